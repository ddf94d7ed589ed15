use super::*;
use crate::proto::*;
use stun::agent::TransactionId;

fn new_request() -> Message {
    let mut msg = Message::new();
    msg.build(&[Box::new(TransactionId::new()), Box::new(allocate_request())])
        .unwrap();
    msg
}

fn response_to(request: &Message, typ: MessageType) -> Message {
    let mut msg = Message::new();
    msg.build(&[Box::new(request.transaction_id), Box::new(typ)])
        .unwrap();
    msg
}

#[tokio::test]
async fn test_transaction_map_check_response_success() {
    let request = new_request();
    let (tr, mut result_rx) = Transaction::new(&request);

    let mut tm = TransactionMap::new();
    tm.insert(tr);
    assert_eq!(tm.size(), 1);

    let response = response_to(&request, allocate_response());
    assert!(tm.check_response(&response).await);
    assert_eq!(tm.size(), 0, "matched transaction should be removed");

    match result_rx.recv().await {
        Some(TransactionResult::Response(msg)) => {
            assert_eq!(msg.transaction_id, request.transaction_id)
        }
        other => panic!("expected success result, got {other:?}"),
    }
}

#[tokio::test]
async fn test_transaction_map_check_response_error() {
    let request = new_request();
    let (tr, mut result_rx) = Transaction::new(&request);

    let mut tm = TransactionMap::new();
    tm.insert(tr);

    let response = response_to(&request, allocate_error_response());
    assert!(tm.check_response(&response).await);

    match result_rx.recv().await {
        Some(TransactionResult::ErrorResponse(_)) => {}
        other => panic!("expected error result, got {other:?}"),
    }
}

#[tokio::test]
async fn test_transaction_map_unknown_id_not_consumed() {
    let request = new_request();
    let (tr, _result_rx) = Transaction::new(&request);

    let mut tm = TransactionMap::new();
    tm.insert(tr);

    // Response to some other transaction.
    let unrelated = new_request();
    let response = response_to(&unrelated, allocate_response());
    assert!(!tm.check_response(&response).await);
    assert_eq!(tm.size(), 1);
}

#[tokio::test]
async fn test_transaction_map_non_response_class_not_consumed() {
    let request = new_request();
    let (tr, _result_rx) = Transaction::new(&request);

    let mut tm = TransactionMap::new();
    tm.insert(tr);

    // An indication that collides with the id must not finish the
    // transaction.
    let indication = response_to(&request, data_indication());
    assert!(!tm.check_response(&indication).await);
    assert_eq!(tm.size(), 1);
}

#[tokio::test]
async fn test_transaction_map_close_unblocks_driver() {
    let request = new_request();
    let (tr, mut result_rx) = Transaction::new(&request);

    let mut tm = TransactionMap::new();
    tm.insert(tr);
    tm.close_and_delete_all();

    assert!(result_rx.recv().await.is_none());
    assert_eq!(tm.size(), 0);
}

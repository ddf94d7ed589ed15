#[cfg(test)]
mod transaction_test;

use std::collections::HashMap;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use stun::message::*;
use tokio::sync::mpsc;

/// Terminal outcome of a STUN transaction against the relay server.
#[derive(Debug)]
pub enum TransactionResult {
    Response(Message),
    ErrorResponse(Message),
    Timeout,
}

/// One in-flight request, keyed by its STUN transaction id.
///
/// The driver of the request holds the receiving end of the result channel;
/// whoever demultiplexes inbound messages delivers through the map.
#[derive(Debug)]
pub struct Transaction {
    pub key: String,
    pub raw: Vec<u8>,
    result_tx: mpsc::Sender<TransactionResult>,
}

impl Transaction {
    /// Creates a transaction for `msg`, returning it together with the
    /// receiving end of its result channel.
    pub fn new(msg: &Message) -> (Self, mpsc::Receiver<TransactionResult>) {
        let (result_tx, result_rx) = mpsc::channel(1);
        (
            Transaction {
                key: transaction_key(msg),
                raw: msg.raw.clone(),
                result_tx,
            },
            result_rx,
        )
    }

    /// Delivers the result to the request driver.
    pub async fn write_result(&self, result: TransactionResult) -> bool {
        self.result_tx.send(result).await.is_ok()
    }
}

/// Key under which a message's transaction is tracked.
pub fn transaction_key(msg: &Message) -> String {
    BASE64_STANDARD.encode(msg.transaction_id.0)
}

/// `TransactionMap` tracks the outstanding transactions of one server
/// connection.
#[derive(Default, Debug)]
pub struct TransactionMap {
    tr_map: HashMap<String, Transaction>,
}

impl TransactionMap {
    /// Create a new [`TransactionMap`].
    pub fn new() -> TransactionMap {
        TransactionMap {
            tr_map: HashMap::new(),
        }
    }

    /// Inserts a [`Transaction`] into the map.
    pub fn insert(&mut self, tr: Transaction) {
        self.tr_map.insert(tr.key.clone(), tr);
    }

    /// Looks up a [`Transaction`] by its key.
    pub fn find(&self, key: &str) -> Option<&Transaction> {
        self.tr_map.get(key)
    }

    /// Deletes a [`Transaction`] by its key.
    pub fn delete(&mut self, key: &str) -> Option<Transaction> {
        self.tr_map.remove(key)
    }

    /// Matches `msg` against an outstanding transaction. On a match the
    /// transaction is finished and the classified result is delivered to
    /// its driver; the caller must not re-dispatch a consumed message.
    pub async fn check_response(&mut self, msg: &Message) -> bool {
        let key = transaction_key(msg);
        if !self.tr_map.contains_key(&key) {
            return false;
        }

        let result = match msg.typ.class {
            CLASS_SUCCESS_RESPONSE => TransactionResult::Response(msg.clone()),
            CLASS_ERROR_RESPONSE => TransactionResult::ErrorResponse(msg.clone()),
            // Requests and indications never finish a transaction, even if
            // their id happens to collide.
            _ => return false,
        };

        if let Some(tr) = self.tr_map.remove(&key) {
            if !tr.write_result(result).await {
                log::debug!("no listener for transaction {key}");
            }
        }
        true
    }

    /// Drops every transaction; their result channels close, which the
    /// drivers observe as termination.
    pub fn close_and_delete_all(&mut self) {
        self.tr_map.clear();
    }

    /// Returns its length.
    pub fn size(&self) -> usize {
        self.tr_map.len()
    }
}

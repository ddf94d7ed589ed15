
use std::net::SocketAddr;
use std::sync::Arc;

use stun::addr::MappedAddress;
use stun::agent::TransactionId;
use stun::attributes::{ATTR_MAPPED_ADDRESS, ATTR_USERNAME};
use stun::error_code::ErrorCodeAttribute;
use stun::message::*;
use stun::textattrs::Username;
use tokio::time::{sleep, Duration, Instant};

use crate::entry::RelayEntry;
use crate::error::*;
use crate::proto;
use crate::relay_conn::RelayConnection;
use crate::transaction::{Transaction, TransactionResult};

/// How long allocate error responses are still treated as transient,
/// counted from the first attempt. ICE says 50 seconds.
const RETRY_TIMEOUT: Duration = Duration::from_millis(50 * 1000);

/// Attempts before the transaction reports a terminal timeout.
const MAX_ALLOCATE_ATTEMPTS: u32 = 5;

/// One ALLOCATE transaction: sends with exponential backoff and dispatches
/// the terminal outcome back into its entry.
pub(crate) struct AllocateRequest {
    entry: Arc<RelayEntry>,
    connection: Arc<RelayConnection>,
    start_time: Instant,
    count: u32,
    timed_out: bool,
}

impl AllocateRequest {
    pub(crate) fn new(entry: Arc<RelayEntry>, connection: Arc<RelayConnection>) -> Self {
        AllocateRequest {
            entry,
            connection,
            start_time: Instant::now(),
            count: 0,
            timed_out: false,
        }
    }

    /// Builds the ALLOCATE request.
    fn prepare(&self, username_fragment: String) -> Result<Message> {
        let mut msg = Message::new();
        msg.build(&[
            Box::new(TransactionId::new()),
            Box::new(proto::allocate_request()),
            Box::new(Username::new(ATTR_USERNAME, username_fragment)),
        ])?;
        Ok(msg)
    }

    /// Backoff before the next retransmission; flags the terminal timeout
    /// once the attempt budget is spent. The resulting schedule is 200,
    /// 200, 400, 800, 1600 ms, then timeout.
    fn next_delay(&mut self) -> Duration {
        let delay = 100 * std::cmp::max(1u64 << self.count, 2);
        self.count += 1;
        if self.count == MAX_ALLOCATE_ATTEMPTS {
            self.timed_out = true;
        }
        Duration::from_millis(delay)
    }

    /// Drives the transaction after an initial delay: send, retransmit on
    /// the backoff schedule, then dispatch the terminal outcome.
    pub(crate) async fn run(mut self, initial_delay: Duration) {
        let cancelled = self.connection.dispose_notify();
        if !initial_delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => return,
                _ = sleep(initial_delay) => {}
            }
        }

        let Some(username_fragment) = self.entry.username_fragment() else {
            return;
        };
        let msg = match self.prepare(username_fragment) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("failed to build allocate request: {err}");
                return;
            }
        };

        let (tr, mut result_rx) = Transaction::new(&msg);
        let key = tr.key.clone();
        self.connection.track_transaction(tr).await;

        log::debug!(
            "allocate transaction {} to {}",
            key,
            self.connection.address()
        );
        self.connection.send_request_packet(&msg.raw).await;

        let result = loop {
            let delay = self.next_delay();
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    self.connection.drop_transaction(&key).await;
                    return;
                }
                result = result_rx.recv() => {
                    match result {
                        Some(result) => break result,
                        // The transaction map was torn down under us.
                        None => return,
                    }
                }
                _ = sleep(delay) => {
                    if self.timed_out {
                        self.connection.drop_transaction(&key).await;
                        break TransactionResult::Timeout;
                    }
                    self.connection.send_request_packet(&msg.raw).await;
                }
            }
        };

        match result {
            TransactionResult::Response(response) => self.on_response(&response).await,
            TransactionResult::ErrorResponse(response) => self.on_error_response(&response).await,
            TransactionResult::Timeout => self.on_timeout().await,
        }
    }

    async fn on_response(&self, response: &Message) {
        let mut mapped = MappedAddress::default();
        match mapped.get_from_as(response, ATTR_MAPPED_ADDRESS) {
            Err(_) => log::info!("allocate response missing mapped address"),
            Ok(()) if !mapped.ip.is_ipv4() => log::info!("mapped address has bad family"),
            Ok(()) => {
                let addr = SocketAddr::new(mapped.ip, mapped.port);
                self.entry.on_connect(addr, &self.connection).await;
            }
        }

        // Keep-alive regardless of whether this request succeeded; the
        // extra traffic is negligible.
        self.entry.schedule_keep_alive().await;
    }

    async fn on_error_response(&self, response: &Message) {
        let mut code = ErrorCodeAttribute::default();
        match code.get_from(response) {
            Err(_) => log::info!("bad allocate response error code"),
            Ok(()) => log::info!("allocate error response: {code}"),
        }

        if self.start_time.elapsed() <= RETRY_TIMEOUT {
            self.entry.schedule_keep_alive().await;
        }
    }

    async fn on_timeout(&self) {
        log::info!("allocate request timed out");
        self.entry
            .handle_connect_failure(Some(self.connection.socket()))
            .await;
    }
}

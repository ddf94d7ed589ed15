use std::net::SocketAddr;
use std::sync::Arc;

use stun::message::Message;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::allocate::AllocateRequest;
use crate::entry::RelayEntry;
use crate::error::*;
use crate::proto::{ProtocolAddress, ProtocolType};
use crate::socket::{AsyncPacketSocket, SocketOption};
use crate::transaction::{Transaction, TransactionMap};

/// A single binding to one relay server endpoint.
///
/// Owns the socket, forwards request bytes for its transactions, and routes
/// STUN responses back to them. Replaced wholesale when the entry falls
/// back to another server address.
pub struct RelayConnection {
    socket: Arc<dyn AsyncPacketSocket + Send + Sync>,
    protocol_address: ProtocolAddress,
    transactions: Mutex<TransactionMap>,
    dispose_notify: CancellationToken,
}

impl RelayConnection {
    pub(crate) fn new(
        protocol_address: ProtocolAddress,
        socket: Arc<dyn AsyncPacketSocket + Send + Sync>,
        dispose_notify: CancellationToken,
    ) -> Self {
        RelayConnection {
            socket,
            protocol_address,
            transactions: Mutex::new(TransactionMap::new()),
            dispose_notify,
        }
    }

    pub fn socket(&self) -> &Arc<dyn AsyncPacketSocket + Send + Sync> {
        &self.socket
    }

    pub fn protocol(&self) -> ProtocolType {
        self.protocol_address.proto
    }

    pub fn address(&self) -> SocketAddr {
        self.protocol_address.address
    }

    pub fn protocol_address(&self) -> &ProtocolAddress {
        &self.protocol_address
    }

    /// Cancelled once the connection is replaced or its port closes; tasks
    /// tied to this connection terminate on it.
    pub(crate) fn dispose_notify(&self) -> CancellationToken {
        self.dispose_notify.clone()
    }

    /// Stops the connection's tasks. Outstanding callbacks still hold
    /// references, so the object itself is freed only after the last of
    /// them completes.
    pub(crate) async fn dispose(&self) {
        self.dispose_notify.cancel();
        self.transactions.lock().await.close_and_delete_all();
    }

    /// Sends data to the relay server.
    pub(crate) async fn send(&self, data: &[u8]) -> Result<usize> {
        self.socket.send_to(data, self.address()).await
    }

    /// Submits a new allocate transaction for `entry`, starting after
    /// `delay`.
    pub(crate) fn send_allocate_request(self: &Arc<Self>, entry: &Arc<RelayEntry>, delay: Duration) {
        let request = AllocateRequest::new(Arc::clone(entry), Arc::clone(self));
        tokio::spawn(request.run(delay));
    }

    /// Validates a response against the outstanding transactions; returns
    /// true iff the message matched one and was consumed.
    pub(crate) async fn check_response(&self, msg: &Message) -> bool {
        self.transactions.lock().await.check_response(msg).await
    }

    pub(crate) async fn track_transaction(&self, tr: Transaction) {
        self.transactions.lock().await.insert(tr);
    }

    pub(crate) async fn drop_transaction(&self, key: &str) {
        self.transactions.lock().await.delete(key);
    }

    /// Writes transaction bytes on behalf of a request. These are already
    /// STUN destined for the server, so no wrapping is necessary; a send
    /// failure is logged and left for the transaction to time out.
    pub(crate) async fn send_request_packet(&self, data: &[u8]) {
        if let Err(err) = self.socket.send_to(data, self.address()).await {
            log::debug!("failed sending request to {}: {err}", self.address());
        }
    }

    pub(crate) async fn set_socket_option(&self, opt: SocketOption, value: i32) -> Result<()> {
        self.socket.set_option(opt, value).await
    }

    /// The latest error generated by the socket.
    pub fn last_error(&self) -> Option<Error> {
        self.socket.last_error()
    }
}

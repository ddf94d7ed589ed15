use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use stun::agent::TransactionId;
use stun::attributes::ATTR_USERNAME;
use stun::message::*;
use stun::textattrs::Username;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::error::*;
use crate::proto::{self, ProtocolType};
use crate::relay_conn::RelayConnection;
use crate::relay_port::RelayPortInternal;
use crate::socket::{AsyncPacketSocket, SocketEvent, SocketOption};

/// Timer message id for the soft connect timeout.
pub(crate) const MESSAGE_CONNECT_TIMEOUT: u32 = 1;

/// Delay between keep-alive allocate requests on a connected entry.
pub(crate) const KEEP_ALIVE_DELAY: Duration = Duration::from_millis(10 * 60 * 1000);

/// How long to wait for a stream socket to reach the server before trying
/// the next address.
pub(crate) const SOFT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3 * 1000);

/// One logical tunnel to the relay, specialized for a single remote peer.
///
/// Entries share the port's server list, but each aims its connection at
/// one destination so that, once the server confirms the binding, packets
/// in either direction can skip the STUN send / data indication wrapping.
pub struct RelayEntry {
    port: Weak<RelayPortInternal>,
    state: Mutex<EntryState>,
}

#[derive(Default)]
struct EntryState {
    ext_addr: Option<SocketAddr>,
    server_index: usize,
    connected: bool,
    locked: bool,
    current_connection: Option<Arc<RelayConnection>>,
}

impl RelayEntry {
    pub(crate) fn new(port: Weak<RelayPortInternal>, ext_addr: Option<SocketAddr>) -> Self {
        RelayEntry {
            port,
            state: Mutex::new(EntryState {
                ext_addr,
                ..Default::default()
            }),
        }
    }

    /// The remote peer this entry is specialized for; `None` until a send
    /// claims it.
    pub async fn address(&self) -> Option<SocketAddr> {
        self.state.lock().await.ext_addr
    }

    pub(crate) async fn set_address(&self, addr: SocketAddr) {
        self.state.lock().await.ext_addr = Some(addr);
    }

    pub async fn connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn locked(&self) -> bool {
        self.state.lock().await.locked
    }

    pub(crate) async fn server_index(&self) -> usize {
        self.state.lock().await.server_index
    }

    pub(crate) async fn set_server_index(&self, server_index: usize) {
        self.state.lock().await.server_index = server_index;
    }

    pub(crate) fn username_fragment(&self) -> Option<String> {
        self.port
            .upgrade()
            .map(|port| port.username_fragment().to_owned())
    }

    /// Returns the last error on the socket of this entry.
    pub async fn last_error(&self) -> Option<Error> {
        let state = self.state.lock().await;
        state
            .current_connection
            .as_ref()
            .and_then(|connection| connection.last_error())
    }

    /// Begins or resumes server selection. A no-op once the entry is
    /// connected.
    pub(crate) fn connect(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.connect_inner())
    }

    async fn connect_inner(self: &Arc<Self>) {
        let Some(port) = self.port.upgrade() else {
            return;
        };

        // If we're already connected, return.
        {
            let state = self.state.lock().await;
            if state.connected {
                return;
            }
        }

        // If we've exhausted all options, bail out.
        let server_index = self.state.lock().await.server_index;
        let Some(ra) = port.server_address(server_index).await else {
            log::warn!("no more relay addresses left to try");
            return;
        };

        // Remove any previous connection. Outstanding callbacks keep it
        // alive until they drain, so this cannot race them.
        {
            let mut state = self.state.lock().await;
            if let Some(old) = state.current_connection.take() {
                old.dispose().await;
            }
        }

        log::info!("connecting to relay via {ra}");

        let bind_addr = SocketAddr::new(port.local_ip(), 0);
        let socket = match ra.proto {
            ProtocolType::Udp => {
                port.socket_factory()
                    .udp_socket(bind_addr, port.min_port(), port.max_port())
                    .await
            }
            ProtocolType::Tcp | ProtocolType::Ssltcp => {
                port.socket_factory()
                    .client_tcp_socket(
                        bind_addr,
                        ra.address,
                        port.proxy(),
                        port.user_agent(),
                        ra.proto == ProtocolType::Ssltcp,
                    )
                    .await
            }
        };

        let socket = match socket {
            Ok(socket) => socket,
            Err(err) => {
                log::warn!("socket creation failed: {err}");
                // Fall back on the next scheduler turn.
                let entry = Arc::clone(self);
                tokio::spawn(async move {
                    entry.on_message(MESSAGE_CONNECT_TIMEOUT).await;
                });
                return;
            }
        };

        let connection = Arc::new(RelayConnection::new(
            ra.clone(),
            socket,
            port.close_notify().child_token(),
        ));
        for (opt, value) in port.options_snapshot().await {
            let _ = connection.set_socket_option(opt, value).await;
        }
        {
            let mut state = self.state.lock().await;
            state.current_connection = Some(Arc::clone(&connection));
        }
        self.spawn_event_pump(Arc::clone(&connection));

        // Streams send the allocate only once the socket connects, with a
        // soft timeout guarding the attempt; UDP has no connect phase.
        if ra.proto == ProtocolType::Tcp || ra.proto == ProtocolType::Ssltcp {
            let entry = Arc::clone(self);
            let close_notify = port.close_notify().clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = close_notify.cancelled() => {}
                    _ = sleep(SOFT_CONNECT_TIMEOUT) => {
                        entry.on_message(MESSAGE_CONNECT_TIMEOUT).await;
                    }
                }
            });
        } else {
            connection.send_allocate_request(self, Duration::ZERO);
        }
    }

    /// Called when an allocate response carries our public binding. The
    /// address given is the one exposed to the outside world on the relay
    /// server.
    pub(crate) async fn on_connect(&self, mapped_addr: SocketAddr, _connection: &Arc<RelayConnection>) {
        let Some(port) = self.port.upgrade() else {
            return;
        };

        // The relay's peer-facing plane is always UDP, whatever the server
        // link runs over.
        let proto = ProtocolType::Udp;
        log::info!("relay allocate succeeded: {proto} @ {mapped_addr}");
        {
            let mut state = self.state.lock().await;
            state.connected = true;
        }

        port.set_related_address(mapped_addr).await;
        port.add_external_address(proto::ProtocolAddress::new(mapped_addr, proto))
            .await;
        port.set_ready().await;
    }

    /// Sends a payload to `addr`, wrapping it in a STUN SEND request unless
    /// the server already holds a lock on that destination.
    pub(crate) async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        let (locked, ext_addr) = {
            let state = self.state.lock().await;
            (state.locked, state.ext_addr)
        };

        // If this connection is locked to the address given, send the
        // packet with no wrapper.
        if locked && ext_addr == Some(addr) {
            return self.send_packet(data).await;
        }

        // Otherwise wrap the data in a SEND request to communicate the
        // destination to the server.
        //
        // Deliberately not tracked as a transaction: if the packet is late
        // we just drop it, and the next send to this address tries again.
        let Some(port) = self.port.upgrade() else {
            return Err(Error::ErrClosed);
        };

        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(TransactionId::new()),
            Box::new(proto::send_request()),
            Box::new(proto::MagicCookie),
            Box::new(Username::new(
                ATTR_USERNAME,
                port.username_fragment().to_owned(),
            )),
            Box::new(proto::DestinationAddress {
                ip: addr.ip(),
                port: addr.port(),
            }),
        ];

        // Attempt to lock.
        if ext_addr == Some(addr) {
            setters.push(Box::new(proto::Options(proto::OPTION_LOCK_DESTINATION)));
        }

        setters.push(Box::new(proto::Data(data.to_vec())));

        // TODO: compute the HMAC.

        let mut request = Message::new();
        request.build(&setters)?;

        self.send_packet(&request.raw).await
    }

    /// Schedules a keep-alive allocate request.
    pub(crate) async fn schedule_keep_alive(self: &Arc<Self>) {
        let current = self.state.lock().await.current_connection.clone();
        if let Some(connection) = current {
            connection.send_allocate_request(self, KEEP_ALIVE_DELAY);
        }
    }

    /// Sets this option on the socket of the current connection.
    pub(crate) async fn set_socket_option(&self, opt: SocketOption, value: i32) -> Result<()> {
        let current = self.state.lock().await.current_connection.clone();
        if let Some(connection) = current {
            connection.set_socket_option(opt, value).await
        } else {
            Ok(())
        }
    }

    /// Tries the next server address.
    ///
    /// Only acts when `socket` is the current connection's socket (or no
    /// socket is given); callbacks from sockets that have since been
    /// replaced are ignored.
    pub(crate) async fn handle_connect_failure(
        self: &Arc<Self>,
        socket: Option<&Arc<dyn AsyncPacketSocket + Send + Sync>>,
    ) {
        let failed = {
            let state = self.state.lock().await;
            match (socket, &state.current_connection) {
                (None, current) => Some(current.as_ref().map(|c| c.protocol_address().clone())),
                (Some(socket), Some(current)) if Arc::ptr_eq(current.socket(), socket) => {
                    Some(Some(current.protocol_address().clone()))
                }
                _ => None,
            }
        };
        let Some(address) = failed else {
            return;
        };

        if let Some(pa) = address {
            if let Some(port) = self.port.upgrade() {
                port.notify_connect_failure(&pa).await;
            }
        }

        // Try to connect to the next server address.
        {
            let mut state = self.state.lock().await;
            state.server_index += 1;
        }
        self.connect().await;
    }

    /// Handles the soft connect timeout message.
    pub(crate) async fn on_message(self: &Arc<Self>, message_id: u32) {
        debug_assert_eq!(message_id, MESSAGE_CONNECT_TIMEOUT);
        let current = self.state.lock().await.current_connection.clone();
        match current {
            Some(connection) => {
                let ra = connection.protocol_address().clone();
                log::warn!("relay {} connection to {} timed out", ra.proto, ra.address);

                // Server addresses are tried strictly in sequence: treat
                // the stall as a failure and move to the next one.
                if let Some(port) = self.port.upgrade() {
                    port.notify_soft_timeout(&ra).await;
                }
                self.handle_connect_failure(Some(connection.socket())).await;
            }
            None => self.handle_connect_failure(None).await,
        }
    }

    async fn on_socket_connect(self: &Arc<Self>, socket: &Arc<dyn AsyncPacketSocket + Send + Sync>) {
        if let Some(remote) = socket.remote_addr() {
            log::info!("relay tcp connected to {remote}");
        }
        let current = self.state.lock().await.current_connection.clone();
        if let Some(connection) = current {
            connection.send_allocate_request(self, Duration::ZERO);
        }
    }

    async fn on_socket_close(
        self: &Arc<Self>,
        socket: &Arc<dyn AsyncPacketSocket + Send + Sync>,
        error: i32,
    ) {
        log::error!("relay connection failed: socket closed (error {error})");
        self.handle_connect_failure(Some(socket)).await;
    }

    /// Classifies a datagram from the server socket: raw forwarded payload,
    /// tracked STUN response, lock confirmation, or data indication.
    pub(crate) async fn on_read_packet(
        &self,
        socket: &Arc<dyn AsyncPacketSocket + Send + Sync>,
        data: &[u8],
        _remote_addr: SocketAddr,
    ) {
        let Some(port) = self.port.upgrade() else {
            return;
        };

        let (connection, locked, ext_addr) = {
            let state = self.state.lock().await;
            match &state.current_connection {
                Some(current) if Arc::ptr_eq(current.socket(), socket) => {
                    (Arc::clone(current), state.locked, state.ext_addr)
                }
                _ => {
                    // This packet comes from a socket that is no longer
                    // current.
                    log::warn!("dropping packet: unknown address");
                    return;
                }
            }
        };

        // Without the magic cookie this is an unwrapped packet forwarded by
        // the server; the actual remote address is the one we recorded.
        if !proto::has_magic_cookie(data) {
            if locked {
                if let Some(ext_addr) = ext_addr {
                    port.on_read_packet(data, ext_addr, ProtocolType::Udp).await;
                }
            } else {
                log::warn!("dropping packet: entry not locked");
            }
            return;
        }

        let mut msg = Message::new();
        msg.raw = data.to_vec();
        if msg.decode().is_err() {
            log::info!("incoming packet was not STUN");
            return;
        }

        // The packet should be an allocate response, a send response, or a
        // data indication.
        if connection.check_response(&msg).await {
            return;
        }

        if msg.typ == proto::send_response() {
            let mut options = proto::Options::default();
            if options.get_from(&msg).is_ok() && options.0 & proto::OPTION_LOCK_DESTINATION != 0 {
                let mut state = self.state.lock().await;
                state.locked = true;
            }
            return;
        }

        if msg.typ != proto::data_indication() {
            log::info!("received bad stun type from server: {}", msg.typ);
            return;
        }

        let mut source = proto::SourceAddress2::default();
        if source.get_from(&msg).is_err() {
            log::info!("data indication has no source address");
            return;
        }
        if !source.ip.is_ipv4() {
            log::info!("source address has bad family");
            return;
        }
        let remote_addr = SocketAddr::new(source.ip, source.port);

        let mut payload = proto::Data::default();
        if payload.get_from(&msg).is_err() {
            log::info!("data indication has no data");
            return;
        }

        // Process the actual data and remote address in the normal manner.
        port.on_read_packet(&payload.0, remote_addr, ProtocolType::Udp)
            .await;
    }

    /// Drops the current connection and with it any in-flight requests.
    pub(crate) async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if let Some(connection) = state.current_connection.take() {
            connection.dispose().await;
        }
    }

    /// Sends `data` to the server with no wrapping.
    async fn send_packet(&self, data: &[u8]) -> Result<usize> {
        let current = self.state.lock().await.current_connection.clone();
        match current {
            Some(connection) => connection.send(data).await,
            None => Err(Error::ErrNotConnected),
        }
    }

    /// Forwards socket events into the entry until the connection is
    /// disposed or the socket closes.
    fn spawn_event_pump(self: &Arc<Self>, connection: Arc<RelayConnection>) {
        let entry = Arc::clone(self);
        tokio::spawn(async move {
            let cancelled = connection.dispose_notify();
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    event = connection.socket().next_event() => match event {
                        Ok(event) => event,
                        Err(err) => {
                            log::debug!("socket event stream ended: {err}");
                            break;
                        }
                    }
                };
                match event {
                    SocketEvent::Packet { data, from } => {
                        entry.on_read_packet(connection.socket(), &data, from).await
                    }
                    SocketEvent::Connect => entry.on_socket_connect(connection.socket()).await,
                    SocketEvent::Close(error) => {
                        entry.on_socket_close(connection.socket(), error).await
                    }
                }
            }
        });
    }
}

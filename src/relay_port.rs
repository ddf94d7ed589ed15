
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use portable_atomic::AtomicBool;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::candidate::{Candidate, CandidateOrigin, CandidateType};
use crate::entry::RelayEntry;
use crate::error::*;
use crate::proto::{ProtocolAddress, ProtocolType};
use crate::socket::{PacketSocketFactory, ProxyInfo, ProxyType, SocketOption};

const MAX_READ_QUEUE_SIZE: usize = 1024;

/// Receives the port's signals: candidate publication, connect failures,
/// soft timeouts, and packets that match no known connection. Delivery is
/// synchronous on the task that produced the event.
#[async_trait]
pub trait RelayPortObserver {
    /// The port's external candidates are ready. Fired exactly once per
    /// port lifetime, on the first successful allocation.
    async fn on_address_ready(&self, candidates: Vec<Candidate>);

    /// A server address could not be reached and the port is moving on.
    async fn on_connect_failure(&self, address: &ProtocolAddress);

    /// A stream connect attempt exceeded the soft timeout. Observational
    /// only; fallback happens regardless.
    async fn on_soft_timeout(&self, address: &ProtocolAddress);

    /// An inbound payload arrived from an address no connection matches,
    /// e.g. a STUN binding from a prospective peer.
    async fn on_unmatched_packet(&self, data: &[u8], from: SocketAddr, proto: ProtocolType);
}

/// `RelayPortConfig` collects the parameters for [`RelayPort::new()`].
pub struct RelayPortConfig {
    pub username_fragment: String,
    pub password: String,
    pub local_ip: IpAddr,
    pub min_port: u16,
    pub max_port: u16,
    pub proxy: ProxyInfo,
    pub user_agent: String,
    pub socket_factory: Arc<dyn PacketSocketFactory + Send + Sync>,
    pub observer: Arc<dyn RelayPortObserver + Send + Sync>,
}

pub(crate) struct RelayPortInternal {
    username_fragment: String,
    password: String,
    local_ip: IpAddr,
    min_port: u16,
    max_port: u16,
    proxy: ProxyInfo,
    user_agent: String,
    socket_factory: Arc<dyn PacketSocketFactory + Send + Sync>,
    observer: Arc<dyn RelayPortObserver + Send + Sync>,
    close_notify: CancellationToken,

    server_addresses: Mutex<VecDeque<ProtocolAddress>>,
    external_addresses: Mutex<Vec<ProtocolAddress>>,
    entries: Mutex<Vec<Arc<RelayEntry>>>,
    options: Mutex<Vec<(SocketOption, i32)>>,
    connections: Mutex<HashMap<SocketAddr, Arc<ProxyConnection>>>,
    candidates: Mutex<Vec<Candidate>>,
    related_address: Mutex<Option<SocketAddr>>,
    ready: AtomicBool,
    error: Mutex<Option<Error>>,
}

impl RelayPortInternal {
    pub(crate) fn username_fragment(&self) -> &str {
        &self.username_fragment
    }

    pub(crate) fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    pub(crate) fn min_port(&self) -> u16 {
        self.min_port
    }

    pub(crate) fn max_port(&self) -> u16 {
        self.max_port
    }

    pub(crate) fn proxy(&self) -> &ProxyInfo {
        &self.proxy
    }

    pub(crate) fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub(crate) fn socket_factory(&self) -> &Arc<dyn PacketSocketFactory + Send + Sync> {
        &self.socket_factory
    }

    pub(crate) fn close_notify(&self) -> &CancellationToken {
        &self.close_notify
    }

    /// The server address at `index` in try-order, if any.
    pub(crate) async fn server_address(&self, index: usize) -> Option<ProtocolAddress> {
        self.server_addresses.lock().await.get(index).cloned()
    }

    pub(crate) async fn options_snapshot(&self) -> Vec<(SocketOption, i32)> {
        self.options.lock().await.clone()
    }

    pub(crate) async fn set_related_address(&self, addr: SocketAddr) {
        *self.related_address.lock().await = Some(addr);
    }

    /// Appends a relay-assigned public address, deduplicating on
    /// `(address, protocol)`.
    pub(crate) async fn add_external_address(&self, pa: ProtocolAddress) {
        let mut external = self.external_addresses.lock().await;
        for existing in external.iter() {
            if existing.address == pa.address && existing.proto == pa.proto {
                log::info!("redundant relay address: {pa}");
                return;
            }
        }
        external.push(pa);
    }

    /// Publishes all external addresses as relay candidates and signals
    /// readiness, the first time it is called.
    pub(crate) async fn set_ready(&self) {
        if self
            .ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let published: Vec<Candidate> = {
                let external = self.external_addresses.lock().await;
                let related = *self.related_address.lock().await;
                external
                    .iter()
                    .map(|pa| Candidate {
                        address: pa.address,
                        protocol: pa.proto,
                        candidate_type: CandidateType::Relay,
                        related_address: related,
                    })
                    .collect()
            };
            {
                let mut candidates = self.candidates.lock().await;
                candidates.extend(published.iter().cloned());
            }
            self.observer.on_address_ready(published).await;
        }
    }

    pub(crate) async fn notify_connect_failure(&self, address: &ProtocolAddress) {
        self.observer.on_connect_failure(address).await;
    }

    pub(crate) async fn notify_soft_timeout(&self, address: &ProtocolAddress) {
        self.observer.on_soft_timeout(address).await;
    }

    fn is_compatible_address(&self, addr: &SocketAddr) -> bool {
        self.local_ip.is_ipv4() == addr.ip().is_ipv4()
    }

    /// Delivers an inbound payload to the connection it belongs to, or
    /// hands it to the observer for STUN-binding handling.
    pub(crate) async fn on_read_packet(
        &self,
        data: &[u8],
        remote_addr: SocketAddr,
        proto: ProtocolType,
    ) {
        let connection = self.connections.lock().await.get(&remote_addr).cloned();
        if let Some(connection) = connection {
            connection.on_read_packet(data).await;
        } else {
            self.observer.on_unmatched_packet(data, remote_addr, proto).await;
        }
    }

    /// Sends a payload towards `addr` through a suitable entry; see
    /// [`RelayPort::send_to`].
    pub(crate) async fn send_to(
        self: &Arc<Self>,
        data: &[u8],
        addr: SocketAddr,
        payload: bool,
    ) -> Result<usize> {
        let entry = {
            let mut entries = self.entries.lock().await;

            // The first entry is created without an address, so it can be
            // claimed by the first destination that comes along.
            let mut chosen: Option<Arc<RelayEntry>> = None;
            for entry in entries.iter() {
                let ext_addr = entry.address().await;
                if ext_addr.is_none() && payload {
                    entry.set_address(addr).await;
                    chosen = Some(Arc::clone(entry));
                    break;
                } else if ext_addr == Some(addr) {
                    chosen = Some(Arc::clone(entry));
                    break;
                }
            }

            // No entry yet for this destination: make one. It will not be
            // usable until it connects.
            if chosen.is_none() && payload {
                let entry = Arc::new(RelayEntry::new(Arc::downgrade(self), Some(addr)));
                if let Some(first) = entries.first() {
                    entry.set_server_index(first.server_index().await).await;
                }
                entry.connect().await;
                entries.push(Arc::clone(&entry));
                chosen = Some(entry);
            }

            // An unconnected entry cannot carry traffic yet; default to the
            // first one.
            let mut selected = None;
            if let Some(entry) = chosen {
                if entry.connected().await {
                    selected = Some(entry);
                }
            }
            if selected.is_none() {
                debug_assert!(!entries.is_empty());
                if let Some(first) = entries.first() {
                    if first.connected().await {
                        selected = Some(Arc::clone(first));
                    }
                }
            }
            let Some(entry) = selected else {
                *self.error.lock().await = Some(Error::ErrWouldBlock);
                return Err(Error::ErrWouldBlock);
            };
            entry
        };

        match entry.send_to(data, addr).await {
            // The caller expects the number of user data bytes, not the
            // wire size of the (possibly wrapped) packet.
            Ok(_) => Ok(data.len()),
            Err(err) => {
                *self.error.lock().await = Some(err.clone());
                Err(err)
            }
        }
    }
}

/// The local side of a relayed transport candidate.
///
/// Manages one entry per distinct remote peer over a shared, ordered list
/// of relay server addresses, and exposes the ICE port surface: candidate
/// preparation, connection matching, sending, and inbound demultiplexing.
pub struct RelayPort {
    internal: Arc<RelayPortInternal>,
}

impl RelayPort {
    /// Creates a port with its bootstrap entry.
    pub fn new(config: RelayPortConfig) -> Self {
        let internal = Arc::new_cyclic(|weak: &Weak<RelayPortInternal>| RelayPortInternal {
            username_fragment: config.username_fragment,
            password: config.password,
            local_ip: config.local_ip,
            min_port: config.min_port,
            max_port: config.max_port,
            proxy: config.proxy,
            user_agent: config.user_agent,
            socket_factory: config.socket_factory,
            observer: config.observer,
            close_notify: CancellationToken::new(),
            server_addresses: Mutex::new(VecDeque::new()),
            external_addresses: Mutex::new(Vec::new()),
            entries: Mutex::new(vec![Arc::new(RelayEntry::new(weak.clone(), None))]),
            options: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            candidates: Mutex::new(Vec::new()),
            related_address: Mutex::new(None),
            ready: AtomicBool::new(false),
            error: Mutex::new(None),
        });
        RelayPort { internal }
    }

    /// Adds a relay server endpoint to the try-order.
    ///
    /// HTTP proxies usually only allow port 443, so TLS endpoints go to the
    /// front of the list when such a proxy is (or may be) in the way.
    pub async fn add_server_address(&self, pa: ProtocolAddress) {
        let mut servers = self.internal.server_addresses.lock().await;
        if pa.proto == ProtocolType::Ssltcp
            && (self.internal.proxy.proxy_type == ProxyType::Https
                || self.internal.proxy.proxy_type == ProxyType::Unknown)
        {
            servers.push_front(pa);
        } else {
            servers.push_back(pa);
        }
    }

    /// Starts allocation on the bootstrap entry. When it completes, the
    /// mapped address becomes this port's candidate address.
    pub async fn prepare_address(&self) {
        let entry = {
            let entries = self.internal.entries.lock().await;
            debug_assert_eq!(entries.len(), 1);
            entries[0].clone()
        };
        entry.connect().await;
        self.internal.ready.store(false, Ordering::Release);
    }

    /// Creates a connection for a remote candidate, if this port can reach
    /// it.
    pub async fn create_connection(
        &self,
        candidate: &Candidate,
        origin: CandidateOrigin,
    ) -> Option<Arc<ProxyConnection>> {
        // Only connect to non-UDP candidates when they are incoming on
        // this port.
        if candidate.protocol != ProtocolType::Udp && origin != CandidateOrigin::ThisPort {
            return None;
        }

        // No loopback through another relay.
        if candidate.candidate_type == CandidateType::Relay {
            return None;
        }

        if !self.internal.is_compatible_address(&candidate.address) {
            return None;
        }

        let index = {
            let locals = self.internal.candidates.lock().await;
            locals
                .iter()
                .position(|local| local.protocol == candidate.protocol)
                .unwrap_or(0)
        };

        let connection = Arc::new(ProxyConnection::new(
            Arc::downgrade(&self.internal),
            index,
            candidate.clone(),
        ));
        self.internal
            .connections
            .lock()
            .await
            .insert(candidate.address, Arc::clone(&connection));
        Some(connection)
    }

    /// Sends a payload to `addr`. `payload` marks user data, which may
    /// claim or create an entry for a new destination. Returns the number
    /// of payload bytes accepted.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr, payload: bool) -> Result<usize> {
        self.internal.send_to(data, addr, payload).await
    }

    /// Applies a socket option to every entry and remembers it for sockets
    /// created later.
    pub async fn set_option(&self, opt: SocketOption, value: i32) -> Result<()> {
        let mut result = Ok(());
        let entries = self.internal.entries.lock().await.clone();
        for entry in &entries {
            if let Err(err) = entry.set_socket_option(opt, value).await {
                *self.internal.error.lock().await = Some(err.clone());
                result = Err(err);
            }
        }
        self.internal.options.lock().await.push((opt, value));
        result
    }

    /// The last error surfaced by a send.
    pub async fn last_error(&self) -> Option<Error> {
        self.internal.error.lock().await.clone()
    }

    /// True once the first allocation has published candidates.
    pub fn ready(&self) -> bool {
        self.internal.ready.load(Ordering::Acquire)
    }

    /// The candidates this port has published.
    pub async fn candidates(&self) -> Vec<Candidate> {
        self.internal.candidates.lock().await.clone()
    }

    /// The relay server's view of this client, once allocated.
    pub async fn related_address(&self) -> Option<SocketAddr> {
        *self.internal.related_address.lock().await
    }

    pub(crate) async fn entries(&self) -> Vec<Arc<RelayEntry>> {
        self.internal.entries.lock().await.clone()
    }

    /// Inbound payload delivery; see [`RelayPortInternal::on_read_packet`].
    pub async fn on_read_packet(&self, data: &[u8], remote_addr: SocketAddr, proto: ProtocolType) {
        self.internal.on_read_packet(data, remote_addr, proto).await;
    }

    /// Tears the port down: stops every entry's timers and pumps, disposes
    /// their connections, and drops all entries and connections. Pending
    /// callbacks drain without effect.
    pub async fn close(&self) {
        self.internal.close_notify.cancel();
        let entries = std::mem::take(&mut *self.internal.entries.lock().await);
        for entry in &entries {
            entry.dispose().await;
        }
        self.internal.connections.lock().await.clear();
    }
}

/// A connection to a remote candidate, proxied through the relay server.
///
/// Outbound data goes through the port's entry for the candidate address;
/// inbound payloads for that address are queued here for the consumer.
pub struct ProxyConnection {
    port: Weak<RelayPortInternal>,
    local_candidate_index: usize,
    remote_candidate: Candidate,
    read_tx: mpsc::Sender<Vec<u8>>,
    read_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl ProxyConnection {
    pub(crate) fn new(
        port: Weak<RelayPortInternal>,
        local_candidate_index: usize,
        remote_candidate: Candidate,
    ) -> Self {
        let (read_tx, read_rx) = mpsc::channel(MAX_READ_QUEUE_SIZE);
        ProxyConnection {
            port,
            local_candidate_index,
            remote_candidate,
            read_tx,
            read_rx: Mutex::new(read_rx),
        }
    }

    pub fn remote_candidate(&self) -> &Candidate {
        &self.remote_candidate
    }

    /// Index of the local candidate this connection pairs with.
    pub fn local_candidate_index(&self) -> usize {
        self.local_candidate_index
    }

    /// Sends user data to the remote candidate.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        let Some(port) = self.port.upgrade() else {
            return Err(Error::ErrClosed);
        };
        port.send_to(data, self.remote_candidate.address, true).await
    }

    /// Waits for the next inbound payload from the remote candidate.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        self.read_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ErrClosed)
    }

    pub(crate) async fn on_read_packet(&self, data: &[u8]) {
        if self.read_tx.try_send(data.to_vec()).is_err() {
            log::warn!("receive buffer full");
        }
    }
}

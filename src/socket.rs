use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::*;

/// Options replayed onto every socket a relay port creates.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum SocketOption {
    DontFragment,
    RcvBuf,
    SndBuf,
    NoDelay,
    Dscp,
}

/// An event produced by an [`AsyncPacketSocket`].
///
/// `Connect` and `Close` are only emitted by stream sockets; datagram
/// sockets emit `Packet` events exclusively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connect,
    Close(i32),
    Packet { data: Vec<u8>, from: SocketAddr },
}

/// A non-blocking packet socket.
///
/// Identity matters: consumers compare sockets with [`Arc::ptr_eq`] to
/// filter events from sockets that have since been replaced.
#[async_trait]
pub trait AsyncPacketSocket {
    /// Writes a datagram (or stream chunk) to `target`.
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize>;

    /// Waits for the next connect/close/read event. Returns an error once
    /// the socket is closed and no further events will be produced.
    async fn next_event(&self) -> Result<SocketEvent>;

    async fn set_option(&self, opt: SocketOption, value: i32) -> Result<()>;

    fn local_addr(&self) -> Result<SocketAddr>;

    /// The connected remote address, for stream sockets.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// The most recent error produced by the socket, if any.
    fn last_error(&self) -> Option<Error>;

    async fn close(&self) -> Result<()>;
}

/// How outgoing stream connections traverse a proxy.
#[derive(Default, PartialEq, Eq, Debug, Clone, Copy)]
pub enum ProxyType {
    #[default]
    None,
    Https,
    Socks5,
    Unknown,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ProxyType::None => "none",
            ProxyType::Https => "https",
            ProxyType::Socks5 => "socks5",
            ProxyType::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Proxy configuration consulted when creating client TCP sockets.
#[derive(Default, Debug, Clone)]
pub struct ProxyInfo {
    pub proxy_type: ProxyType,
    pub address: Option<SocketAddr>,
}

/// Creates the sockets a relay port talks to its servers through.
#[async_trait]
pub trait PacketSocketFactory {
    /// An unconnected UDP socket bound to `bind_addr`, with its port picked
    /// from `[min_port, max_port]` (0 meaning any).
    async fn udp_socket(
        &self,
        bind_addr: SocketAddr,
        min_port: u16,
        max_port: u16,
    ) -> Result<Arc<dyn AsyncPacketSocket + Send + Sync>>;

    /// A client TCP socket to `remote_addr`, optionally through `proxy` and
    /// wrapped in TLS. The socket emits [`SocketEvent::Connect`] once the
    /// stream is established.
    async fn client_tcp_socket(
        &self,
        bind_addr: SocketAddr,
        remote_addr: SocketAddr,
        proxy: &ProxyInfo,
        user_agent: &str,
        tls: bool,
    ) -> Result<Arc<dyn AsyncPacketSocket + Send + Sync>>;
}

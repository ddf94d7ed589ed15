//! Channel-backed fakes for the socket and observer interfaces, plus
//! builders for the server messages tests inject.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use stun::addr::MappedAddress;
use stun::agent::TransactionId;
use stun::attributes::ATTR_MAPPED_ADDRESS;
use stun::error_code::{ErrorCode, ErrorCodeAttribute};
use stun::message::*;
use tokio::sync::{mpsc, Mutex};

use crate::candidate::Candidate;
use crate::error::*;
use crate::proto::*;
use crate::relay_port::RelayPortObserver;
use crate::socket::*;

/// A scriptable socket: the test injects events through the handle and
/// observes everything written to the wire.
pub(crate) struct MockSocket {
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    event_rx: Mutex<mpsc::UnboundedReceiver<SocketEvent>>,
    sent_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    option_tx: mpsc::UnboundedSender<(SocketOption, i32)>,
}

pub(crate) struct MockSocketHandle {
    pub(crate) event_tx: mpsc::UnboundedSender<SocketEvent>,
    pub(crate) sent_rx: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    pub(crate) option_rx: mpsc::UnboundedReceiver<(SocketOption, i32)>,
}

impl MockSocket {
    pub(crate) fn new(
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, MockSocketHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (option_tx, option_rx) = mpsc::unbounded_channel();
        (
            Arc::new(MockSocket {
                local_addr,
                remote_addr,
                event_rx: Mutex::new(event_rx),
                sent_tx,
                option_tx,
            }),
            MockSocketHandle {
                event_tx,
                sent_rx,
                option_rx,
            },
        )
    }
}

#[async_trait]
impl AsyncPacketSocket for MockSocket {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize> {
        self.sent_tx
            .send((data.to_vec(), target))
            .map_err(|_| Error::ErrSocketClosed)?;
        Ok(data.len())
    }

    async fn next_event(&self) -> Result<SocketEvent> {
        self.event_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ErrSocketClosed)
    }

    async fn set_option(&self, opt: SocketOption, value: i32) -> Result<()> {
        let _ = self.option_tx.send((opt, value));
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn last_error(&self) -> Option<Error> {
        None
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Records every socket the port asks for.
pub(crate) struct SocketRequest {
    pub(crate) proto: &'static str,
    pub(crate) bind_addr: SocketAddr,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) tls: bool,
}

/// Hands out pre-scripted sockets in order; runs dry with an error.
#[derive(Default)]
pub(crate) struct MockSocketFactory {
    udp_sockets: Mutex<VecDeque<Arc<dyn AsyncPacketSocket + Send + Sync>>>,
    tcp_sockets: Mutex<VecDeque<Arc<dyn AsyncPacketSocket + Send + Sync>>>,
    pub(crate) created: Mutex<Vec<SocketRequest>>,
}

impl MockSocketFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockSocketFactory::default())
    }

    pub(crate) async fn script_udp(&self, socket: Arc<dyn AsyncPacketSocket + Send + Sync>) {
        self.udp_sockets.lock().await.push_back(socket);
    }

    pub(crate) async fn script_tcp(&self, socket: Arc<dyn AsyncPacketSocket + Send + Sync>) {
        self.tcp_sockets.lock().await.push_back(socket);
    }
}

#[async_trait]
impl PacketSocketFactory for MockSocketFactory {
    async fn udp_socket(
        &self,
        bind_addr: SocketAddr,
        _min_port: u16,
        _max_port: u16,
    ) -> Result<Arc<dyn AsyncPacketSocket + Send + Sync>> {
        self.created.lock().await.push(SocketRequest {
            proto: "udp",
            bind_addr,
            remote_addr: None,
            tls: false,
        });
        self.udp_sockets
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| Error::Other("no scripted udp socket".to_owned()))
    }

    async fn client_tcp_socket(
        &self,
        bind_addr: SocketAddr,
        remote_addr: SocketAddr,
        _proxy: &ProxyInfo,
        _user_agent: &str,
        tls: bool,
    ) -> Result<Arc<dyn AsyncPacketSocket + Send + Sync>> {
        self.created.lock().await.push(SocketRequest {
            proto: "tcp",
            bind_addr,
            remote_addr: Some(remote_addr),
            tls,
        });
        self.tcp_sockets
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| Error::Other("no scripted tcp socket".to_owned()))
    }
}

/// Forwards every signal into a channel the test drains.
pub(crate) struct MockObserver {
    address_ready_tx: mpsc::UnboundedSender<Vec<Candidate>>,
    connect_failure_tx: mpsc::UnboundedSender<ProtocolAddress>,
    soft_timeout_tx: mpsc::UnboundedSender<ProtocolAddress>,
    unmatched_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr, ProtocolType)>,
}

pub(crate) struct ObserverEvents {
    pub(crate) address_ready: mpsc::UnboundedReceiver<Vec<Candidate>>,
    pub(crate) connect_failure: mpsc::UnboundedReceiver<ProtocolAddress>,
    pub(crate) soft_timeout: mpsc::UnboundedReceiver<ProtocolAddress>,
    pub(crate) unmatched: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr, ProtocolType)>,
}

impl MockObserver {
    pub(crate) fn new() -> (Arc<Self>, ObserverEvents) {
        let (address_ready_tx, address_ready) = mpsc::unbounded_channel();
        let (connect_failure_tx, connect_failure) = mpsc::unbounded_channel();
        let (soft_timeout_tx, soft_timeout) = mpsc::unbounded_channel();
        let (unmatched_tx, unmatched) = mpsc::unbounded_channel();
        (
            Arc::new(MockObserver {
                address_ready_tx,
                connect_failure_tx,
                soft_timeout_tx,
                unmatched_tx,
            }),
            ObserverEvents {
                address_ready,
                connect_failure,
                soft_timeout,
                unmatched,
            },
        )
    }
}

#[async_trait]
impl RelayPortObserver for MockObserver {
    async fn on_address_ready(&self, candidates: Vec<Candidate>) {
        let _ = self.address_ready_tx.send(candidates);
    }

    async fn on_connect_failure(&self, address: &ProtocolAddress) {
        let _ = self.connect_failure_tx.send(address.clone());
    }

    async fn on_soft_timeout(&self, address: &ProtocolAddress) {
        let _ = self.soft_timeout_tx.send(address.clone());
    }

    async fn on_unmatched_packet(&self, data: &[u8], from: SocketAddr, proto: ProtocolType) {
        let _ = self.unmatched_tx.send((data.to_vec(), from, proto));
    }
}

pub(crate) fn decode_message(raw: &[u8]) -> Message {
    let mut msg = Message::new();
    msg.raw = raw.to_vec();
    msg.decode().expect("valid STUN message");
    msg
}

/// Allocate success response for a captured request, framed the way the
/// server frames it (magic cookie first).
pub(crate) fn allocate_response_packet(request_raw: &[u8], mapped: SocketAddr) -> Vec<u8> {
    let request = decode_message(request_raw);
    let mut msg = Message::new();
    msg.build(&[
        Box::new(request.transaction_id),
        Box::new(allocate_response()),
        Box::new(MagicCookie),
    ])
    .unwrap();
    let mapped = MappedAddress {
        ip: mapped.ip(),
        port: mapped.port(),
    };
    mapped.add_to_as(&mut msg, ATTR_MAPPED_ADDRESS).unwrap();
    msg.raw
}

/// Allocate error response for a captured request.
pub(crate) fn allocate_error_response_packet(request_raw: &[u8], code: u16) -> Vec<u8> {
    let request = decode_message(request_raw);
    let mut msg = Message::new();
    msg.build(&[
        Box::new(request.transaction_id),
        Box::new(allocate_error_response()),
        Box::new(MagicCookie),
        Box::new(ErrorCodeAttribute {
            code: ErrorCode(code),
            reason: b"denied".to_vec(),
        }),
    ])
    .unwrap();
    msg.raw
}

/// Send response, optionally confirming a destination lock.
pub(crate) fn send_response_packet(options: Option<u32>) -> Vec<u8> {
    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(TransactionId::new()),
        Box::new(send_response()),
        Box::new(MagicCookie),
    ];
    if let Some(bits) = options {
        setters.push(Box::new(Options(bits)));
    }
    let mut msg = Message::new();
    msg.build(&setters).unwrap();
    msg.raw
}

/// Data indication carrying a forwarded payload from `source`.
pub(crate) fn data_indication_packet(source: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut msg = Message::new();
    msg.build(&[
        Box::new(TransactionId::new()),
        Box::new(data_indication()),
        Box::new(MagicCookie),
        Box::new(SourceAddress2 {
            ip: source.ip(),
            port: source.port(),
        }),
        Box::new(Data(payload.to_vec())),
    ])
    .unwrap();
    msg.raw
}

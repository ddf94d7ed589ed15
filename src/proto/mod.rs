#[cfg(test)]
mod proto_test;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use stun::addr::MappedAddress;
#[cfg(test)]
use stun::agent::TransactionId;
use stun::attributes::*;
use stun::checks::*;
use stun::message::*;

// proto implements the pre-standard relay dialect spoken by legacy
// Google-style relay servers: ALLOCATE for the public binding, SEND to wrap
// outbound payloads, DATA indications for inbound ones.

/// Relay magic cookie, carried as the first attribute of every SEND request.
///
/// Because the message header is 20 bytes and the attribute TLV header is 4,
/// the cookie value always sits at byte offset 24 of the datagram, which is
/// what lets a receiver distinguish framed relay messages from raw forwarded
/// payloads on the same socket.
pub const TURN_MAGIC_COOKIE_VALUE: [u8; 4] = [0x72, 0xc6, 0x4b, 0xc6];

/// Byte offset at which the magic cookie value appears in a framed message.
pub const MAGIC_COOKIE_OFFSET: usize = MESSAGE_HEADER_SIZE + ATTRIBUTE_HEADER_SIZE;

/// OPTIONS bit asking the server to bind the allocation to the packet's
/// destination, after which traffic in both directions may flow unframed.
pub const OPTION_LOCK_DESTINATION: u32 = 0x1;

pub const ATTR_MAGIC_COOKIE: AttrType = AttrType(0x000F); // MAGIC-COOKIE
pub const ATTR_DESTINATION_ADDRESS: AttrType = AttrType(0x0011); // DESTINATION-ADDRESS
pub const ATTR_SOURCE_ADDRESS2: AttrType = AttrType(0x0012); // SOURCE-ADDRESS2
pub const ATTR_OPTIONS: AttrType = AttrType(0x8001); // OPTIONS

/// Returns true iff `data` carries the relay magic cookie at the fixed
/// offset. Shorter datagrams are not framed messages.
pub fn has_magic_cookie(data: &[u8]) -> bool {
    data.len() >= MAGIC_COOKIE_OFFSET + TURN_MAGIC_COOKIE_VALUE.len()
        && data[MAGIC_COOKIE_OFFSET..MAGIC_COOKIE_OFFSET + TURN_MAGIC_COOKIE_VALUE.len()]
            == TURN_MAGIC_COOKIE_VALUE
}

// allocate_request is shorthand for the allocate request message type.
pub fn allocate_request() -> MessageType {
    MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST)
}

// allocate_response is shorthand for the allocate success response type.
pub fn allocate_response() -> MessageType {
    MessageType::new(METHOD_ALLOCATE, CLASS_SUCCESS_RESPONSE)
}

// allocate_error_response is shorthand for the allocate error response type.
pub fn allocate_error_response() -> MessageType {
    MessageType::new(METHOD_ALLOCATE, CLASS_ERROR_RESPONSE)
}

// send_request is shorthand for the send request message type.
pub fn send_request() -> MessageType {
    MessageType::new(METHOD_SEND, CLASS_REQUEST)
}

// send_response is shorthand for the send success response type.
pub fn send_response() -> MessageType {
    MessageType::new(METHOD_SEND, CLASS_SUCCESS_RESPONSE)
}

// data_indication is shorthand for the data indication message type.
pub fn data_indication() -> MessageType {
    MessageType::new(METHOD_DATA, CLASS_INDICATION)
}

/// Transport protocol of a relay server endpoint.
///
/// The ordering is the preference order for connections: UDP first, then
/// TCP, then TLS-over-TCP.
#[derive(Default, PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
pub enum ProtocolType {
    #[default]
    Udp,
    Tcp,
    Ssltcp,
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ProtocolType::Udp => "udp",
            ProtocolType::Tcp => "tcp",
            ProtocolType::Ssltcp => "ssltcp",
        };
        write!(f, "{s}")
    }
}

/// A relay server endpoint: one transport address reachable over one
/// protocol. Immutable after construction.
#[derive(PartialEq, Eq, Debug, Clone, Hash)]
pub struct ProtocolAddress {
    pub address: SocketAddr,
    pub proto: ProtocolType,
}

impl ProtocolAddress {
    pub fn new(address: SocketAddr, proto: ProtocolType) -> Self {
        ProtocolAddress { address, proto }
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.proto, self.address)
    }
}

/// `MagicCookie` represents the `MAGIC-COOKIE` attribute.
///
/// Its value is the fixed four byte cookie; it must be the first attribute
/// added to a message so that the value lands at the fixed offset.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct MagicCookie;

impl Setter for MagicCookie {
    /// Adds `MAGIC-COOKIE` to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_MAGIC_COOKIE, &TURN_MAGIC_COOKIE_VALUE);
        Ok(())
    }
}

impl Getter for MagicCookie {
    /// Checks that `MAGIC-COOKIE` is present with the expected value.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_MAGIC_COOKIE)?;
        check_size(ATTR_MAGIC_COOKIE, v.len(), TURN_MAGIC_COOKIE_VALUE.len())?;
        if v != TURN_MAGIC_COOKIE_VALUE {
            return Err(stun::Error::Other(format!("bad magic cookie {v:?}")));
        }
        Ok(())
    }
}

/// `DestinationAddress` represents the `DESTINATION-ADDRESS` attribute.
///
/// Carried in SEND requests to tell the server which remote peer the
/// wrapped payload is for. Encoded in the plain (non-XOR) address format.
#[derive(Debug, PartialEq, Eq)]
pub struct DestinationAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl Default for DestinationAddress {
    fn default() -> Self {
        DestinationAddress {
            ip: IpAddr::V4(Ipv4Addr::from(0)),
            port: 0,
        }
    }
}

impl fmt::Display for DestinationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(_) => write!(f, "{}:{}", self.ip, self.port),
            IpAddr::V6(_) => write!(f, "[{}]:{}", self.ip, self.port),
        }
    }
}

impl Setter for DestinationAddress {
    /// Adds `DESTINATION-ADDRESS` to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let a = MappedAddress {
            ip: self.ip,
            port: self.port,
        };
        a.add_to_as(m, ATTR_DESTINATION_ADDRESS)
    }
}

impl Getter for DestinationAddress {
    /// Decodes `DESTINATION-ADDRESS` from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let mut a = MappedAddress::default();
        a.get_from_as(m, ATTR_DESTINATION_ADDRESS)?;
        self.ip = a.ip;
        self.port = a.port;
        Ok(())
    }
}

/// `SourceAddress2` represents the `SOURCE-ADDRESS2` attribute.
///
/// Carried in DATA indications to name the remote peer a forwarded payload
/// came from. Only IPv4 sources are accepted by this implementation; the
/// caller checks the decoded family.
#[derive(Debug, PartialEq, Eq)]
pub struct SourceAddress2 {
    pub ip: IpAddr,
    pub port: u16,
}

impl Default for SourceAddress2 {
    fn default() -> Self {
        SourceAddress2 {
            ip: IpAddr::V4(Ipv4Addr::from(0)),
            port: 0,
        }
    }
}

impl Setter for SourceAddress2 {
    /// Adds `SOURCE-ADDRESS2` to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let a = MappedAddress {
            ip: self.ip,
            port: self.port,
        };
        a.add_to_as(m, ATTR_SOURCE_ADDRESS2)
    }
}

impl Getter for SourceAddress2 {
    /// Decodes `SOURCE-ADDRESS2` from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let mut a = MappedAddress::default();
        a.get_from_as(m, ATTR_SOURCE_ADDRESS2)?;
        self.ip = a.ip;
        self.port = a.port;
        Ok(())
    }
}

// uint32 flags
const OPTIONS_SIZE: usize = 4; // 4 bytes, 32 bits

/// `Options` represents the `OPTIONS` attribute, a 32-bit flag word.
///
/// A SEND request with bit 0x1 set asks the server to lock the allocation
/// to the destination; a SEND response echoing the bit confirms the lock.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct Options(pub u32);

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Setter for Options {
    /// Adds `OPTIONS` to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let mut v = vec![0; OPTIONS_SIZE];
        v.copy_from_slice(&self.0.to_be_bytes());
        m.add(ATTR_OPTIONS, &v);
        Ok(())
    }
}

impl Getter for Options {
    /// Decodes `OPTIONS` from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_OPTIONS)?;
        check_size(ATTR_OPTIONS, v.len(), OPTIONS_SIZE)?;
        self.0 = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        Ok(())
    }
}

/// `Data` represents the `DATA` attribute: the user payload wrapped by a
/// SEND request or a DATA indication.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct Data(pub Vec<u8>);

impl Setter for Data {
    /// Adds `DATA` to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_DATA, &self.0);
        Ok(())
    }
}

impl Getter for Data {
    /// Decodes `DATA` from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        self.0 = m.get(ATTR_DATA)?;
        Ok(())
    }
}

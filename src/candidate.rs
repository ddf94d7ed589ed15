use std::fmt;
use std::net::SocketAddr;

use crate::proto::ProtocolType;

/// Represents the type of an ICE candidate.
#[derive(Default, PartialEq, Eq, Debug, Clone, Copy)]
pub enum CandidateType {
    #[default]
    Unspecified,
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
            CandidateType::Unspecified => "Unknown candidate type",
        };
        write!(f, "{s}")
    }
}

/// Where a remote candidate was learned from, relative to the port asked to
/// create a connection for it.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum CandidateOrigin {
    ThisPort,
    OtherPort,
    Message,
}

/// A transport candidate as exchanged by the ICE layer.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Candidate {
    pub address: SocketAddr,
    pub protocol: ProtocolType,
    pub candidate_type: CandidateType,
    /// The address this candidate was derived from, e.g. the relay server's
    /// view of the client for relay candidates.
    pub related_address: Option<SocketAddr>,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.candidate_type, self.protocol, self.address
        )?;
        if let Some(related) = &self.related_address {
            write!(f, " related {related}")?;
        }
        Ok(())
    }
}

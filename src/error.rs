use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("relay: no connected entry is available yet")]
    ErrWouldBlock,
    #[error("relay: entry has no connection to the relay server")]
    ErrNotConnected,
    #[error("relay: port has been closed")]
    ErrClosed,
    #[error("relay: socket is closed")]
    ErrSocketClosed,
    #[error("{0}")]
    Stun(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

// stun::Error and io::Error are kept by message only so that Error stays
// Clone + PartialEq, which RelayPort::last_error() relies on.
impl From<stun::Error> for Error {
    fn from(e: stun::Error) -> Self {
        Error::Stun(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

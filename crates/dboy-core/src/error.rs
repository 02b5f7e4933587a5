use crate::handshake::HandshakeError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("frame length {0} out of range")]
    FrameLength(usize),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),
    #[error(transparent)]
    Storage(#[from] dboy_storage::Error),
}

impl Error {
    pub fn is_invalid_link(&self) -> bool {
        matches!(self, Error::Storage(dboy_storage::Error::InvalidLinkFormat(_)))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Storage(dboy_storage::Error::Integrity { .. }))
    }

    /// Peer closed the stream on a frame boundary.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

//! Encrypted, framed message channel over one byte stream.
//!
//! Each direction runs its own AES-256-CTR keystream. Key and IV per
//! direction come from HKDF-SHA256 over the session password, so the two
//! directions never share keystream. Because CTR is stateful, frames must be
//! read in the order they were written; any failure closes the channel.

use crate::error::{Error, Result};
use crate::handshake::{read_lp, write_lp, HandshakeError, MAX_MESSAGE_SIZE};
use crate::message::Message;
use aes::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

const LISTENER_TO_CONNECTOR: &[u8] = b"dboy listener->connector";
const CONNECTOR_TO_LISTENER: &[u8] = b"dboy connector->listener";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Connector,
}

pub struct SecureChannel<S> {
    stream: S,
    encryptor: Aes256Ctr,
    decryptor: Aes256Ctr,
    limit: Duration,
    closed: bool,
}

fn keystream(password: &[u8], info: &[u8]) -> Result<Aes256Ctr> {
    let hk = Hkdf::<Sha256>::new(None, password);
    let mut okm = Zeroizing::new([0u8; 48]);
    hk.expand(info, &mut okm[..])
        .map_err(|_| HandshakeError::Crypto("HKDF expand failed".into()))?;
    Aes256Ctr::new_from_slices(&okm[..32], &okm[32..])
        .map_err(|e| HandshakeError::Crypto(e.to_string()).into())
}

fn closed() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "channel closed",
    ))
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, password: &[u8], role: Role, limit: Duration) -> Result<Self> {
        let (send_info, recv_info) = match role {
            Role::Listener => (LISTENER_TO_CONNECTOR, CONNECTOR_TO_LISTENER),
            Role::Connector => (CONNECTOR_TO_LISTENER, LISTENER_TO_CONNECTOR),
        };
        Ok(Self {
            stream,
            encryptor: keystream(password, send_info)?,
            decryptor: keystream(password, recv_info)?,
            limit,
            closed: false,
        })
    }

    /// Read the next message. `None` means the peer sent an empty payload.
    pub async fn read(&mut self) -> Result<Option<Message>> {
        if self.closed {
            return Err(closed());
        }
        let mut frame = match read_lp(&mut self.stream, self.limit).await {
            Ok(f) => f,
            Err(e) => {
                self.close().await;
                return Err(e);
            }
        };

        self.decryptor.apply_keystream(&mut frame);
        if frame.is_empty() {
            return Ok(None);
        }
        match bincode::deserialize(&frame) {
            Ok(m) => Ok(Some(m)),
            Err(e) => {
                self.close().await;
                Err(e.into())
            }
        }
    }

    pub async fn write(&mut self, msg: &Message) -> Result<()> {
        if self.closed {
            return Err(closed());
        }
        let mut buf = bincode::serialize(msg)?;
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(Error::FrameLength(buf.len()));
        }

        self.encryptor.apply_keystream(&mut buf);
        if let Err(e) = write_lp(&mut self.stream, &buf, self.limit).await {
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Shut the underlying stream down. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = tokio::time::timeout(self.limit, self.stream.shutdown()).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S> fmt::Debug for SecureChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

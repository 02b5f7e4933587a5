//! Handshake implementation.
//!
//! - The listener sends its per-run RSA public key (PKCS#1 DER).
//! - The connector picks a random password, seals it with RSA-OAEP (SHA-256)
//!   and sends it back.
//! - Both sides key an AES-256-CTR [`SecureChannel`] from the password and the
//!   listener confirms with a framed OK message.
//!
//! Raw handshake payloads and encrypted frames share one framing: a u32
//! little-endian length followed by that many bytes.

use crate::channel::{Role, SecureChannel};
use crate::error::{Error, Result};
use crate::keys::SessionKeyPair;
use crate::message::Message;
use rand_core::{OsRng, RngCore};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

/// Largest payload a single frame may carry.
pub const MAX_MESSAGE_SIZE: usize = 16_777_215;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("no session key available")]
    MissingKey,
    #[error("handshake payload length {0} out of range")]
    BadLength(usize),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("peer answered with message type {0} instead of OK")]
    NotAcknowledged(u32),
    #[error("peer closed the channel during the handshake")]
    Closed,
}

/// Run `fut` with a deadline, mapping expiry to [`Error::Timeout`].
pub(crate) async fn timed<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(limit))?
}

/// Write one length-prefixed frame (u32 LE length). An empty payload still
/// sends a zero prefix.
pub(crate) async fn write_lp<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    data: &[u8],
    limit: Duration,
) -> Result<()> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(Error::FrameLength(data.len()));
    }
    timed(limit, async {
        transport.write_all(&(data.len() as u32).to_le_bytes()).await?;
        transport.write_all(data).await?;
        transport.flush().await?;
        Ok::<_, Error>(())
    })
    .await
}

/// Read one length-prefixed frame. A bad length fails before any payload
/// byte is consumed.
pub(crate) async fn read_lp<T: AsyncRead + Unpin + Send>(
    transport: &mut T,
    limit: Duration,
) -> Result<Vec<u8>> {
    timed(limit, async {
        let mut lenb = [0u8; 4];
        transport.read_exact(&mut lenb).await?;
        let len = u32::from_le_bytes(lenb) as usize;

        if len == 0 || len > MAX_MESSAGE_SIZE {
            return Err(Error::FrameLength(len));
        }

        let mut buf = vec![0u8; len];
        transport.read_exact(&mut buf).await?;
        Ok::<_, Error>(buf)
    })
    .await
}

fn as_handshake(e: Error) -> Error {
    match e {
        Error::FrameLength(n) => HandshakeError::BadLength(n).into(),
        other => other,
    }
}

/// Listener side: publish the key, recover the password, confirm with OK.
pub async fn accept<S>(
    mut stream: S,
    keys: Option<&SessionKeyPair>,
    limit: Duration,
) -> Result<SecureChannel<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let password = match recover_password(&mut stream, keys, limit).await {
        Ok(p) => p,
        Err(e) => {
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    let mut channel = SecureChannel::new(stream, &password, Role::Listener, limit)?;
    channel.write(&Message::ok()).await?;
    tracing::debug!("Handshake complete (listener)");
    Ok(channel)
}

async fn recover_password<S>(
    stream: &mut S,
    keys: Option<&SessionKeyPair>,
    limit: Duration,
) -> Result<Zeroizing<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let keys = keys.ok_or(HandshakeError::MissingKey)?;
    write_lp(stream, keys.public_key_bytes(), limit).await?;

    let sealed = read_lp(stream, limit).await.map_err(as_handshake)?;
    Ok(keys.decrypt(&sealed)?)
}

/// Connector side: seal a fresh password for the listener's key and wait for
/// its OK.
pub async fn connect<S>(
    mut stream: S,
    password_size: usize,
    limit: Duration,
) -> Result<SecureChannel<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let password = match send_password(&mut stream, password_size, limit).await {
        Ok(p) => p,
        Err(e) => {
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    let mut channel = SecureChannel::new(stream, &password, Role::Connector, limit)?;
    match channel.read().await? {
        Some(m) if m.is_ok() => {
            tracing::debug!("Handshake complete (connector)");
            Ok(channel)
        }
        other => {
            channel.close().await;
            Err(match other {
                Some(m) => HandshakeError::NotAcknowledged(m.kind),
                None => HandshakeError::Closed,
            }
            .into())
        }
    }
}

async fn send_password<S>(
    stream: &mut S,
    password_size: usize,
    limit: Duration,
) -> Result<Zeroizing<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let public_der = read_lp(stream, limit).await.map_err(as_handshake)?;

    let mut password = Zeroizing::new(vec![0u8; password_size]);
    OsRng.fill_bytes(&mut password);

    let sealed = SessionKeyPair::seal_for(&public_der, &password)?;
    write_lp(stream, &sealed, limit).await?;
    Ok(password)
}

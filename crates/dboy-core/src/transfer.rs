//! Chunk transfer over an established [`SecureChannel`].
//!
//! The connector asks for one chunk at a time, starting at the number of
//! bytes it already holds, and the listener streams that chunk back as
//! pieces followed by a chunk-end marker.

use crate::channel::SecureChannel;
use crate::error::{Error, Result};
use crate::library::{Library, LibraryItem};
use crate::message::Message;
use async_trait::async_trait;
use dboy_storage::{chunk_count, chunk_len, ContentHash, DownloadItem, CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Bytes carried by one piece message.
pub const PIECE_SIZE: usize = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub full_hash: String,
    pub size: u64,
    pub index: u64,
    pub offset: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Something that can hand out files by content identity.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    type File: ChunkFile;

    /// The file with this identity, or `None` if it is not available here.
    async fn open(&self, full_hash: &str, size: u64) -> Result<Option<Arc<Self::File>>>;
}

#[async_trait]
pub trait ChunkFile: Send + Sync {
    /// `len` bytes at absolute `position`.
    async fn read(&self, position: u64, len: usize) -> Result<Vec<u8>>;
}

#[async_trait]
impl ChunkSource for Library {
    type File = LibraryItem;

    async fn open(&self, full_hash: &str, size: u64) -> Result<Option<Arc<LibraryItem>>> {
        Ok(self.find(full_hash, size).await)
    }
}

#[async_trait]
impl ChunkFile for LibraryItem {
    async fn read(&self, position: u64, len: usize) -> Result<Vec<u8>> {
        self.read_range(position, len).await
    }
}

/// Answer chunk requests until the peer hangs up.
pub async fn serve<S, C>(channel: &mut SecureChannel<S>, source: &C) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: ChunkSource,
{
    loop {
        let msg = match channel.read().await {
            Ok(Some(m)) => m,
            Ok(None) => continue,
            Err(e) if e.is_eof() => return Ok(()),
            Err(e) => return Err(e),
        };
        match msg.kind {
            Message::CHUNK_REQUEST => {
                let req: ChunkRequest = msg.decode_body()?;
                send_chunk(channel, source, &req).await?;
            }
            other => tracing::debug!("Ignoring message type {}", other),
        }
    }
}

async fn send_chunk<S, C>(channel: &mut SecureChannel<S>, source: &C, req: &ChunkRequest) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: ChunkSource,
{
    let len = chunk_len(req.size, req.index);
    if req.index >= chunk_count(req.size) || req.offset > len {
        return channel.write(&Message::new(Message::NOT_FOUND)).await;
    }
    let Some(file) = source.open(&req.full_hash, req.size).await? else {
        return channel.write(&Message::new(Message::NOT_FOUND)).await;
    };
    tracing::debug!("Serving chunk {} of {} from {}", req.index, req.full_hash, req.offset);

    let mut offset = req.offset;
    while offset < len {
        let n = (len - offset).min(PIECE_SIZE as u64) as usize;
        let position = req.index * CHUNK_SIZE + offset;
        let data = file.read(position, n).await?;
        let piece = Piece {
            index: req.index,
            offset,
            data,
        };
        channel.write(&Message::with_body(Message::PIECE, &piece)?).await?;
        offset += n as u64;
    }
    channel.write(&Message::new(Message::CHUNK_END)).await
}

/// Pull every missing chunk of `item` from the peer, then verify the result
/// against the declared content hash.
pub async fn download<S>(channel: &mut SecureChannel<S>, item: &DownloadItem) -> Result<ContentHash>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    item.set_sources(1);
    let result = fetch_pending(channel, item).await;
    item.set_sources(0);
    result?;

    tracing::info!("{}: all chunks received, verifying", item.file_name());
    Ok(item.verify().await?)
}

async fn fetch_pending<S>(channel: &mut SecureChannel<S>, item: &DownloadItem) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    for chunk in item.pending().await {
        let req = ChunkRequest {
            full_hash: item.full_hash().to_string(),
            size: item.size(),
            index: chunk.index,
            offset: chunk.completed,
        };
        channel.write(&Message::with_body(Message::CHUNK_REQUEST, &req)?).await?;

        loop {
            let Some(msg) = channel.read().await? else {
                continue;
            };
            match msg.kind {
                Message::PIECE => {
                    let piece: Piece = msg.decode_body()?;
                    if piece.index != chunk.index {
                        return Err(Error::Protocol(format!(
                            "asked for chunk {}, got {}",
                            chunk.index, piece.index
                        )));
                    }
                    item.write_piece(piece.index, piece.offset, &piece.data).await?;
                }
                Message::CHUNK_END => break,
                Message::NOT_FOUND => {
                    return Err(Error::Protocol(format!(
                        "peer does not have chunk {} of {}",
                        chunk.index,
                        item.file_name()
                    )));
                }
                other => {
                    return Err(Error::Protocol(format!("unexpected message type {other}")));
                }
            }
        }
    }
    Ok(())
}

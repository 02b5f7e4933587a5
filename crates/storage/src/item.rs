//! A single persistent transfer: a preallocated `.tmp` data file plus a
//! `.meta` file recording per-chunk completion.

use crate::error::{Error, Result};
use crate::hash::{chunk_count, chunk_len, ContentHash, CHUNK_SIZE};
use crate::link::ShareLink;
use crate::pool::WorkerPool;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

const ZERO_BLOCK: usize = 64 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub index: u64,
    pub completed: u64,
}

/// On-disk layout of the `.meta` file.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct Meta {
    name: String,
    chunks: Vec<ChunkProgress>,
}

pub struct DownloadItem {
    link: ShareLink,
    data_path: PathBuf,
    meta_path: PathBuf,
    chunks: Mutex<Vec<ChunkProgress>>,
    sources: watch::Sender<u32>,
    received: watch::Sender<u64>,
    disposed: AtomicBool,
    pool: WorkerPool,
}

pub(crate) fn data_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.tmp"))
}

pub(crate) fn meta_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.meta"))
}

impl DownloadItem {
    /// Allocate the backing files for a new transfer.
    pub(crate) async fn create(dir: &Path, link: ShareLink, pool: WorkerPool) -> Result<Self> {
        let stem = link.stem();
        let data_path = data_path(dir, &stem);
        let meta_path = meta_path(dir, &stem);

        let chunks: Vec<ChunkProgress> = (0..chunk_count(link.size))
            .map(|index| ChunkProgress { index, completed: 0 })
            .collect();

        let written = match allocate(&data_path, link.size).await {
            Ok(()) => write_meta(&meta_path, &link.file_name, &chunks).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!("Allocating {} failed: {}", link.file_name, e);
            for path in [&data_path, &meta_path] {
                if let Err(e) = fs::remove_file(path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::debug!("Leaving {}: {}", path.display(), e);
                    }
                }
            }
            return Err(e);
        }

        tracing::info!("Allocated {} ({} bytes, {} chunks)", link.file_name, link.size, chunks.len());
        Ok(Self::assemble(link, data_path, meta_path, chunks, pool))
    }

    /// Rebuild a transfer from an existing `.tmp`/`.meta` pair.
    pub(crate) async fn open(dir: &Path, full_hash: &str, size: u64, pool: WorkerPool) -> Result<Self> {
        let stem = format!("{full_hash}_{size}");
        let data_path = data_path(dir, &stem);
        let meta_path = meta_path(dir, &stem);

        let meta: Meta = serde_json::from_slice(&fs::read(&meta_path).await?)?;
        let link = ShareLink::new(meta.name, size, full_hash)?;

        let expected = chunk_count(size);
        let valid = meta.chunks.len() as u64 == expected
            && meta.chunks.iter().enumerate().all(|(i, c)| {
                c.index == i as u64 && c.completed <= chunk_len(size, c.index)
            });
        if !valid {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} has inconsistent chunk table", meta_path.display()),
            )));
        }

        let on_disk = fs::metadata(&data_path).await?.len();
        if on_disk != size {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} is {on_disk} bytes, expected {size}", data_path.display()),
            )));
        }

        Ok(Self::assemble(link, data_path, meta_path, meta.chunks, pool))
    }

    fn assemble(
        link: ShareLink,
        data_path: PathBuf,
        meta_path: PathBuf,
        chunks: Vec<ChunkProgress>,
        pool: WorkerPool,
    ) -> Self {
        let received: u64 = chunks.iter().map(|c| c.completed).sum();
        Self {
            link,
            data_path,
            meta_path,
            chunks: Mutex::new(chunks),
            sources: watch::channel(0).0,
            received: watch::channel(received).0,
            disposed: AtomicBool::new(false),
            pool,
        }
    }

    pub fn link(&self) -> &ShareLink {
        &self.link
    }

    pub fn file_name(&self) -> &str {
        &self.link.file_name
    }

    pub fn size(&self) -> u64 {
        self.link.size
    }

    pub fn full_hash(&self) -> &str {
        &self.link.full_hash
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn sources(&self) -> u32 {
        *self.sources.borrow()
    }

    pub fn set_sources(&self, n: u32) {
        self.sources.send_if_modified(|cur| {
            let changed = *cur != n;
            *cur = n;
            changed
        });
    }

    pub fn subscribe_sources(&self) -> watch::Receiver<u32> {
        self.sources.subscribe()
    }

    pub fn total_bytes_received(&self) -> u64 {
        *self.received.borrow()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<u64> {
        self.received.subscribe()
    }

    pub async fn chunks(&self) -> Vec<ChunkProgress> {
        self.chunks.lock().await.clone()
    }

    /// Chunks that still need bytes, as `(index, completed)`.
    pub async fn pending(&self) -> Vec<ChunkProgress> {
        let size = self.size();
        self.chunks
            .lock()
            .await
            .iter()
            .filter(|c| c.completed < chunk_len(size, c.index))
            .copied()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.total_bytes_received() == self.size()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Store `data` at `offset` within chunk `index` and persist progress.
    pub async fn write_piece(&self, index: u64, offset: u64, data: &[u8]) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed(self.link.stem()));
        }
        let limit = chunk_len(self.size(), index);
        let end = offset.checked_add(data.len() as u64);
        let Some(end) = end.filter(|end| index < chunk_count(self.size()) && *end <= limit) else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("piece {index}@{offset}+{} outside chunk of {limit} bytes", data.len()),
            )));
        };

        let mut chunks = self.chunks.lock().await;
        let chunk = &mut chunks[index as usize];
        if offset > chunk.completed {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("piece {index}@{offset} leaves a gap after {}", chunk.completed),
            )));
        }

        let mut f = OpenOptions::new().write(true).open(&self.data_path).await?;
        f.seek(SeekFrom::Start(index * CHUNK_SIZE + offset)).await?;
        f.write_all(data).await?;
        f.flush().await?;

        let gained = end.saturating_sub(chunk.completed);
        chunk.completed = chunk.completed.max(end);

        write_meta(&self.meta_path, &self.link.file_name, &chunks).await?;
        drop(chunks);

        if gained > 0 {
            self.received.send_modify(|r| *r += gained);
        }
        tracing::debug!("{}: chunk {} now at {}", self.link.file_name, index, end);
        Ok(())
    }

    /// Re-hash the data file and compare against the declared hash. On a
    /// mismatch every chunk is marked empty again so the next fetch starts
    /// over.
    pub async fn verify(&self) -> Result<ContentHash> {
        let path = self.data_path.clone();
        let hash = self.pool.run(move || ContentHash::of_file(&path)).await??;
        if hash.full_hash != self.link.full_hash {
            tracing::warn!("{}: content hash mismatch, discarding progress", self.link.file_name);
            self.reset().await?;
            return Err(Error::Integrity {
                expected: self.link.full_hash.clone(),
                actual: hash.full_hash,
            });
        }
        Ok(hash)
    }

    async fn reset(&self) -> Result<()> {
        let mut chunks = self.chunks.lock().await;
        for chunk in chunks.iter_mut() {
            chunk.completed = 0;
        }
        write_meta(&self.meta_path, &self.link.file_name, &chunks).await?;
        self.received.send_replace(0);
        Ok(())
    }

    /// Remove both backing files. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut errors = Vec::new();
        for path in [&self.data_path, &self.meta_path] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => errors.push(Error::Io(e)),
            }
        }
        if !errors.is_empty() {
            self.disposed.store(false, Ordering::SeqCst);
        }
        crate::error::aggregate(errors)
    }
}

impl std::fmt::Debug for DownloadItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadItem")
            .field("file_name", &self.link.file_name)
            .field("size", &self.link.size)
            .field("full_hash", &self.link.full_hash)
            .field("sources", &self.sources())
            .field("total_bytes_received", &self.total_bytes_received())
            .finish()
    }
}

async fn write_meta(path: &Path, name: &str, chunks: &[ChunkProgress]) -> Result<()> {
    let meta = Meta {
        name: name.to_string(),
        chunks: chunks.to_vec(),
    };
    fs::write(path, serde_json::to_vec(&meta)?).await?;
    Ok(())
}

/// Write explicit zeros up to `size`; sparse files are not relied upon.
async fn allocate(path: &Path, size: u64) -> Result<()> {
    let mut f = fs::File::create(path).await?;
    let zeros = vec![0u8; ZERO_BLOCK];
    let mut left = size;
    while left > 0 {
        let n = left.min(ZERO_BLOCK as u64) as usize;
        f.write_all(&zeros[..n]).await?;
        left -= n as u64;
    }
    f.flush().await?;
    f.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    fn link_for(data: &[u8], name: &str) -> ShareLink {
        let chunk = hex::encode(Sha256::digest(data));
        let full = hex::encode(Sha256::digest(chunk.as_bytes()));
        ShareLink::new(name, data.len() as u64, &full).unwrap()
    }

    #[tokio::test]
    async fn create_preallocates_and_writes_meta() -> Result<()> {
        let temp = TempDir::new()?;
        let link = ShareLink::new("a.bin", 5000, &"1".repeat(64))?;
        let item = DownloadItem::create(temp.path(), link, WorkerPool::new(1)).await?;

        assert_eq!(fs::metadata(item.data_path()).await?.len(), 5000);
        let meta: Meta = serde_json::from_slice(&fs::read(item.meta_path()).await?)?;
        assert_eq!(meta.name, "a.bin");
        assert_eq!(meta.chunks, vec![ChunkProgress { index: 0, completed: 0 }]);
        assert_eq!(item.total_bytes_received(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn pieces_advance_progress_and_persist() -> Result<()> {
        let temp = TempDir::new()?;
        let data = b"hello world".to_vec();
        let link = link_for(&data, "hello.txt");
        let item = DownloadItem::create(temp.path(), link.clone(), WorkerPool::new(1)).await?;
        let mut progress = item.subscribe_progress();

        item.write_piece(0, 0, &data[..5]).await?;
        assert!(progress.has_changed().unwrap());
        assert_eq!(*progress.borrow_and_update(), 5);

        // Overlapping resend only counts new bytes.
        item.write_piece(0, 3, &data[3..]).await?;
        assert_eq!(item.total_bytes_received(), data.len() as u64);
        assert!(item.is_complete());
        assert!(item.pending().await.is_empty());

        let reopened =
            DownloadItem::open(temp.path(), &link.full_hash, link.size, WorkerPool::new(1)).await?;
        assert_eq!(reopened.total_bytes_received(), data.len() as u64);
        assert_eq!(reopened.file_name(), "hello.txt");

        let hash = item.verify().await?;
        assert_eq!(hash.full_hash, link.full_hash);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_gaps_and_out_of_range() -> Result<()> {
        let temp = TempDir::new()?;
        let link = ShareLink::new("x", 10, &"2".repeat(64))?;
        let item = DownloadItem::create(temp.path(), link, WorkerPool::new(1)).await?;

        assert!(item.write_piece(0, 4, b"ab").await.is_err());
        assert!(item.write_piece(0, 8, b"abc").await.is_err());
        assert!(item.write_piece(1, 0, b"a").await.is_err());
        assert!(matches!(
            item.write_piece(0, u64::MAX, b"ab").await,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::InvalidInput
        ));
        assert_eq!(item.total_bytes_received(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn verify_flags_mismatch() -> Result<()> {
        let temp = TempDir::new()?;
        let link = link_for(b"expected", "e.txt");
        let item = DownloadItem::create(temp.path(), link, WorkerPool::new(1)).await?;
        item.write_piece(0, 0, b"tampered").await?;

        assert!(matches!(item.verify().await, Err(Error::Integrity { .. })));
        assert_eq!(item.total_bytes_received(), 0);
        assert_eq!(item.pending().await, vec![ChunkProgress { index: 0, completed: 0 }]);

        let meta: Meta = serde_json::from_slice(&fs::read(item.meta_path()).await?)?;
        assert_eq!(meta.chunks, vec![ChunkProgress { index: 0, completed: 0 }]);

        item.write_piece(0, 0, b"expected").await?;
        item.verify().await?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_create_leaves_no_files() -> Result<()> {
        let temp = TempDir::new()?;
        let link = ShareLink::new("m", 1024, &"4".repeat(64))?;
        std::fs::create_dir(meta_path(temp.path(), &link.stem()))?;

        assert!(DownloadItem::create(temp.path(), link.clone(), WorkerPool::new(1))
            .await
            .is_err());
        assert!(!data_path(temp.path(), &link.stem()).exists());
        Ok(())
    }

    #[tokio::test]
    async fn dispose_removes_files_once() -> Result<()> {
        let temp = TempDir::new()?;
        let link = ShareLink::new("d", 1, &"3".repeat(64))?;
        let item = DownloadItem::create(temp.path(), link, WorkerPool::new(1)).await?;

        item.dispose().await?;
        assert!(item.is_disposed());
        assert!(!item.data_path().exists());
        assert!(!item.meta_path().exists());
        item.dispose().await?;
        assert!(matches!(item.write_piece(0, 0, b"x").await, Err(Error::Disposed(_))));
        Ok(())
    }
}

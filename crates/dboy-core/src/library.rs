//! Locally shared files.
//!
//! A [`Library`] owns one [`LibraryCollection`] per share folder. Every
//! regular file below a folder is a [`LibraryItem`] whose content hash is
//! computed on the worker pool and cached until the file's size or
//! modification time changes.

use crate::error::{Error, Result};
use dboy_storage::{ContentHash, ShareLink, WorkerPool};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, OnceCell};
use walkdir::WalkDir;

pub struct Library {
    shares: Vec<PathBuf>,
    cwd: PathBuf,
    pool: WorkerPool,
    collections: OnceCell<Vec<Arc<LibraryCollection>>>,
}

impl Library {
    /// Relative share paths are resolved against `cwd`.
    pub fn new(shares: Vec<PathBuf>, cwd: PathBuf, pool: WorkerPool) -> Self {
        Self {
            shares,
            cwd,
            pool,
            collections: OnceCell::new(),
        }
    }

    /// One collection per usable share folder. Folders that cannot be
    /// created or are not directories are left out. Nothing is cached until
    /// at least one folder resolves.
    pub async fn collections(&self) -> Vec<Arc<LibraryCollection>> {
        let scanned = self
            .collections
            .get_or_try_init(|| async {
                let mut out = Vec::new();
                for share in &self.shares {
                    match resolve_dir(&self.cwd, share).await {
                        Ok(root) => out.push(Arc::new(LibraryCollection::new(root, self.pool.clone()))),
                        Err(e) => tracing::warn!("Skipping share {}: {}", share.display(), e),
                    }
                }
                if out.is_empty() && !self.shares.is_empty() {
                    return Err(());
                }
                Ok(out)
            })
            .await;
        scanned.cloned().unwrap_or_default()
    }

    /// Find a shared file by content identity.
    pub async fn find(&self, full_hash: &str, size: u64) -> Option<Arc<LibraryItem>> {
        for collection in self.collections().await {
            for item in collection.items().await {
                // Cheap size check before hashing.
                match fs::metadata(item.path()).await {
                    Ok(m) if m.len() == size => {}
                    _ => continue,
                }
                match item.hash().await {
                    Ok(h) if h.full_hash == full_hash => return Some(item),
                    Ok(_) => {}
                    Err(e) => tracing::debug!("Skipping {}: {}", item.path().display(), e),
                }
            }
        }
        None
    }
}

/// Make `path` absolute, create it if missing and resolve symlinks.
pub(crate) async fn resolve_dir(cwd: &Path, path: &Path) -> Result<PathBuf> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    if !fs::try_exists(&path).await? {
        fs::create_dir_all(&path).await?;
    }
    let path = fs::canonicalize(&path).await?;
    if !fs::metadata(&path).await?.is_dir() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{} is not a directory", path.display()),
        )));
    }
    Ok(path)
}

pub struct LibraryCollection {
    root: PathBuf,
    pool: WorkerPool,
    items: OnceCell<Vec<Arc<LibraryItem>>>,
}

impl LibraryCollection {
    fn new(root: PathBuf, pool: WorkerPool) -> Self {
        Self {
            root,
            pool,
            items: OnceCell::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn items(&self) -> Vec<Arc<LibraryItem>> {
        self.items
            .get_or_init(|| async {
                let root = self.root.clone();
                let files = self.pool.run(move || walk(&root)).await.unwrap_or_else(|e| {
                    tracing::warn!("Scan of {} failed: {}", self.root.display(), e);
                    Vec::new()
                });
                tracing::info!("{}: {} file(s)", self.root.display(), files.len());
                files
                    .into_iter()
                    .map(|p| Arc::new(LibraryItem::new(p, self.pool.clone())))
                    .collect()
            })
            .await
            .clone()
    }
}

fn walk(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for ent in WalkDir::new(root).follow_links(true).min_depth(1) {
        let ent = match ent {
            Ok(ent) => ent,
            Err(e) => {
                tracing::debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if ent.file_type().is_file() {
            files.push(ent.into_path());
        }
    }
    files.sort();
    files
}

#[derive(Clone)]
struct Cached {
    size: u64,
    modified: Option<SystemTime>,
    hash: ContentHash,
}

pub struct LibraryItem {
    path: PathBuf,
    name: String,
    pool: WorkerPool,
    cache: Mutex<Option<Cached>>,
    computations: AtomicUsize,
}

impl LibraryItem {
    fn new(path: PathBuf, pool: WorkerPool) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            name,
            pool,
            cache: Mutex::new(None),
            computations: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content hash, recomputed only when size or mtime changed.
    pub async fn hash(&self) -> Result<ContentHash> {
        let mut cache = self.cache.lock().await;
        let meta = fs::metadata(&self.path).await?;
        let size = meta.len();
        let modified = meta.modified().ok();

        if let Some(c) = cache.as_ref() {
            if c.size == size && c.modified == modified {
                return Ok(c.hash.clone());
            }
        }

        let path = self.path.clone();
        let hash = self.pool.run(move || ContentHash::of_file(&path)).await??;
        self.computations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Hashed {} ({} chunks)", self.path.display(), hash.chunks.len());

        *cache = Some(Cached {
            size,
            modified,
            hash: hash.clone(),
        });
        Ok(hash)
    }

    /// Share link for the current content.
    pub async fn url(&self) -> Result<ShareLink> {
        let hash = self.hash().await?;
        Ok(ShareLink::new(self.name.clone(), hash.size(), &hash.full_hash)?)
    }

    /// Read up to `len` bytes starting at `position`.
    pub async fn read_range(&self, position: u64, len: usize) -> Result<Vec<u8>> {
        let mut f = fs::File::open(&self.path).await?;
        f.seek(SeekFrom::Start(position)).await?;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    fn library(cwd: &Path, shares: &[&str]) -> Library {
        Library::new(
            shares.iter().map(PathBuf::from).collect(),
            cwd.to_path_buf(),
            WorkerPool::new(2),
        )
    }

    #[tokio::test]
    async fn scans_shares_recursively() -> Result<()> {
        let temp = TempDir::new()?;
        std::fs::create_dir_all(temp.path().join("music/deep"))?;
        std::fs::write(temp.path().join("music/a.txt"), b"a")?;
        std::fs::write(temp.path().join("music/deep/b.txt"), b"bb")?;
        std::fs::write(temp.path().join("plain-file"), b"x")?;

        let lib = library(temp.path(), &["music", "fresh", "plain-file"]);
        let collections = lib.collections().await;

        // "fresh" is created, "plain-file" is skipped.
        assert_eq!(collections.len(), 2);
        assert!(temp.path().join("fresh").is_dir());

        let names: Vec<String> = collections[0]
            .items()
            .await
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert!(collections[1].items().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_scan_is_retried() -> Result<()> {
        let temp = TempDir::new()?;
        std::fs::write(temp.path().join("later"), b"not yet a folder")?;

        let lib = library(temp.path(), &["later"]);
        assert!(lib.collections().await.is_empty());

        std::fs::remove_file(temp.path().join("later"))?;
        let collections = lib.collections().await;
        assert_eq!(collections.len(), 1);
        assert!(temp.path().join("later").is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn hash_is_cached_until_file_changes() -> Result<()> {
        let temp = TempDir::new()?;
        std::fs::create_dir(temp.path().join("s"))?;
        let file = temp.path().join("s/f.bin");
        std::fs::write(&file, b"first")?;

        let lib = library(temp.path(), &["s"]);
        let item = lib.collections().await[0].items().await[0].clone();

        let a = item.hash().await?;
        let b = item.hash().await?;
        assert_eq!(a, b);
        assert_eq!(item.computations.load(Ordering::Relaxed), 1);

        let chunk = hex::encode(Sha256::digest(b"first"));
        assert_eq!(a.full_hash, hex::encode(Sha256::digest(chunk.as_bytes())));

        std::fs::write(&file, b"second, longer")?;
        let c = item.hash().await?;
        assert_ne!(a, c);
        assert_eq!(item.computations.load(Ordering::Relaxed), 2);
        Ok(())
    }

    #[tokio::test]
    async fn url_round_trips_and_find_locates_item() -> Result<()> {
        let temp = TempDir::new()?;
        std::fs::create_dir(temp.path().join("s"))?;
        std::fs::write(temp.path().join("s/my file.txt"), b"content")?;

        let lib = library(temp.path(), &["s"]);
        let item = lib.collections().await[0].items().await[0].clone();
        let link = item.url().await?;

        assert_eq!(link.file_name, "my file.txt");
        assert_eq!(link.size, 7);
        assert_eq!(ShareLink::parse(&link.render())?, link);

        let found = lib.find(&link.full_hash, 7).await.unwrap();
        assert_eq!(found.path(), item.path());
        assert!(lib.find(&link.full_hash, 8).await.is_none());
        assert_eq!(item.read_range(3, 4).await?, b"tent");
        Ok(())
    }
}

//! The set of transfers living in one temp directory.

use crate::error::{aggregate, Error, Result};
use crate::item::{self, DownloadItem};
use crate::link::{is_hash, ShareLink};
use crate::pool::WorkerPool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

type Key = (String, u64);

#[derive(Default)]
struct Items {
    order: Vec<Arc<DownloadItem>>,
    by_key: HashMap<Key, Arc<DownloadItem>>,
}

impl Items {
    fn insert(&mut self, item: Arc<DownloadItem>) {
        let key = (item.full_hash().to_string(), item.size());
        self.by_key.insert(key, item.clone());
        self.order.push(item);
    }
}

pub struct DownloadList {
    dir: PathBuf,
    pool: WorkerPool,
    items: Mutex<Option<Items>>,
    disposed: AtomicBool,
}

impl DownloadList {
    /// `dir` must already exist.
    pub fn new(dir: PathBuf, pool: WorkerPool) -> Self {
        Self {
            dir,
            pool,
            items: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// All known transfers, scanning the directory on first use.
    pub async fn items(&self) -> Result<Vec<Arc<DownloadItem>>> {
        let mut guard = self.items.lock().await;
        let items = self.loaded(&mut guard).await?;
        Ok(items.order.clone())
    }

    pub async fn get(&self, full_hash: &str, size: u64) -> Result<Option<Arc<DownloadItem>>> {
        let mut guard = self.items.lock().await;
        let items = self.loaded(&mut guard).await?;
        Ok(items
            .by_key
            .get(&(full_hash.to_ascii_lowercase(), size))
            .cloned())
    }

    /// Register a transfer for `link`, reusing an existing one for the same
    /// content.
    pub async fn add_by_link(&self, link: &str) -> Result<Arc<DownloadItem>> {
        let link = ShareLink::parse(link)?;
        self.add(link).await
    }

    pub async fn add(&self, link: ShareLink) -> Result<Arc<DownloadItem>> {
        if self.is_disposed() {
            return Err(Error::Disposed(self.dir.display().to_string()));
        }
        let mut guard = self.items.lock().await;
        let items = self.loaded(&mut guard).await?;

        let key = (link.full_hash.clone(), link.size);
        if let Some(existing) = items.by_key.get(&key) {
            return Ok(existing.clone());
        }

        let item = Arc::new(DownloadItem::create(&self.dir, link, self.pool.clone()).await?);
        items.insert(item.clone());
        Ok(item)
    }

    /// Dispose one transfer and forget it.
    pub async fn remove(&self, full_hash: &str, size: u64) -> Result<bool> {
        let mut guard = self.items.lock().await;
        let items = self.loaded(&mut guard).await?;
        let key = (full_hash.to_ascii_lowercase(), size);
        let Some(item) = items.by_key.get(&key).cloned() else {
            return Ok(false);
        };
        item.dispose().await?;
        items.by_key.remove(&key);
        items.order.retain(|i| !Arc::ptr_eq(i, &item));
        Ok(true)
    }

    /// Dispose every transfer, including ones only known from disk.
    /// Failures are collected; the rest still run.
    pub async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::SeqCst);
        let mut guard = self.items.lock().await;
        let items = self.loaded(&mut guard).await?;

        let mut errors = Vec::new();
        let mut kept = Items::default();
        for item in std::mem::take(&mut items.order) {
            match item.dispose().await {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!("Failed to dispose {}: {}", item.file_name(), e);
                    errors.push(e);
                    kept.insert(item);
                }
            }
        }
        *items = kept;
        aggregate(errors)
    }

    async fn loaded<'a>(&self, guard: &'a mut Option<Items>) -> Result<&'a mut Items> {
        let items = match guard.take() {
            Some(items) => items,
            None => self.scan().await?,
        };
        Ok(guard.insert(items))
    }

    async fn scan(&self) -> Result<Items> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some((hash, size)) = name.to_str().and_then(parse_data_name) else {
                continue;
            };
            let stem = format!("{hash}_{size}");
            if !fs::try_exists(item::meta_path(&self.dir, &stem))
                .await
                .unwrap_or(false)
            {
                tracing::debug!("Skipping {}: no metadata", stem);
                continue;
            }
            match DownloadItem::open(&self.dir, hash, size, self.pool.clone()).await {
                Ok(item) => found.push(item),
                Err(e) => tracing::warn!("Skipping {}: {}", stem, e),
            }
        }

        found.sort_by(|a, b| a.link().stem().cmp(&b.link().stem()));
        let mut items = Items::default();
        for item in found {
            items.insert(Arc::new(item));
        }
        tracing::info!("Loaded {} download(s) from {}", items.order.len(), self.dir.display());
        Ok(items)
    }
}

/// Match `<64 hex>_<digits>.tmp`.
fn parse_data_name(name: &str) -> Option<(&str, u64)> {
    let stem = name.strip_suffix(".tmp")?;
    let (hash, size) = stem.split_once('_')?;
    if !is_hash(hash) || size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((hash, size.parse().ok()?))
}

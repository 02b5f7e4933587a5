//! Two-level content hashing.
//!
//! A file is split into fixed [`CHUNK_SIZE`] chunks (the last one may be
//! shorter). Every chunk gets its own SHA-256, and the lowercase hex form of
//! each chunk hash is fed, in order, into a running SHA-256 whose final value
//! is the file's `full_hash`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Size of a hashing / completion-tracking chunk.
pub const CHUNK_SIZE: u64 = 9_728_000;

const READ_BUF: usize = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkHash {
    pub hash: String,
    pub size: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ContentHash {
    pub full_hash: String,
    pub chunks: Vec<ChunkHash>,
}

impl ContentHash {
    /// Hash a file from disk. Blocking; run it on the worker pool.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let f = File::open(path)?;
        Self::of_reader(f)
    }

    /// Hash everything readable from `reader`.
    pub fn of_reader<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut full = Sha256::new();
        let mut chunks = Vec::new();
        let mut buf = vec![0u8; READ_BUF];

        let mut chunk = Sha256::new();
        let mut in_chunk: u64 = 0;

        loop {
            let want = (CHUNK_SIZE - in_chunk).min(READ_BUF as u64) as usize;
            let n = match reader.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            chunk.update(&buf[..n]);
            in_chunk += n as u64;

            if in_chunk == CHUNK_SIZE {
                let done = std::mem::replace(&mut chunk, Sha256::new());
                push_chunk(&mut full, &mut chunks, done, in_chunk);
                in_chunk = 0;
            }
        }

        if in_chunk > 0 {
            push_chunk(&mut full, &mut chunks, chunk, in_chunk);
        }

        Ok(Self {
            full_hash: hex::encode(full.finalize()),
            chunks,
        })
    }

    /// Total number of bytes covered by the chunks.
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

fn push_chunk(full: &mut Sha256, chunks: &mut Vec<ChunkHash>, chunk: Sha256, size: u64) {
    let hash = hex::encode(chunk.finalize());
    full.update(hash.as_bytes());
    chunks.push(ChunkHash { hash, size });
}

/// Number of chunks a file of `size` bytes is split into.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE)
}

/// Byte length of chunk `index` in a file of `size` bytes.
pub fn chunk_len(size: u64, index: u64) -> u64 {
    let start = index.saturating_mul(CHUNK_SIZE);
    size.saturating_sub(start).min(CHUNK_SIZE)
}

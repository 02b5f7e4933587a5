//! Content addressing and persistent download state.
//!
//! Files are identified by a two-level SHA-256 ([`ContentHash`]) and shared
//! as [`ShareLink`]s. A [`DownloadList`] keeps partially received files on
//! disk so transfers survive restarts.

pub mod error;
pub mod hash;
pub mod item;
pub mod link;
pub mod list;
pub mod pool;

pub use error::{Error, Result};
pub use hash::{chunk_count, chunk_len, ChunkHash, ContentHash, CHUNK_SIZE};
pub use item::{ChunkProgress, DownloadItem};
pub use link::ShareLink;
pub use list::DownloadList;
pub use pool::WorkerPool;

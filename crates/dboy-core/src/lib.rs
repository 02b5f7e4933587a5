//! dboy core - point-to-point file delivery.
//!
//! Peers exchange a session password over an RSA handshake, talk through an
//! AES-CTR encrypted framed channel, and move files chunk by chunk into
//! resumable downloads.

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod handshake;
pub mod keys;
pub mod library;
pub mod message;
pub mod transfer;

// Re-export commonly used types
pub use channel::SecureChannel;
pub use client::Client;
pub use config::{ClientConfig, ConfigInput};
pub use error::{Error, Result};
pub use events::{ClientEvent, ClientState, Connected, Connecting};
pub use handshake::{HandshakeError, MAX_MESSAGE_SIZE};
pub use keys::SessionKeyPair;
pub use library::{Library, LibraryCollection, LibraryItem};
pub use message::Message;
pub use transfer::{ChunkFile, ChunkSource};

pub use dboy_storage::{ContentHash, DownloadItem, DownloadList, ShareLink};

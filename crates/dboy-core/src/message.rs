use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A structured message carried in one encrypted frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: u32,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Message {
    /// Handshake acknowledgement.
    pub const OK: u32 = 0;
    pub const CHUNK_REQUEST: u32 = 1;
    pub const PIECE: u32 = 2;
    pub const CHUNK_END: u32 = 3;
    pub const NOT_FOUND: u32 = 4;

    pub fn new(kind: u32) -> Self {
        Self {
            kind,
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Self::OK)
    }

    pub fn with_body<T: Serialize>(kind: u32, body: &T) -> Result<Self> {
        Ok(Self {
            kind,
            body: bincode::serialize(body)?,
        })
    }

    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.body)?)
    }

    pub fn is_ok(&self) -> bool {
        self.kind == Self::OK
    }
}

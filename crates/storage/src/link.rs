//! Share links: `dboy://|file|<url-encoded name>|<size>|<64 hex hash>|/`

use crate::error::{Error, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt;
use std::str::FromStr;

const PREFIX: &str = "dboy://|file|";
const SUFFIX: &str = "|/";

/// Name used when a link carries an empty file name.
pub const DEFAULT_FILE_NAME: &str = "file.dat";

/// Same set `encodeURIComponent` leaves alone.
const NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShareLink {
    pub file_name: String,
    pub size: u64,
    pub full_hash: String,
}

impl ShareLink {
    /// Build a link, normalizing the hash to lowercase and an empty name to
    /// [`DEFAULT_FILE_NAME`].
    pub fn new(file_name: impl Into<String>, size: u64, full_hash: &str) -> Result<Self> {
        let full_hash = full_hash.trim().to_ascii_lowercase();
        if !is_hash(&full_hash) {
            return Err(Error::InvalidLinkFormat(format!("bad hash {full_hash:?}")));
        }
        let mut file_name = file_name.into();
        if file_name.is_empty() {
            file_name = DEFAULT_FILE_NAME.to_string();
        }
        Ok(Self {
            file_name,
            size,
            full_hash,
        })
    }

    pub fn parse(link: &str) -> Result<Self> {
        let bad = || Error::InvalidLinkFormat(link.to_string());
        let s = link.trim();

        // Scheme is matched case-insensitively; the rest is ASCII structure.
        let head = s.get(..PREFIX.len()).ok_or_else(bad)?;
        if !head.eq_ignore_ascii_case(PREFIX) {
            return Err(bad());
        }
        let body = s[PREFIX.len()..].strip_suffix(SUFFIX).ok_or_else(bad)?;

        let mut parts = body.rsplitn(3, '|');
        let hash = parts.next().ok_or_else(bad)?;
        let size = parts.next().ok_or_else(bad)?;
        let name = parts.next().ok_or_else(bad)?;

        if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let size: u64 = size.parse().map_err(|_| bad())?;

        let hash = hash.trim();
        if !is_hash(&hash.to_ascii_lowercase()) {
            return Err(bad());
        }

        let name = percent_decode_str(name)
            .decode_utf8()
            .map_err(|_| bad())?
            .into_owned();

        Self::new(name, size, hash)
    }

    pub fn render(&self) -> String {
        format!(
            "{PREFIX}{}|{}|{}{SUFFIX}",
            utf8_percent_encode(&self.file_name, NAME),
            self.size,
            self.full_hash
        )
    }

    /// Stem shared by the `.tmp` and `.meta` files of a transfer.
    pub fn stem(&self) -> String {
        format!("{}_{}", self.full_hash, self.size)
    }
}

impl fmt::Display for ShareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for ShareLink {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

pub(crate) fn is_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

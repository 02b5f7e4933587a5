use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Share folder used when none is configured.
pub const DEFAULT_SHARE: &str = "shared";

/// Overhead of RSA-OAEP with SHA-256: two digests plus two bytes.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

const MIN_KEY_BITS: usize = 1024;

/// Raw, possibly partial user input. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigInput {
    pub shares: Option<Vec<String>>,
    pub temp_dir: Option<PathBuf>,
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
    pub password_size: Option<usize>,
    pub key_bits: Option<usize>,
    pub io_timeout_secs: Option<u64>,
    pub workers: Option<usize>,
}

impl ConfigInput {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Share folders, never empty and free of duplicates
    pub shares: Vec<PathBuf>,

    /// Directory holding partial downloads
    pub temp_dir: PathBuf,

    /// Address the listener binds to
    pub listen_host: IpAddr,

    /// Port to listen on for incoming connections
    pub listen_port: u16,

    /// Size of the symmetric session password in bytes
    pub password_size: usize,

    /// RSA modulus size for the per-run key pair
    pub key_bits: usize,

    /// Deadline for each handshake step and framed read
    pub io_timeout: Duration,

    /// Upper bound on concurrent CPU-heavy jobs
    pub workers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            shares: vec![PathBuf::from(DEFAULT_SHARE)],
            temp_dir: std::env::temp_dir().join("dboy"),
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 6868,
            password_size: 32,
            key_bits: 2048,
            io_timeout: Duration::from_secs(30),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
        }
    }
}

impl ClientConfig {
    /// Compute the effective configuration. Missing or unusable values fall
    /// back to defaults.
    pub fn resolve(input: ConfigInput) -> Self {
        let d = Self::default();

        let mut shares: Vec<PathBuf> = Vec::new();
        for s in input.shares.unwrap_or_default() {
            let s = s.trim();
            if s.is_empty() {
                continue;
            }
            let p = PathBuf::from(s);
            if !shares.contains(&p) {
                shares.push(p);
            }
        }
        if shares.is_empty() {
            shares = d.shares.clone();
        }

        let listen_host = match input.listen_host.as_deref().map(str::trim) {
            None | Some("") => d.listen_host,
            Some(h) => h.parse().unwrap_or_else(|_| {
                tracing::warn!("Invalid listen host {:?}, using {}", h, d.listen_host);
                d.listen_host
            }),
        };

        let key_bits = match input.key_bits {
            Some(b) if b >= MIN_KEY_BITS => b,
            Some(b) => {
                tracing::warn!("Key size {} too small, using {}", b, d.key_bits);
                d.key_bits
            }
            None => d.key_bits,
        };

        let capacity = key_bits / 8 - OAEP_OVERHEAD;
        let password_size = match input.password_size {
            Some(0) | None => d.password_size,
            Some(n) => n,
        };
        let password_size = if password_size > capacity {
            tracing::warn!(
                "Password size {} exceeds what a {}-bit key can carry, using {}",
                password_size,
                key_bits,
                capacity
            );
            capacity
        } else {
            password_size
        };

        let io_timeout = match input.io_timeout_secs {
            Some(0) | None => d.io_timeout,
            Some(s) => Duration::from_secs(s),
        };

        Self {
            shares,
            temp_dir: input
                .temp_dir
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(d.temp_dir),
            listen_host,
            listen_port: input.listen_port.unwrap_or(d.listen_port),
            password_size,
            key_bits,
            io_timeout,
            workers: input.workers.filter(|w| *w > 0).unwrap_or(d.workers),
        }
    }
}

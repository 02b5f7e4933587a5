use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid link format: {0}")]
    InvalidLinkFormat(String),
    #[error("metadata error: {0}")]
    Meta(#[from] serde_json::Error),
    #[error("integrity error: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("{0} is disposed")]
    Disposed(String),
    #[error("worker pool error: {0}")]
    Worker(String),
    #[error("{} disposal(s) failed: {}", .0.len(), join(.0))]
    Aggregate(Vec<Error>),
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collapse the failures of a dispose-all pass into a single result.
pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(Error::Aggregate(errors)),
    }
}

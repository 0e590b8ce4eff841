use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort a benchmark run before any trial output.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("cannot open {}: {source}", path.display())]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load map: {0}")]
    Load(#[source] std::io::Error),

    #[error("key corpus too short: expected {expected} keys, found {found}")]
    CorpusTooShort { expected: usize, found: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, BenchError>;

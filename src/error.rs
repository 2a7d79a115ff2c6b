use thiserror::Error;

/// Errors surfaced by the block codec, bitmap allocator, cache adapter and
/// tree algorithms. A single closed taxonomy threads through all four
/// layers so callers only need one `match`.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("key not found")]
    NotFound,

    #[error("key already present")]
    DuplicateKey,

    #[error("allocator exhausted and backing file could not be extended")]
    OutOfSpace,

    #[error("block i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("node at offset {offset} failed header validation: {reason}")]
    CorruptNode { offset: u64, reason: String },

    #[error("tree poisoned by a prior fatal error")]
    TreePoisoned,

    #[error("offset {0} does not name an allocatable node block")]
    InvalidOffset(u64),

    #[error("invalid tree configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

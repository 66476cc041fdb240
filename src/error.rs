use thiserror::Error;

/// Errors raised by the kvstore.
///
/// `Configuration` and `Protocol` are fatal for the process that sees them:
/// they indicate a broken deployment or a client/server mismatch and are
/// never retried. `InvalidArgument` is raised synchronously, before any
/// network activity.
#[derive(Error, Debug)]
pub enum KvError {
    /// Malformed registry file, empty partition table, bad shared tensor setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unexpected message type, rank-assignment violation, bad manifest.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Caller-side misuse (mismatched lengths, empty names, unknown keys).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection failures, oversized frames, peers hanging up.
    #[error("transport error: {0}")]
    Transport(String),

    /// A blocking operation exceeded its configured deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Encoding a message failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Shared tensor storage is unusable (poisoned lock).
    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for kvstore operations.
pub type Result<T> = std::result::Result<T, KvError>;

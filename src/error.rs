/// Errors produced by a [`Limiter`](crate::Limiter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The limiter was configured with a rate or burst it cannot represent.
    #[error("invalid limiter configuration: {0}")]
    InvalidConfiguration(&'static str),
    /// The request can never be satisfied since it asks for more tokens than
    /// the bucket holds.
    #[error("requested {requested} tokens, which exceeds the burst of {burst}")]
    BurstExceeded {
        /// The number of tokens requested.
        requested: u64,
        /// The configured burst of the limiter.
        burst: u64,
    },
    /// The deadline of the context passed before the tokens became available.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The context was cancelled before the tokens became available.
    #[error("wait cancelled")]
    Cancelled,
}

/// Result alias used throughout this crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

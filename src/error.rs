use thiserror::Error;

/// Raised once, at construction time. Nothing on the per-call path
/// produces an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("histogram bucket length must be positive")]
    ZeroBucketLength,

    #[error("histogram bucket length {0} cannot be rounded to a power of two")]
    BucketLengthTooLarge(usize),

    #[error("window duration must be positive, got {0}ms")]
    NonPositiveWindow(i64),
}

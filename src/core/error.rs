use thiserror::Error;

/// Core error type for identity parsing and validation.
///
/// Higher layers (the limiter, the runner, the engine) define their own
/// error enums and wrap lower ones with `#[from]`, preserving the full
/// error chain.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A string could not be parsed as a correlation id.
    #[error("invalid correlation id: {0}")]
    InvalidCorrelationId(String),
}

pub type Result<T> = std::result::Result<T, Error>;

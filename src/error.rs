//! Error types for lipread-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid or incomplete model configuration, raised at construction.
    #[error("config: {0}")]
    Config(String),

    /// Argument shapes or lengths that violate the call contract.
    #[error("shape: {0}")]
    Shape(String),

    /// Vocabulary mapping that breaks the `char2idx` contract.
    #[error("vocab: {0}")]
    Vocab(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

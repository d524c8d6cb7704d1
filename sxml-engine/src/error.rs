use thiserror::Error;

/// Failures of a pass itself, as opposed to problems found in the document
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("superseded by a newer request")]
    Cancelled,
    /// The driver saw more close tags than open ones; the SAX source and the driver disagree
    #[error("tag stack underflow at offset {offset}")]
    StackUnderflow { offset: usize },
    #[error("document {0} is not open")]
    NotOpen(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::Task(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("invalid reference {href:?}: {message}")]
    InvalidReference { href: String, message: String },
    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("{url}: {message}")]
    Io { url: String, message: String },
    #[error("{url}: {message}")]
    Http { url: String, message: String },
    #[error("{0}: cancelled")]
    Cancelled(String),
}

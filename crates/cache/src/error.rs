use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors raised by the content cache and its blob backends.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("payload {0} not found")]
    NotFound(String),

    #[error("invalid content hash '{0}'")]
    InvalidHash(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("timed out fetching {0}")]
    Timeout(String),

    #[error("payload from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },
}

impl CacheError {
    /// Returns `true` if retrying might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            CacheError::Status { status, .. } => *status >= 500 || *status == 429,
            CacheError::Timeout(_) | CacheError::Io(_) => true,
            CacheError::NotFound(_) | CacheError::InvalidHash(_) | CacheError::TooLarge { .. } => {
                false
            }
        }
    }
}

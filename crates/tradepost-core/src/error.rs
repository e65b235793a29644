use thiserror::Error;
use tradepost_api::BackendError;
use tradepost_cache::CacheError;

/// All the ways things can go wrong in tradepost
///
/// Backend errors are passed through untouched. Cached reads wrap them in
/// `CacheError::Fetch`; [`Error::backend`] digs them back out.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// The backend error behind this one, direct or via the cache
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            Error::Backend(e) => Some(e),
            Error::Cache(e) => e.fetch_source::<BackendError>(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.backend(), Some(BackendError::NotFound(_)))
    }
}

use std::sync::Arc;
use thiserror::Error;

/// Cache failures
///
/// Clone so every waiter on a shared in-flight fetch gets the same error.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Query {key} failed after {attempts} attempt(s): {source}")]
    Fetch {
        key: String,
        attempts: u32,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("Cache storage failed: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// The fetcher's own error, if it is a `T`
    pub fn fetch_source<T: std::error::Error + 'static>(&self) -> Option<&T> {
        match self {
            CacheError::Fetch { source, .. } => source.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

// Storefront domain: typed records, per-entity repositories, cached reads
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod session_store;
pub mod storefront;

pub use config::{BackendConfig, CacheSettings, Config};
pub use error::Error;
pub use repository::{Entity, Repository, Searchable};
pub use session_store::SessionStore;
pub use storefront::Storefront;

/// Result type alias because typing Result<T, Error> everywhere is tedious
pub type Result<T> = std::result::Result<T, Error>;

// Client-side query cache
// Keeps network round trips down and survives restarts through a durable snapshot

pub mod cache;
pub mod clock;
pub mod error;
pub mod key;
pub mod retry;
pub mod snapshot;
pub mod store;

pub use cache::{CacheConfig, CacheEntry, CacheResult, CacheSource, EntryState, QueryCache, QueryStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, Result};
pub use key::QueryKey;
pub use retry::RetryPolicy;
pub use store::{DurableStore, MemoryStore, SqliteStore};

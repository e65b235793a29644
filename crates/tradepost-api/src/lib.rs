// Backend boundary - the hosted data + auth service lives on the other side
pub mod auth;
pub mod client;
pub mod error;
pub mod query;

// Re-export common types
pub use auth::{AuthBackend, AuthUser, Session, SignUp};
pub use client::{Backend, BackendClient};
pub use error::{BackendError, Result};
pub use query::{Order, SelectQuery};

//! SQLite backend for the Heddle sync gateway.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated
//! thread without blocking the async runtime. The JSON tree is mirrored in
//! memory for reads and subscriptions; every write commits to the database
//! first and only then becomes visible in the mirror, so a failed commit
//! leaves nothing half-applied.

mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteGateway;

//! Core types and trait definitions for the Heddle loom tracker.
//!
//! Everything a batch lifecycle needs to be *described* lives here: the
//! transaction ledger model, the pure balance calculator, the sync-gateway
//! abstraction over the remote key-value store, the dataset export format,
//! and the schema migration rules. Storage backends and the lifecycle engine
//! live in their own crates; all of them depend on this one, and this one
//! depends on nothing heavier than `tokio::sync`.

pub mod balance;
pub mod batch;
pub mod dataset;
pub mod error;
pub mod gateway;
pub mod loom;
pub mod migrate;
pub mod transaction;

pub use error::{
  Error, MigrationError, NotFoundError, Result, SyncError, ValidationError,
};

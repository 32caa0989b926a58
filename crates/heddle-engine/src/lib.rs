//! Batch lifecycle engine for the Heddle loom tracker.
//!
//! Two layers live here. [`store::EntityStore`] keeps a live, decoded copy
//! of the gateway tree: one background task owns the root subscription,
//! migrates or seeds what it finds, and publishes every applied revision
//! through a watch channel. [`engine::BatchEngine`] implements the batch
//! lifecycle on top of it — recording production, splitting full batches,
//! carrying balances forward — with every state change expressed as a
//! single atomic gateway update.
//!
//! Neither layer knows which backend it is talking to; both are generic
//! over [`heddle_core::gateway::SyncGateway`].

pub mod engine;
pub mod report;
pub mod store;

pub use engine::{
  BatchEngine, MaterialMovement, MovementKind, ProductionRequest,
  SplitSummary, SubmitOutcome,
};
pub use report::{BatchStatus, BatchView, LoomReport};
pub use store::{EntityStore, StoreFailure, StoreSnapshot, StoreStatus};

#[cfg(test)]
mod tests;

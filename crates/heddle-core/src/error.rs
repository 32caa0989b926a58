//! Error taxonomy for the Heddle core.
//!
//! The four kinds the rest of the system matches on — validation, not-found,
//! sync, migration — are distinct enums wrapped by [`Error`], so callers can
//! always tell them apart programmatically rather than by string inspection.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{
  batch::BatchId,
  loom::LoomId,
  transaction::{Material, TransactionKind},
};

// ─── Validation ──────────────────────────────────────────────────────────────

/// Malformed input, rejected before anything touches the store.
#[derive(Debug, Error)]
pub enum ValidationError {
  #[error("{kind} quantity must be positive, got {quantity}")]
  NonPositiveQuantity {
    kind:     TransactionKind,
    quantity: Decimal,
  },

  #[error("{0} transactions must name a raw material, not the produced unit")]
  RawMaterialRequired(TransactionKind),

  #[error("production output is counted in warps, not {0}")]
  ProductionCountsWarps(Material),

  #[error(
    "opening balance magnitude {0} is below the carry threshold; \
     balances this small are dropped, not recorded"
  )]
  NegligibleOpening(Decimal),

  #[error("batch target must be positive, got {0}")]
  NonPositiveTarget(Decimal),

  #[error("consumption factor for {material} must not be negative, got {factor}")]
  NegativeFactor { material: Material, factor: Decimal },

  #[error("import document is not a JSON object")]
  ImportNotAnObject,

  #[error("import document is missing required field {0:?}")]
  ImportMissingField(&'static str),
}

// ─── Not found ───────────────────────────────────────────────────────────────

/// A referenced entity does not exist in the current snapshot.
#[derive(Debug, Error)]
pub enum NotFoundError {
  #[error("loom not found: {0}")]
  Loom(LoomId),

  #[error("batch not found: {0}")]
  Batch(BatchId),
}

// ─── Sync ────────────────────────────────────────────────────────────────────

/// The remote store could not be read or written. Nothing was mutated; the
/// caller may retry.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("store backend error: {0}")]
  Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("failed to encode record for the store: {0}")]
  Encode(#[from] serde_json::Error),

  #[error("root subscription failed: {0}")]
  Subscription(String),

  #[error("entity store is closed")]
  StoreClosed,
}

impl SyncError {
  /// Wrap a backend-specific gateway error.
  pub fn backend<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Backend(Box::new(err))
  }
}

// ─── Migration ───────────────────────────────────────────────────────────────

/// Stored data could not be brought up to the current schema. The entity
/// store refuses to expose anything until this is resolved — never silently
/// drops records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
  #[error(
    "unsupported stored schema version {0} (this build reads versions 1 \
     through {current})",
    current = crate::migrate::CURRENT_SCHEMA_VERSION
  )]
  UnsupportedVersion(u32),

  #[error("stored dataset has no schema version field")]
  MissingVersion,

  #[error("stored record could not be decoded: {0}")]
  Malformed(String),
}

// ─── Top-level ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum Error {
  #[error("validation: {0}")]
  Validation(#[from] ValidationError),

  #[error("not found: {0}")]
  NotFound(#[from] NotFoundError),

  #[error("sync: {0}")]
  Sync(#[from] SyncError),

  #[error("migration: {0}")]
  Migration(#[from] MigrationError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

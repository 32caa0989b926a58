//! Batch identity and the close-time snapshot record.
//!
//! A batch is never stored as a first-class object — it is always
//! reconstructed from the transactions that share its id. The one thing that
//! *is* persisted per closed batch is a [`BatchClosure`]: the sequence number
//! and the target/factor settings in effect at the moment the batch closed,
//! so that historical reports stay pinned when loom settings change later.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::loom::{ConsumptionFactors, LoomId};

// ─── BatchId ─────────────────────────────────────────────────────────────────

/// Opaque identifier of one production cycle on one loom.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BatchId(String);

impl BatchId {
  /// A fresh id for a newly opened batch.
  pub fn generate() -> Self { Self(Uuid::new_v4().hyphenated().to_string()) }

  /// The synthetic batch that owns a loom's pre-migration transactions.
  /// There is exactly one per loom.
  pub fn legacy(loom: &LoomId) -> Self { Self(format!("legacy-{loom}")) }

  /// Deterministic id for a batch known historically only by its sequence
  /// number (the fused-tag era stored `batchNumber` instead of an id).
  pub fn numbered(loom: &LoomId, number: u32) -> Self {
    Self(format!("{loom}-b{number}"))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for BatchId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for BatchId {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

impl From<String> for BatchId {
  fn from(s: String) -> Self { Self(s) }
}

// ─── BatchClosure ────────────────────────────────────────────────────────────

/// Snapshot written in the same atomic update that closes a batch.
///
/// Balances of an archived batch are recomputed from its transactions on
/// every read; this record supplies the factors and target that computation
/// must use. Batches archived before closures existed have none — reports
/// fall back to the loom's current settings and say so.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchClosure {
  pub batch_id:     BatchId,
  pub loom_id:      LoomId,
  /// Sequence number the batch held while it was active.
  pub sequence:     u32,
  pub closed_at:    DateTime<Utc>,
  pub target_units: Decimal,
  pub factors:      ConsumptionFactors,
}

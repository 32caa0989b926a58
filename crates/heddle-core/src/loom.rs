//! Loom identity and per-loom configuration.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
  batch::BatchId,
  error::ValidationError,
  transaction::Material,
};

// ─── LoomId ──────────────────────────────────────────────────────────────────

/// Opaque identifier of one loom. The factory this grew up in numbers its
/// looms "1" through "4", but nothing here depends on that.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LoomId(String);

impl LoomId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for LoomId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for LoomId {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

impl From<String> for LoomId {
  fn from(s: String) -> Self { Self(s) }
}

// ─── ConsumptionFactors ──────────────────────────────────────────────────────

/// Raw-material consumption per produced warp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionFactors {
  pub cone:    Decimal,
  pub jarigai: Decimal,
}

impl ConsumptionFactors {
  pub fn new(cone: Decimal, jarigai: Decimal) -> Result<Self, ValidationError> {
    for (material, factor) in
      [(Material::Cone, cone), (Material::Jarigai, jarigai)]
    {
      if factor.is_sign_negative() {
        return Err(ValidationError::NegativeFactor { material, factor });
      }
    }
    Ok(Self { cone, jarigai })
  }

  pub fn for_material(&self, material: Material) -> Option<Decimal> {
    match material {
      Material::Cone => Some(self.cone),
      Material::Jarigai => Some(self.jarigai),
      Material::Warp => None,
    }
  }
}

impl Default for ConsumptionFactors {
  fn default() -> Self {
    Self {
      cone:    DEFAULT_CONE_FACTOR,
      jarigai: DEFAULT_JARIGAI_FACTOR,
    }
  }
}

// ─── Defaults ────────────────────────────────────────────────────────────────

/// Batch completion threshold a fresh loom starts with: 80 warps.
pub const DEFAULT_TARGET_UNITS: Decimal = Decimal::from_parts(80, 0, 0, false, 0);

/// Cone yarn consumed per warp on a fresh loom: 0.12.
pub const DEFAULT_CONE_FACTOR: Decimal = Decimal::from_parts(12, 0, 0, false, 2);

/// Jarigai thread consumed per warp on a fresh loom: 0.05.
pub const DEFAULT_JARIGAI_FACTOR: Decimal =
  Decimal::from_parts(5, 0, 0, false, 2);

// ─── LoomConfig ──────────────────────────────────────────────────────────────

/// Current mutable state of one loom.
///
/// `active_batch_id` and `batch_sequence` change only when the lifecycle
/// engine closes a batch; `target_units` and `factors` change only through
/// user-initiated settings edits, which affect future calculations — closed
/// batches stay pinned by their [`crate::batch::BatchClosure`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoomConfig {
  pub id:              LoomId,
  pub target_units:    Decimal,
  pub factors:         ConsumptionFactors,
  pub active_batch_id: BatchId,
  pub batch_sequence:  u32,
}

impl LoomConfig {
  /// A first-use config: default target and factors, sequence 1, with the
  /// caller-chosen active batch.
  pub fn with_defaults(id: LoomId, active_batch_id: BatchId) -> Self {
    Self {
      id,
      target_units: DEFAULT_TARGET_UNITS,
      factors: ConsumptionFactors::default(),
      active_batch_id,
      batch_sequence: 1,
    }
  }
}

// ─── LoomSettings ────────────────────────────────────────────────────────────

/// The user-editable subset of a [`LoomConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoomSettings {
  pub target_units: Decimal,
  pub factors:      ConsumptionFactors,
}

impl LoomSettings {
  pub fn validate(&self) -> Result<(), ValidationError> {
    if self.target_units <= Decimal::ZERO {
      return Err(ValidationError::NonPositiveTarget(self.target_units));
    }
    // Factor sign is enforced by ConsumptionFactors::new, but settings may
    // arrive fully deserialized; re-check here.
    ConsumptionFactors::new(self.factors.cone, self.factors.jarigai)?;
    Ok(())
  }
}

//! Transaction — the fundamental unit of the Heddle ledger.
//!
//! A transaction is an immutable fact about one loom: warps produced,
//! material received or returned, or a balance carried in from the previous
//! batch. Once written, the only field that ever changes is `archived`,
//! flipped to `true` in the same atomic update that closes the batch the
//! transaction belongs to.
//!
//! Two historical encodings of the kind (signed quantities, and fused tags
//! like `CONE_RECEIPT`) exist only inside [`crate::migrate`]; everything past
//! ingestion carries the explicit [`TransactionKind`] + [`Material`] pair.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  balance::CARRY_THRESHOLD,
  batch::BatchId,
  error::ValidationError,
  loom::LoomId,
};

// ─── TransactionId ───────────────────────────────────────────────────────────

/// Opaque identifier of one ledger entry.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TransactionId(String);

impl TransactionId {
  pub fn generate() -> Self { Self(Uuid::new_v4().hyphenated().to_string()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for TransactionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for TransactionId {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

impl From<String> for TransactionId {
  fn from(s: String) -> Self { Self(s) }
}

// ─── Material ────────────────────────────────────────────────────────────────

/// What a transaction counts. `Warp` is the finished unit coming off the
/// loom; `Cone` (yarn) and `Jarigai` (zari thread) are the raw materials it
/// consumes.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Material {
  Cone,
  Jarigai,
  Warp,
}

impl Material {
  /// The two stock-tracked raw materials, in reporting order.
  pub const RAW: [Material; 2] = [Material::Cone, Material::Jarigai];

  pub fn is_raw(self) -> bool { !matches!(self, Material::Warp) }
}

impl std::fmt::Display for Material {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Material::Cone => "cone",
      Material::Jarigai => "jarigai",
      Material::Warp => "warp",
    })
  }
}

// ─── TransactionKind ─────────────────────────────────────────────────────────

/// The explicit kind tag. Quantities are stored as positive magnitudes for
/// every kind except `Opening`, which may carry a negative balance forward
/// (a shortage inherited from the closed batch).
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
  /// Finished warps coming off the loom.
  Production,
  /// Raw material received into the batch's stock.
  Receipt,
  /// Raw material sent back; reduces stock.
  Return,
  /// Balance carried forward from the previous batch.
  Opening,
}

impl std::fmt::Display for TransactionKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      TransactionKind::Production => "production",
      TransactionKind::Receipt => "receipt",
      TransactionKind::Return => "return",
      TransactionKind::Opening => "opening",
    })
  }
}

// ─── Transaction ─────────────────────────────────────────────────────────────

/// An immutable ledger entry. See the module docs for the mutability rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
  pub id:          TransactionId,
  pub loom_id:     LoomId,
  /// The batch cycle this entry is attributed to. Mandatory; pre-migration
  /// entries without one are assigned their loom's synthetic legacy batch
  /// during ingestion.
  pub batch_id:    BatchId,
  pub kind:        TransactionKind,
  pub material:    Material,
  pub quantity:    Decimal,
  /// Creation order. Entries written together in one atomic update carry
  /// strictly increasing timestamps (millisecond offsets).
  pub recorded_at: DateTime<Utc>,
  /// True once this entry's batch has been closed.
  #[serde(default)]
  pub archived:    bool,
  /// Free text; no semantic effect.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub note:        Option<String>,
}

impl Transaction {
  /// Finished warps into a batch.
  pub fn production(
    loom_id: LoomId,
    batch_id: BatchId,
    quantity: Decimal,
    note: Option<String>,
    recorded_at: DateTime<Utc>,
  ) -> Result<Self, ValidationError> {
    if quantity <= Decimal::ZERO {
      return Err(ValidationError::NonPositiveQuantity {
        kind: TransactionKind::Production,
        quantity,
      });
    }
    Ok(Self {
      id: TransactionId::generate(),
      loom_id,
      batch_id,
      kind: TransactionKind::Production,
      material: Material::Warp,
      quantity,
      recorded_at,
      archived: false,
      note,
    })
  }

  /// Raw material received into a batch.
  pub fn receipt(
    loom_id: LoomId,
    batch_id: BatchId,
    material: Material,
    quantity: Decimal,
    note: Option<String>,
    recorded_at: DateTime<Utc>,
  ) -> Result<Self, ValidationError> {
    Self::movement(
      TransactionKind::Receipt,
      loom_id,
      batch_id,
      material,
      quantity,
      note,
      recorded_at,
    )
  }

  /// Raw material sent back out of a batch. `quantity` is the positive
  /// magnitude returned.
  pub fn material_return(
    loom_id: LoomId,
    batch_id: BatchId,
    material: Material,
    quantity: Decimal,
    note: Option<String>,
    recorded_at: DateTime<Utc>,
  ) -> Result<Self, ValidationError> {
    Self::movement(
      TransactionKind::Return,
      loom_id,
      batch_id,
      material,
      quantity,
      note,
      recorded_at,
    )
  }

  /// Carry-forward opening balance. The quantity may be negative (inherited
  /// shortage) but never below the carry threshold in magnitude — balances
  /// that small are dropped instead of recorded.
  pub fn opening(
    loom_id: LoomId,
    batch_id: BatchId,
    material: Material,
    quantity: Decimal,
    note: Option<String>,
    recorded_at: DateTime<Utc>,
  ) -> Result<Self, ValidationError> {
    if !material.is_raw() {
      return Err(ValidationError::RawMaterialRequired(
        TransactionKind::Opening,
      ));
    }
    if quantity.abs() < CARRY_THRESHOLD {
      return Err(ValidationError::NegligibleOpening(quantity));
    }
    Ok(Self {
      id: TransactionId::generate(),
      loom_id,
      batch_id,
      kind: TransactionKind::Opening,
      material,
      quantity,
      recorded_at,
      archived: false,
      note,
    })
  }

  fn movement(
    kind: TransactionKind,
    loom_id: LoomId,
    batch_id: BatchId,
    material: Material,
    quantity: Decimal,
    note: Option<String>,
    recorded_at: DateTime<Utc>,
  ) -> Result<Self, ValidationError> {
    if !material.is_raw() {
      return Err(ValidationError::RawMaterialRequired(kind));
    }
    if quantity <= Decimal::ZERO {
      return Err(ValidationError::NonPositiveQuantity { kind, quantity });
    }
    Ok(Self {
      id: TransactionId::generate(),
      loom_id,
      batch_id,
      kind,
      material,
      quantity,
      recorded_at,
      archived: false,
      note,
    })
  }

  /// The same entry with its archived flag set — the one permitted mutation,
  /// applied when the owning batch closes.
  pub fn into_archived(mut self) -> Self {
    self.archived = true;
    self
  }
}

//! Schema migration: decoding every historical era of the persisted tree
//! into the current [`Dataset`].
//!
//! Three shapes exist in the wild:
//!
//! - **version 1** — the signed-quantity era. Records carry a `material`
//!   tag and a signed `value`; the kind is implied by the sign (positive
//!   raw-material entries are receipts, negative ones returns). No batch
//!   attribution; material stock lives in config fields.
//! - **versions 2 and 3** — the fused-tag era. Records carry one combined
//!   `type` tag (`CONE_RECEIPT`, `JARIGAI_OPENING`, ...) and a per-loom
//!   integer `batchNumber`. The bump from 2 to 3 changed no field shapes,
//!   so both decode identically.
//! - **version 4** — the current schema, exactly what [`Dataset`]
//!   serialises to.
//!
//! Upgrading is pure and idempotent: the output is always a version-4
//! dataset, and upgrading an already-upgraded tree is the identity. Both
//! legacy encodings are unified into the explicit kind + material pair at
//! this boundary; no other module ever sees a fused tag or a signed
//! quantity. Records that predate batch attribution land in a synthetic
//! per-loom legacy batch rather than carrying a missing-batch special case
//! through the business logic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::{
  balance::CARRY_THRESHOLD,
  batch::BatchId,
  dataset::Dataset,
  error::MigrationError,
  loom::{ConsumptionFactors, LoomConfig, LoomId},
  transaction::{Material, Transaction, TransactionId, TransactionKind},
};

/// The schema version this crate reads and writes natively.
pub const CURRENT_SCHEMA_VERSION: u32 = 4;

// ─── Version sniffing ────────────────────────────────────────────────────────

/// Read the version stamp off a root tree. The legacy camelCase spelling is
/// accepted alongside the current one.
pub fn schema_version(root: &Value) -> Result<u32, MigrationError> {
  let Value::Object(map) = root else {
    return Err(MigrationError::Malformed("root is not an object".into()));
  };
  let version = map
    .get("schema_version")
    .or_else(|| map.get("schemaVersion"))
    .ok_or(MigrationError::MissingVersion)?;
  version
    .as_u64()
    .and_then(|v| u32::try_from(v).ok())
    .ok_or_else(|| {
      MigrationError::Malformed(format!(
        "schema version {version} is not an integer"
      ))
    })
}

/// Decode a root tree of any supported era into a current-version dataset.
pub fn upgrade(root: &Value) -> Result<Dataset, MigrationError> {
  match schema_version(root)? {
    1 => upgrade_signed(root),
    2 | 3 => upgrade_fused(root),
    CURRENT_SCHEMA_VERSION => Dataset::decode(root)
      .map_err(|e| MigrationError::Malformed(e.to_string())),
    other => Err(MigrationError::UnsupportedVersion(other)),
  }
}

/// Collection values regardless of container shape: live roots store
/// records as maps, old exports as arrays.
fn records<'v>(collection: Option<&'v Value>) -> Vec<&'v Value> {
  match collection {
    Some(Value::Object(map)) => map.values().collect(),
    Some(Value::Array(items)) => items.iter().collect(),
    _ => Vec::new(),
  }
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, MigrationError> {
  DateTime::from_timestamp_millis(ms).ok_or_else(|| {
    MigrationError::Malformed(format!("timestamp {ms} out of range"))
  })
}

fn field<'v>(root: &'v Value, name: &str, legacy: &str) -> Option<&'v Value> {
  let map = root.as_object()?;
  map.get(name).or_else(|| map.get(legacy))
}

// ─── Legacy configs (both eras) ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawLegacyConfig {
  id:                   String,
  target:               Decimal,
  #[serde(default, alias = "batchNumber")]
  batch_number:         Option<u32>,
  #[serde(default, alias = "coneStock")]
  cone_stock:           Option<Decimal>,
  #[serde(default, alias = "jarigaiStock")]
  jarigai_stock:        Option<Decimal>,
  #[serde(alias = "coneUsageFactor")]
  cone_usage_factor:    Decimal,
  #[serde(alias = "jarigaiUsageFactor")]
  jarigai_usage_factor: Decimal,
}

fn legacy_configs(
  root: &Value,
) -> Result<Vec<RawLegacyConfig>, MigrationError> {
  records(field(root, "loom_configs", "loomConfigs"))
    .into_iter()
    .map(|value| {
      RawLegacyConfig::deserialize(value)
        .map_err(|e| MigrationError::Malformed(format!("loom config: {e}")))
    })
    .collect()
}

// ─── Version 1: signed-quantity era ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawSignedTransaction {
  id:        String,
  #[serde(alias = "loomId")]
  loom_id:   String,
  material:  RawSignedMaterial,
  value:     Decimal,
  timestamp: i64,
  #[serde(default)]
  note:      Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RawSignedMaterial {
  Cone,
  Jarigai,
  Warp,
}

impl RawSignedMaterial {
  fn into_material(self) -> Material {
    match self {
      RawSignedMaterial::Cone => Material::Cone,
      RawSignedMaterial::Jarigai => Material::Jarigai,
      RawSignedMaterial::Warp => Material::Warp,
    }
  }
}

fn upgrade_signed(root: &Value) -> Result<Dataset, MigrationError> {
  let mut data = Dataset::empty();

  for raw in records(root.get("transactions")) {
    let raw = RawSignedTransaction::deserialize(raw)
      .map_err(|e| MigrationError::Malformed(format!("transaction: {e}")))?;
    let loom_id = LoomId::new(raw.loom_id);
    let (kind, material, quantity) = match raw.material.into_material() {
      Material::Warp => {
        if raw.value <= Decimal::ZERO {
          return Err(MigrationError::Malformed(format!(
            "production entry {} has non-positive quantity {}",
            raw.id, raw.value
          )));
        }
        (TransactionKind::Production, Material::Warp, raw.value)
      }
      material => {
        if raw.value.is_zero() {
          continue;
        }
        if raw.value.is_sign_negative() {
          (TransactionKind::Return, material, -raw.value)
        } else {
          (TransactionKind::Receipt, material, raw.value)
        }
      }
    };
    let tx = Transaction {
      id: TransactionId::from(raw.id),
      batch_id: BatchId::legacy(&loom_id),
      loom_id,
      kind,
      material,
      quantity,
      recorded_at: timestamp(raw.timestamp)?,
      archived: false,
      note: raw.note,
    };
    data.transactions.insert(tx.id.clone(), tx);
  }

  for raw in legacy_configs(root)? {
    let loom_id = LoomId::new(raw.id);
    let batch_id = BatchId::legacy(&loom_id);
    // Pre-batch stock lived in config fields; it becomes the legacy
    // batch's opening balances so every balance derives from the ledger.
    for (offset, (material, stock)) in [
      (Material::Cone, raw.cone_stock),
      (Material::Jarigai, raw.jarigai_stock),
    ]
    .into_iter()
    .enumerate()
    {
      let Some(stock) = stock else { continue };
      if stock.abs() < CARRY_THRESHOLD {
        continue;
      }
      let tx = Transaction {
        id:          TransactionId::from(format!(
          "{}-opening-{material}",
          batch_id.as_str()
        )),
        loom_id:     loom_id.clone(),
        batch_id:    batch_id.clone(),
        kind:        TransactionKind::Opening,
        material,
        quantity:    stock,
        recorded_at: DateTime::UNIX_EPOCH
          + chrono::Duration::milliseconds(offset as i64),
        archived:    false,
        note:        Some("Opening balance (migrated)".to_owned()),
      };
      data.transactions.insert(tx.id.clone(), tx);
    }
    data.loom_configs.insert(loom_id.clone(), LoomConfig {
      id: loom_id,
      target_units: raw.target,
      factors: ConsumptionFactors {
        cone:    raw.cone_usage_factor,
        jarigai: raw.jarigai_usage_factor,
      },
      active_batch_id: batch_id,
      batch_sequence: 1,
    });
  }

  provision_orphan_looms(&mut data);
  Ok(data)
}

// ─── Versions 2-3: fused-tag era ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawFusedTransaction {
  id:           String,
  #[serde(alias = "loomId")]
  loom_id:      String,
  #[serde(default, alias = "batchNumber")]
  batch_number: Option<u32>,
  #[serde(rename = "type")]
  kind:         RawFusedKind,
  value:        Decimal,
  timestamp:    i64,
  #[serde(default)]
  note:         Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RawFusedKind {
  Production,
  ConeReceipt,
  JarigaiReceipt,
  ConeReturn,
  JarigaiReturn,
  ConeOpening,
  JarigaiOpening,
}

impl RawFusedKind {
  fn unfuse(self) -> (TransactionKind, Material) {
    match self {
      RawFusedKind::Production => (TransactionKind::Production, Material::Warp),
      RawFusedKind::ConeReceipt => (TransactionKind::Receipt, Material::Cone),
      RawFusedKind::JarigaiReceipt => {
        (TransactionKind::Receipt, Material::Jarigai)
      }
      RawFusedKind::ConeReturn => (TransactionKind::Return, Material::Cone),
      RawFusedKind::JarigaiReturn => {
        (TransactionKind::Return, Material::Jarigai)
      }
      RawFusedKind::ConeOpening => (TransactionKind::Opening, Material::Cone),
      RawFusedKind::JarigaiOpening => {
        (TransactionKind::Opening, Material::Jarigai)
      }
    }
  }
}

fn upgrade_fused(root: &Value) -> Result<Dataset, MigrationError> {
  let mut data = Dataset::empty();

  // Active batch number per loom, from configs; needed to derive the
  // archived flag the fused era never stored.
  let mut active_numbers: BTreeMap<LoomId, Option<u32>> = BTreeMap::new();

  let configs = legacy_configs(root)?;
  for raw in &configs {
    active_numbers.insert(LoomId::new(raw.id.clone()), raw.batch_number);
  }

  for raw in records(root.get("transactions")) {
    let raw = RawFusedTransaction::deserialize(raw)
      .map_err(|e| MigrationError::Malformed(format!("transaction: {e}")))?;
    let loom_id = LoomId::new(raw.loom_id);
    let (kind, material) = raw.kind.unfuse();
    let active = active_numbers.get(&loom_id).copied().flatten();
    let (batch_id, archived) = match raw.batch_number {
      Some(n) => (
        BatchId::numbered(&loom_id, n),
        active.is_some_and(|current| n < current),
      ),
      // Unlabelled records predate batch attribution; once the loom has
      // moved to numbered batches they are history.
      None => (BatchId::legacy(&loom_id), active.is_some()),
    };
    let tx = Transaction {
      id: TransactionId::from(raw.id),
      loom_id,
      batch_id,
      kind,
      material,
      quantity: raw.value,
      recorded_at: timestamp(raw.timestamp)?,
      archived,
      note: raw.note,
    };
    data.transactions.insert(tx.id.clone(), tx);
  }

  for raw in configs {
    let loom_id = LoomId::new(raw.id);
    let (active_batch_id, batch_sequence) = match raw.batch_number {
      Some(n) => (BatchId::numbered(&loom_id, n), n.max(1)),
      None => (BatchId::legacy(&loom_id), 1),
    };
    // Stock fields were a running cache of the opening transactions the
    // fused era already wrote; balances derive from the ledger now.
    data.loom_configs.insert(loom_id.clone(), LoomConfig {
      id: loom_id,
      target_units: raw.target,
      factors: ConsumptionFactors {
        cone:    raw.cone_usage_factor,
        jarigai: raw.jarigai_usage_factor,
      },
      active_batch_id,
      batch_sequence,
    });
  }

  provision_orphan_looms(&mut data);
  Ok(data)
}

// ─── Shared assembly ─────────────────────────────────────────────────────────

/// Give every loom referenced only by transactions a config, so no record
/// is dropped for want of one. The synthesised config's active batch is the
/// batch of the loom's most recent entry.
fn provision_orphan_looms(data: &mut Dataset) {
  let mut orphans: BTreeMap<LoomId, (DateTime<Utc>, BatchId)> =
    BTreeMap::new();
  for tx in data.transactions.values() {
    if data.loom_configs.contains_key(&tx.loom_id) {
      continue;
    }
    let newest = orphans
      .entry(tx.loom_id.clone())
      .or_insert_with(|| (tx.recorded_at, tx.batch_id.clone()));
    if tx.recorded_at > newest.0 {
      *newest = (tx.recorded_at, tx.batch_id.clone());
    }
  }
  for (loom_id, (_, active)) in orphans {
    let config = LoomConfig::with_defaults(loom_id.clone(), active);
    data.loom_configs.insert(loom_id, config);
  }
}

//! The full persisted dataset: the tree a gateway root holds, decoded.
//!
//! The entity store's cache is a `Dataset`; export produces one; import and
//! seeding replace the remote root with one. Everything in it is keyed the
//! way the gateway lays paths out (`transactions/{id}`, `loom_configs/{id}`,
//! `batch_closures/{id}`, `schema_version`), so `serde_json::to_value` of a
//! `Dataset` is exactly the tree to write at the root path.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  batch::{BatchClosure, BatchId},
  error::{SyncError, ValidationError},
  loom::{LoomConfig, LoomId},
  migrate::CURRENT_SCHEMA_VERSION,
  transaction::{Material, Transaction, TransactionId, TransactionKind},
};

/// Looms provisioned when seeding an empty backend.
pub const DEFAULT_LOOMS: [&str; 4] = ["1", "2", "3", "4"];

/// Cone stock a freshly seeded loom opens with.
pub const SEED_CONE_OPENING: Decimal = Decimal::from_parts(10, 0, 0, false, 0);
/// Jarigai stock a freshly seeded loom opens with.
pub const SEED_JARIGAI_OPENING: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

// ─── Dataset ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
  pub schema_version: u32,
  #[serde(default)]
  pub transactions:   BTreeMap<TransactionId, Transaction>,
  #[serde(default)]
  pub loom_configs:   BTreeMap<LoomId, LoomConfig>,
  #[serde(default)]
  pub batch_closures: BTreeMap<BatchId, BatchClosure>,
}

impl Default for Dataset {
  fn default() -> Self {
    Self {
      schema_version: CURRENT_SCHEMA_VERSION,
      transactions:   BTreeMap::new(),
      loom_configs:   BTreeMap::new(),
      batch_closures: BTreeMap::new(),
    }
  }
}

/// How to provision looms when replacing or initialising a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedProfile {
  /// Looms start with the customary stock on hand (cone 10, jarigai 5),
  /// recorded as opening balances of each loom's first batch.
  Stocked,
  /// Looms start empty; no opening transactions at all.
  Zeroed,
}

impl Dataset {
  pub fn empty() -> Self { Self::default() }

  /// A first-run dataset: the default looms, each on a fresh first batch.
  /// Every seeded transaction gets a strictly increasing timestamp so
  /// creation order is unambiguous.
  pub fn seed(profile: SeedProfile, now: DateTime<Utc>) -> Self {
    let mut data = Self::empty();
    let mut tick = 0i64;
    for loom in DEFAULT_LOOMS {
      let loom_id = LoomId::new(loom);
      let config =
        LoomConfig::with_defaults(loom_id.clone(), BatchId::generate());
      if profile == SeedProfile::Stocked {
        for (material, quantity) in [
          (Material::Cone, SEED_CONE_OPENING),
          (Material::Jarigai, SEED_JARIGAI_OPENING),
        ] {
          let tx = Transaction {
            id:          TransactionId::generate(),
            loom_id:     loom_id.clone(),
            batch_id:    config.active_batch_id.clone(),
            kind:        TransactionKind::Opening,
            material,
            quantity,
            recorded_at: now + Duration::milliseconds(tick),
            archived:    false,
            note:        Some("Opening balance (batch #1)".to_owned()),
          };
          tick += 1;
          data.transactions.insert(tx.id.clone(), tx);
        }
      }
      data.loom_configs.insert(config.id.clone(), config);
    }
    data
  }

  /// The JSON tree to write at the gateway root.
  pub fn to_value(&self) -> Result<Value, SyncError> {
    Ok(serde_json::to_value(self)?)
  }

  /// Decode a current-version tree. Older versions go through
  /// [`crate::migrate::upgrade`] instead.
  pub fn decode(value: &Value) -> Result<Self, serde_json::Error> {
    Self::deserialize(value)
  }

  // ── Queries ───────────────────────────────────────────────────────────

  pub fn loom_config(&self, loom_id: &LoomId) -> Option<&LoomConfig> {
    self.loom_configs.get(loom_id)
  }

  pub fn transactions_for_loom<'a>(
    &'a self,
    loom_id: &'a LoomId,
  ) -> impl Iterator<Item = &'a Transaction> {
    self.transactions.values().filter(move |tx| &tx.loom_id == loom_id)
  }

  pub fn transactions_for_batch<'a>(
    &'a self,
    batch_id: &'a BatchId,
  ) -> impl Iterator<Item = &'a Transaction> {
    self.transactions.values().filter(move |tx| &tx.batch_id == batch_id)
  }

  /// Closures for one loom, oldest first.
  pub fn closures_for_loom<'a>(
    &'a self,
    loom_id: &'a LoomId,
  ) -> Vec<&'a BatchClosure> {
    let mut closures: Vec<&BatchClosure> = self
      .batch_closures
      .values()
      .filter(|c| &c.loom_id == loom_id)
      .collect();
    closures.sort_by_key(|c| c.sequence);
    closures
  }
}

/// Stable creation order: by timestamp, then by id for entries stamped in
/// the same millisecond from different sessions.
pub fn chronological<'a>(
  transactions: impl IntoIterator<Item = &'a Transaction>,
) -> Vec<&'a Transaction> {
  let mut sorted: Vec<&Transaction> = transactions.into_iter().collect();
  sorted.sort_by(|a, b| {
    a.recorded_at.cmp(&b.recorded_at).then_with(|| a.id.cmp(&b.id))
  });
  sorted
}

// ─── Import normalisation ────────────────────────────────────────────────────

/// Validate the top-level shape of an imported document and normalise the
/// transaction collection to a map. Historical exports stored transactions
/// as an array and named the config map `loomConfigs`; both are accepted.
/// The result still carries whatever schema era the document was written
/// in; run it through [`crate::migrate::upgrade`] before use.
pub fn normalize_import(value: &Value) -> Result<Value, ValidationError> {
  let Value::Object(map) = value else {
    return Err(ValidationError::ImportNotAnObject);
  };
  let transactions = map
    .get("transactions")
    .ok_or(ValidationError::ImportMissingField("transactions"))?;
  if !map.contains_key("loom_configs") && !map.contains_key("loomConfigs") {
    return Err(ValidationError::ImportMissingField("loom_configs"));
  }

  let mut normalized = map.clone();
  if let Value::Array(entries) = transactions {
    let mut keyed = serde_json::Map::new();
    for entry in entries {
      let Some(id) = entry.get("id").and_then(Value::as_str) else {
        return Err(ValidationError::ImportMissingField("transaction id"));
      };
      keyed.insert(id.to_owned(), entry.clone());
    }
    normalized.insert("transactions".to_owned(), Value::Object(keyed));
  }
  Ok(Value::Object(normalized))
}

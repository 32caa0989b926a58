//! The batch lifecycle engine.
//!
//! Every operation follows the same discipline: validate the input, read
//! one consistent snapshot, plan the entire change, apply it as a single
//! atomic gateway update, then wait for the written revision to echo back
//! through the store. No state change ever spans two revisions, so a crash
//! or a concurrent reader can only observe a batch fully open or fully
//! closed, never half-split.
//!
//! Within one process a per-loom mutex serialises lifecycle operations.
//! Across sessions the backend is last-write-wins, same as the realtime
//! store this grew up on; the crate tests demonstrate what a cross-session
//! double split does.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use heddle_core::{
  Error, NotFoundError, Result, SyncError, ValidationError,
  balance::{BatchBalances, round_qty},
  batch::{BatchClosure, BatchId},
  dataset::{Dataset, SeedProfile, normalize_import},
  gateway::{KvPath, SyncGateway, UpdateSet},
  loom::{LoomConfig, LoomId, LoomSettings},
  migrate,
  transaction::{Material, Transaction, TransactionKind},
};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
  report::{self, LoomReport},
  store::EntityStore,
};

// ─── Requests ────────────────────────────────────────────────────────────────

/// One raw-material quantity, as carried by requests and outcomes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialMovement {
  pub material: Material,
  pub quantity: Decimal,
}

/// Which way a standalone stock movement goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementKind {
  Receipt,
  Return,
}

/// A production visit: warps produced, plus any raw material received at
/// the same time. The receipts are attributed to the batch the production
/// lands in — or, on a split, to the batch being closed, whose final
/// balance they feed.
#[derive(Debug, Clone)]
pub struct ProductionRequest {
  pub units:    Decimal,
  pub receipts: Vec<MaterialMovement>,
  pub note:     Option<String>,
}

impl ProductionRequest {
  pub fn new(units: Decimal) -> Self {
    Self { units, receipts: Vec::new(), note: None }
  }

  fn validate(&self) -> Result<(), ValidationError> {
    if self.units <= Decimal::ZERO {
      return Err(ValidationError::NonPositiveQuantity {
        kind:     TransactionKind::Production,
        quantity: self.units,
      });
    }
    for receipt in &self.receipts {
      if !receipt.material.is_raw() {
        return Err(ValidationError::RawMaterialRequired(
          TransactionKind::Receipt,
        ));
      }
      if receipt.quantity <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveQuantity {
          kind:     TransactionKind::Receipt,
          quantity: receipt.quantity,
        });
      }
    }
    Ok(())
  }
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// What a production submission did.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
  /// Everything fit in the active batch. `batch_full` is set when this
  /// submission landed the batch exactly on target; closing it is the
  /// caller's decision, not an automatic consequence.
  Recorded {
    batch_id:   BatchId,
    produced:   Decimal,
    batch_full: bool,
  },
  /// The submission overflowed the target: the active batch was filled,
  /// closed and replaced in the same atomic update.
  Split(SplitSummary),
}

/// The result of closing a batch, whether by overflow or by request.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitSummary {
  pub closed_batch_id: BatchId,
  pub new_batch_id:    BatchId,
  /// Sequence number of the new active batch.
  pub sequence:        u32,
  /// Units recorded into the closed batch to land it exactly on target.
  pub filler_units:    Decimal,
  /// Units recorded into the new batch.
  pub excess_units:    Decimal,
  /// Opening balances written into the new batch. Balances below the carry
  /// threshold are dropped and do not appear here.
  pub carried:         Vec<MaterialMovement>,
}

// ─── BatchEngine ─────────────────────────────────────────────────────────────

/// The lifecycle engine over one entity store. Cheap to share behind an
/// `Arc`; one per process is the intended shape.
pub struct BatchEngine<G: SyncGateway> {
  store: Arc<EntityStore<G>>,
  locks: Mutex<BTreeMap<LoomId, Arc<Mutex<()>>>>,
}

impl<G: SyncGateway> BatchEngine<G> {
  pub fn new(store: Arc<EntityStore<G>>) -> Self {
    Self { store, locks: Mutex::new(BTreeMap::new()) }
  }

  pub fn store(&self) -> &Arc<EntityStore<G>> { &self.store }

  /// Record a production visit against the loom's active batch.
  pub async fn submit_production(
    &self,
    loom_id: &LoomId,
    request: ProductionRequest,
  ) -> Result<SubmitOutcome> {
    request.validate()?;
    let lock = self.loom_lock(loom_id).await;
    let _guard = lock.lock().await;
    self.store.wait_ready().await?;
    let data = self.store.dataset();
    let config = loom_config(&data, loom_id)?;

    let mut stamp = stamper(Utc::now());
    let active: Vec<&Transaction> =
      data.transactions_for_batch(&config.active_batch_id).collect();
    let before =
      BatchBalances::compute(active.iter().copied(), &config.factors);
    let remaining =
      (config.target_units - before.produced).max(Decimal::ZERO);

    if request.units <= remaining {
      let mut updates = UpdateSet::new();
      for receipt in &request.receipts {
        let tx = Transaction::receipt(
          loom_id.clone(),
          config.active_batch_id.clone(),
          receipt.material,
          receipt.quantity,
          request.note.clone(),
          stamp(),
        )?;
        updates.put(KvPath::transaction(&tx.id), &tx)?;
      }
      let tx = Transaction::production(
        loom_id.clone(),
        config.active_batch_id.clone(),
        request.units,
        request.note.clone(),
        stamp(),
      )?;
      updates.put(KvPath::transaction(&tx.id), &tx)?;

      let produced = round_qty(before.produced + request.units);
      let outcome = SubmitOutcome::Recorded {
        batch_id: config.active_batch_id.clone(),
        produced,
        batch_full: produced >= config.target_units,
      };
      self.apply(updates).await?;
      return Ok(outcome);
    }

    // Overflow: fill the batch to target (the filler is zero when the
    // batch already sits at or past it), close it, and open the next batch
    // with the excess.
    let (updates, summary) = plan_split(
      &data,
      config,
      remaining,
      request.units - remaining,
      &request.receipts,
      request.note.as_deref(),
      &mut stamp,
    )?;
    self.apply(updates).await?;
    tracing::info!(
      loom = %loom_id,
      batch = summary.sequence,
      "batch overflowed, opened the next one"
    );
    Ok(SubmitOutcome::Split(summary))
  }

  /// Close the active batch right where it stands and open the next one.
  /// Balances carry forward exactly as on an overflow split; no filler or
  /// excess production is recorded.
  pub async fn close_batch(&self, loom_id: &LoomId) -> Result<SplitSummary> {
    let lock = self.loom_lock(loom_id).await;
    let _guard = lock.lock().await;
    self.store.wait_ready().await?;
    let data = self.store.dataset();
    let config = loom_config(&data, loom_id)?;

    let mut stamp = stamper(Utc::now());
    let (updates, summary) = plan_split(
      &data,
      config,
      Decimal::ZERO,
      Decimal::ZERO,
      &[],
      None,
      &mut stamp,
    )?;
    self.apply(updates).await?;
    tracing::info!(
      loom = %loom_id,
      batch = summary.sequence,
      "closed the active batch"
    );
    Ok(summary)
  }

  /// Record a standalone raw-material receipt or return against the active
  /// batch.
  pub async fn record_movement(
    &self,
    loom_id: &LoomId,
    kind: MovementKind,
    movement: MaterialMovement,
    note: Option<String>,
  ) -> Result<Transaction> {
    let lock = self.loom_lock(loom_id).await;
    let _guard = lock.lock().await;
    self.store.wait_ready().await?;
    let data = self.store.dataset();
    let config = loom_config(&data, loom_id)?;

    let batch_id = config.active_batch_id.clone();
    let tx = match kind {
      MovementKind::Receipt => Transaction::receipt(
        loom_id.clone(),
        batch_id,
        movement.material,
        movement.quantity,
        note,
        Utc::now(),
      )?,
      MovementKind::Return => Transaction::material_return(
        loom_id.clone(),
        batch_id,
        movement.material,
        movement.quantity,
        note,
        Utc::now(),
      )?,
    };
    let mut updates = UpdateSet::new();
    updates.put(KvPath::transaction(&tx.id), &tx)?;
    self.apply(updates).await?;
    Ok(tx)
  }

  /// Update a loom's target and consumption factors. Affects the active
  /// batch's figures from now on; closed batches stay pinned by their
  /// closure records.
  pub async fn update_settings(
    &self,
    loom_id: &LoomId,
    settings: LoomSettings,
  ) -> Result<LoomConfig> {
    settings.validate()?;
    let lock = self.loom_lock(loom_id).await;
    let _guard = lock.lock().await;
    self.store.wait_ready().await?;
    let data = self.store.dataset();
    let config = loom_config(&data, loom_id)?;

    let mut config = config.clone();
    config.target_units = settings.target_units;
    config.factors = settings.factors;
    let mut updates = UpdateSet::new();
    updates.put(KvPath::loom_config(&config.id), &config)?;
    self.apply(updates).await?;
    Ok(config)
  }

  /// The report for one loom: its active batch plus the most recently
  /// closed ones.
  pub async fn loom_report(&self, loom_id: &LoomId) -> Result<LoomReport> {
    self.store.wait_ready().await?;
    let data = self.store.dataset();
    let config = loom_config(&data, loom_id)?;
    Ok(report::build(&data, config))
  }

  /// Every configured loom, in id order.
  pub async fn looms(&self) -> Result<Vec<LoomId>> {
    self.store.wait_ready().await?;
    Ok(self.store.dataset().loom_configs.keys().cloned().collect())
  }

  /// Delete every archived transaction and every closure record for one
  /// loom. The active batch is untouched. Returns how many transactions
  /// were removed.
  pub async fn purge_archived(&self, loom_id: &LoomId) -> Result<usize> {
    let lock = self.loom_lock(loom_id).await;
    let _guard = lock.lock().await;
    self.store.wait_ready().await?;
    let data = self.store.dataset();
    loom_config(&data, loom_id)?;

    let mut updates = UpdateSet::new();
    let mut purged = 0usize;
    for tx in data.transactions_for_loom(loom_id) {
      if tx.archived {
        updates.delete(KvPath::transaction(&tx.id));
        purged += 1;
      }
    }
    for closure in data.closures_for_loom(loom_id) {
      updates.delete(KvPath::batch_closure(&closure.batch_id));
    }
    if updates.is_empty() {
      return Ok(0);
    }
    self.apply(updates).await?;
    Ok(purged)
  }

  /// The full dataset, for export: one consistent snapshot of the latest
  /// revision.
  pub async fn export_dataset(&self) -> Result<Dataset> {
    self.store.wait_ready().await?;
    Ok((*self.store.dataset()).clone())
  }

  /// Replace everything with an imported document. Accepts current-version
  /// exports and every historical era the migration path reads. Does not
  /// require the store to be ready — importing over an unreadable backend
  /// is the recovery path.
  pub async fn import_dataset(&self, document: &Value) -> Result<Dataset> {
    let normalized = normalize_import(document)?;
    let data = migrate::upgrade(&normalized)?;
    self.replace_root(&data).await?;
    Ok(data)
  }

  /// Wipe the backend and reseed it with the default looms.
  pub async fn reset(&self, profile: SeedProfile) -> Result<Dataset> {
    let data = Dataset::seed(profile, Utc::now());
    self.replace_root(&data).await?;
    Ok(data)
  }

  /// The per-loom write lock. Serialises this process's lifecycle
  /// operations per loom; cross-session writes race at the backend.
  async fn loom_lock(&self, loom_id: &LoomId) -> Arc<Mutex<()>> {
    let mut locks = self.locks.lock().await;
    locks
      .entry(loom_id.clone())
      .or_insert_with(|| Arc::new(Mutex::new(())))
      .clone()
  }

  /// Apply one atomic update and wait for its echo, so the next read on
  /// this engine observes the write.
  async fn apply(&self, updates: UpdateSet) -> Result<()> {
    let revision = self
      .store
      .gateway()
      .atomic_update(updates)
      .await
      .map_err(SyncError::backend)?;
    self.store.wait_applied(revision).await
  }

  async fn replace_root(&self, data: &Dataset) -> Result<()> {
    let value = data.to_value()?;
    let revision = self
      .store
      .gateway()
      .set(&KvPath::root(), value)
      .await
      .map_err(SyncError::backend)?;
    self.store.wait_applied(revision).await
  }
}

fn loom_config<'d>(
  data: &'d Dataset,
  loom_id: &LoomId,
) -> Result<&'d LoomConfig> {
  data
    .loom_config(loom_id)
    .ok_or_else(|| Error::NotFound(NotFoundError::Loom(loom_id.clone())))
}

// ─── Split planning ──────────────────────────────────────────────────────────

/// Plan the atomic update that closes the active batch and opens the next
/// one: receipts and filler into the closing batch, everything in it
/// re-written archived, a closure snapshot, carried-forward openings, the
/// excess production, and the config pointing at the new batch.
pub(crate) fn plan_split(
  data: &Dataset,
  config: &LoomConfig,
  filler_units: Decimal,
  excess_units: Decimal,
  receipts: &[MaterialMovement],
  note: Option<&str>,
  stamp: &mut impl FnMut() -> DateTime<Utc>,
) -> Result<(UpdateSet, SplitSummary)> {
  let loom_id = &config.id;
  let closing_batch = config.active_batch_id.clone();

  let mut closing_txs: Vec<Transaction> =
    data.transactions_for_batch(&closing_batch).cloned().collect();
  for receipt in receipts {
    closing_txs.push(Transaction::receipt(
      loom_id.clone(),
      closing_batch.clone(),
      receipt.material,
      receipt.quantity,
      note.map(str::to_owned),
      stamp(),
    )?);
  }
  if filler_units > Decimal::ZERO {
    closing_txs.push(Transaction::production(
      loom_id.clone(),
      closing_batch.clone(),
      filler_units,
      Some(suffixed(note, &format!("batch #{} fill", config.batch_sequence))),
      stamp(),
    )?);
  }

  // The final position of the closing batch, receipts and filler included.
  let closed = BatchBalances::compute(closing_txs.iter(), &config.factors);

  let closure = BatchClosure {
    batch_id:     closing_batch.clone(),
    loom_id:      loom_id.clone(),
    sequence:     config.batch_sequence,
    closed_at:    stamp(),
    target_units: config.target_units,
    factors:      config.factors,
  };

  let new_batch = BatchId::generate();
  let sequence = config.batch_sequence + 1;

  let mut updates = UpdateSet::new();
  // Everything in the closed batch is archived in this same revision,
  // including the entries the split itself created.
  for tx in closing_txs {
    let tx = tx.into_archived();
    updates.put(KvPath::transaction(&tx.id), &tx)?;
  }
  updates.put(KvPath::batch_closure(&closure.batch_id), &closure)?;

  let mut carried = Vec::new();
  for balance in closed.carryable() {
    let tx = Transaction::opening(
      loom_id.clone(),
      new_batch.clone(),
      balance.material,
      balance.closing,
      Some(format!("Opening balance (batch #{sequence})")),
      stamp(),
    )?;
    carried.push(MaterialMovement {
      material: balance.material,
      quantity: balance.closing,
    });
    updates.put(KvPath::transaction(&tx.id), &tx)?;
  }

  if excess_units > Decimal::ZERO {
    let tx = Transaction::production(
      loom_id.clone(),
      new_batch.clone(),
      excess_units,
      Some(suffixed(note, &format!("batch #{sequence} overflow"))),
      stamp(),
    )?;
    updates.put(KvPath::transaction(&tx.id), &tx)?;
  }

  let mut next_config = config.clone();
  next_config.active_batch_id = new_batch.clone();
  next_config.batch_sequence = sequence;
  updates.put(KvPath::loom_config(&next_config.id), &next_config)?;

  let summary = SplitSummary {
    closed_batch_id: closing_batch,
    new_batch_id: new_batch,
    sequence,
    filler_units,
    excess_units,
    carried,
  };
  Ok((updates, summary))
}

/// Compose a user note with a lifecycle marker.
fn suffixed(note: Option<&str>, marker: &str) -> String {
  match note {
    Some(text) => format!("{text} ({marker})"),
    None => format!("({marker})"),
  }
}

/// Strictly increasing timestamps for entries written in one update.
fn stamper(base: DateTime<Utc>) -> impl FnMut() -> DateTime<Utc> {
  let mut tick = 0i64;
  move || {
    let at = base + Duration::milliseconds(tick);
    tick += 1;
    at
  }
}

//! Per-loom reporting: the active batch plus recently closed ones.
//!
//! Nothing here is stored. Balances of every batch, open or closed, are
//! recomputed from its transactions on each read; closed batches use the
//! factors pinned by their closure record when one exists, and fall back to
//! the loom's current settings — flagged as assumed — when it does not.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use heddle_core::{
  balance::BatchBalances,
  batch::BatchId,
  dataset::{Dataset, chronological},
  loom::{ConsumptionFactors, LoomConfig, LoomId},
  transaction::Transaction,
};
use rust_decimal::Decimal;

/// How many closed batches a report carries alongside the active one.
pub const COMPLETED_BATCHES_SHOWN: usize = 3;

/// Where a batch stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
  Current,
  Completed,
}

/// One batch, computed for display.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchView {
  pub batch_id:        BatchId,
  pub status:          BatchStatus,
  /// Sequence number, when known. Batches archived before closure records
  /// existed have none.
  pub sequence:        Option<u32>,
  pub target_units:    Decimal,
  pub balances:        BatchBalances,
  /// Units still to produce before the batch is full. Zero for completed
  /// batches.
  pub remaining:       Decimal,
  pub started_at:      Option<DateTime<Utc>>,
  pub closed_at:       Option<DateTime<Utc>>,
  /// Factors the balances were computed with.
  pub factors:         ConsumptionFactors,
  /// True when no closure record survives and the loom's current settings
  /// were assumed instead.
  pub factors_assumed: bool,
}

/// The report for one loom.
#[derive(Debug, Clone, PartialEq)]
pub struct LoomReport {
  pub loom_id:   LoomId,
  pub current:   BatchView,
  /// Most recently closed batches, newest first.
  pub completed: Vec<BatchView>,
}

pub(crate) fn build(data: &Dataset, config: &LoomConfig) -> LoomReport {
  LoomReport {
    loom_id:   config.id.clone(),
    current:   current_view(data, config),
    completed: completed_views(data, config),
  }
}

fn current_view(data: &Dataset, config: &LoomConfig) -> BatchView {
  let transactions: Vec<&Transaction> =
    data.transactions_for_batch(&config.active_batch_id).collect();
  let balances =
    BatchBalances::compute(transactions.iter().copied(), &config.factors);
  let started_at = chronological(transactions.iter().copied())
    .first()
    .map(|tx| tx.recorded_at);
  BatchView {
    batch_id: config.active_batch_id.clone(),
    status: BatchStatus::Current,
    sequence: Some(config.batch_sequence),
    target_units: config.target_units,
    balances,
    remaining: (config.target_units - balances.produced).max(Decimal::ZERO),
    started_at,
    closed_at: None,
    factors: config.factors,
    factors_assumed: false,
  }
}

fn completed_views(data: &Dataset, config: &LoomConfig) -> Vec<BatchView> {
  let mut batches: BTreeMap<&BatchId, Vec<&Transaction>> = BTreeMap::new();
  for tx in data.transactions_for_loom(&config.id) {
    if tx.archived && tx.batch_id != config.active_batch_id {
      batches.entry(&tx.batch_id).or_default().push(tx);
    }
  }

  let mut views: Vec<BatchView> = batches
    .into_iter()
    .map(|(batch_id, transactions)| {
      completed_view(data, config, batch_id, transactions)
    })
    .collect();

  // Newest first. Every completed batch has a closed-at: the closure's
  // timestamp, or the last transaction's when the closure predates closure
  // records.
  views.sort_by(|a, b| {
    b.closed_at
      .cmp(&a.closed_at)
      .then_with(|| b.sequence.cmp(&a.sequence))
  });
  views.truncate(COMPLETED_BATCHES_SHOWN);
  views
}

fn completed_view(
  data: &Dataset,
  config: &LoomConfig,
  batch_id: &BatchId,
  transactions: Vec<&Transaction>,
) -> BatchView {
  let closure = data.batch_closures.get(batch_id);
  let (target_units, factors, factors_assumed) = match closure {
    Some(closure) => (closure.target_units, closure.factors, false),
    None => (config.target_units, config.factors, true),
  };
  let balances =
    BatchBalances::compute(transactions.iter().copied(), &factors);
  let ordered = chronological(transactions.iter().copied());
  BatchView {
    batch_id: batch_id.clone(),
    status: BatchStatus::Completed,
    sequence: closure.map(|c| c.sequence),
    target_units,
    balances,
    remaining: Decimal::ZERO,
    started_at: ordered.first().map(|tx| tx.recorded_at),
    closed_at: closure
      .map(|c| c.closed_at)
      .or_else(|| ordered.last().map(|tx| tx.recorded_at)),
    factors,
    factors_assumed,
  }
}

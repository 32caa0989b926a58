//! Engine tests over the in-memory backend: store lifecycle (seeding,
//! migration, failure and recovery), production recording, batch splits
//! with carry-forward, reporting, the destructive operations, and the
//! concurrency behaviour this design promises.

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use chrono::{Duration, Utc};
use heddle_core::{
  Error, MigrationError, NotFoundError, SyncError, ValidationError,
  batch::BatchId,
  dataset::SeedProfile,
  gateway::{KvPath, Revision, Snapshot, SyncGateway, UpdateSet},
  loom::{ConsumptionFactors, LoomId, LoomSettings},
  migrate::CURRENT_SCHEMA_VERSION,
  transaction::{Material, TransactionId, TransactionKind},
};
use heddle_store_memory::MemoryGateway;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::{
  engine::{
    BatchEngine, MaterialMovement, MovementKind, ProductionRequest,
    SubmitOutcome, plan_split,
  },
  report::BatchStatus,
  store::{EntityStore, StoreStatus},
};

fn dec(s: &str) -> Decimal {
  s.parse().expect("decimal literal")
}

fn loom(id: &str) -> LoomId {
  LoomId::new(id)
}

fn movement(material: Material, qty: &str) -> MaterialMovement {
  MaterialMovement { material, quantity: dec(qty) }
}

/// A ready engine over a fresh in-memory backend, reset to the zeroed
/// profile so tests start from clean looms with default settings.
async fn zeroed_engine() -> BatchEngine<MemoryGateway> {
  let store = Arc::new(EntityStore::open(Arc::new(MemoryGateway::new())));
  let engine = BatchEngine::new(store);
  engine.reset(SeedProfile::Zeroed).await.expect("reset");
  engine
}

/// A ready engine over a freshly auto-seeded backend.
async fn seeded_engine() -> BatchEngine<MemoryGateway> {
  let store = Arc::new(EntityStore::open(Arc::new(MemoryGateway::new())));
  let engine = BatchEngine::new(store);
  engine.store().wait_ready().await.expect("ready");
  engine
}

async fn submit<G: SyncGateway>(
  engine: &BatchEngine<G>,
  id: &LoomId,
  units: &str,
) -> SubmitOutcome {
  engine
    .submit_production(id, ProductionRequest::new(dec(units)))
    .await
    .expect("submit")
}

async fn set_loom<G: SyncGateway>(
  engine: &BatchEngine<G>,
  id: &LoomId,
  target: &str,
  cone: &str,
  jarigai: &str,
) {
  let settings = LoomSettings {
    target_units: dec(target),
    factors: ConsumptionFactors::new(dec(cone), dec(jarigai))
      .expect("valid factors"),
  };
  engine.update_settings(id, settings).await.expect("settings");
}

// ─── Store lifecycle ─────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_backend_is_seeded_with_default_looms() {
  let engine = seeded_engine().await;

  let looms = engine.looms().await.unwrap();
  assert_eq!(looms, vec![loom("1"), loom("2"), loom("3"), loom("4")]);

  let report = engine.loom_report(&loom("1")).await.unwrap();
  assert_eq!(report.current.status, BatchStatus::Current);
  assert_eq!(report.current.sequence, Some(1));
  assert_eq!(report.current.balances.cone.opening, dec("10"));
  assert_eq!(report.current.balances.jarigai.opening, dec("5"));
  assert_eq!(report.current.balances.produced, Decimal::ZERO);
  assert_eq!(report.current.remaining, dec("80"));
  assert!(report.completed.is_empty());
}

#[tokio::test]
async fn older_schema_is_migrated_and_written_back() {
  let gateway = Arc::new(MemoryGateway::new());
  let legacy = json!({
    "schemaVersion": 2,
    "transactions": {
      "p1": { "id": "p1", "loomId": "1", "batchNumber": 1,
              "type": "PRODUCTION", "value": 30,
              "timestamp": 1700000000000i64 },
      "p2": { "id": "p2", "loomId": "1", "batchNumber": 2,
              "type": "CONE_OPENING", "value": 2,
              "timestamp": 1700000100000i64 }
    },
    "loomConfigs": {
      "1": { "id": "1", "target": 80, "batchNumber": 2,
             "coneStock": 2, "jarigaiStock": 0,
             "coneUsageFactor": 0.4, "jarigaiUsageFactor": 0.1 }
    }
  });
  gateway.set(&KvPath::root(), legacy).await.unwrap();

  let store = Arc::new(EntityStore::open(Arc::clone(&gateway)));
  store.wait_ready().await.unwrap();

  // The upgrade was persisted: the root now carries the current schema.
  let root = gateway.root().await;
  assert_eq!(root["schema_version"], json!(CURRENT_SCHEMA_VERSION));
  assert!(root.get("schemaVersion").is_none());

  let engine = BatchEngine::new(store);
  let id = loom("1");
  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(report.current.batch_id, BatchId::numbered(&id, 2));
  assert_eq!(report.current.balances.cone.opening, dec("2"));

  // The closed batch predates closure records, so its figures assume the
  // loom's current factors and say so.
  let closed = &report.completed[0];
  assert_eq!(closed.batch_id, BatchId::numbered(&id, 1));
  assert_eq!(closed.sequence, None);
  assert!(closed.factors_assumed);
  assert_eq!(closed.balances.produced, dec("30"));
  assert_eq!(closed.balances.cone.consumed, dec("12"));
}

#[tokio::test]
async fn unreadable_backend_fails_then_reset_recovers() {
  let gateway = Arc::new(MemoryGateway::new());
  gateway
    .set(&KvPath::root(), json!({ "schema_version": 99 }))
    .await
    .unwrap();

  let store = Arc::new(EntityStore::open(Arc::clone(&gateway)));
  let err = store.wait_ready().await.unwrap_err();
  assert!(matches!(
    err,
    Error::Migration(MigrationError::UnsupportedVersion(99))
  ));

  // Resetting replaces the unreadable root and brings the store back.
  let engine = BatchEngine::new(store);
  engine.reset(SeedProfile::Stocked).await.unwrap();
  engine.store().wait_ready().await.unwrap();
  assert_eq!(engine.looms().await.unwrap().len(), 4);
}

#[tokio::test]
async fn closed_store_rejects_waits() {
  let store = Arc::new(EntityStore::open(Arc::new(MemoryGateway::new())));
  store.wait_ready().await.unwrap();

  store.close();
  assert_eq!(store.status(), StoreStatus::Closed);
  let err = store.wait_applied(u64::MAX).await.unwrap_err();
  assert!(matches!(err, Error::Sync(SyncError::StoreClosed)));
  let err = store.wait_ready().await.unwrap_err();
  assert!(matches!(err, Error::Sync(SyncError::StoreClosed)));
}

#[tokio::test]
async fn store_subscription_follows_external_writes() {
  let gateway = Arc::new(MemoryGateway::new());
  let store = Arc::new(EntityStore::open(Arc::clone(&gateway)));
  store.wait_ready().await.unwrap();
  let mut updates = store.subscribe();
  let seen = updates.borrow_and_update().revision;

  // A write from "another session", straight at the gateway.
  let revision = gateway
    .set(
      &KvPath::parse("transactions/ext-1"),
      json!({
        "id": "ext-1", "loom_id": "1", "batch_id": "b-x",
        "kind": "receipt", "material": "cone", "quantity": "2.5",
        "recorded_at": "2024-03-01T06:00:00Z"
      }),
    )
    .await
    .unwrap();
  store.wait_applied(revision).await.unwrap();

  assert!(updates.borrow().revision > seen);
  let data = store.dataset();
  let tx = data
    .transactions
    .get(&TransactionId::from("ext-1"))
    .expect("external entry decoded");
  assert_eq!(tx.kind, TransactionKind::Receipt);
  assert_eq!(tx.quantity, dec("2.5"));
}

// ─── Recording production ────────────────────────────────────────────────────

#[tokio::test]
async fn production_within_target_appends_to_active_batch() {
  let engine = zeroed_engine().await;
  let id = loom("1");
  let before = engine.loom_report(&id).await.unwrap();

  let outcome = submit(&engine, &id, "30").await;
  assert_eq!(outcome, SubmitOutcome::Recorded {
    batch_id:   before.current.batch_id.clone(),
    produced:   dec("30"),
    batch_full: false,
  });

  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(report.current.batch_id, before.current.batch_id);
  assert_eq!(report.current.balances.produced, dec("30"));
  assert_eq!(report.current.remaining, dec("50"));
  assert_eq!(report.current.balances.cone.consumed, dec("3.6"));
  assert_eq!(report.current.balances.jarigai.consumed, dec("1.5"));
}

#[tokio::test]
async fn submission_with_receipts_records_both() {
  let engine = zeroed_engine().await;
  let id = loom("2");

  let mut request = ProductionRequest::new(dec("10"));
  request.receipts.push(movement(Material::Cone, "4"));
  request.receipts.push(movement(Material::Jarigai, "1.5"));
  request.note = Some("morning shift".to_owned());
  engine.submit_production(&id, request).await.unwrap();

  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(report.current.balances.produced, dec("10"));
  assert_eq!(report.current.balances.cone.received, dec("4"));
  assert_eq!(report.current.balances.jarigai.received, dec("1.5"));

  // All three entries share the visit's note and carry strictly
  // increasing timestamps, so creation order stays unambiguous.
  let data = engine.export_dataset().await.unwrap();
  let mut stamps: Vec<_> =
    data.transactions_for_loom(&id).map(|tx| tx.recorded_at).collect();
  assert_eq!(stamps.len(), 3);
  stamps.sort();
  stamps.dedup();
  assert_eq!(stamps.len(), 3);
  assert!(
    data
      .transactions_for_loom(&id)
      .all(|tx| tx.note.as_deref() == Some("morning shift"))
  );
}

#[tokio::test]
async fn exact_fit_flags_batch_full_without_splitting() {
  let engine = zeroed_engine().await;
  let id = loom("1");

  submit(&engine, &id, "79.5").await;
  let outcome = submit(&engine, &id, "0.5").await;
  let SubmitOutcome::Recorded { batch_full, produced, .. } = outcome else {
    panic!("exact fit must not split");
  };
  assert!(batch_full);
  assert_eq!(produced, dec("80"));

  // Still one open batch: nothing archived, no closure, no new openings.
  let data = engine.export_dataset().await.unwrap();
  assert!(data.batch_closures.is_empty());
  assert!(data.transactions.values().all(|tx| !tx.archived));
  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(report.current.sequence, Some(1));
  assert_eq!(report.current.remaining, Decimal::ZERO);
}

#[tokio::test]
async fn submission_past_a_full_batch_splits_with_zero_filler() {
  let engine = zeroed_engine().await;
  let id = loom("1");
  submit(&engine, &id, "80").await;

  let SubmitOutcome::Split(summary) = submit(&engine, &id, "1").await else {
    panic!("submission past target must split");
  };
  assert_eq!(summary.filler_units, Decimal::ZERO);
  assert_eq!(summary.excess_units, dec("1"));
  assert_eq!(summary.sequence, 2);

  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(report.current.balances.produced, dec("1"));
  assert_eq!(report.completed[0].balances.produced, dec("80"));
}

// ─── Splits and carry-forward ────────────────────────────────────────────────

#[tokio::test]
async fn overflow_split_fills_closes_and_carries() {
  let engine = zeroed_engine().await;
  let id = loom("1");
  set_loom(&engine, &id, "80", "0.45", "0.1").await;
  engine
    .record_movement(
      &id,
      MovementKind::Receipt,
      movement(Material::Cone, "2"),
      None,
    )
    .await
    .unwrap();
  engine
    .record_movement(
      &id,
      MovementKind::Receipt,
      movement(Material::Cone, "5"),
      None,
    )
    .await
    .unwrap();
  submit(&engine, &id, "70").await;

  let SubmitOutcome::Split(summary) = submit(&engine, &id, "15").await else {
    panic!("15 over a 70-of-80 batch must split");
  };
  assert_eq!(summary.filler_units, dec("10"));
  assert_eq!(summary.excess_units, dec("5"));
  assert_eq!(summary.sequence, 2);
  assert_eq!(summary.carried, vec![
    movement(Material::Cone, "-29"),
    movement(Material::Jarigai, "-8"),
  ]);

  let report = engine.loom_report(&id).await.unwrap();
  let closed = &report.completed[0];
  assert_eq!(closed.status, BatchStatus::Completed);
  assert_eq!(closed.batch_id, summary.closed_batch_id);
  assert_eq!(closed.sequence, Some(1));
  assert_eq!(closed.balances.produced, dec("80"));
  assert_eq!(closed.balances.cone.received, dec("7"));
  assert_eq!(closed.balances.cone.consumed, dec("36"));
  assert_eq!(closed.balances.cone.closing, dec("-29"));
  assert!(!closed.factors_assumed);
  assert!(closed.closed_at.is_some());

  assert_eq!(report.current.batch_id, summary.new_batch_id);
  assert_eq!(report.current.balances.cone.opening, dec("-29"));
  assert_eq!(report.current.balances.jarigai.opening, dec("-8"));
  assert_eq!(report.current.balances.produced, dec("5"));
  assert_eq!(report.current.remaining, dec("75"));

  // Everything in the closed batch is archived, including the filler the
  // split itself recorded; the new batch's entries are not.
  let data = engine.export_dataset().await.unwrap();
  assert!(
    data
      .transactions_for_batch(&summary.closed_batch_id)
      .all(|tx| tx.archived)
  );
  assert!(
    data
      .transactions_for_batch(&summary.new_batch_id)
      .all(|tx| !tx.archived)
  );
}

#[tokio::test]
async fn split_conserves_submitted_units() {
  let engine = zeroed_engine().await;
  let id = loom("3");
  submit(&engine, &id, "64").await;

  let SubmitOutcome::Split(summary) = submit(&engine, &id, "40").await else {
    panic!("overflow expected");
  };
  assert_eq!(summary.filler_units + summary.excess_units, dec("40"));

  let report = engine.loom_report(&id).await.unwrap();
  let total = report.current.balances.produced
    + report.completed[0].balances.produced;
  assert_eq!(total, dec("104"));
}

#[tokio::test]
async fn force_close_carries_balances_without_production() {
  let engine = zeroed_engine().await;
  let id = loom("2");
  engine
    .record_movement(
      &id,
      MovementKind::Receipt,
      movement(Material::Cone, "6"),
      None,
    )
    .await
    .unwrap();
  submit(&engine, &id, "20").await;

  let summary = engine.close_batch(&id).await.unwrap();
  assert_eq!(summary.filler_units, Decimal::ZERO);
  assert_eq!(summary.excess_units, Decimal::ZERO);
  assert_eq!(summary.sequence, 2);
  // Default factors: cone closes at 6 − 20 × 0.12, jarigai at −20 × 0.05.
  assert_eq!(summary.carried, vec![
    movement(Material::Cone, "3.6"),
    movement(Material::Jarigai, "-1"),
  ]);

  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(report.completed[0].balances.cone.closing, dec("3.6"));
  assert_eq!(report.current.balances.cone.opening, dec("3.6"));
  assert_eq!(report.current.balances.jarigai.opening, dec("-1"));
  assert_eq!(report.current.balances.produced, Decimal::ZERO);
}

#[tokio::test]
async fn dust_balances_are_not_carried_forward() {
  let engine = zeroed_engine().await;
  let id = loom("4");
  engine
    .record_movement(
      &id,
      MovementKind::Receipt,
      movement(Material::Cone, "0.0004"),
      None,
    )
    .await
    .unwrap();

  let summary = engine.close_batch(&id).await.unwrap();
  assert!(summary.carried.is_empty());

  // The new batch starts with no transactions at all.
  let data = engine.export_dataset().await.unwrap();
  assert!(
    data.transactions_for_batch(&summary.new_batch_id).next().is_none()
  );
  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(report.current.balances.cone.opening, Decimal::ZERO);
}

#[tokio::test]
async fn receipts_on_a_splitting_submission_feed_the_closing_batch() {
  let engine = zeroed_engine().await;
  let id = loom("1");
  set_loom(&engine, &id, "10", "0.12", "0.05").await;

  let mut request = ProductionRequest::new(dec("12"));
  request.receipts.push(movement(Material::Cone, "3"));
  let outcome = engine.submit_production(&id, request).await.unwrap();
  let SubmitOutcome::Split(summary) = outcome else {
    panic!("12 against a target of 10 must split");
  };
  assert_eq!(summary.filler_units, dec("10"));
  assert_eq!(summary.excess_units, dec("2"));

  let report = engine.loom_report(&id).await.unwrap();
  let closed = &report.completed[0];
  assert_eq!(closed.balances.cone.received, dec("3"));
  assert_eq!(closed.balances.produced, dec("10"));
  // 3 − 10 × 0.12 carries into the new batch as its opening.
  assert_eq!(report.current.balances.cone.received, Decimal::ZERO);
  assert_eq!(report.current.balances.cone.opening, dec("1.8"));
  assert_eq!(report.current.balances.produced, dec("2"));
}

#[tokio::test]
async fn closed_batches_stay_pinned_when_settings_change() {
  let engine = zeroed_engine().await;
  let id = loom("2");
  submit(&engine, &id, "50").await;
  engine.close_batch(&id).await.unwrap();

  set_loom(&engine, &id, "100", "0.5", "0.2").await;

  let report = engine.loom_report(&id).await.unwrap();
  let closed = &report.completed[0];
  // The closure pins the settings in effect at close time.
  assert_eq!(closed.target_units, dec("80"));
  assert_eq!(closed.balances.cone.consumed, dec("6"));
  assert!(!closed.factors_assumed);

  assert_eq!(report.current.target_units, dec("100"));
  assert_eq!(report.current.remaining, dec("100"));
  assert_eq!(report.current.factors.cone, dec("0.5"));
}

// ─── Validation and lookups ──────────────────────────────────────────────────

#[tokio::test]
async fn invalid_requests_never_touch_the_store() {
  let engine = zeroed_engine().await;
  let id = loom("1");
  let before = engine.store().snapshot().revision;

  let err = engine
    .submit_production(&id, ProductionRequest::new(Decimal::ZERO))
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Validation(ValidationError::NonPositiveQuantity {
      kind: TransactionKind::Production,
      ..
    })
  ));

  let mut request = ProductionRequest::new(dec("5"));
  request.receipts.push(movement(Material::Warp, "1"));
  let err = engine.submit_production(&id, request).await.unwrap_err();
  assert!(matches!(
    err,
    Error::Validation(ValidationError::RawMaterialRequired(
      TransactionKind::Receipt
    ))
  ));

  let err = engine
    .record_movement(
      &id,
      MovementKind::Return,
      movement(Material::Cone, "-2"),
      None,
    )
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Validation(ValidationError::NonPositiveQuantity {
      kind: TransactionKind::Return,
      ..
    })
  ));

  let err = engine
    .update_settings(&id, LoomSettings {
      target_units: Decimal::ZERO,
      factors:      ConsumptionFactors::default(),
    })
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Validation(ValidationError::NonPositiveTarget(_))
  ));

  assert_eq!(engine.store().snapshot().revision, before);
}

#[tokio::test]
async fn unknown_loom_is_reported_not_found() {
  let engine = zeroed_engine().await;
  let ghost = loom("9");

  let err = engine.loom_report(&ghost).await.unwrap_err();
  assert!(matches!(err, Error::NotFound(NotFoundError::Loom(id)) if id == ghost));

  let err = engine
    .submit_production(&ghost, ProductionRequest::new(dec("1")))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::NotFound(NotFoundError::Loom(_))));
}

#[tokio::test]
async fn returns_reduce_the_closing_balance() {
  let engine = zeroed_engine().await;
  let id = loom("3");
  engine
    .record_movement(
      &id,
      MovementKind::Receipt,
      movement(Material::Jarigai, "5"),
      None,
    )
    .await
    .unwrap();
  engine
    .record_movement(
      &id,
      MovementKind::Return,
      movement(Material::Jarigai, "2"),
      None,
    )
    .await
    .unwrap();

  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(report.current.balances.jarigai.received, dec("5"));
  assert_eq!(report.current.balances.jarigai.returned, dec("2"));
  assert_eq!(report.current.balances.jarigai.closing, dec("3"));
}

// ─── Reporting ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn report_carries_at_most_three_completed_batches_newest_first() {
  let engine = zeroed_engine().await;
  let id = loom("1");
  for units in ["5", "6", "7", "8"] {
    submit(&engine, &id, units).await;
    engine.close_batch(&id).await.unwrap();
  }

  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(report.completed.len(), 3);
  assert_eq!(report.completed[0].balances.produced, dec("8"));
  assert_eq!(report.completed[1].balances.produced, dec("7"));
  assert_eq!(report.completed[2].balances.produced, dec("6"));
  assert_eq!(report.completed[0].sequence, Some(4));
  assert_eq!(report.current.sequence, Some(5));
}

// ─── Destructive operations ──────────────────────────────────────────────────

#[tokio::test]
async fn purge_removes_archived_history_and_keeps_the_active_batch() {
  let engine = zeroed_engine().await;
  let id = loom("2");
  submit(&engine, &id, "30").await;
  engine.close_batch(&id).await.unwrap();
  submit(&engine, &id, "10").await;

  let purged = engine.purge_archived(&id).await.unwrap();
  assert_eq!(purged, 1);

  let data = engine.export_dataset().await.unwrap();
  assert!(data.batch_closures.is_empty());
  assert!(data.transactions.values().all(|tx| !tx.archived));

  let report = engine.loom_report(&id).await.unwrap();
  assert!(report.completed.is_empty());
  assert_eq!(report.current.balances.produced, dec("10"));
  // Carried openings belong to the active batch and survive the purge.
  assert_eq!(report.current.balances.cone.opening, dec("-3.6"));

  assert_eq!(engine.purge_archived(&id).await.unwrap(), 0);
}

#[tokio::test]
async fn export_import_round_trips_every_record() {
  let engine = zeroed_engine().await;
  let id = loom("1");
  submit(&engine, &id, "25").await;
  engine.close_batch(&id).await.unwrap();
  let exported = engine.export_dataset().await.unwrap();

  // Wipe, then restore from the export.
  engine.reset(SeedProfile::Zeroed).await.unwrap();
  let document = exported.to_value().unwrap();
  engine.import_dataset(&document).await.unwrap();

  let restored = engine.export_dataset().await.unwrap();
  assert_eq!(restored, exported);
}

#[tokio::test]
async fn import_accepts_array_transactions_from_old_exports() {
  let engine = zeroed_engine().await;
  let document = json!({
    "schemaVersion": 2,
    "transactions": [
      { "id": "x1", "loomId": "7", "batchNumber": 1,
        "type": "PRODUCTION", "value": 12, "timestamp": 1700000000000i64 }
    ],
    "loomConfigs": {
      "7": { "id": "7", "target": 40, "batchNumber": 1,
             "coneStock": 0, "jarigaiStock": 0,
             "coneUsageFactor": 0.2, "jarigaiUsageFactor": 0.1 }
    }
  });
  engine.import_dataset(&document).await.unwrap();

  // The import replaced the seeded looms entirely.
  assert_eq!(engine.looms().await.unwrap(), vec![loom("7")]);
  let report = engine.loom_report(&loom("7")).await.unwrap();
  assert_eq!(report.current.balances.produced, dec("12"));
  assert_eq!(report.current.remaining, dec("28"));
}

#[tokio::test]
async fn import_rejects_documents_missing_required_fields() {
  let engine = zeroed_engine().await;

  let err =
    engine.import_dataset(&json!({ "loomConfigs": {} })).await.unwrap_err();
  assert!(matches!(
    err,
    Error::Validation(ValidationError::ImportMissingField("transactions"))
  ));

  let err = engine.import_dataset(&json!([1, 2])).await.unwrap_err();
  assert!(matches!(
    err,
    Error::Validation(ValidationError::ImportNotAnObject)
  ));
}

#[tokio::test]
async fn reset_zeroed_provisions_empty_looms() {
  let engine = seeded_engine().await;
  engine.reset(SeedProfile::Zeroed).await.unwrap();

  let data = engine.export_dataset().await.unwrap();
  assert!(data.transactions.is_empty());
  assert_eq!(data.loom_configs.len(), 4);
}

// ─── Concurrency ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_submissions_on_one_loom_serialise_in_process() {
  let engine = Arc::new(zeroed_engine().await);
  let id = loom("1");

  let a = engine.submit_production(&id, ProductionRequest::new(dec("50")));
  let b = engine.submit_production(&id, ProductionRequest::new(dec("50")));
  let (a, b) = tokio::join!(a, b);
  let (a, b) = (a.unwrap(), b.unwrap());

  // One submission fit, the other split; which is which depends on polling
  // order, but between them nothing is lost or double-counted.
  let split = match (&a, &b) {
    (SubmitOutcome::Recorded { .. }, SubmitOutcome::Split(split)) => split,
    (SubmitOutcome::Split(split), SubmitOutcome::Recorded { .. }) => split,
    other => panic!("expected one append and one split, got {other:?}"),
  };
  assert_eq!(split.filler_units, dec("30"));
  assert_eq!(split.excess_units, dec("20"));

  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(
    report.current.balances.produced
      + report.completed[0].balances.produced,
    dec("100")
  );
}

#[tokio::test]
async fn double_split_from_one_snapshot_is_last_write_wins() {
  let engine = zeroed_engine().await;
  let id = loom("1");
  submit(&engine, &id, "70").await;

  // Two sessions plan the same overflow from the same snapshot, then both
  // apply. This is the cross-session race the per-loom lock cannot cover.
  let store = engine.store();
  let data = store.dataset();
  let config = data.loom_config(&id).unwrap();
  let base = Utc::now();
  let mut stamp_a = {
    let mut tick = 0i64;
    move || {
      tick += 1;
      base + Duration::milliseconds(tick)
    }
  };
  let mut stamp_b = {
    let mut tick = 100i64;
    move || {
      tick += 1;
      base + Duration::milliseconds(tick)
    }
  };
  let (updates_a, summary_a) =
    plan_split(&data, config, dec("10"), dec("5"), &[], None, &mut stamp_a)
      .unwrap();
  let (updates_b, summary_b) =
    plan_split(&data, config, dec("10"), dec("5"), &[], None, &mut stamp_b)
      .unwrap();

  let gateway = store.gateway();
  gateway.atomic_update(updates_a).await.unwrap();
  let last = gateway.atomic_update(updates_b).await.unwrap();
  store.wait_applied(last).await.unwrap();

  // The second config write wins; both closures target the same batch and
  // collapse into one record; the loser's new batch is orphaned, and the
  // closed batch keeps both fillers. Last write wins is the storage
  // contract, and the data stays decodable throughout.
  let data = store.dataset();
  let config = data.loom_config(&id).unwrap();
  assert_eq!(config.active_batch_id, summary_b.new_batch_id);
  assert_eq!(config.batch_sequence, 2);
  assert_eq!(data.batch_closures.len(), 1);
  assert!(
    data.transactions_for_batch(&summary_a.new_batch_id).next().is_some()
  );

  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(report.current.batch_id, summary_b.new_batch_id);
  assert_eq!(report.completed.len(), 1);
  assert_eq!(report.completed[0].balances.produced, dec("90"));
}

// ─── Failure injection ───────────────────────────────────────────────────────

#[derive(Debug)]
struct InjectedFailure;

impl std::fmt::Display for InjectedFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("injected write failure")
  }
}

impl std::error::Error for InjectedFailure {}

/// Delegates to a [`MemoryGateway`], failing atomic updates on demand.
struct FlakyGateway {
  inner:       MemoryGateway,
  fail_writes: AtomicBool,
}

impl FlakyGateway {
  fn new() -> Self {
    Self {
      inner:       MemoryGateway::new(),
      fail_writes: AtomicBool::new(false),
    }
  }
}

impl SyncGateway for FlakyGateway {
  type Error = InjectedFailure;

  async fn get(&self, path: &KvPath) -> Result<Value, InjectedFailure> {
    Ok(self.inner.get(path).await.expect("infallible"))
  }

  async fn set(
    &self,
    path: &KvPath,
    value: Value,
  ) -> Result<Revision, InjectedFailure> {
    Ok(self.inner.set(path, value).await.expect("infallible"))
  }

  async fn remove(&self, path: &KvPath) -> Result<Revision, InjectedFailure> {
    Ok(self.inner.remove(path).await.expect("infallible"))
  }

  async fn atomic_update(
    &self,
    updates: UpdateSet,
  ) -> Result<Revision, InjectedFailure> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(InjectedFailure);
    }
    Ok(self.inner.atomic_update(updates).await.expect("infallible"))
  }

  async fn subscribe(
    &self,
    path: &KvPath,
  ) -> Result<watch::Receiver<Snapshot>, InjectedFailure> {
    Ok(self.inner.subscribe(path).await.expect("infallible"))
  }
}

#[tokio::test]
async fn failed_atomic_update_mutates_nothing() {
  let store = Arc::new(EntityStore::open(Arc::new(FlakyGateway::new())));
  let engine = BatchEngine::new(store);
  engine.reset(SeedProfile::Zeroed).await.unwrap();
  let id = loom("1");
  submit(&engine, &id, "10").await;
  let before = engine.export_dataset().await.unwrap();

  engine.store().gateway().fail_writes.store(true, Ordering::SeqCst);
  let err = engine
    .submit_production(&id, ProductionRequest::new(dec("5")))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Sync(SyncError::Backend(_))));
  assert_eq!(engine.export_dataset().await.unwrap(), before);

  // The same submission goes through once writes work again.
  engine.store().gateway().fail_writes.store(false, Ordering::SeqCst);
  submit(&engine, &id, "5").await;
  let report = engine.loom_report(&id).await.unwrap();
  assert_eq!(report.current.balances.produced, dec("15"));
}

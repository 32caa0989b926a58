//! The entity store: a live, decoded view of the gateway tree.
//!
//! One background task owns the root subscription. Every snapshot the
//! gateway pushes is decoded — migrated first when it carries an older
//! schema — into a [`Dataset`] published through a watch channel, so reads
//! are cheap `Arc` clones that never touch the backend. An empty backend is
//! seeded with the default looms before the store reports ready.
//!
//! Writes do not go through the store. Writers talk to the gateway directly
//! and then [`EntityStore::wait_applied`] on the revision they got back, so
//! local changes and changes from other sessions flow through the same
//! subscription path and the cache can never disagree with the backend.
//!
//! A snapshot that cannot be decoded marks the store failed but does not
//! stop the task: the last good dataset stays published, and a later
//! readable snapshot — typically a reset or an import replacing the root —
//! brings the store back to ready.

use std::sync::Arc;

use chrono::Utc;
use heddle_core::{
  Error, Result, SyncError,
  dataset::{Dataset, SeedProfile},
  error::MigrationError,
  gateway::{KvPath, Revision, Snapshot, SyncGateway},
  migrate,
};
use tokio::sync::watch;

// ─── Status ──────────────────────────────────────────────────────────────────

/// Lifecycle of the store's view of the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreStatus {
  /// The first snapshot has not decoded yet (seeding may be in flight).
  Loading,
  /// The published dataset reflects the latest gateway revision.
  Ready,
  /// The latest snapshot could not be exposed. The subscription stays up;
  /// a readable root replacement clears this.
  Failed(StoreFailure),
  /// [`EntityStore::close`] was called. Terminal.
  Closed,
}

/// Why a store is failed. `Migration` means the stored data itself is the
/// problem; `Gateway` covers an unusable subscription or a failed seed or
/// migration write-back.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreFailure {
  Migration(MigrationError),
  Gateway(String),
}

impl StoreFailure {
  fn into_error(self) -> Error {
    match self {
      StoreFailure::Migration(err) => Error::Migration(err),
      StoreFailure::Gateway(message) => {
        Error::Sync(SyncError::Subscription(message))
      }
    }
  }
}

// ─── StoreSnapshot ───────────────────────────────────────────────────────────

/// What the store publishes: one decoded dataset and the gateway revision
/// it reflects.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
  pub revision: Revision,
  pub data:     Arc<Dataset>,
}

// ─── EntityStore ─────────────────────────────────────────────────────────────

struct Shared {
  status: watch::Sender<StoreStatus>,
  state:  watch::Sender<StoreSnapshot>,
}

impl Shared {
  /// Publish a decoded dataset. State first, then status, so a caller woken
  /// by `Ready` always sees the data that made the store ready.
  fn publish(&self, revision: Revision, data: Dataset) {
    self
      .state
      .send_replace(StoreSnapshot { revision, data: Arc::new(data) });
    self.status.send_if_modified(|status| match status {
      StoreStatus::Ready | StoreStatus::Closed => false,
      StoreStatus::Loading | StoreStatus::Failed(_) => {
        *status = StoreStatus::Ready;
        true
      }
    });
  }

  fn fail(&self, failure: StoreFailure) {
    self.status.send_if_modified(|status| {
      if *status == StoreStatus::Closed {
        false
      } else {
        *status = StoreStatus::Failed(failure);
        true
      }
    });
  }
}

/// A live cache of the gateway tree. See the module docs for the read and
/// write paths.
pub struct EntityStore<G: SyncGateway> {
  gateway: Arc<G>,
  shared:  Arc<Shared>,
  task:    tokio::task::JoinHandle<()>,
}

impl<G: SyncGateway + 'static> EntityStore<G> {
  /// Open a store over `gateway` and start its subscription task. The store
  /// is `Loading` until the first snapshot has been decoded (after seeding,
  /// if the backend was empty).
  pub fn open(gateway: Arc<G>) -> Self {
    let (status, _) = watch::channel(StoreStatus::Loading);
    let (state, _) = watch::channel(StoreSnapshot {
      revision: 0,
      data:     Arc::new(Dataset::empty()),
    });
    let shared = Arc::new(Shared { status, state });
    let task = tokio::spawn(run(Arc::clone(&gateway), Arc::clone(&shared)));
    Self { gateway, shared, task }
  }
}

impl<G: SyncGateway> EntityStore<G> {
  /// The gateway this store sits on. Writers use it directly, then wait for
  /// their revision with [`Self::wait_applied`].
  pub fn gateway(&self) -> &Arc<G> { &self.gateway }

  pub fn status(&self) -> StoreStatus { self.shared.status.borrow().clone() }

  /// The latest published snapshot. Meaningful once the store is ready.
  pub fn snapshot(&self) -> StoreSnapshot { self.shared.state.borrow().clone() }

  /// The latest published dataset.
  pub fn dataset(&self) -> Arc<Dataset> { self.snapshot().data }

  /// A receiver that yields a fresh [`StoreSnapshot`] after every applied
  /// revision, coalescing intermediate ones for slow readers.
  pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
    self.shared.state.subscribe()
  }

  /// Resolve once the store has left `Loading`: `Ok` when ready, the
  /// current failure as an error otherwise. Callers may retry after the
  /// backend has been repaired.
  pub async fn wait_ready(&self) -> Result<()> {
    let mut status = self.shared.status.subscribe();
    loop {
      match &*status.borrow() {
        StoreStatus::Ready => return Ok(()),
        StoreStatus::Failed(failure) => {
          return Err(failure.clone().into_error());
        }
        StoreStatus::Closed => return Err(SyncError::StoreClosed.into()),
        StoreStatus::Loading => {}
      }
      if status.changed().await.is_err() {
        return Err(SyncError::StoreClosed.into());
      }
    }
  }

  /// Resolve once the snapshot at `revision` or later has been published.
  /// This is what gives same-process writers read-your-writes: write to the
  /// gateway, then wait for the returned revision to echo back.
  ///
  /// A failure already recorded when the wait starts is ignored — the write
  /// being waited on may be the root replacement that repairs it. A failure
  /// recorded during the wait resolves the wait with that error.
  pub async fn wait_applied(&self, revision: Revision) -> Result<()> {
    let mut state = self.shared.state.subscribe();
    let mut status = self.shared.status.subscribe();
    loop {
      if *status.borrow() == StoreStatus::Closed {
        return Err(SyncError::StoreClosed.into());
      }
      if state.borrow().revision >= revision {
        return Ok(());
      }
      tokio::select! {
        changed = state.changed() => {
          if changed.is_err() {
            return Err(SyncError::StoreClosed.into());
          }
        }
        changed = status.changed() => {
          if changed.is_err() {
            return Err(SyncError::StoreClosed.into());
          }
          if let StoreStatus::Failed(failure) = &*status.borrow() {
            return Err(failure.clone().into_error());
          }
        }
      }
    }
  }

  /// Stop the subscription task. Reads keep returning the last published
  /// snapshot; pending and future waits resolve with
  /// [`SyncError::StoreClosed`].
  pub fn close(&self) {
    self.task.abort();
    self.shared.status.send_if_modified(|status| {
      if *status == StoreStatus::Closed {
        false
      } else {
        *status = StoreStatus::Closed;
        true
      }
    });
  }
}

impl<G: SyncGateway> Drop for EntityStore<G> {
  fn drop(&mut self) { self.task.abort(); }
}

// ─── Subscription task ───────────────────────────────────────────────────────

async fn run<G: SyncGateway>(gateway: Arc<G>, shared: Arc<Shared>) {
  let root = KvPath::root();
  let mut updates = match gateway.subscribe(&root).await {
    Ok(rx) => rx,
    Err(err) => {
      shared.fail(StoreFailure::Gateway(err.to_string()));
      return;
    }
  };

  loop {
    let snapshot = updates.borrow_and_update().clone();
    apply(gateway.as_ref(), &shared, snapshot).await;
    if updates.changed().await.is_err() {
      shared.fail(StoreFailure::Gateway(
        "gateway dropped its subscription".to_owned(),
      ));
      return;
    }
  }
}

/// Decode one gateway snapshot into the published dataset, seeding or
/// migrating first where needed.
async fn apply<G: SyncGateway>(gateway: &G, shared: &Shared, snapshot: Snapshot) {
  if snapshot.value.is_null() {
    // Empty backend: provision the default looms. The seed write echoes
    // back through the subscription, so the store stays `Loading` here and
    // goes ready when the echo decodes.
    tracing::info!("backend is empty, seeding default looms");
    let seeded = Dataset::seed(SeedProfile::Stocked, Utc::now());
    if let Err(err) = write_root(gateway, &seeded).await {
      shared.fail(StoreFailure::Gateway(err.to_string()));
    }
    return;
  }

  let version = match migrate::schema_version(&snapshot.value) {
    Ok(version) => version,
    Err(err) => {
      shared.fail(StoreFailure::Migration(err));
      return;
    }
  };
  let data = match migrate::upgrade(&snapshot.value) {
    Ok(data) => data,
    Err(err) => {
      shared.fail(StoreFailure::Migration(err));
      return;
    }
  };

  if version != migrate::CURRENT_SCHEMA_VERSION {
    // Persist the upgrade as one root replacement. Its echo re-applies the
    // same dataset at a later revision, which is harmless.
    tracing::warn!(
      from = version,
      to = migrate::CURRENT_SCHEMA_VERSION,
      "migrated stored data, writing the upgrade back"
    );
    if let Err(err) = write_root(gateway, &data).await {
      shared.fail(StoreFailure::Gateway(err.to_string()));
      return;
    }
  }

  shared.publish(snapshot.revision, data);
}

async fn write_root<G: SyncGateway>(
  gateway: &G,
  data: &Dataset,
) -> Result<Revision> {
  let value = data.to_value().map_err(Error::Sync)?;
  gateway
    .set(&KvPath::root(), value)
    .await
    .map_err(|err| Error::Sync(SyncError::backend(err)))
}

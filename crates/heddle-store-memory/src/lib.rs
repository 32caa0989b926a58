//! In-memory [`SyncGateway`] backend.
//!
//! A single-process stand-in for the remote store: one JSON tree behind a
//! lock, with the same atomic-update and replay-on-subscribe semantics the
//! trait promises. The engine's test suite runs against this backend, and
//! it backs the CLI's `--ephemeral` mode.

use std::convert::Infallible;

use heddle_core::gateway::{
  KvPath, Revision, Snapshot, SyncGateway, UpdateSet, Watchers, apply_write,
  value_at,
};
use serde_json::Value;
use tokio::sync::{Mutex, watch};

/// Gateway state lives behind one lock so that writes, their revision
/// stamps, and watcher notifications always agree on ordering.
#[derive(Debug, Default)]
struct Inner {
  root:     Value,
  revision: Revision,
  watchers: Watchers,
}

impl Inner {
  fn commit(&mut self) -> Revision {
    self.revision += 1;
    self.watchers.notify(&self.root, self.revision);
    self.revision
  }
}

#[derive(Debug, Default)]
pub struct MemoryGateway {
  inner: Mutex<Inner>,
}

impl MemoryGateway {
  pub fn new() -> Self { Self::default() }

  /// The whole tree as of now. Test convenience.
  pub async fn root(&self) -> Value {
    self.inner.lock().await.root.clone()
  }

  /// The last committed revision. Test convenience.
  pub async fn revision(&self) -> Revision {
    self.inner.lock().await.revision
  }
}

impl SyncGateway for MemoryGateway {
  type Error = Infallible;

  async fn get(&self, path: &KvPath) -> Result<Value, Infallible> {
    let inner = self.inner.lock().await;
    Ok(value_at(&inner.root, path).clone())
  }

  async fn set(
    &self,
    path: &KvPath,
    value: Value,
  ) -> Result<Revision, Infallible> {
    let mut updates = UpdateSet::new();
    updates.put_value(path.clone(), value);
    self.atomic_update(updates).await
  }

  async fn remove(&self, path: &KvPath) -> Result<Revision, Infallible> {
    let mut updates = UpdateSet::new();
    updates.delete(path.clone());
    self.atomic_update(updates).await
  }

  async fn atomic_update(
    &self,
    updates: UpdateSet,
  ) -> Result<Revision, Infallible> {
    let mut inner = self.inner.lock().await;
    for (path, write) in updates.entries() {
      apply_write(&mut inner.root, path, write);
    }
    Ok(inner.commit())
  }

  async fn subscribe(
    &self,
    path: &KvPath,
  ) -> Result<watch::Receiver<Snapshot>, Infallible> {
    let mut inner = self.inner.lock().await;
    let Inner { root, revision, watchers } = &mut *inner;
    Ok(watchers.subscribe(path, root, *revision))
  }
}

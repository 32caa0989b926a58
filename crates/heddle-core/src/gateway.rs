//! The `SyncGateway` trait and supporting key-value types.
//!
//! The trait is implemented by storage backends (`heddle-store-memory`,
//! `heddle-store-sqlite`). Higher layers (`heddle-engine`, `heddle-cli`)
//! depend on this abstraction, not on any concrete backend.
//!
//! The data model is a single JSON tree addressed by slash-separated
//! [`KvPath`]s, in the manner of a realtime-database document root. Writes
//! are whole-subtree replacements; a multi-path [`UpdateSet`] applies as one
//! atomic revision. Subscribers get the current value replayed immediately
//! and a fresh [`Snapshot`] after every subsequent revision, with
//! intermediate states coalesced away by the underlying watch channel.

use std::future::Future;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::{
  batch::BatchId,
  error::SyncError,
  loom::LoomId,
  transaction::TransactionId,
};

/// Monotonically increasing write counter, scoped to one gateway instance.
/// Every successful write returns the revision it produced; snapshots carry
/// the revision they reflect, which is what lets a caller wait until its own
/// write has echoed back through a subscription.
pub type Revision = u64;

// ─── KvPath ──────────────────────────────────────────────────────────────────

/// A slash-separated location in the tree. The empty path is the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KvPath(String);

impl KvPath {
  pub fn root() -> Self { Self(String::new()) }

  /// Parse a slash-joined string. Empty segments are dropped, so `""` and
  /// `"/"` both mean the root.
  pub fn parse(s: &str) -> Self {
    Self(
      s.split('/')
        .filter(|seg| !seg.is_empty())
        .collect::<Vec<_>>()
        .join("/"),
    )
  }

  pub fn is_root(&self) -> bool { self.0.is_empty() }

  /// One level deeper. `segment` must not contain `/`.
  pub fn child(&self, segment: &str) -> Self {
    debug_assert!(!segment.is_empty() && !segment.contains('/'));
    if self.0.is_empty() {
      Self(segment.to_owned())
    } else {
      Self(format!("{}/{segment}", self.0))
    }
  }

  pub fn segments(&self) -> impl Iterator<Item = &str> {
    self.0.split('/').filter(|s| !s.is_empty())
  }

  pub fn as_str(&self) -> &str { &self.0 }

  // ── Well-known locations ──────────────────────────────────────────────

  pub fn schema_version() -> Self { Self("schema_version".into()) }

  pub fn transactions() -> Self { Self("transactions".into()) }

  pub fn transaction(id: &TransactionId) -> Self {
    Self::transactions().child(id.as_str())
  }

  pub fn loom_configs() -> Self { Self("loom_configs".into()) }

  pub fn loom_config(id: &LoomId) -> Self {
    Self::loom_configs().child(id.as_str())
  }

  pub fn batch_closures() -> Self { Self("batch_closures".into()) }

  pub fn batch_closure(id: &BatchId) -> Self {
    Self::batch_closures().child(id.as_str())
  }
}

impl std::fmt::Display for KvPath {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.0.is_empty() { f.write_str("/") } else { f.write_str(&self.0) }
  }
}

// ─── Writes ──────────────────────────────────────────────────────────────────

/// One write against one path. `Put(Value::Null)` is equivalent to `Delete`;
/// null nodes do not exist in the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum KvWrite {
  Put(Value),
  Delete,
}

/// An ordered collection of writes applied together as a single revision.
/// Entries apply in insertion order; callers should not target a path nested
/// under another entry's path in the same set.
#[derive(Debug, Clone, Default)]
pub struct UpdateSet {
  entries: Vec<(KvPath, KvWrite)>,
}

impl UpdateSet {
  pub fn new() -> Self { Self::default() }

  /// Serialise `value` and stage it at `path`.
  pub fn put<T: Serialize>(
    &mut self,
    path: KvPath,
    value: &T,
  ) -> Result<(), SyncError> {
    let value = serde_json::to_value(value)?;
    self.put_value(path, value);
    Ok(())
  }

  /// Stage an already-encoded value at `path`.
  pub fn put_value(&mut self, path: KvPath, value: Value) {
    self.entries.push((path, KvWrite::Put(value)));
  }

  pub fn delete(&mut self, path: KvPath) {
    self.entries.push((path, KvWrite::Delete));
  }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn entries(&self) -> impl Iterator<Item = (&KvPath, &KvWrite)> {
    self.entries.iter().map(|(p, w)| (p, w))
  }

  pub fn into_entries(self) -> Vec<(KvPath, KvWrite)> { self.entries }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// The value of a watched subtree as of a revision. `Value::Null` means the
/// subtree does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
  pub revision: Revision,
  pub value:    Value,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a synchronised key-value tree backend.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes.
pub trait SyncGateway: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Read the current value at `path`. `Value::Null` if absent.
  fn get<'a>(
    &'a self,
    path: &'a KvPath,
  ) -> impl Future<Output = Result<Value, Self::Error>> + Send + 'a;

  /// Replace the subtree at `path` with `value`.
  fn set<'a>(
    &'a self,
    path: &'a KvPath,
    value: Value,
  ) -> impl Future<Output = Result<Revision, Self::Error>> + Send + 'a;

  /// Remove the subtree at `path`.
  fn remove<'a>(
    &'a self,
    path: &'a KvPath,
  ) -> impl Future<Output = Result<Revision, Self::Error>> + Send + 'a;

  /// Apply every entry in `updates` as one atomic revision: either all of
  /// them become visible together or, on error, none of them do.
  fn atomic_update(
    &self,
    updates: UpdateSet,
  ) -> impl Future<Output = Result<Revision, Self::Error>> + Send + '_;

  /// Watch the subtree at `path`. The receiver is primed with the current
  /// value (replay on subscribe), then updated after every revision. A slow
  /// reader observes the latest state, not every intermediate one.
  fn subscribe<'a>(
    &'a self,
    path: &'a KvPath,
  ) -> impl Future<Output = Result<watch::Receiver<Snapshot>, Self::Error>>
  + Send
  + 'a;
}

// ─── Tree helpers ────────────────────────────────────────────────────────────

const NULL: Value = Value::Null;

/// The value at `path` inside `root`, or `Value::Null` when the path walks
/// off the tree.
pub fn value_at<'v>(root: &'v Value, path: &KvPath) -> &'v Value {
  let mut node = root;
  for segment in path.segments() {
    match node {
      Value::Object(map) => match map.get(segment) {
        Some(child) => node = child,
        None => return &NULL,
      },
      _ => return &NULL,
    }
  }
  node
}

/// Apply one write to an in-memory tree. Missing intermediate nodes are
/// created as objects on put; deletes prune parents left empty so that
/// absent and empty subtrees stay indistinguishable.
pub fn apply_write(root: &mut Value, path: &KvPath, write: &KvWrite) {
  let segments: Vec<&str> = path.segments().collect();
  match write {
    KvWrite::Put(value) if !value.is_null() => {
      put_at(root, &segments, value.clone());
    }
    _ => {
      if segments.is_empty() {
        *root = Value::Null;
      } else {
        prune(root, &segments);
        if root.as_object().is_some_and(serde_json::Map::is_empty) {
          *root = Value::Null;
        }
      }
    }
  }
}

fn put_at(node: &mut Value, segments: &[&str], value: Value) {
  let [head, rest @ ..] = segments else {
    *node = value;
    return;
  };
  if !node.is_object() {
    *node = Value::Object(serde_json::Map::new());
  }
  if let Value::Object(map) = node {
    let child = map.entry((*head).to_owned()).or_insert(Value::Null);
    put_at(child, rest, value);
  }
}

/// Remove `segments` under `node`, dropping intermediate objects emptied by
/// the removal.
fn prune(node: &mut Value, segments: &[&str]) {
  let Value::Object(map) = node else { return };
  let [head, rest @ ..] = segments else { return };
  if rest.is_empty() {
    map.remove(*head);
    return;
  }
  if let Some(child) = map.get_mut(*head) {
    prune(child, rest);
    if child.as_object().is_some_and(serde_json::Map::is_empty) {
      map.remove(*head);
    }
  }
}

// ─── Watchers ────────────────────────────────────────────────────────────────

/// Registry of live subscriptions over one tree. Backends embed this inside
/// the same lock that guards their tree and revision counter, so snapshots
/// always go out in revision order.
#[derive(Debug, Default)]
pub struct Watchers {
  entries: Vec<(KvPath, watch::Sender<Snapshot>)>,
}

impl Watchers {
  pub fn new() -> Self { Self::default() }

  /// Open a subscription primed with the current value at `path`.
  pub fn subscribe(
    &mut self,
    path: &KvPath,
    root: &Value,
    revision: Revision,
  ) -> watch::Receiver<Snapshot> {
    let snapshot = Snapshot {
      revision,
      value: value_at(root, path).clone(),
    };
    let (tx, rx) = watch::channel(snapshot);
    self.entries.push((path.clone(), tx));
    rx
  }

  /// Push the post-revision state to every live subscription, dropping the
  /// ones whose receivers have all gone away.
  pub fn notify(&mut self, root: &Value, revision: Revision) {
    self.entries.retain(|(path, tx)| {
      let snapshot = Snapshot {
        revision,
        value: value_at(root, path).clone(),
      };
      tx.send(snapshot).is_ok()
    });
  }
}

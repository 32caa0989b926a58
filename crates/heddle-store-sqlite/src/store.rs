//! [`SqliteGateway`] — the SQLite implementation of [`SyncGateway`].

use std::{collections::BTreeSet, path::Path, sync::Arc};

use heddle_core::gateway::{
  KvPath, KvWrite, Revision, Snapshot, SyncGateway, UpdateSet, Watchers,
  apply_write, value_at,
};
use serde_json::Value;
use tokio::sync::{Mutex, watch};

use crate::{Result, schema::SCHEMA};

// ─── Gateway ─────────────────────────────────────────────────────────────────

/// A sync gateway backed by a single SQLite file.
///
/// Cloning is cheap — the connection and the in-memory mirror are
/// reference-counted, so every clone observes the same revisions.
#[derive(Clone)]
pub struct SqliteGateway {
  conn:   tokio_rusqlite::Connection,
  shared: Arc<Mutex<Shared>>,
}

/// Mirror state lives behind one lock so writes, revision stamps, and
/// watcher notifications always agree on ordering. The lock is held across
/// the database commit; writers queue rather than interleave.
#[derive(Default)]
struct Shared {
  root:     Value,
  revision: Revision,
  watchers: Watchers,
}

impl SqliteGateway {
  /// Open (or create) a gateway at `path` and load the stored tree.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn).await
  }

  /// Open an in-memory gateway — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn).await
  }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    let rows: Vec<(String, String)> = conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        let mut stmt = conn.prepare("SELECT path, value FROM kv")?;
        let rows = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(rows)
      })
      .await?;

    // Rows are disjoint record-granularity paths; folding them in any
    // order reassembles the tree.
    let mut root = Value::Null;
    for (path, text) in rows {
      let value: Value = serde_json::from_str(&text)?;
      apply_write(&mut root, &KvPath::parse(&path), &KvWrite::Put(value));
    }

    Ok(Self {
      conn,
      shared: Arc::new(Mutex::new(Shared { root, ..Shared::default() })),
    })
  }
}

// ─── Row planning ────────────────────────────────────────────────────────────

/// The SQL side of one atomic update: which top-level keys to clear and the
/// canonical rows to write back for them.
struct WritePlan {
  wipe_all: bool,
  deletes:  Vec<String>,
  inserts:  Vec<(String, String)>,
}

/// The canonical rows for one top-level key of the tree: one row per child
/// for collections, one scalar row otherwise, none for an absent subtree.
fn rows_for_key(key: &str, value: &Value) -> Vec<(String, String)> {
  match value {
    Value::Null => Vec::new(),
    Value::Object(map) => map
      .iter()
      .map(|(name, child)| (format!("{key}/{name}"), child.to_string()))
      .collect(),
    scalar => vec![(key.to_owned(), scalar.to_string())],
  }
}

/// Derive the row changes that bring the table to `staged`. Only the
/// top-level keys the update touched are rewritten; a root-path write
/// rebuilds everything.
fn plan_writes(staged: &Value, updates: &UpdateSet) -> WritePlan {
  let mut wipe_all = false;
  let mut touched: BTreeSet<String> = BTreeSet::new();
  for (path, _) in updates.entries() {
    match path.segments().next() {
      Some(first) => {
        touched.insert(first.to_owned());
      }
      None => wipe_all = true,
    }
  }

  let mut inserts = Vec::new();
  if wipe_all {
    if let Value::Object(map) = staged {
      for (key, value) in map {
        inserts.extend(rows_for_key(key, value));
      }
    }
    return WritePlan { wipe_all, deletes: Vec::new(), inserts };
  }

  for key in &touched {
    let value = staged.get(key).unwrap_or(&Value::Null);
    inserts.extend(rows_for_key(key, value));
  }
  WritePlan {
    wipe_all: false,
    deletes: touched.into_iter().collect(),
    inserts,
  }
}

// ─── Trait implementation ────────────────────────────────────────────────────

impl SyncGateway for SqliteGateway {
  type Error = crate::Error;

  async fn get(&self, path: &KvPath) -> Result<Value> {
    let shared = self.shared.lock().await;
    Ok(value_at(&shared.root, path).clone())
  }

  async fn set(&self, path: &KvPath, value: Value) -> Result<Revision> {
    let mut updates = UpdateSet::new();
    updates.put_value(path.clone(), value);
    self.atomic_update(updates).await
  }

  async fn remove(&self, path: &KvPath) -> Result<Revision> {
    let mut updates = UpdateSet::new();
    updates.delete(path.clone());
    self.atomic_update(updates).await
  }

  async fn atomic_update(&self, updates: UpdateSet) -> Result<Revision> {
    let mut shared = self.shared.lock().await;

    // Stage the post-update tree; the live mirror is untouched until the
    // database commit has succeeded.
    let mut staged = shared.root.clone();
    for (path, write) in updates.entries() {
      apply_write(&mut staged, path, write);
    }

    let plan = plan_writes(&staged, &updates);
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if plan.wipe_all {
          tx.execute("DELETE FROM kv", [])?;
        }
        for key in &plan.deletes {
          tx.execute(
            "DELETE FROM kv WHERE path = ?1 OR path LIKE ?1 || '/%'",
            rusqlite::params![key],
          )?;
        }
        for (path, value) in &plan.inserts {
          tx.execute(
            "INSERT OR REPLACE INTO kv (path, value) VALUES (?1, ?2)",
            rusqlite::params![path, value],
          )?;
        }
        tx.commit()?;
        Ok(())
      })
      .await?;

    shared.root = staged;
    shared.revision += 1;
    let revision = shared.revision;
    let Shared { root, watchers, .. } = &mut *shared;
    watchers.notify(root, revision);
    Ok(revision)
  }

  async fn subscribe(
    &self,
    path: &KvPath,
  ) -> Result<watch::Receiver<Snapshot>> {
    let mut shared = self.shared.lock().await;
    let Shared { root, revision, watchers } = &mut *shared;
    Ok(watchers.subscribe(path, root, *revision))
  }
}

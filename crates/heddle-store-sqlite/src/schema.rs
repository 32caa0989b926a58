//! SQL schema for the SQLite gateway.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
///
/// One row per record-granularity path: `transactions/{id}`,
/// `loom_configs/{id}`, `batch_closures/{id}`, and scalar roots such as
/// `schema_version`. Values are JSON text. Writes at other depths are
/// normalised to these rows before they land.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS kv (
    path  TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

PRAGMA user_version = 1;
";

//! `heddle` — command line for the Heddle loom tracker.
//!
//! # Usage
//!
//! ```text
//! heddle status
//! heddle status 1
//! heddle submit 1 12.5 --cone 4 --note "morning delivery"
//! heddle close 1
//! heddle export backup.json
//! ```
//!
//! The dataset lives in one SQLite file, located by `--store-path`, the
//! `HEDDLE_STORE_PATH` environment variable, or `store_path` in the config
//! file, in that order. `--ephemeral` swaps in a throwaway in-memory store,
//! handy for trying commands out without touching real data.

mod commands;
mod render;

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use heddle_core::{gateway::SyncGateway, transaction::Material};
use heddle_engine::{BatchEngine, EntityStore};
use heddle_store_memory::MemoryGateway;
use heddle_store_sqlite::SqliteGateway;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "heddle", version, about = "Batch lifecycle tracker for handloom production")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "heddle.toml")]
  config: PathBuf,

  /// SQLite database path; overrides the config file.
  #[arg(long, value_name = "FILE")]
  store_path: Option<PathBuf>,

  /// Use a throwaway in-memory store instead of SQLite.
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
  /// Show every loom, or one loom's full report.
  Status {
    /// Loom to report on; all looms when omitted.
    loom: Option<String>,
  },

  /// Record finished warps against a loom's active batch.
  Submit {
    loom:  String,
    /// Warps produced.
    units: Decimal,

    /// Cone yarn received during the same visit.
    #[arg(long, value_name = "QTY")]
    cone: Option<Decimal>,

    /// Jarigai thread received during the same visit.
    #[arg(long, value_name = "QTY")]
    jarigai: Option<Decimal>,

    /// Free-text note attached to every entry this records.
    #[arg(long)]
    note: Option<String>,
  },

  /// Record raw material received into a loom's active batch.
  Receive {
    loom:     String,
    material: RawMaterial,
    quantity: Decimal,

    #[arg(long)]
    note: Option<String>,
  },

  /// Record raw material sent back out of a loom's active batch.
  Return {
    loom:     String,
    material: RawMaterial,
    quantity: Decimal,

    #[arg(long)]
    note: Option<String>,
  },

  /// Close the active batch where it stands and open the next one.
  Close { loom: String },

  /// Show or change a loom's batch target and consumption factors.
  Settings {
    loom: String,

    /// New batch completion target, in warps.
    #[arg(long, value_name = "UNITS")]
    target: Option<Decimal>,

    /// Cone yarn consumed per warp.
    #[arg(long, value_name = "FACTOR")]
    cone_factor: Option<Decimal>,

    /// Jarigai thread consumed per warp.
    #[arg(long, value_name = "FACTOR")]
    jarigai_factor: Option<Decimal>,
  },

  /// Write the whole dataset as JSON.
  Export {
    /// Destination file; stdout when omitted.
    file: Option<PathBuf>,
  },

  /// Replace the whole dataset from a JSON export.
  Import {
    file: PathBuf,

    /// Skip the confirmation prompt.
    #[arg(long)]
    yes: bool,
  },

  /// Delete a loom's archived transactions and closure records.
  Purge {
    loom: String,

    /// Skip the confirmation prompt.
    #[arg(long)]
    yes: bool,
  },

  /// Wipe the store and reseed the default looms.
  Reset {
    /// Seed looms with no stock instead of the customary openings.
    #[arg(long)]
    zeroed: bool,

    /// Skip the confirmation prompt.
    #[arg(long)]
    yes: bool,
  },
}

/// Raw materials a movement can name. The produced unit (warp) is counted
/// through `submit`, never received or returned.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum RawMaterial {
  Cone,
  Jarigai,
}

impl From<RawMaterial> for Material {
  fn from(material: RawMaterial) -> Self {
    match material {
      RawMaterial::Cone => Material::Cone,
      RawMaterial::Jarigai => Material::Jarigai,
    }
  }
}

// ─── Config file ──────────────────────────────────────────────────────────────

/// Shape of the optional TOML config file; `HEDDLE_`-prefixed environment
/// variables override it.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct CliConfig {
  store_path: PathBuf,
}

impl Default for CliConfig {
  fn default() -> Self {
    Self { store_path: PathBuf::from("~/.local/share/heddle/heddle.db") }
  }
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config.clone()).required(false))
    .add_source(config::Environment::with_prefix("HEDDLE"))
    .build()
    .context("failed to read configuration")?;
  let file_cfg: CliConfig = settings
    .try_deserialize()
    .context("failed to deserialise configuration")?;

  if cli.ephemeral {
    let gateway = Arc::new(MemoryGateway::new());
    return run(gateway, cli.command).await;
  }

  let store_path =
    expand_tilde(&cli.store_path.unwrap_or(file_cfg.store_path));
  if let Some(parent) = store_path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {parent:?}"))?;
  }
  let gateway = SqliteGateway::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;
  run(Arc::new(gateway), cli.command).await
}

async fn run<G: SyncGateway + 'static>(
  gateway: Arc<G>,
  command: Command,
) -> anyhow::Result<()> {
  let store = Arc::new(EntityStore::open(gateway));
  let engine = BatchEngine::new(store);
  commands::dispatch(&engine, command).await
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

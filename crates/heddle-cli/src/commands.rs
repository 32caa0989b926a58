//! Subcommand handlers. Each one drives the engine and prints through
//! [`crate::render`]; destructive commands confirm on stdin first unless
//! `--yes` was passed.

use std::path::PathBuf;

use anyhow::Context as _;
use heddle_core::{
  dataset::SeedProfile,
  gateway::SyncGateway,
  loom::{ConsumptionFactors, LoomId, LoomSettings},
  transaction::Material,
};
use heddle_engine::{
  BatchEngine, MaterialMovement, MovementKind, ProductionRequest,
  SubmitOutcome,
};
use rust_decimal::Decimal;

use crate::{Command, render};

pub async fn dispatch<G: SyncGateway>(
  engine: &BatchEngine<G>,
  command: Command,
) -> anyhow::Result<()> {
  match command {
    Command::Status { loom } => status(engine, loom).await,
    Command::Submit { loom, units, cone, jarigai, note } => {
      submit(engine, loom, units, cone, jarigai, note).await
    }
    Command::Receive { loom, material, quantity, note } => {
      movement(engine, MovementKind::Receipt, loom, material.into(), quantity, note)
        .await
    }
    Command::Return { loom, material, quantity, note } => {
      movement(engine, MovementKind::Return, loom, material.into(), quantity, note)
        .await
    }
    Command::Close { loom } => close(engine, loom).await,
    Command::Settings { loom, target, cone_factor, jarigai_factor } => {
      settings(engine, loom, target, cone_factor, jarigai_factor).await
    }
    Command::Export { file } => export(engine, file).await,
    Command::Import { file, yes } => import(engine, file, yes).await,
    Command::Purge { loom, yes } => purge(engine, loom, yes).await,
    Command::Reset { zeroed, yes } => reset(engine, zeroed, yes).await,
  }
}

async fn status<G: SyncGateway>(
  engine: &BatchEngine<G>,
  loom: Option<String>,
) -> anyhow::Result<()> {
  match loom {
    Some(loom) => {
      let loom_id = LoomId::new(loom);
      let report = engine.loom_report(&loom_id).await?;
      println!("loom {loom_id}");
      render::report(&report);
    }
    None => {
      for loom_id in engine.looms().await? {
        let report = engine.loom_report(&loom_id).await?;
        render::summary_line(&report);
      }
    }
  }
  Ok(())
}

async fn submit<G: SyncGateway>(
  engine: &BatchEngine<G>,
  loom: String,
  units: Decimal,
  cone: Option<Decimal>,
  jarigai: Option<Decimal>,
  note: Option<String>,
) -> anyhow::Result<()> {
  let loom_id = LoomId::new(loom);
  let mut request = ProductionRequest::new(units);
  if let Some(quantity) = cone {
    request
      .receipts
      .push(MaterialMovement { material: Material::Cone, quantity });
  }
  if let Some(quantity) = jarigai {
    request
      .receipts
      .push(MaterialMovement { material: Material::Jarigai, quantity });
  }
  request.note = note;

  match engine.submit_production(&loom_id, request).await? {
    SubmitOutcome::Recorded { produced, batch_full, .. } => {
      println!("Recorded {units} warps on loom {loom_id}; batch now at {produced}.");
      if batch_full {
        println!("The batch has reached its target; close it to start the next one.");
      }
    }
    SubmitOutcome::Split(summary) => {
      println!("Recorded {units} warps on loom {loom_id}.");
      render::split(&summary);
    }
  }
  Ok(())
}

async fn movement<G: SyncGateway>(
  engine: &BatchEngine<G>,
  kind: MovementKind,
  loom: String,
  material: Material,
  quantity: Decimal,
  note: Option<String>,
) -> anyhow::Result<()> {
  let loom_id = LoomId::new(loom);
  let movement = MaterialMovement { material, quantity };
  engine.record_movement(&loom_id, kind, movement, note).await?;
  match kind {
    MovementKind::Receipt => {
      println!("Received {quantity} {material} into loom {loom_id}'s active batch.");
    }
    MovementKind::Return => {
      println!("Returned {quantity} {material} from loom {loom_id}'s active batch.");
    }
  }
  Ok(())
}

async fn close<G: SyncGateway>(
  engine: &BatchEngine<G>,
  loom: String,
) -> anyhow::Result<()> {
  let loom_id = LoomId::new(loom);
  let summary = engine.close_batch(&loom_id).await?;
  println!("loom {loom_id}:");
  render::split(&summary);
  Ok(())
}

async fn settings<G: SyncGateway>(
  engine: &BatchEngine<G>,
  loom: String,
  target: Option<Decimal>,
  cone_factor: Option<Decimal>,
  jarigai_factor: Option<Decimal>,
) -> anyhow::Result<()> {
  let loom_id = LoomId::new(loom);
  let report = engine.loom_report(&loom_id).await?;
  let current = &report.current;

  if target.is_none() && cone_factor.is_none() && jarigai_factor.is_none() {
    println!(
      "loom {loom_id}: target {} warps, factors cone {} / jarigai {}",
      current.target_units, current.factors.cone, current.factors.jarigai
    );
    return Ok(());
  }

  let settings = LoomSettings {
    target_units: target.unwrap_or(current.target_units),
    factors:      ConsumptionFactors::new(
      cone_factor.unwrap_or(current.factors.cone),
      jarigai_factor.unwrap_or(current.factors.jarigai),
    )?,
  };
  let config = engine.update_settings(&loom_id, settings).await?;
  println!(
    "loom {}: target {} warps, factors cone {} / jarigai {}",
    config.id, config.target_units, config.factors.cone, config.factors.jarigai
  );
  Ok(())
}

async fn export<G: SyncGateway>(
  engine: &BatchEngine<G>,
  file: Option<PathBuf>,
) -> anyhow::Result<()> {
  let data = engine.export_dataset().await?;
  let text = serde_json::to_string_pretty(&data.to_value()?)?;
  match file {
    Some(path) => {
      std::fs::write(&path, text)
        .with_context(|| format!("failed to write {path:?}"))?;
      println!(
        "Exported {} transactions across {} looms to {}.",
        data.transactions.len(),
        data.loom_configs.len(),
        path.display()
      );
    }
    None => println!("{text}"),
  }
  Ok(())
}

async fn import<G: SyncGateway>(
  engine: &BatchEngine<G>,
  file: PathBuf,
  yes: bool,
) -> anyhow::Result<()> {
  let raw = std::fs::read_to_string(&file)
    .with_context(|| format!("failed to read {file:?}"))?;
  let document: serde_json::Value =
    serde_json::from_str(&raw).context("import file is not valid JSON")?;
  if !yes && !confirm("This replaces every record in the store. Continue?")? {
    println!("Cancelled.");
    return Ok(());
  }
  let data = engine.import_dataset(&document).await?;
  println!(
    "Imported {} transactions across {} looms.",
    data.transactions.len(),
    data.loom_configs.len()
  );
  Ok(())
}

async fn purge<G: SyncGateway>(
  engine: &BatchEngine<G>,
  loom: String,
  yes: bool,
) -> anyhow::Result<()> {
  let loom_id = LoomId::new(loom);
  if !yes
    && !confirm(&format!(
      "This permanently deletes loom {loom_id}'s archived history. Continue?"
    ))?
  {
    println!("Cancelled.");
    return Ok(());
  }
  let removed = engine.purge_archived(&loom_id).await?;
  println!("Removed {removed} archived transactions from loom {loom_id}.");
  Ok(())
}

async fn reset<G: SyncGateway>(
  engine: &BatchEngine<G>,
  zeroed: bool,
  yes: bool,
) -> anyhow::Result<()> {
  if !yes
    && !confirm("This wipes the store and reseeds the default looms. Continue?")?
  {
    println!("Cancelled.");
    return Ok(());
  }
  let profile = if zeroed { SeedProfile::Zeroed } else { SeedProfile::Stocked };
  let data = engine.reset(profile).await?;
  println!("Store reset; {} looms provisioned.", data.loom_configs.len());
  Ok(())
}

/// Ask a yes/no question on stdin. Anything but an explicit yes is a no.
fn confirm(prompt: &str) -> anyhow::Result<bool> {
  use std::io::{self, BufRead, Write};
  print!("{prompt} [y/N] ");
  io::stdout().flush().ok();
  let mut line = String::new();
  io::stdin().lock().read_line(&mut line)?;
  Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

//! Plain-text rendering of reports and lifecycle outcomes.

use heddle_engine::{BatchStatus, BatchView, LoomReport, SplitSummary};

/// One loom's full report: the active batch, then recently closed ones.
pub fn report(report: &LoomReport) {
  batch(&report.current);
  for view in &report.completed {
    println!();
    batch(view);
  }
}

/// One line per loom for the overview listing.
pub fn summary_line(report: &LoomReport) {
  let current = &report.current;
  let seq = match current.sequence {
    Some(n) => format!("#{n}"),
    None => "-".to_owned(),
  };
  println!(
    "loom {:<4} batch {:<5} produced {:>9} of {:<7} cone {:>10}  jarigai {:>10}",
    report.loom_id.to_string(),
    seq,
    current.balances.produced,
    current.target_units.to_string(),
    current.balances.cone.closing,
    current.balances.jarigai.closing,
  );
}

fn batch(view: &BatchView) {
  let label = match view.sequence {
    Some(n) => format!("batch #{n}"),
    None => format!("batch {}", view.batch_id),
  };
  match view.status {
    BatchStatus::Current => {
      println!("{label} (current)");
      println!(
        "  produced {} of {} ({} remaining)",
        view.balances.produced, view.target_units, view.remaining
      );
    }
    BatchStatus::Completed => {
      match view.closed_at {
        Some(at) => {
          println!("{label} (closed {})", at.format("%Y-%m-%d %H:%M UTC"));
        }
        None => println!("{label} (closed)"),
      }
      println!("  produced {} of {}", view.balances.produced, view.target_units);
    }
  }
  if view.factors_assumed {
    println!("  (no closure record; figures use the loom's current factors)");
  }
  println!(
    "  {:<10}{:>10}{:>10}{:>10}{:>10}{:>10}",
    "material", "opening", "received", "consumed", "returned", "closing"
  );
  for balance in [&view.balances.cone, &view.balances.jarigai] {
    println!(
      "  {:<10}{:>10}{:>10}{:>10}{:>10}{:>10}",
      balance.material.to_string(),
      balance.opening,
      balance.received,
      balance.consumed,
      balance.returned,
      balance.closing,
    );
  }
}

/// What a split did: the closed batch, the new one, and what moved between
/// them.
pub fn split(summary: &SplitSummary) {
  println!(
    "Closed batch #{}; opened batch #{}.",
    summary.sequence - 1,
    summary.sequence
  );
  if !summary.filler_units.is_zero() {
    println!(
      "  filler recorded into the closed batch: {}",
      summary.filler_units
    );
  }
  if !summary.excess_units.is_zero() {
    println!(
      "  overflow recorded into batch #{}: {}",
      summary.sequence, summary.excess_units
    );
  }
  if summary.carried.is_empty() {
    println!("  nothing carried forward");
  } else {
    let carried: Vec<String> = summary
      .carried
      .iter()
      .map(|m| format!("{} {}", m.material, m.quantity))
      .collect();
    println!("  carried into batch #{}: {}", summary.sequence, carried.join(", "));
  }
}

//! Balance calculator.
//!
//! Pure arithmetic over a batch's transactions: no storage, no I/O. The
//! closing balance of each raw material is
//!
//! ```text
//! closing = opening + received − consumed − returned
//! consumed = produced × factor
//! ```
//!
//! All quantities are [`Decimal`]s rounded to three places, half away from
//! zero. Rounding is applied once per computed figure (the consumed total,
//! each summed column, the closing result), never per addend, so a column of
//! raw entries sums exactly before the single final rounding.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::{
  loom::ConsumptionFactors,
  transaction::{Material, Transaction, TransactionKind},
};

/// Decimal places carried by every reported quantity.
pub const QUANTITY_DP: u32 = 3;

/// Magnitude below which a closing balance is treated as dust and not
/// carried forward into the next batch: 0.001.
pub const CARRY_THRESHOLD: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

/// Round to reporting precision, half away from zero.
pub fn round_qty(value: Decimal) -> Decimal {
  value.round_dp_with_strategy(QUANTITY_DP, RoundingStrategy::MidpointAwayFromZero)
}

// ─── MaterialBalance ─────────────────────────────────────────────────────────

/// One raw material's movement through a batch, every figure rounded to
/// reporting precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialBalance {
  pub material: Material,
  pub opening:  Decimal,
  pub received: Decimal,
  pub consumed: Decimal,
  pub returned: Decimal,
  pub closing:  Decimal,
}

impl MaterialBalance {
  /// Whether the closing balance is large enough to carry into the next
  /// batch. Sign is irrelevant; a shortage carries just like a surplus.
  pub fn carries_forward(&self) -> bool { self.closing.abs() >= CARRY_THRESHOLD }
}

// ─── BatchBalances ───────────────────────────────────────────────────────────

/// The computed position of one batch: warps produced plus a closing
/// balance per raw material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchBalances {
  pub produced: Decimal,
  pub cone:     MaterialBalance,
  pub jarigai:  MaterialBalance,
}

impl BatchBalances {
  /// Compute from the batch's transactions. Entries for other batches are
  /// the caller's filtering problem; everything passed in is summed.
  pub fn compute(
    transactions: impl IntoIterator<Item = impl std::borrow::Borrow<Transaction>>,
    factors: &ConsumptionFactors,
  ) -> Self {
    let mut produced = Decimal::ZERO;
    let mut opening = [Decimal::ZERO; 2];
    let mut received = [Decimal::ZERO; 2];
    let mut returned = [Decimal::ZERO; 2];

    for tx in transactions {
      let tx = tx.borrow();
      match tx.kind {
        TransactionKind::Production => produced += tx.quantity,
        _ => {
          let slot = match tx.material {
            Material::Cone => 0,
            Material::Jarigai => 1,
            Material::Warp => continue,
          };
          match tx.kind {
            TransactionKind::Receipt => received[slot] += tx.quantity,
            TransactionKind::Return => returned[slot] += tx.quantity,
            TransactionKind::Opening => opening[slot] += tx.quantity,
            TransactionKind::Production => unreachable!(),
          }
        }
      }
    }

    produced = round_qty(produced);

    let balance = |slot: usize, material: Material, factor: Decimal| {
      let opening = round_qty(opening[slot]);
      let received = round_qty(received[slot]);
      let returned = round_qty(returned[slot]);
      let consumed = round_qty(produced * factor);
      let closing = round_qty(opening + received - consumed - returned);
      MaterialBalance { material, opening, received, consumed, returned, closing }
    };

    BatchBalances {
      produced,
      cone: balance(0, Material::Cone, factors.cone),
      jarigai: balance(1, Material::Jarigai, factors.jarigai),
    }
  }

  /// Closing balances that clear the carry threshold, in reporting order.
  pub fn carryable(&self) -> impl Iterator<Item = &MaterialBalance> {
    [&self.cone, &self.jarigai]
      .into_iter()
      .filter(|b| b.carries_forward())
  }
}

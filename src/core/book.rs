//! Position Book
//!
//! Net position and average entry price per instrument, owned by the engine
//! and persisted with the rest of the state. Quantities are notional in
//! equity units (the same units the risk caps use), so realized P&L is the
//! closed quantity times the fractional price move:
//!
//!   pnl = closed × (fill - avg) / avg × sign(position)
//!
//! and lands in the same units as `RiskConfig::equity` and the stops.
//! Fills without a price move the quantity only and book nothing.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Signed net quantity
    pub quantity: Decimal,
    /// Zero when the position was opened without a price
    pub avg_price: Decimal,
}

impl Position {
    /// Apply a signed fill and return the realized P&L in equity units
    pub fn apply(&mut self, qty: Decimal, price: Option<Decimal>) -> Decimal {
        let same_side =
            self.quantity.is_zero() || self.quantity.is_sign_positive() == qty.is_sign_positive();

        if same_side {
            let total = self.quantity + qty;
            if let Some(price) = price {
                if self.avg_price.is_zero() || self.quantity.is_zero() {
                    self.avg_price = price;
                } else if !total.is_zero() {
                    let cost = self.avg_price * self.quantity.abs() + price * qty.abs();
                    self.avg_price = cost / total.abs();
                }
            }
            self.quantity = total;
            return Decimal::ZERO;
        }

        let closed = qty.abs().min(self.quantity.abs());
        let sign = if self.quantity.is_sign_positive() { Decimal::ONE } else { -Decimal::ONE };
        let pnl = match price {
            Some(price) if !self.avg_price.is_zero() => {
                (price - self.avg_price) * closed / self.avg_price * sign
            }
            _ => Decimal::ZERO,
        };

        self.quantity += qty;
        if self.quantity.is_zero() {
            self.avg_price = Decimal::ZERO;
        } else if self.quantity.is_sign_positive() != sign.is_sign_positive() {
            // Flipped through zero: the remainder opens at the fill price
            self.avg_price = price.unwrap_or(Decimal::ZERO);
        }
        pnl
    }
}

/// Positions keyed by instrument; flat instruments have no entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionBook {
    positions: BTreeMap<String, Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instrument: &str) -> Option<&Position> {
        self.positions.get(instrument)
    }

    pub fn quantity(&self, instrument: &str) -> Decimal {
        self.get(instrument).map(|p| p.quantity).unwrap_or(Decimal::ZERO)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Book a signed fill; returns realized P&L in equity units
    pub fn apply(&mut self, instrument: &str, qty: Decimal, price: Option<Decimal>) -> Decimal {
        let pos = self.positions.entry(instrument.to_string()).or_default();
        let pnl = pos.apply(qty, price);
        if pos.quantity.is_zero() {
            self.positions.remove(instrument);
        }
        pnl
    }
}

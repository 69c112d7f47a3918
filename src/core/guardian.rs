//! Risk Guardian Module
//!
//! Admission control. Every proposed order is checked against the
//! post-trade hypothetical state before it reaches the gateway:
//! - day P&L and intraday P&L against their stops
//! - per-instrument and gross exposure caps
//! - free equity against the solvency buffer
//!
//! `record_fill` books a confirmed fill. `reserve` books an order the venue
//! acknowledged without reporting a fill: it counts toward exposure from
//! then on, because the venue may fill it at any time.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Risk limits, as fractions of equity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub equity: Decimal,
    /// Reject once day P&L <= daily_stop × equity (e.g. -0.02)
    pub daily_stop: Decimal,
    /// Reject once intraday P&L <= intraday_stop × equity
    pub intraday_stop: Decimal,
    pub max_instrument_exposure: Decimal,
    pub max_gross_exposure: Decimal,
    /// Minimum free equity left after the trade
    pub solvency_buffer: Decimal,
    /// Length of an intraday session in hours
    pub intraday_session_hours: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            equity: dec!(1.0),
            daily_stop: dec!(-0.02),
            intraday_stop: dec!(-0.03),
            max_instrument_exposure: dec!(1.0),
            max_gross_exposure: dec!(1.5),
            solvency_buffer: dec!(0.1),
            intraday_session_hours: 8,
        }
    }
}

/// Counters and exposures owned by the guardian
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub day_pnl: Decimal,
    pub intraday_pnl: Decimal,
    /// Signed filled exposure per instrument
    pub exposures: BTreeMap<String, Decimal>,
    /// Signed quantity of acknowledged orders with no reported fill
    #[serde(default)]
    pub pending: BTreeMap<String, Decimal>,
}

/// Why an order was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskRejection {
    #[error("daily stop hit: day pnl {pnl} <= {limit}")]
    DailyStop { pnl: Decimal, limit: Decimal },
    #[error("intraday stop hit: intraday pnl {pnl} <= {limit}")]
    IntradayStop { pnl: Decimal, limit: Decimal },
    #[error("{instrument} exposure {exposure} would exceed cap {cap}")]
    InstrumentCap { instrument: String, exposure: Decimal, cap: Decimal },
    #[error("gross exposure {gross} would exceed cap {cap}")]
    GrossCap { gross: Decimal, cap: Decimal },
    #[error("free equity {free} would fall below buffer {buffer}")]
    Solvency { free: Decimal, buffer: Decimal },
}

/// Risk Guardian - single writer of RiskState
#[derive(Debug, Clone)]
pub struct RiskEngine {
    config: RiskConfig,
    state: RiskState,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config, state: RiskState::default() }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    fn filled(&self, instrument: &str) -> Decimal {
        self.state.exposures.get(instrument).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn pending(&self, instrument: &str) -> Decimal {
        self.state.pending.get(instrument).copied().unwrap_or(Decimal::ZERO)
    }

    /// Filled plus pending signed exposure
    pub fn exposure(&self, instrument: &str) -> Decimal {
        self.filled(instrument) + self.pending(instrument)
    }

    pub fn gross_exposure(&self) -> Decimal {
        let mut instruments: Vec<&String> =
            self.state.exposures.keys().chain(self.state.pending.keys()).collect();
        instruments.sort();
        instruments.dedup();
        instruments.into_iter().map(|i| self.exposure(i).abs()).sum()
    }

    /// Admission check against the post-trade state
    ///
    /// `qty` is signed: positive adds long exposure, negative short.
    pub fn check(&self, instrument: &str, qty: Decimal) -> Result<(), RiskRejection> {
        let cfg = &self.config;
        let s = &self.state;

        let limit = cfg.daily_stop * cfg.equity;
        if s.day_pnl <= limit {
            return Err(RiskRejection::DailyStop { pnl: s.day_pnl, limit });
        }

        let limit = cfg.intraday_stop * cfg.equity;
        if s.intraday_pnl <= limit {
            return Err(RiskRejection::IntradayStop { pnl: s.intraday_pnl, limit });
        }

        let current = self.exposure(instrument);
        let after = current + qty;
        let cap = cfg.max_instrument_exposure * cfg.equity;
        if after.abs() > cap {
            return Err(RiskRejection::InstrumentCap {
                instrument: instrument.to_string(),
                exposure: after,
                cap,
            });
        }

        let gross = self.gross_exposure() - current.abs() + after.abs();
        let cap = cfg.max_gross_exposure * cfg.equity;
        if gross > cap {
            return Err(RiskRejection::GrossCap { gross, cap });
        }

        let free = cfg.equity + s.day_pnl - gross;
        let buffer = cfg.solvency_buffer * cfg.equity;
        if free < buffer {
            return Err(RiskRejection::Solvency { free, buffer });
        }

        Ok(())
    }

    pub fn allows_trade(&self, instrument: &str, qty: Decimal) -> bool {
        self.check(instrument, qty).is_ok()
    }

    /// Book a confirmed fill
    pub fn record_fill(&mut self, instrument: &str, qty: Decimal, pnl: Decimal) {
        let exposure = self.filled(instrument) + qty;
        set_or_remove(&mut self.state.exposures, instrument, exposure);
        self.state.day_pnl += pnl;
        self.state.intraday_pnl += pnl;

        debug!(
            instrument,
            %qty,
            %pnl,
            %exposure,
            day_pnl = %self.state.day_pnl,
            "fill recorded"
        );
    }

    /// Hold exposure for an order acknowledged without a fill
    pub fn reserve(&mut self, instrument: &str, qty: Decimal) {
        let pending = self.pending(instrument) + qty;
        set_or_remove(&mut self.state.pending, instrument, pending);
        info!(instrument, %qty, %pending, "pending order reserved against exposure");
    }

    /// UTC day roll: both counters restart
    pub fn start_new_day(&mut self) {
        info!(day_pnl = %self.state.day_pnl, "new trading day, pnl counters reset");
        self.state.day_pnl = Decimal::ZERO;
        self.state.intraday_pnl = Decimal::ZERO;
    }

    /// Session boundary: intraday counter restarts
    pub fn reset_intraday(&mut self) {
        debug!(intraday_pnl = %self.state.intraday_pnl, "intraday pnl reset");
        self.state.intraday_pnl = Decimal::ZERO;
    }

    pub fn restore(&mut self, state: RiskState) {
        self.state = state;
    }

    /// One-line summary for logs
    pub fn status(&self) -> String {
        format!(
            "Day P&L: {} | Intraday P&L: {} | Gross: {} | Instruments: {} | Pending: {}",
            self.state.day_pnl,
            self.state.intraday_pnl,
            self.gross_exposure(),
            self.state.exposures.len(),
            self.state.pending.len(),
        )
    }
}

fn set_or_remove(map: &mut BTreeMap<String, Decimal>, instrument: &str, value: Decimal) {
    if value.is_zero() {
        map.remove(instrument);
    } else {
        map.insert(instrument.to_string(), value);
    }
}

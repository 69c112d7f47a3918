//! Broker Module
//!
//! Execution gateway abstraction.
//! - simulated: in-memory fills for backtest and paper modes
//! - rest: JSON order endpoint for live mode

pub mod rest;
pub mod simulated;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{ExecutionConfig, GatewayKind, Mode};
use crate::core::types::Direction;

pub use rest::RestGateway;
pub use simulated::SimulatedGateway;

/// Gateway trait - every execution venue implements this
///
/// An `Err` means the order may not have reached the venue (transport or
/// auth failure). A venue-side refusal comes back as `Ok` with a
/// non-filled status.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult>;
}

/// Order request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub instrument: String,
    pub side: Direction,
    /// Unsigned size; the side carries the sign
    pub quantity: Decimal,
    /// Limit price, None for market orders
    pub price: Option<Decimal>,
    pub strategy_id: String,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub valid_for_secs: u64,
}

impl OrderRequest {
    /// Signed quantity as booked against exposure
    pub fn signed_quantity(&self) -> Decimal {
        match self.side {
            Direction::Long => self.quantity,
            Direction::Short => -self.quantity,
            Direction::Flat => Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Filled,
    /// Acknowledged by the venue, no fill reported yet
    Pending,
    Rejected,
}

/// Order result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub client_order_id: Uuid,
    #[serde(default)]
    pub venue_order_id: Option<String>,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled_quantity: Decimal,
    #[serde(default)]
    pub fill_price: Option<Decimal>,
    #[serde(default)]
    pub message: Option<String>,
}

impl OrderResult {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

/// Pick the gateway for a run mode
///
/// Live mode always goes through the REST gateway.
pub fn build_gateway(mode: Mode, cfg: &ExecutionConfig) -> Result<Arc<dyn ExecutionGateway>> {
    let kind = if mode == Mode::Live { GatewayKind::Rest } else { cfg.gateway };
    match kind {
        GatewayKind::Simulated => Ok(Arc::new(SimulatedGateway::new())),
        GatewayKind::Rest => {
            let gateway = RestGateway::from_config(cfg).context("failed to build rest gateway")?;
            Ok(Arc::new(gateway))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(side: Direction) -> OrderRequest {
        OrderRequest {
            client_order_id: Uuid::new_v4(),
            instrument: "BTC".into(),
            side,
            quantity: dec!(0.25),
            price: None,
            strategy_id: "Grid-Range".into(),
            stop_loss_pct: dec!(0.01),
            take_profit_pct: dec!(0.015),
            valid_for_secs: 60,
        }
    }

    #[test]
    fn test_signed_quantity() {
        assert_eq!(order(Direction::Long).signed_quantity(), dec!(0.25));
        assert_eq!(order(Direction::Short).signed_quantity(), dec!(-0.25));
        assert_eq!(order(Direction::Flat).signed_quantity(), Decimal::ZERO);
    }

    #[test]
    fn test_build_gateway_by_mode() {
        let cfg = ExecutionConfig::default();
        assert_eq!(build_gateway(Mode::Paper, &cfg).unwrap().name(), "simulated");
        assert_eq!(build_gateway(Mode::Backtest, &cfg).unwrap().name(), "simulated");
        // Live without an endpoint cannot be built
        assert!(build_gateway(Mode::Live, &cfg).is_err());
    }
}

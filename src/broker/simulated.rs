//! Simulated execution
//!
//! Fills every order immediately and in full, at the limit price when one is
//! given. Position and P&L accounting live in the engine's position book, so
//! a restarted process needs nothing from this gateway.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::debug;

use super::{ExecutionGateway, OrderRequest, OrderResult, OrderStatus};

/// In-memory gateway for backtest and paper modes
#[derive(Default)]
pub struct SimulatedGateway {
    fills: Mutex<Vec<OrderResult>>,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fill_count(&self) -> usize {
        self.fills.lock().map(|f| f.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ExecutionGateway for SimulatedGateway {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult> {
        let mut fills = self
            .fills
            .lock()
            .map_err(|_| anyhow::anyhow!("simulated fill log poisoned"))?;

        let result = OrderResult {
            client_order_id: order.client_order_id,
            venue_order_id: Some(format!("SIM-{}", fills.len() + 1)),
            status: OrderStatus::Filled,
            filled_quantity: order.quantity,
            fill_price: order.price,
            message: None,
        };
        fills.push(result.clone());

        debug!(
            instrument = %order.instrument,
            side = %order.side,
            quantity = %order.quantity,
            price = ?order.price,
            "simulated fill"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Direction;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn order(side: Direction, quantity: Decimal, price: Option<Decimal>) -> OrderRequest {
        OrderRequest {
            client_order_id: Uuid::new_v4(),
            instrument: "BTC".into(),
            side,
            quantity,
            price,
            strategy_id: "MOM-ATR-Break".into(),
            stop_loss_pct: dec!(0.01),
            take_profit_pct: dec!(0.02),
            valid_for_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_market_order_fills() {
        let gw = SimulatedGateway::new();
        let result = gw.place_order(&order(Direction::Long, dec!(0.5), None)).await.unwrap();
        assert!(result.is_filled());
        assert_eq!(result.filled_quantity, dec!(0.5));
        assert_eq!(result.fill_price, None);
        assert_eq!(result.venue_order_id.as_deref(), Some("SIM-1"));
        assert_eq!(gw.fill_count(), 1);
    }

    #[tokio::test]
    async fn test_limit_order_fills_at_limit() {
        let gw = SimulatedGateway::new();
        gw.place_order(&order(Direction::Long, dec!(1), Some(dec!(100)))).await.unwrap();
        let result = gw
            .place_order(&order(Direction::Short, dec!(1), Some(dec!(115))))
            .await
            .unwrap();
        assert_eq!(result.fill_price, Some(dec!(115)));
        assert_eq!(result.venue_order_id.as_deref(), Some("SIM-2"));
        assert_eq!(gw.fill_count(), 2);
    }
}

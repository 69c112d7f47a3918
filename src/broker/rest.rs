//! REST execution gateway
//!
//! Posts orders as JSON to a single endpoint with a bearer key read from
//! the environment. Venue-specific signing is out of scope.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{ExecutionGateway, OrderRequest, OrderResult, OrderStatus};
use crate::config::ExecutionConfig;

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Serialize)]
struct WireOrder<'a> {
    client_order_id: String,
    symbol: &'a str,
    side: &'a str,
    qty: String,
    #[serde(rename = "type")]
    order_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    stop_loss_pct: String,
    take_profit_pct: String,
    valid_for_secs: u64,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Option<String>,
    status: String,
    #[serde(default)]
    filled_qty: Option<String>,
    #[serde(default)]
    filled_avg_price: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn parse_status(status: &str) -> OrderStatus {
    match status.to_ascii_lowercase().as_str() {
        "filled" => OrderStatus::Filled,
        "rejected" | "canceled" | "cancelled" | "expired" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

pub struct RestGateway {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl RestGateway {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build execution HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            client,
        })
    }

    pub fn from_config(cfg: &ExecutionConfig) -> Result<Self> {
        anyhow::ensure!(!cfg.endpoint.is_empty(), "execution.endpoint is not set");
        let api_key = std::env::var(&cfg.api_key_env)
            .with_context(|| format!("environment variable {} is not set", cfg.api_key_env))?;
        Self::new(cfg.endpoint.clone(), api_key)
    }
}

#[async_trait]
impl ExecutionGateway for RestGateway {
    fn name(&self) -> &str {
        "rest"
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult> {
        let wire = WireOrder {
            client_order_id: order.client_order_id.to_string(),
            symbol: &order.instrument,
            side: if order.signed_quantity().is_sign_negative() { "sell" } else { "buy" },
            qty: order.quantity.to_string(),
            order_type: if order.price.is_some() { "limit" } else { "market" },
            limit_price: order.price.map(|p| p.to_string()),
            stop_loss_pct: order.stop_loss_pct.to_string(),
            take_profit_pct: order.take_profit_pct.to_string(),
            valid_for_secs: order.valid_for_secs,
        };

        let resp: WireResponse = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&wire)
            .send()
            .await
            .context("order request failed")?
            .error_for_status()
            .context("execution venue returned an error status")?
            .json()
            .await
            .context("order response not JSON")?;

        debug!(instrument = %order.instrument, status = %resp.status, "order acknowledged");

        let decimal = |v: Option<String>| -> Option<Decimal> { v.and_then(|s| s.parse().ok()) };
        Ok(OrderResult {
            client_order_id: order.client_order_id,
            venue_order_id: resp.id,
            status: parse_status(&resp.status),
            filled_quantity: decimal(resp.filled_qty).unwrap_or_default(),
            fill_price: decimal(resp.filled_avg_price),
            message: resp.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("FILLED"), OrderStatus::Filled);
        assert_eq!(parse_status("canceled"), OrderStatus::Rejected);
        assert_eq!(parse_status("new"), OrderStatus::Pending);
    }

    #[test]
    fn test_wire_response_minimal() {
        let resp: WireResponse =
            serde_json::from_str(r#"{"status":"filled","filled_qty":"0.5"}"#).unwrap();
        assert_eq!(resp.status, "filled");
        assert_eq!(resp.filled_qty.as_deref(), Some("0.5"));
        assert!(resp.id.is_none());
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        assert!(RestGateway::from_config(&ExecutionConfig::default()).is_err());
    }
}

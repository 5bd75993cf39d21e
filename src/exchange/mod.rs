// =============================================================================
// ExchangeAdapter — a capability set, not a hierarchy
// =============================================================================
//
// Grounded on `libs/exchange-adapters/src/exchange_adapters/base.py`: one
// trait, selected at startup by `execution_mode`, matching the teacher's
// approach to `binance::BinanceClient` as a flat capability wrapper rather
// than a class hierarchy.
// =============================================================================

pub mod binance;
pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AppSettings, ExecutionMode};
use crate::types::{ExecutionReport, Market, OrderIntent};

/// A single open position reported by `fetch_positions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub market: Market,
    pub symbol: String,
    pub qty: f64,
    pub notional_usd: f64,
}

/// An event surfaced by `stream_execution_events`: either a fill update or
/// an operational alert (e.g. a reconnect).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AdapterEvent {
    Execution(ExecutionReport),
    Alert { severity: String, message: String },
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn place_order(&self, intent: &OrderIntent) -> anyhow::Result<ExecutionReport>;

    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<bool>;

    async fn fetch_positions(&self) -> anyhow::Result<Vec<PositionInfo>>;

    /// Poll once for execution/alert events. The real "stream" is the
    /// caller looping this with its own backoff, matching the teacher's
    /// connection-per-call style in `binance::client`.
    async fn poll_execution_events(&self) -> anyhow::Result<Vec<AdapterEvent>>;
}

/// Chooses the adapter implied by `settings.execution_mode`, mirroring
/// `exchange_adapters/factory.py::build_exchange_adapter`.
pub fn build_exchange_adapter(settings: &AppSettings) -> anyhow::Result<Arc<dyn ExchangeAdapter>> {
    match settings.execution_mode {
        ExecutionMode::Paper => Ok(Arc::new(simulated::SimulatedExchangeAdapter::new())),
        ExecutionMode::Live => {
            let api_key = settings
                .binance_api_key
                .clone()
                .ok_or_else(|| anyhow::anyhow!("BINANCE_API_KEY is required for live execution mode"))?;
            let api_secret = settings
                .binance_api_secret
                .clone()
                .ok_or_else(|| anyhow::anyhow!("BINANCE_API_SECRET is required for live execution mode"))?;
            Ok(Arc::new(binance::BinanceExchangeAdapter::new(
                api_key,
                api_secret,
                settings.binance_testnet,
            )))
        }
    }
}

// =============================================================================
// SimulatedExchangeAdapter — paper trading fills
// =============================================================================
//
// Grounded on `exchange_adapters/simulated.py`: a hardcoded price table
// jittered by +/-0.15%, a flat 4 bps fee, and orders that always fill in
// full and immediately.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use uuid::Uuid;

use super::{AdapterEvent, ExchangeAdapter, PositionInfo};
use crate::types::{ExecutionReport, ExecutionStatus, Market, OrderIntent};

static BASE_PRICES: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        ("BTCUSDT", 65000.0),
        ("ETHUSDT", 3200.0),
        ("BNBUSDT", 580.0),
        ("SOLUSDT", 140.0),
        ("XRPUSDT", 0.62),
        ("ADAUSDT", 0.47),
        ("DOGEUSDT", 0.12),
        ("LINKUSDT", 19.0),
        ("AVAXUSDT", 34.0),
        ("TONUSDT", 6.8),
    ])
});

const DEFAULT_PRICE: f64 = 10.0;
const FEE_RATE: f64 = 0.0004;

pub struct SimulatedExchangeAdapter {
    positions: Mutex<HashMap<(Market, String), f64>>,
}

impl SimulatedExchangeAdapter {
    pub fn new() -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
        }
    }

    fn price_for(&self, symbol: &str) -> f64 {
        let base = BASE_PRICES.get(symbol).copied().unwrap_or(DEFAULT_PRICE);
        let jitter = rand::thread_rng().gen_range(-0.0015..=0.0015);
        (base * (1.0 + jitter)).max(0.0001)
    }
}

impl Default for SimulatedExchangeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for SimulatedExchangeAdapter {
    async fn place_order(&self, intent: &OrderIntent) -> anyhow::Result<ExecutionReport> {
        let px = self.price_for(&intent.symbol);
        let qty = intent.qty_usd / px;
        let fee = intent.qty_usd * FEE_RATE;

        let signed_qty = if intent.side > 0 { qty } else { -qty };
        let key = (intent.market, intent.symbol.clone());
        {
            let mut positions = self.positions.lock();
            *positions.entry(key).or_insert(0.0) += signed_qty;
        }

        Ok(ExecutionReport {
            schema_version: "1.0".to_string(),
            order_id: format!("paper-{}", &Uuid::new_v4().simple().to_string()[..16]),
            intent_id: intent.intent_id.clone(),
            symbol: intent.symbol.clone(),
            market: intent.market,
            side: intent.side,
            status: ExecutionStatus::Filled,
            filled_qty: qty,
            avg_price: px,
            fee,
            ts: Utc::now(),
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn fetch_positions(&self) -> anyhow::Result<Vec<PositionInfo>> {
        let positions = self.positions.lock();
        Ok(positions
            .iter()
            .map(|((market, symbol), qty)| {
                let px = BASE_PRICES.get(symbol.as_str()).copied().unwrap_or(DEFAULT_PRICE);
                PositionInfo {
                    market: *market,
                    symbol: symbol.clone(),
                    qty: *qty,
                    notional_usd: qty.abs() * px,
                }
            })
            .collect())
    }

    async fn poll_execution_events(&self) -> anyhow::Result<Vec<AdapterEvent>> {
        Ok(vec![])
    }
}

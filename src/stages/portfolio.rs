// =============================================================================
// PortfolioStage — signal.universe -> order.intent
// =============================================================================
//
// Grounded on `apps/portfolio_service.py`: sizes an order in USD notional
// off the account's base risk capital scaled by signal strength (floored
// at 20% of base capital, and at $10 absolute minimum), and chooses spot
// for long signals / perp for short signals since spot doesn't support
// shorting.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::config::AppSettings;
use crate::types::{streams, Market, OrderIntent, SignalEvent};
use crate::worker::StageHandler;

pub struct PortfolioStage {
    settings: Arc<AppSettings>,
}

impl PortfolioStage {
    pub fn new(settings: Arc<AppSettings>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl StageHandler for PortfolioStage {
    fn name(&self) -> &str {
        "portfolio"
    }

    async fn handle(&self, payload: Value) -> anyhow::Result<Vec<(String, Value)>> {
        let signal: SignalEvent = match serde_json::from_value(payload) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "failed to decode signal.universe record");
                return Ok(vec![]);
            }
        };

        let base_risk_capital = self.settings.base_risk_capital();
        let qty_usd = (base_risk_capital * signal.strength.max(0.2)).max(10.0);
        let market = Market::for_side(signal.side);

        let intent = OrderIntent {
            schema_version: "1.0".to_string(),
            intent_id: Uuid::new_v4().to_string(),
            event_id: signal.event_id,
            symbol: signal.symbol,
            market,
            side: signal.side,
            qty_usd,
            max_slippage_bps: self.settings.max_slippage_bps,
            reason: signal.rationale,
        }
        .validate()?;

        Ok(vec![(streams::ORDER_INTENT.to_string(), serde_json::to_value(intent)?)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stage() -> PortfolioStage {
        let mut settings = AppSettings::from_env();
        settings.account_equity_usd = 100_000.0;
        settings.risk_per_trade_pct = 0.005;
        PortfolioStage::new(Arc::new(settings))
    }

    fn signal(side: i8, strength: f64) -> SignalEvent {
        SignalEvent {
            schema_version: "1.0".into(),
            event_id: "e1".into(),
            symbol: "BTCUSDT".into(),
            side,
            strength,
            confidence: 0.8,
            horizon_min: 60,
            ttl_sec: 3600,
            rationale: "x".into(),
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn long_signal_routes_to_spot() {
        let stage = stage();
        let out = stage
            .handle(serde_json::to_value(signal(1, 0.8)).unwrap())
            .await
            .unwrap();
        let intent: OrderIntent = serde_json::from_value(out[0].1.clone()).unwrap();
        assert_eq!(intent.market, Market::Spot);
    }

    #[tokio::test]
    async fn short_signal_routes_to_perp() {
        let stage = stage();
        let out = stage
            .handle(serde_json::to_value(signal(-1, 0.8)).unwrap())
            .await
            .unwrap();
        let intent: OrderIntent = serde_json::from_value(out[0].1.clone()).unwrap();
        assert_eq!(intent.market, Market::Perp);
    }

    #[tokio::test]
    async fn sizing_scales_with_strength_floored_at_point_two() {
        let stage = stage();
        let out = stage
            .handle(serde_json::to_value(signal(1, 0.05)).unwrap())
            .await
            .unwrap();
        let intent: OrderIntent = serde_json::from_value(out[0].1.clone()).unwrap();
        // base_risk_capital = 500, floor strength at 0.2 -> 100
        assert!((intent.qty_usd - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sizing_never_goes_below_ten_dollars() {
        let mut settings = AppSettings::from_env();
        settings.account_equity_usd = 100.0;
        settings.risk_per_trade_pct = 0.001;
        let stage = PortfolioStage::new(Arc::new(settings));
        let out = stage
            .handle(serde_json::to_value(signal(1, 0.2)).unwrap())
            .await
            .unwrap();
        let intent: OrderIntent = serde_json::from_value(out[0].1.clone()).unwrap();
        assert!(intent.qty_usd >= 10.0);
    }
}

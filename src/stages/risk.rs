// =============================================================================
// RiskStage — order.intent -> {order.approved, order.rejected}
//             pnl.snapshot -> (kill switch state, risk.alert)
// =============================================================================
//
// Grounded on `apps/risk_service.py`. Two responsibilities on one stage,
// matching the source's single `RiskService` class:
//
// - `handle_order_intent`: kill-switch/daily-drawdown gate first, then
//   computes `allowed_X = max(0, limit_X - current_X)` for each of the
//   four exposure dimensions and caps the intent at the tightest one. A
//   cap of zero or less is a rejection; the blamed dimension is the first
//   exhausted one in priority order (symbol, market, side, total). An
//   approved intent is republished with `qty_usd` replaced by the cap —
//   `order.approved` carries an `OrderIntent`, not a separate decision
//   record, matching the source's `intent.model_copy(update=...)`.
// - `handle_pnl_snapshot`: accumulates daily realized PnL by delta (so
//   replays / duplicate snapshots don't double count) and trips the kill
//   switch once the configured daily drawdown threshold is breached.
//
// Kill-switch and the last-seen-realized bookkeeping are owned by this
// single worker task (`Mutex`, not `Arc`-shared) — only the exposure and
// daily-PnL numbers in `TradingStateStore` are shared across stages.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::AppSettings;
use crate::state_store::TradingStateStore;
use crate::types::{streams, Market, OrderIntent, PnLSnapshot, RejectReason, RiskAlert, RiskDecision};
use crate::worker::StageHandler;

struct Inner {
    kill_switch: bool,
    last_snapshot_realized: f64,
}

pub struct RiskStage {
    settings: Arc<AppSettings>,
    state_store: Arc<dyn TradingStateStore>,
    inner: Mutex<Inner>,
}

impl RiskStage {
    pub fn new(settings: Arc<AppSettings>, state_store: Arc<dyn TradingStateStore>) -> Self {
        Self {
            settings,
            state_store,
            inner: Mutex::new(Inner {
                kill_switch: false,
                last_snapshot_realized: 0.0,
            }),
        }
    }

    async fn daily_drawdown_breached(&self) -> anyhow::Result<bool> {
        let realized = self.state_store.get_daily_realized_pnl().await?;
        let limit = self.settings.account_equity_usd * self.settings.max_daily_drawdown_pct;
        Ok(realized <= -limit)
    }

    async fn handle_order_intent(&self, intent: OrderIntent) -> anyhow::Result<Vec<(String, Value)>> {
        if self.inner.lock().kill_switch || self.daily_drawdown_breached().await? {
            self.inner.lock().kill_switch = true;
            let decision = RiskDecision {
                schema_version: "1.0".to_string(),
                intent_id: intent.intent_id.clone(),
                allow: false,
                reason_code: RejectReason::DailyDrawdownBreach.to_string(),
                capped_qty_usd: 0.0,
            };
            return Ok(vec![(streams::ORDER_REJECTED.to_string(), serde_json::to_value(decision)?)]);
        }

        let equity = self.settings.account_equity_usd;
        let symbol_limit = equity * self.settings.max_symbol_exposure_pct;
        let total_limit = equity * self.settings.max_total_exposure_pct;
        let market_limit = equity
            * match intent.market {
                Market::Spot => self.settings.max_spot_exposure_pct,
                Market::Perp => self.settings.max_perp_exposure_pct,
            };
        let side_limit = equity
            * if intent.side > 0 {
                self.settings.max_long_exposure_pct
            } else {
                self.settings.max_short_exposure_pct
            };

        let current_symbol = self.state_store.get_symbol_exposure(&intent.symbol).await?;
        let current_total = self.state_store.get_total_exposure().await?;
        let current_market = self.state_store.get_market_exposure(intent.market).await?;
        let current_side = self.state_store.get_side_exposure(intent.side).await?;

        let allowed_by_symbol = (symbol_limit - current_symbol).max(0.0);
        let allowed_by_total = (total_limit - current_total).max(0.0);
        let allowed_by_market = (market_limit - current_market).max(0.0);
        let allowed_by_side = (side_limit - current_side).max(0.0);

        let cap = intent
            .qty_usd
            .min(allowed_by_symbol)
            .min(allowed_by_total)
            .min(allowed_by_market)
            .min(allowed_by_side);

        if cap <= 0.0 {
            let reason_code = if allowed_by_symbol <= 0.0 {
                RejectReason::SymbolExposureLimit
            } else if allowed_by_market <= 0.0 {
                RejectReason::MarketExposureLimit
            } else if allowed_by_side <= 0.0 {
                RejectReason::SideExposureLimit
            } else {
                RejectReason::TotalExposureLimit
            };
            let decision = RiskDecision {
                schema_version: "1.0".to_string(),
                intent_id: intent.intent_id.clone(),
                allow: false,
                reason_code: reason_code.to_string(),
                capped_qty_usd: 0.0,
            };
            return Ok(vec![(streams::ORDER_REJECTED.to_string(), serde_json::to_value(decision)?)]);
        }

        self.state_store
            .add_exposure(&intent.symbol, intent.market, intent.side, cap)
            .await?;

        let approved = OrderIntent { qty_usd: cap, ..intent };
        Ok(vec![(streams::ORDER_APPROVED.to_string(), serde_json::to_value(approved)?)])
    }

    async fn handle_pnl_snapshot(&self, snapshot: PnLSnapshot) -> anyhow::Result<Vec<(String, Value)>> {
        let delta = {
            let mut inner = self.inner.lock();
            let delta = snapshot.realized - inner.last_snapshot_realized;
            inner.last_snapshot_realized = snapshot.realized;
            delta
        };
        self.state_store.add_daily_realized_pnl(delta).await?;

        if self.daily_drawdown_breached().await? {
            self.inner.lock().kill_switch = true;
            warn!(realized = snapshot.realized, "daily drawdown breached, tripping kill switch");
            let alert = RiskAlert {
                schema_version: "1.0".to_string(),
                message: "Daily drawdown breached. Strategy halted.".to_string(),
                severity: "critical".to_string(),
                source: "risk".to_string(),
                drawdown: Some(snapshot.drawdown),
            };
            return Ok(vec![(streams::RISK_ALERT.to_string(), serde_json::to_value(alert)?)]);
        }
        Ok(vec![])
    }

    /// Resets the kill switch and daily realized PnL accumulator. Called
    /// by the orchestrator at UTC day boundaries.
    pub async fn reset_daily(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.kill_switch = false;
        inner.last_snapshot_realized = 0.0;
        drop(inner);
        self.state_store.reset_daily_realized_pnl().await?;
        info!("risk stage daily state reset");
        Ok(())
    }
}

#[async_trait]
impl StageHandler for RiskStage {
    fn name(&self) -> &str {
        "risk"
    }

    async fn handle(&self, payload: Value) -> anyhow::Result<Vec<(String, Value)>> {
        if let Ok(intent) = serde_json::from_value::<OrderIntent>(payload.clone()) {
            return match intent.validate() {
                Ok(intent) => self.handle_order_intent(intent).await,
                Err(err) => {
                    warn!(error = %err, "order.intent record failed validation");
                    Ok(vec![])
                }
            };
        }
        match serde_json::from_value::<PnLSnapshot>(payload) {
            Ok(snapshot) => self.handle_pnl_snapshot(snapshot).await,
            Err(err) => {
                warn!(error = %err, "failed to decode risk stage input as intent or snapshot");
                Ok(vec![])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::MemoryTradingStateStore;
    use chrono::Utc;

    fn settings() -> Arc<AppSettings> {
        let mut s = AppSettings::from_env();
        s.account_equity_usd = 100_000.0;
        s.max_symbol_exposure_pct = 0.05;
        s.max_total_exposure_pct = 0.20;
        s.max_spot_exposure_pct = 0.12;
        s.max_perp_exposure_pct = 0.12;
        s.max_long_exposure_pct = 0.12;
        s.max_short_exposure_pct = 0.02;
        s.max_daily_drawdown_pct = 0.02;
        Arc::new(s)
    }

    fn intent(symbol: &str, market: Market, side: i8, qty_usd: f64) -> OrderIntent {
        OrderIntent {
            schema_version: "1.0".into(),
            intent_id: "i1".into(),
            event_id: "e1".into(),
            symbol: symbol.into(),
            market,
            side,
            qty_usd,
            max_slippage_bps: 20,
            reason: "x".into(),
        }
    }

    #[tokio::test]
    async fn caps_qty_at_symbol_limit_and_still_approves() {
        let store: Arc<dyn TradingStateStore> = Arc::new(MemoryTradingStateStore::new());
        let stage = RiskStage::new(settings(), store);
        // symbol cap is 5% of 100k = 5000
        let out = stage
            .handle(serde_json::to_value(intent("BTCUSDT", Market::Spot, 1, 6000.0)).unwrap())
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, streams::ORDER_APPROVED);
        let approved: OrderIntent = serde_json::from_value(out[0].1.clone()).unwrap();
        assert!((approved.qty_usd - 5000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejects_with_symbol_reason_when_symbol_exhausted() {
        let store: Arc<dyn TradingStateStore> = Arc::new(MemoryTradingStateStore::new());
        let stage = RiskStage::new(settings(), store);
        stage
            .handle(serde_json::to_value(intent("BTCUSDT", Market::Spot, 1, 5000.0)).unwrap())
            .await
            .unwrap();

        let out = stage
            .handle(serde_json::to_value(intent("BTCUSDT", Market::Spot, 1, 1000.0)).unwrap())
            .await
            .unwrap();
        assert_eq!(out[0].0, streams::ORDER_REJECTED);
        let decision: RiskDecision = serde_json::from_value(out[0].1.clone()).unwrap();
        assert_eq!(decision.reason_code, "SYMBOL_EXPOSURE_LIMIT");
    }

    #[tokio::test]
    async fn rejects_with_market_cap_when_market_exhausted_across_symbols() {
        let store: Arc<dyn TradingStateStore> = Arc::new(MemoryTradingStateStore::new());
        let stage = RiskStage::new(settings(), store);
        // fill spot market cap (12k) across three symbols within their own 5k caps
        stage
            .handle(serde_json::to_value(intent("BTCUSDT", Market::Spot, 1, 4000.0)).unwrap())
            .await
            .unwrap();
        stage
            .handle(serde_json::to_value(intent("ETHUSDT", Market::Spot, 1, 4000.0)).unwrap())
            .await
            .unwrap();
        stage
            .handle(serde_json::to_value(intent("SOLUSDT", Market::Spot, 1, 4000.0)).unwrap())
            .await
            .unwrap();

        let out = stage
            .handle(serde_json::to_value(intent("ADAUSDT", Market::Spot, 1, 1000.0)).unwrap())
            .await
            .unwrap();
        assert_eq!(out[0].0, streams::ORDER_REJECTED);
        let decision: RiskDecision = serde_json::from_value(out[0].1.clone()).unwrap();
        assert_eq!(decision.reason_code, "MARKET_EXPOSURE_LIMIT");
    }

    #[tokio::test]
    async fn rejects_short_side_quickly_due_to_tight_side_limit() {
        let store: Arc<dyn TradingStateStore> = Arc::new(MemoryTradingStateStore::new());
        let stage = RiskStage::new(settings(), store);
        // short side limit is 2% of 100k = 2000, already exhausted by a prior short
        stage
            .handle(serde_json::to_value(intent("ETHUSDT", Market::Perp, -1, 2000.0)).unwrap())
            .await
            .unwrap();

        let out = stage
            .handle(serde_json::to_value(intent("BTCUSDT", Market::Perp, -1, 500.0)).unwrap())
            .await
            .unwrap();
        let decision: RiskDecision = serde_json::from_value(out[0].1.clone()).unwrap();
        assert_eq!(decision.reason_code, "SIDE_EXPOSURE_LIMIT");
    }

    #[tokio::test]
    async fn approves_intent_within_all_caps_unchanged() {
        let store: Arc<dyn TradingStateStore> = Arc::new(MemoryTradingStateStore::new());
        let stage = RiskStage::new(settings(), store);
        let out = stage
            .handle(serde_json::to_value(intent("BTCUSDT", Market::Spot, 1, 500.0)).unwrap())
            .await
            .unwrap();
        assert_eq!(out[0].0, streams::ORDER_APPROVED);
        let approved: OrderIntent = serde_json::from_value(out[0].1.clone()).unwrap();
        assert!((approved.qty_usd - 500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn kill_switch_trips_on_daily_drawdown_breach_and_rejects_subsequent_intents() {
        let store: Arc<dyn TradingStateStore> = Arc::new(MemoryTradingStateStore::new());
        let stage = RiskStage::new(settings(), store);

        let snapshot = PnLSnapshot {
            schema_version: "1.0".into(),
            ts: Utc::now(),
            account: "paper".into(),
            unrealized: 0.0,
            realized: -2500.0, // 2.5% of 100k, breaches 2% threshold
            exposure: 0.0,
            drawdown: 0.025,
        };
        let alerts = stage
            .handle(serde_json::to_value(snapshot).unwrap())
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, streams::RISK_ALERT);

        let out = stage
            .handle(serde_json::to_value(intent("BTCUSDT", Market::Spot, 1, 100.0)).unwrap())
            .await
            .unwrap();
        assert_eq!(out[0].0, streams::ORDER_REJECTED);
        let decision: RiskDecision = serde_json::from_value(out[0].1.clone()).unwrap();
        assert_eq!(decision.reason_code, "DAILY_DRAWDOWN_BREACH");
    }
}

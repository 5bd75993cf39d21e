// =============================================================================
// PositionSyncStage — timer-driven exchange reconciliation
// =============================================================================
//
// Grounded on `apps/position_sync_service.py`. Runs on its own interval
// (not stream-driven like the other stages), skips entirely unless
// `execution_mode = live`, and replaces the shared exposure snapshot with
// the exchange's reported positions every tick. Emits a `risk.alert` when
// the aggregate drift against the currently tracked total exposure exceeds
// the configured threshold.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::{AppSettings, ExecutionMode};
use crate::exchange::ExchangeAdapter;
use crate::state_store::{ExposureSnapshot, TradingStateStore};
use crate::types::{streams, Market, RiskAlert};

pub struct PositionSyncStage {
    settings: Arc<AppSettings>,
    adapter: Arc<dyn ExchangeAdapter>,
    state_store: Arc<dyn TradingStateStore>,
    bus: Arc<dyn EventBus>,
}

impl PositionSyncStage {
    pub fn new(
        settings: Arc<AppSettings>,
        adapter: Arc<dyn ExchangeAdapter>,
        state_store: Arc<dyn TradingStateStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            settings,
            adapter,
            state_store,
            bus,
        }
    }

    /// Runs one reconciliation pass. Returns `Ok(())` whether or not a
    /// drift alert fired; failures to reach the adapter are logged and
    /// swallowed, matching the "skip this tick" behavior of a timer loop
    /// that must not die on a transient exchange outage.
    pub async fn tick(&self) -> anyhow::Result<()> {
        if self.settings.execution_mode != ExecutionMode::Live {
            return Ok(());
        }

        let positions = match self.adapter.fetch_positions().await {
            Ok(positions) => positions,
            Err(err) => {
                warn!(error = %err, "position sync: fetch_positions failed, skipping this tick");
                return Ok(());
            }
        };

        let mut snapshot = ExposureSnapshot::default();
        for position in &positions {
            let notional = if position.notional_usd > 0.0 {
                position.notional_usd
            } else {
                position.qty.abs()
            };
            *snapshot.by_symbol.entry(position.symbol.clone()).or_insert(0.0) += notional;
            *snapshot.by_market.entry(position.market).or_insert(0.0) += notional;
            let side = if position.qty >= 0.0 { 1 } else { -1 };
            *snapshot.by_side.entry(side).or_insert(0.0) += notional;
            snapshot.total += notional;
        }

        let desired_total: f64 = snapshot.by_market.values().sum();
        let current_total = self.state_store.get_total_exposure().await?;
        let drift_pct = (desired_total - current_total).abs() / self.settings.account_equity_usd.max(1.0);

        if drift_pct >= self.settings.position_sync_drift_alert_pct {
            let alert = RiskAlert {
                schema_version: "1.0".to_string(),
                message: format!(
                    "Position sync drift {:.4} exceeds threshold {:.4} (desired={:.2}, tracked={:.2})",
                    drift_pct, self.settings.position_sync_drift_alert_pct, desired_total, current_total
                ),
                severity: "warning".to_string(),
                source: "position_sync".to_string(),
                drawdown: None,
            };
            self.bus
                .publish(streams::RISK_ALERT, serde_json::to_value(&alert)?)
                .await?;
        }

        self.state_store.replace_exposure_snapshot(snapshot).await?;
        info!(positions = positions.len(), drift_pct, "position sync reconciled");
        Ok(())
    }

    /// Runs `tick` on `position_sync_interval_sec`, exiting when `shutdown`
    /// fires — the same cooperative-cancellation shape as `run_stream_worker`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.settings.position_sync_interval_sec.max(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(error = %err, "position sync tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("position sync stopping on shutdown signal");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::exchange::PositionInfo;
    use crate::state_store::MemoryTradingStateStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct StubAdapter {
        positions: Mutex<Vec<PositionInfo>>,
    }

    #[async_trait]
    impl ExchangeAdapter for StubAdapter {
        async fn place_order(
            &self,
            _intent: &crate::types::OrderIntent,
        ) -> anyhow::Result<crate::types::ExecutionReport> {
            unreachable!("not exercised in position sync tests")
        }
        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn fetch_positions(&self) -> anyhow::Result<Vec<PositionInfo>> {
            Ok(self.positions.lock().clone())
        }
        async fn poll_execution_events(&self) -> anyhow::Result<Vec<crate::exchange::AdapterEvent>> {
            Ok(vec![])
        }
    }

    fn settings_live() -> AppSettings {
        let mut s = AppSettings::from_env();
        s.execution_mode = crate::config::ExecutionMode::Live;
        s.account_equity_usd = 100_000.0;
        s.position_sync_drift_alert_pct = 0.01;
        s
    }

    #[tokio::test]
    async fn paper_mode_skips_reconciliation_entirely() {
        let settings = Arc::new(AppSettings::from_env());
        let adapter = Arc::new(StubAdapter { positions: Mutex::new(vec![]) });
        let state_store = Arc::new(MemoryTradingStateStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());

        state_store.add_exposure("BTCUSDT", Market::Spot, 1, 5000.0).await.unwrap();

        let stage = PositionSyncStage::new(settings, adapter, state_store.clone(), bus);
        stage.tick().await.unwrap();

        // unchanged, since paper mode never calls replace_exposure_snapshot
        assert_eq!(state_store.get_total_exposure().await.unwrap(), 5000.0);
    }

    #[tokio::test]
    async fn live_mode_replaces_snapshot_from_exchange_positions() {
        let settings = Arc::new(settings_live());
        let adapter = Arc::new(StubAdapter {
            positions: Mutex::new(vec![PositionInfo {
                market: Market::Spot,
                symbol: "BTCUSDT".to_string(),
                qty: 0.1,
                notional_usd: 6500.0,
            }]),
        });
        let state_store = Arc::new(MemoryTradingStateStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());

        let stage = PositionSyncStage::new(settings, adapter, state_store.clone(), bus);
        stage.tick().await.unwrap();

        assert_eq!(state_store.get_total_exposure().await.unwrap(), 6500.0);
    }

    #[tokio::test]
    async fn large_drift_publishes_risk_alert() {
        let settings = Arc::new(settings_live());
        let adapter = Arc::new(StubAdapter {
            positions: Mutex::new(vec![PositionInfo {
                market: Market::Spot,
                symbol: "BTCUSDT".to_string(),
                qty: 1.0,
                notional_usd: 65000.0,
            }]),
        });
        let state_store = Arc::new(MemoryTradingStateStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());

        let stage = PositionSyncStage::new(settings, adapter, state_store.clone(), bus.clone());
        stage.tick().await.unwrap();

        let records = bus.read(streams::RISK_ALERT, "0", 10, 0).await.unwrap();
        assert_eq!(records.len(), 1);
    }
}

// =============================================================================
// UniverseStage — signal.tradeable -> signal.universe
// =============================================================================
//
// Grounded on `apps/universe_service.py`: drops any signal whose symbol
// doesn't end in "USDT" or isn't in the configured trading universe. Pure
// pass-through filter otherwise.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AppSettings;
use crate::types::{streams, SignalEvent};
use crate::worker::StageHandler;

pub struct UniverseStage {
    settings: Arc<AppSettings>,
}

impl UniverseStage {
    pub fn new(settings: Arc<AppSettings>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl StageHandler for UniverseStage {
    fn name(&self) -> &str {
        "universe"
    }

    async fn handle(&self, payload: Value) -> anyhow::Result<Vec<(String, Value)>> {
        let signal: SignalEvent = match serde_json::from_value(payload) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "failed to decode signal.tradeable record");
                return Ok(vec![]);
            }
        };

        if !signal.symbol.ends_with("USDT") || !self.settings.universe_symbols.contains(&signal.symbol) {
            debug!(symbol = %signal.symbol, "symbol outside trading universe, dropping");
            return Ok(vec![]);
        }

        Ok(vec![(streams::SIGNAL_UNIVERSE.to_string(), serde_json::to_value(signal)?)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stage() -> UniverseStage {
        let mut settings = AppSettings::from_env();
        settings.universe_symbols = vec!["BTCUSDT".to_string()];
        UniverseStage::new(Arc::new(settings))
    }

    fn signal(symbol: &str) -> SignalEvent {
        SignalEvent {
            schema_version: "1.0".into(),
            event_id: "e1".into(),
            symbol: symbol.into(),
            side: 1,
            strength: 0.8,
            confidence: 0.8,
            horizon_min: 60,
            ttl_sec: 3600,
            rationale: "x".into(),
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_universe_symbol_passes_through() {
        let stage = stage();
        let out = stage
            .handle(serde_json::to_value(signal("BTCUSDT")).unwrap())
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn out_of_universe_symbol_is_dropped() {
        let stage = stage();
        let out = stage
            .handle(serde_json::to_value(signal("ETHUSDT")).unwrap())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn non_usdt_symbol_is_dropped() {
        let stage = stage();
        let out = stage
            .handle(serde_json::to_value(signal("BTCBUSD")).unwrap())
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}

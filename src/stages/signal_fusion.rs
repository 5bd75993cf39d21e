// =============================================================================
// SignalFusionStage — signal.raw -> signal.tradeable
// =============================================================================
//
// Grounded on `apps/signal_fusion_service.py`. Keeps the last *fused*
// signal seen per symbol and drops a new one if: side is neutral,
// confidence is below the configured floor, the signal is already stale,
// or it conflicts with the stored signal — opposite side, within the
// 30-minute conflict window, and within 0.2 strength of each other.
// Surviving signals are strength-boosted by their own confidence and
// stamped with a fresh `generated_at` before being republished.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AppSettings;
use crate::types::{streams, SignalEvent};
use crate::worker::StageHandler;

const CONFLICT_WINDOW_SEC: i64 = 30 * 60;

pub struct SignalFusionStage {
    settings: Arc<AppSettings>,
    last_signal: Mutex<HashMap<String, SignalEvent>>,
}

impl SignalFusionStage {
    pub fn new(settings: Arc<AppSettings>) -> Self {
        Self {
            settings,
            last_signal: Mutex::new(HashMap::new()),
        }
    }

    fn conflicts(prior: &SignalEvent, incoming: &SignalEvent) -> bool {
        let opposite = incoming.side != prior.side;
        let delta_sec = (incoming.generated_at - prior.generated_at).num_seconds();
        let close_strength = (incoming.strength - prior.strength).abs() < 0.2;
        opposite && delta_sec <= CONFLICT_WINDOW_SEC && close_strength
    }
}

#[async_trait]
impl StageHandler for SignalFusionStage {
    fn name(&self) -> &str {
        "signal_fusion"
    }

    async fn handle(&self, payload: Value) -> anyhow::Result<Vec<(String, Value)>> {
        let decoded: SignalEvent = match serde_json::from_value(payload) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "failed to decode signal.raw record");
                return Ok(vec![]);
            }
        };
        let signal = match decoded.validate() {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "signal.raw record failed validation");
                return Ok(vec![]);
            }
        };

        if signal.side == 0 {
            debug!(symbol = %signal.symbol, "dropping neutral signal");
            return Ok(vec![]);
        }
        if signal.confidence < self.settings.min_signal_confidence {
            debug!(symbol = %signal.symbol, confidence = signal.confidence, "dropping low-confidence signal");
            return Ok(vec![]);
        }
        if signal.is_stale(Utc::now()) {
            debug!(symbol = %signal.symbol, "dropping stale signal");
            return Ok(vec![]);
        }

        let fused_strength = (signal.strength * (0.8 + 0.2 * signal.confidence)).min(1.0);
        let fused = SignalEvent {
            strength: fused_strength,
            generated_at: Utc::now(),
            rationale: format!("fused: {}", signal.rationale),
            ..signal.clone()
        };

        {
            let mut last = self.last_signal.lock();
            if let Some(prior) = last.get(&signal.symbol) {
                if Self::conflicts(prior, &signal) {
                    debug!(symbol = %signal.symbol, "dropping conflicting signal");
                    return Ok(vec![]);
                }
            }
            last.insert(signal.symbol.clone(), fused.clone());
        }

        Ok(vec![(
            streams::SIGNAL_TRADEABLE.to_string(),
            serde_json::to_value(fused)?,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn stage() -> SignalFusionStage {
        let mut settings = AppSettings::from_env();
        settings.min_signal_confidence = 0.5;
        SignalFusionStage::new(Arc::new(settings))
    }

    fn signal(symbol: &str, side: i8, confidence: f64, age_sec: i64) -> SignalEvent {
        SignalEvent {
            schema_version: "1.0".into(),
            event_id: "e1".into(),
            symbol: symbol.into(),
            side,
            strength: 0.8,
            confidence,
            horizon_min: 60,
            ttl_sec: 3600,
            rationale: "x".into(),
            generated_at: Utc::now() - Duration::seconds(age_sec),
        }
    }

    #[tokio::test]
    async fn neutral_signal_is_dropped() {
        let stage = stage();
        let out = stage
            .handle(serde_json::to_value(signal("BTCUSDT", 0, 0.9, 0)).unwrap())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn low_confidence_signal_is_dropped() {
        let stage = stage();
        let out = stage
            .handle(serde_json::to_value(signal("BTCUSDT", 1, 0.2, 0)).unwrap())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn stale_signal_is_dropped() {
        let stage = stage();
        let out = stage
            .handle(serde_json::to_value(signal("BTCUSDT", 1, 0.9, 4000)).unwrap())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn conflicting_signal_within_window_is_dropped() {
        let stage = stage();
        stage
            .handle(serde_json::to_value(signal("BTCUSDT", 1, 0.9, 0)).unwrap())
            .await
            .unwrap();

        let out = stage
            .handle(serde_json::to_value(signal("BTCUSDT", -1, 0.9, 0)).unwrap())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn surviving_signal_has_boosted_strength() {
        let stage = stage();
        let out = stage
            .handle(serde_json::to_value(signal("BTCUSDT", 1, 0.9, 0)).unwrap())
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        let fused: SignalEvent = serde_json::from_value(out[0].1.clone()).unwrap();
        // strength=0.8 * (0.8 + 0.2*0.9) = 0.8 * 0.98 = 0.784
        assert!((fused.strength - 0.784).abs() < 1e-9);
    }
}

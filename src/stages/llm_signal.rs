// =============================================================================
// LlmSignalStage — news.entity -> signal.raw
// =============================================================================
//
// Grounded on `apps/llm_signal_service.py`. A pluggable `LLMProvider` trait
// separates the OpenAI-backed provider from a deterministic keyword
// heuristic used when no API key is configured or the call fails — the
// heuristic is never a "mock", it's the source's actual fallback path.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AppSettings;
use crate::types::{streams, EntityEvent, SignalEvent};
use crate::worker::StageHandler;

static POSITIVE_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "surge", "rally", "adoption", "partnership", "bullish", "inflow", "upgrade", "approval",
    ]
});

static NEGATIVE_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "hack", "exploit", "lawsuit", "ban", "crash", "bearish", "outflow", "delist",
    ]
});

#[derive(Debug, Clone)]
pub struct HeuristicOutcome {
    pub side: i8,
    pub strength: f64,
    pub confidence: f64,
    pub horizon_min: u32,
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Returns `None` to signal the caller should fall back to the
    /// heuristic (no provider configured, transient failure).
    async fn classify(&self, text: &str) -> Option<HeuristicOutcome>;
}

/// Deterministic keyword-count heuristic, used whenever no LLM provider is
/// configured or the provider call fails after retries.
pub struct HeuristicProvider;

impl HeuristicProvider {
    pub fn classify(text: &str) -> HeuristicOutcome {
        let lower = text.to_lowercase();
        let positive = POSITIVE_KEYWORDS.iter().filter(|k| lower.contains(**k)).count();
        let negative = NEGATIVE_KEYWORDS.iter().filter(|k| lower.contains(**k)).count();

        let side: i8 = match positive.cmp(&negative) {
            std::cmp::Ordering::Greater => 1,
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
        };
        let edge = (positive as i64 - negative as i64).unsigned_abs() as f64;
        let strength = (0.4 + edge * 0.15).min(1.0);
        let confidence = (0.55 + edge * 0.1).min(0.95);
        let horizon_min = if edge < 2.0 { 60 } else { 180 };

        HeuristicOutcome {
            side,
            strength,
            confidence,
            horizon_min,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiClassification {
    side: i8,
    strength: f64,
    confidence: f64,
    #[serde(default = "default_horizon")]
    horizon_min: u32,
}

fn default_horizon() -> u32 {
    60
}

fn parse_json_text(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        return Some(v);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end]).ok()
}

/// Calls the OpenAI chat completions API, retrying up to three times with
/// exponential backoff (0.5s, 1s, 2s), matching the source's `tenacity`
/// decorator.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
            api_key,
            model,
        }
    }

    async fn call_once(&self, text: &str) -> anyhow::Result<HeuristicOutcome> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "Classify crypto news as a trading signal. Reply with JSON: {\"side\": -1|0|1, \"strength\": 0..1, \"confidence\": 0..1, \"horizon_min\": int}."},
                {"role": "user", "content": text},
            ],
            "temperature": 0.0,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: Value = response.json().await?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing message content"))?;

        let json = parse_json_text(content)
            .ok_or_else(|| anyhow::anyhow!("could not locate JSON object in model output"))?;
        let classification: OpenAiClassification = serde_json::from_value(json)?;

        Ok(HeuristicOutcome {
            side: classification.side,
            strength: classification.strength,
            confidence: classification.confidence,
            horizon_min: classification.horizon_min,
        })
    }
}

#[async_trait]
impl LLMProvider for OpenAiProvider {
    async fn classify(&self, text: &str) -> Option<HeuristicOutcome> {
        let mut delay = Duration::from_millis(500);
        for attempt in 1..=3 {
            match self.call_once(text).await {
                Ok(outcome) => return Some(outcome),
                Err(err) => {
                    warn!(attempt, error = %err, "openai classification attempt failed");
                    if attempt == 3 {
                        return None;
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        None
    }
}

pub struct LlmSignalStage {
    settings: Arc<AppSettings>,
    provider: Option<Arc<dyn LLMProvider>>,
}

impl LlmSignalStage {
    pub fn new(settings: Arc<AppSettings>) -> Self {
        let provider: Option<Arc<dyn LLMProvider>> = settings.openai_api_key.clone().map(|key| {
            Arc::new(OpenAiProvider::new(key, settings.openai_model.clone())) as Arc<dyn LLMProvider>
        });
        Self { settings, provider }
    }
}

#[async_trait]
impl StageHandler for LlmSignalStage {
    fn name(&self) -> &str {
        "llm_signal"
    }

    async fn handle(&self, payload: Value) -> anyhow::Result<Vec<(String, Value)>> {
        let entity: EntityEvent = match serde_json::from_value(payload) {
            Ok(entity) => entity,
            Err(err) => {
                warn!(error = %err, "failed to decode news.entity record");
                return Ok(vec![]);
            }
        };

        let text = format!("{} {}", entity.title, entity.content);
        let outcome = match &self.provider {
            Some(provider) => match provider.classify(&text).await {
                Some(outcome) => outcome,
                None => {
                    debug!("llm provider unavailable, falling back to heuristic");
                    HeuristicProvider::classify(&text)
                }
            },
            None => HeuristicProvider::classify(&text),
        };

        let mut outputs = Vec::with_capacity(entity.symbols.len());
        for symbol in &entity.symbols {
            let signal = SignalEvent {
                schema_version: "1.0".to_string(),
                event_id: entity.event_id.clone(),
                symbol: symbol.clone(),
                side: outcome.side,
                strength: outcome.strength,
                confidence: outcome.confidence,
                horizon_min: outcome.horizon_min,
                ttl_sec: self.settings.default_event_ttl_sec,
                rationale: format!("llm_signal: tags={:?}", entity.tags),
                generated_at: Utc::now(),
            }
            .validate()?;
            outputs.push((streams::SIGNAL_RAW.to_string(), serde_json::to_value(signal)?));
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_detects_bullish_keywords() {
        let outcome = HeuristicProvider::classify("Bitcoin rally continues amid adoption surge");
        assert_eq!(outcome.side, 1);
        assert!(outcome.strength > 0.0);
    }

    #[test]
    fn heuristic_detects_bearish_keywords() {
        let outcome = HeuristicProvider::classify("Exchange hack leads to lawsuit and ban");
        assert_eq!(outcome.side, -1);
    }

    #[test]
    fn heuristic_is_neutral_with_no_keywords() {
        let outcome = HeuristicProvider::classify("Quarterly earnings report released");
        assert_eq!(outcome.side, 0);
    }

    #[test]
    fn heuristic_formula_matches_edge_based_spec() {
        // edge = |positive - negative| = 1: "rally" + "adoption" (2) vs "bearish" (1)
        let outcome = HeuristicProvider::classify("Bitcoin rally amid adoption despite bearish fears");
        assert_eq!(outcome.side, 1);
        assert!((outcome.strength - 0.55).abs() < 1e-9);
        assert!((outcome.confidence - 0.65).abs() < 1e-9);
        assert_eq!(outcome.horizon_min, 60);
    }

    #[test]
    fn heuristic_wide_edge_extends_horizon() {
        // edge = 3: "surge"/"rally"/"adoption" with no negative hits
        let outcome = HeuristicProvider::classify("Bitcoin surge and rally amid adoption");
        assert_eq!(outcome.side, 1);
        assert!((outcome.strength - 0.85).abs() < 1e-9);
        assert!((outcome.confidence - 0.85).abs() < 1e-9);
        assert_eq!(outcome.horizon_min, 180);
    }

    #[test]
    fn parse_json_text_extracts_object_from_prose() {
        let text = "Here is the result: {\"side\": 1, \"strength\": 0.5, \"confidence\": 0.7} thanks!";
        let value = parse_json_text(text).unwrap();
        assert_eq!(value["side"], 1);
    }

    #[tokio::test]
    async fn stage_emits_one_signal_per_symbol() {
        let mut settings = AppSettings::from_env();
        settings.openai_api_key = None;
        let stage = LlmSignalStage::new(Arc::new(settings));

        let entity = EntityEvent {
            schema_version: "1.0".into(),
            event_id: "e1".into(),
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            tags: vec!["adoption".into()],
            regions: vec![],
            relevance_score: 0.8,
            title: "Bitcoin adoption surge".into(),
            content: "Institutions rally behind bitcoin".into(),
        };

        let out = stage
            .handle(serde_json::to_value(entity).unwrap())
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
    }
}

// =============================================================================
// EntityStage — news.raw -> news.entity
// =============================================================================
//
// Extracts traded symbols and coarse tags from a news item's title+content.
// Grounded on `apps/entity_service.py`: a universe substring match plus a
// word-boundary alias regex for symbol extraction, and a keyword->tag table
// for tagging. `relevance_score` rewards tag/symbol richness, capped at 1.0.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::config::AppSettings;
use crate::types::{streams, EntityEvent, NewsEvent};
use crate::worker::StageHandler;

static SYMBOL_ALIASES: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("bitcoin", "BTCUSDT"),
        ("ethereum", "ETHUSDT"),
        ("bnb", "BNBUSDT"),
        ("solana", "SOLUSDT"),
        ("xrp", "XRPUSDT"),
        ("cardano", "ADAUSDT"),
        ("dogecoin", "DOGEUSDT"),
        ("chainlink", "LINKUSDT"),
        ("avalanche", "AVAXUSDT"),
        ("toncoin", "TONUSDT"),
    ]
});

static TAG_KEYWORDS: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("etf", "macro"),
        ("hack", "security"),
        ("exploit", "security"),
        ("partnership", "adoption"),
        ("listing", "exchange"),
        ("delist", "exchange"),
        ("regulation", "regulation"),
        ("sec", "regulation"),
    ]
});

fn alias_pattern(alias: &str) -> Regex {
    Regex::new(&format!(r"\b{}\b", regex::escape(alias))).expect("alias pattern is valid")
}

pub struct EntityStage {
    settings: Arc<AppSettings>,
}

impl EntityStage {
    pub fn new(settings: Arc<AppSettings>) -> Self {
        Self { settings }
    }

    fn extract_symbols(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        let mut symbols = Vec::new();

        for symbol in &self.settings.universe_symbols {
            if lower.contains(&symbol.to_lowercase()) && !symbols.contains(symbol) {
                symbols.push(symbol.clone());
            }
        }

        for (alias, symbol) in SYMBOL_ALIASES.iter() {
            let symbol = symbol.to_string();
            if symbols.contains(&symbol) {
                continue;
            }
            if alias_pattern(alias).is_match(&lower) {
                symbols.push(symbol);
            }
        }

        symbols.sort();
        symbols.dedup();
        symbols
    }

    fn extract_tags(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        let mut tags = Vec::new();
        for (keyword, tag) in TAG_KEYWORDS.iter() {
            if lower.contains(keyword) && !tags.contains(&tag.to_string()) {
                tags.push(tag.to_string());
            }
        }
        tags.sort();
        tags.dedup();
        tags
    }
}

#[async_trait]
impl StageHandler for EntityStage {
    fn name(&self) -> &str {
        "entity"
    }

    async fn handle(&self, payload: Value) -> anyhow::Result<Vec<(String, Value)>> {
        let news: NewsEvent = match serde_json::from_value(payload) {
            Ok(news) => news,
            Err(err) => {
                warn!(error = %err, "failed to decode news.raw record");
                return Ok(vec![]);
            }
        };

        let combined = format!("{} {}", news.title, news.content);
        let symbols = self.extract_symbols(&combined);
        if symbols.is_empty() {
            return Ok(vec![]);
        }
        let tags = self.extract_tags(&combined);
        let relevance_score = (0.5 + 0.1 * tags.len() as f64 + 0.1 * symbols.len() as f64).min(1.0);

        let event = EntityEvent {
            schema_version: "1.0".to_string(),
            event_id: news.event_id,
            symbols,
            tags,
            regions: vec![],
            relevance_score,
            title: news.title,
            content: news.content,
        }
        .validate()?;

        Ok(vec![(streams::NEWS_ENTITY.to_string(), serde_json::to_value(event)?)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stage() -> EntityStage {
        let mut settings = AppSettings::from_env();
        settings.universe_symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        EntityStage::new(Arc::new(settings))
    }

    fn news(title: &str, content: &str) -> NewsEvent {
        NewsEvent {
            schema_version: "1.0".into(),
            event_id: "e1".into(),
            source: "coindesk".into(),
            published_at: Utc::now(),
            title: title.to_string(),
            content: content.to_string(),
            lang: "en".into(),
            url: "".into(),
            dedup_hash: "h".into(),
        }
    }

    #[tokio::test]
    async fn extracts_universe_symbol_and_alias() {
        let stage = stage();
        let news = news(
            "Bitcoin rallies as BTCUSDT volume spikes",
            "Ethereum also saw gains.",
        );
        let out = stage
            .handle(serde_json::to_value(news).unwrap())
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        let entity: EntityEvent = serde_json::from_value(out[0].1.clone()).unwrap();
        assert!(entity.symbols.contains(&"BTCUSDT".to_string()));
        assert!(entity.symbols.contains(&"ETHUSDT".to_string()));
    }

    #[tokio::test]
    async fn no_recognized_symbol_drops_the_record() {
        let stage = stage();
        let news = news("Local weather forecast", "Rain expected this weekend.");
        let out = stage
            .handle(serde_json::to_value(news).unwrap())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn etf_and_partnership_map_to_tags() {
        let stage = stage();
        let news = news(
            "Bitcoin ETF approval fuels new partnership talks",
            "Major asset managers confirm new bitcoin ETF partnership.",
        );
        let out = stage
            .handle(serde_json::to_value(news).unwrap())
            .await
            .unwrap();
        let entity: EntityEvent = serde_json::from_value(out[0].1.clone()).unwrap();
        assert!(entity.tags.contains(&"macro".to_string()));
        assert!(entity.tags.contains(&"adoption".to_string()));
    }

    #[tokio::test]
    async fn relevance_score_is_capped_at_one() {
        let stage = stage();
        let news = news(
            "Bitcoin ETF hack exploit partnership listing delist regulation SEC",
            "Ethereum BTCUSDT ETHUSDT",
        );
        let out = stage
            .handle(serde_json::to_value(news).unwrap())
            .await
            .unwrap();
        let entity: EntityEvent = serde_json::from_value(out[0].1.clone()).unwrap();
        assert!(entity.relevance_score <= 1.0);
    }
}

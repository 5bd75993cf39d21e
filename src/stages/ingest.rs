// =============================================================================
// IngestStage — polls news feeds, dedups, publishes to news.raw
// =============================================================================
//
// Grounded on `apps/ingest_service.py`. Timer-driven like `PositionSyncStage`
// rather than stream-driven: it's the source of `news.raw`, not a consumer
// of anything on the bus. `dedup_hash` is `sha256(source|title|url)` over
// lowercased, trimmed fields, and `event_id` is its first 16 hex chars,
// matching the source exactly so replayed/re-fetched items are idempotent.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::AppSettings;
use crate::dedup::DedupStore;
use crate::types::{streams, NewsEvent};

fn default_feeds() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("coindesk", "https://www.coindesk.com/arc/outboundfeeds/rss/"),
        ("cointelegraph", "https://cointelegraph.com/rss"),
    ])
}

pub struct IngestStage {
    settings: Arc<AppSettings>,
    bus: Arc<dyn EventBus>,
    dedup: Arc<dyn DedupStore>,
    client: reqwest::Client,
    feeds: HashMap<&'static str, &'static str>,
}

impl IngestStage {
    pub fn new(settings: Arc<AppSettings>, bus: Arc<dyn EventBus>, dedup: Arc<dyn DedupStore>) -> Self {
        Self {
            settings,
            bus,
            dedup,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .expect("failed to build reqwest client"),
            feeds: default_feeds(),
        }
    }

    fn make_dedup_hash(source: &str, title: &str, url: &str) -> String {
        let raw = format!(
            "{}|{}|{}",
            source,
            title.trim().to_lowercase(),
            url.trim().to_lowercase()
        );
        let digest = Sha256::digest(raw.as_bytes());
        hex::encode(digest)
    }

    async fn fetch_feed(&self, source: &str, url: &str) -> Vec<NewsEvent> {
        let mut out = Vec::new();

        let bytes = match self.client.get(url).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.bytes().await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(feed = source, error = %err, "failed to read feed body");
                        return out;
                    }
                },
                Err(err) => {
                    warn!(feed = source, error = %err, "feed request returned an error status");
                    return out;
                }
            },
            Err(err) => {
                warn!(feed = source, error = %err, "failed to fetch feed");
                return out;
            }
        };

        let channel = match rss::Channel::read_from(&bytes[..]) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(feed = source, error = %err, "failed to parse feed");
                return out;
            }
        };

        for item in channel.items() {
            let title = item.title().unwrap_or_default().trim().to_string();
            if title.is_empty() {
                continue;
            }
            let content = item
                .description()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(&title)
                .to_string();
            let link = item.link().unwrap_or_default().trim().to_string();

            let dedup_hash = Self::make_dedup_hash(source, &title, &link);
            match self
                .dedup
                .seen_or_add(&dedup_hash, self.settings.default_event_ttl_sec)
                .await
            {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    warn!(feed = source, error = %err, "dedup check failed, skipping item");
                    continue;
                }
            }

            let published_at = item
                .pub_date()
                .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            out.push(NewsEvent {
                schema_version: "1.0".to_string(),
                event_id: dedup_hash.chars().take(16).collect(),
                source: source.to_string(),
                published_at,
                title,
                content,
                lang: "en".to_string(),
                url: link,
                dedup_hash,
            });
        }

        out
    }

    pub async fn run_once(&self) -> usize {
        let mut total = 0;
        for (source, url) in &self.feeds {
            for event in self.fetch_feed(source, url).await {
                match serde_json::to_value(&event) {
                    Ok(payload) => {
                        if let Err(err) = self.bus.publish(streams::NEWS_RAW, payload).await {
                            warn!(error = %err, "failed to publish ingested news event");
                            continue;
                        }
                        total += 1;
                    }
                    Err(err) => warn!(error = %err, "failed to encode ingested news event"),
                }
            }
        }
        info!(published = total, "ingest cycle complete");
        total
    }

    pub async fn run(self: Arc<Self>, interval_sec: u64, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_sec.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("ingest stopping on shutdown signal");
                        return;
                    }
                }
            }
        }
    }
}

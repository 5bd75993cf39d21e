// =============================================================================
// MonitoringStage — human-readable alerts to Telegram
// =============================================================================
//
// Grounded on `apps/monitoring_alert_service.py`'s `TelegramNotifier` and
// `MonitoringAlertService`. Four source streams (`news.raw`,
// `order.rejected`, `execution.report`, `risk.alert`), one `MonitoringStage`
// instance per stream selected by `MonitoringKind`, same shape as
// `PersistenceStage`. None of the handlers publish anything downstream.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::AppSettings;
use crate::types::{ExecutionReport, NewsEvent, RiskAlert, RiskDecision};
use crate::worker::StageHandler;

const TITLE_MAX_LEN: usize = 180;

/// Sends a line of text to Telegram, falling back to a structured log line
/// when no bot token/chat id is configured (paper/dev setups).
pub struct TelegramNotifier {
    token: Option<String>,
    chat_id: Option<String>,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(settings: &AppSettings) -> Self {
        Self {
            token: settings.telegram_bot_token.clone(),
            chat_id: settings.telegram_chat_id.clone(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    pub async fn send(&self, text: &str) {
        let (Some(token), Some(chat_id)) = (&self.token, &self.chat_id) else {
            info!(alert = text, "alert (telegram not configured)");
            return;
        };

        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let result = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await;

        if let Err(err) = result {
            warn!(error = %err, "telegram send failed");
        }
    }
}

fn truncate_title(title: &str) -> String {
    if title.chars().count() <= TITLE_MAX_LEN {
        return title.to_string();
    }
    let keep = TITLE_MAX_LEN - 3;
    let truncated: String = title.chars().take(keep).collect();
    format!("{truncated}...")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringKind {
    News,
    Rejected,
    Execution,
    RiskAlert,
}

pub struct MonitoringStage {
    notifier: Arc<TelegramNotifier>,
    kind: MonitoringKind,
}

impl MonitoringStage {
    pub fn new(notifier: Arc<TelegramNotifier>, kind: MonitoringKind) -> Self {
        Self { notifier, kind }
    }
}

#[async_trait]
impl StageHandler for MonitoringStage {
    fn name(&self) -> &str {
        match self.kind {
            MonitoringKind::News => "monitoring::news",
            MonitoringKind::Rejected => "monitoring::rejected",
            MonitoringKind::Execution => "monitoring::execution",
            MonitoringKind::RiskAlert => "monitoring::risk_alert",
        }
    }

    async fn handle(&self, payload: Value) -> anyhow::Result<Vec<(String, Value)>> {
        let message = match self.kind {
            MonitoringKind::News => match serde_json::from_value::<NewsEvent>(payload) {
                Ok(event) => format!(
                    "[NEWS] source={}\ntitle={}\nurl={}",
                    event.source,
                    truncate_title(&event.title),
                    event.url
                ),
                Err(err) => {
                    warn!(error = %err, "failed to decode news.raw record for monitoring");
                    return Ok(vec![]);
                }
            },
            MonitoringKind::Rejected => match serde_json::from_value::<RiskDecision>(payload) {
                Ok(decision) => format!(
                    "[REJECTED] intent={} reason={} cap={}",
                    decision.intent_id, decision.reason_code, decision.capped_qty_usd
                ),
                Err(err) => {
                    warn!(error = %err, "failed to decode order.rejected record for monitoring");
                    return Ok(vec![]);
                }
            },
            MonitoringKind::Execution => match serde_json::from_value::<ExecutionReport>(payload) {
                Ok(report) => format!(
                    "[EXEC] order={} {} status={} qty={} px={}",
                    report.order_id, report.symbol, report.status, report.filled_qty, report.avg_price
                ),
                Err(err) => {
                    warn!(error = %err, "failed to decode execution.report record for monitoring");
                    return Ok(vec![]);
                }
            },
            MonitoringKind::RiskAlert => match serde_json::from_value::<RiskAlert>(payload) {
                Ok(alert) => format!("[RISK] {}", alert.message),
                Err(err) => {
                    warn!(error = %err, "failed to decode risk.alert record for monitoring");
                    return Ok(vec![]);
                }
            },
        };

        self.notifier.send(&message).await;
        Ok(vec![])
    }
}

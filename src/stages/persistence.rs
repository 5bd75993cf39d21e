// =============================================================================
// PersistenceStage — idempotent upserts into Postgres
// =============================================================================
//
// Grounded on `apps/persistence_service.py` for the merge semantics and on
// the query style of `libs/exchange-adapters` + the pack's db.rs examples
// for plain `sqlx::query`/`query_as` (no compile-time `query!` macros, since
// there is no live database to check against at build time).
//
// One `PersistenceStage` per source stream, selected by `PersistenceKind` at
// construction — each upserts into its own table keyed by primary id, plus
// an append-only audit row for execution reports. The one non-trivial piece
// is `merge_execution_state`: a pure function so the merge rule can be
// tested without a database.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;

use crate::types::{
    ExecutionReport, ExecutionStatus, NewsEvent, OrderIntent, PnLSnapshot, RiskDecision,
};
use crate::worker::StageHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceKind {
    News,
    OrderIntent,
    RiskDecision,
    ExecutionReport,
    PnlSnapshot,
}

pub struct PersistenceStage {
    pool: PgPool,
    kind: PersistenceKind,
}

impl PersistenceStage {
    pub fn new(pool: PgPool, kind: PersistenceKind) -> Self {
        Self { pool, kind }
    }
}

/// The merge-relevant columns of an `execution_reports` row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionRow {
    pub status: ExecutionStatus,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub fee: f64,
    pub ts: DateTime<Utc>,
}

impl From<&ExecutionReport> for ExecutionRow {
    fn from(report: &ExecutionReport) -> Self {
        Self {
            status: report.status,
            filled_qty: report.filled_qty,
            avg_price: report.avg_price,
            fee: report.fee,
            ts: report.ts,
        }
    }
}

/// Merges `incoming` into `current` per the status-rank / last-write-wins
/// rule in §4.11. `current = None` means "no row yet" — insert as-is.
pub fn merge_execution_state(current: Option<ExecutionRow>, incoming: ExecutionRow) -> ExecutionRow {
    let Some(current) = current else {
        return incoming;
    };

    let take_incoming_status = incoming.status.rank() > current.status.rank()
        || (incoming.status.rank() == current.status.rank() && incoming.ts >= current.ts);

    ExecutionRow {
        status: if take_incoming_status { incoming.status } else { current.status },
        filled_qty: current.filled_qty.max(incoming.filled_qty),
        fee: current.fee.max(incoming.fee),
        ts: current.ts.max(incoming.ts),
        avg_price: if incoming.filled_qty >= current.filled_qty {
            incoming.avg_price
        } else {
            current.avg_price
        },
    }
}

impl PersistenceStage {
    async fn persist_news(&self, event: NewsEvent) -> anyhow::Result<()> {
        sqlx::query(
            "insert into news_events (event_id, source, published_at, title, content, lang, url, dedup_hash) \
             values ($1, $2, $3, $4, $5, $6, $7, $8) \
             on conflict (event_id) do update set \
               source = excluded.source, title = excluded.title, content = excluded.content",
        )
        .bind(&event.event_id)
        .bind(&event.source)
        .bind(event.published_at)
        .bind(&event.title)
        .bind(&event.content)
        .bind(&event.lang)
        .bind(&event.url)
        .bind(&event.dedup_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_order_intent(&self, intent: OrderIntent) -> anyhow::Result<()> {
        sqlx::query(
            "insert into order_intents (intent_id, event_id, symbol, market, side, qty_usd, max_slippage_bps, reason) \
             values ($1, $2, $3, $4, $5, $6, $7, $8) \
             on conflict (intent_id) do nothing",
        )
        .bind(&intent.intent_id)
        .bind(&intent.event_id)
        .bind(&intent.symbol)
        .bind(intent.market.to_string())
        .bind(intent.side as i16)
        .bind(intent.qty_usd)
        .bind(intent.max_slippage_bps as i32)
        .bind(&intent.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_risk_decision(&self, decision: RiskDecision) -> anyhow::Result<()> {
        sqlx::query(
            "insert into risk_decisions (intent_id, allow, reason_code, capped_qty_usd) \
             values ($1, $2, $3, $4) \
             on conflict (intent_id) do update set \
               allow = excluded.allow, reason_code = excluded.reason_code, capped_qty_usd = excluded.capped_qty_usd",
        )
        .bind(&decision.intent_id)
        .bind(decision.allow)
        .bind(&decision.reason_code)
        .bind(decision.capped_qty_usd)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_execution_report(&self, report: ExecutionReport) -> anyhow::Result<()> {
        let current = sqlx::query_as::<_, (String, f64, f64, f64, DateTime<Utc>)>(
            "select status, filled_qty, avg_price, fee, ts from execution_reports where order_id = $1",
        )
        .bind(&report.order_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|(status, filled_qty, avg_price, fee, ts)| ExecutionRow {
            status: parse_execution_status(&status),
            filled_qty,
            avg_price,
            fee,
            ts,
        });

        let merged = merge_execution_state(current, ExecutionRow::from(&report));

        sqlx::query(
            "insert into execution_reports (order_id, intent_id, symbol, market, side, status, filled_qty, avg_price, fee, ts) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             on conflict (order_id) do update set \
               status = excluded.status, filled_qty = excluded.filled_qty, \
               avg_price = excluded.avg_price, fee = excluded.fee, ts = excluded.ts",
        )
        .bind(&report.order_id)
        .bind(&report.intent_id)
        .bind(&report.symbol)
        .bind(report.market.to_string())
        .bind(report.side as i16)
        .bind(merged.status.to_string())
        .bind(merged.filled_qty)
        .bind(merged.avg_price)
        .bind(merged.fee)
        .bind(merged.ts)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "insert into execution_report_events (order_id, status, filled_qty, avg_price, fee, ts) \
             values ($1, $2, $3, $4, $5, $6) \
             on conflict (order_id, status, filled_qty, avg_price, fee, ts) do nothing",
        )
        .bind(&report.order_id)
        .bind(report.status.to_string())
        .bind(report.filled_qty)
        .bind(report.avg_price)
        .bind(report.fee)
        .bind(report.ts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn persist_pnl_snapshot(&self, snapshot: PnLSnapshot) -> anyhow::Result<()> {
        sqlx::query(
            "insert into pnl_snapshots (account, ts, unrealized, realized, exposure, drawdown) \
             values ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&snapshot.account)
        .bind(snapshot.ts)
        .bind(snapshot.unrealized)
        .bind(snapshot.realized)
        .bind(snapshot.exposure)
        .bind(snapshot.drawdown)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_execution_status(s: &str) -> ExecutionStatus {
    match s {
        "new" => ExecutionStatus::New,
        "partially_filled" => ExecutionStatus::PartiallyFilled,
        "filled" => ExecutionStatus::Filled,
        "rejected" => ExecutionStatus::Rejected,
        _ => ExecutionStatus::Canceled,
    }
}

#[async_trait]
impl StageHandler for PersistenceStage {
    fn name(&self) -> &str {
        match self.kind {
            PersistenceKind::News => "persistence::news",
            PersistenceKind::OrderIntent => "persistence::order_intent",
            PersistenceKind::RiskDecision => "persistence::risk_decision",
            PersistenceKind::ExecutionReport => "persistence::execution_report",
            PersistenceKind::PnlSnapshot => "persistence::pnl_snapshot",
        }
    }

    async fn handle(&self, payload: Value) -> anyhow::Result<Vec<(String, Value)>> {
        let result = match self.kind {
            PersistenceKind::News => match serde_json::from_value::<NewsEvent>(payload) {
                Ok(event) => self.persist_news(event).await,
                Err(err) => {
                    warn!(error = %err, "failed to decode news.raw record for persistence");
                    return Ok(vec![]);
                }
            },
            PersistenceKind::OrderIntent => match serde_json::from_value::<OrderIntent>(payload) {
                Ok(intent) => self.persist_order_intent(intent).await,
                Err(err) => {
                    warn!(error = %err, "failed to decode order.intent record for persistence");
                    return Ok(vec![]);
                }
            },
            PersistenceKind::RiskDecision => match serde_json::from_value::<RiskDecision>(payload) {
                Ok(decision) => self.persist_risk_decision(decision).await,
                Err(err) => {
                    warn!(error = %err, "failed to decode order.rejected record for persistence");
                    return Ok(vec![]);
                }
            },
            PersistenceKind::ExecutionReport => {
                match serde_json::from_value::<ExecutionReport>(payload) {
                    Ok(report) => self.persist_execution_report(report).await,
                    Err(err) => {
                        warn!(error = %err, "failed to decode execution.report record for persistence");
                        return Ok(vec![]);
                    }
                }
            }
            PersistenceKind::PnlSnapshot => match serde_json::from_value::<PnLSnapshot>(payload) {
                Ok(snapshot) => self.persist_pnl_snapshot(snapshot).await,
                Err(err) => {
                    warn!(error = %err, "failed to decode pnl.snapshot record for persistence");
                    return Ok(vec![]);
                }
            },
        };

        if let Err(err) = result {
            warn!(error = %err, stage = self.name(), "persistence upsert failed");
        }
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: ExecutionStatus, filled_qty: f64, avg_price: f64, fee: f64, ts_offset_sec: i64) -> ExecutionRow {
        ExecutionRow {
            status,
            filled_qty,
            avg_price,
            fee,
            ts: Utc::now() + chrono::Duration::seconds(ts_offset_sec),
        }
    }

    #[test]
    fn no_current_row_takes_incoming_verbatim() {
        let incoming = row(ExecutionStatus::New, 0.0, 0.0, 0.0, 0);
        let merged = merge_execution_state(None, incoming);
        assert_eq!(merged, incoming);
    }

    #[test]
    fn higher_rank_status_wins() {
        let current = row(ExecutionStatus::New, 0.0, 0.0, 0.0, 0);
        let incoming = row(ExecutionStatus::Filled, 1.0, 65000.0, 0.5, 1);
        let merged = merge_execution_state(Some(current), incoming);
        assert_eq!(merged.status, ExecutionStatus::Filled);
    }

    #[test]
    fn equal_rank_status_keeps_latest_by_timestamp() {
        let current = row(ExecutionStatus::Filled, 1.0, 65000.0, 0.0, 5);
        let incoming = row(ExecutionStatus::Canceled, 1.0, 65000.0, 0.0, 1);
        let merged = merge_execution_state(Some(current), incoming);
        // incoming.ts < current.ts, so current status is kept despite equal rank
        assert_eq!(merged.status, ExecutionStatus::Filled);
    }

    #[test]
    fn filled_qty_and_fee_take_the_max() {
        let current = row(ExecutionStatus::PartiallyFilled, 0.5, 65000.0, 0.1, 0);
        let incoming = row(ExecutionStatus::PartiallyFilled, 0.3, 65500.0, 0.2, 1);
        let merged = merge_execution_state(Some(current), incoming);
        assert_eq!(merged.filled_qty, 0.5);
        assert_eq!(merged.fee, 0.2);
    }

    #[test]
    fn avg_price_only_updates_when_incoming_filled_qty_is_not_smaller() {
        let current = row(ExecutionStatus::PartiallyFilled, 0.5, 65000.0, 0.0, 0);
        let stale = row(ExecutionStatus::PartiallyFilled, 0.3, 70000.0, 0.0, 1);
        let merged = merge_execution_state(Some(current), stale);
        assert_eq!(merged.avg_price, 65000.0);

        let fresher = row(ExecutionStatus::Filled, 1.0, 66000.0, 0.0, 2);
        let merged = merge_execution_state(Some(current), fresher);
        assert_eq!(merged.avg_price, 66000.0);
    }
}

// =============================================================================
// PositionPnlStage — execution.report -> pnl.snapshot
// =============================================================================
//
// Grounded on `apps/position_pnl_service.py`. Keeps a per-(market, symbol)
// `qty`/`avg_cost` and a process-global `realized` trail, updated with
// standard weighted-average-cost accounting:
//
// - opening/adding (same sign as the existing position): blend avg_cost by
//   notional.
// - closing (opposite sign): realize pnl on the overlapping quantity;
//   if the fill flips the position, the residual opens at the fill price
//   but keeps the pre-flip avg_cost — a known simplification carried over
//   from the source rather than fixed here.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::types::{streams, ExecutionReport, ExecutionStatus, Market, PnLSnapshot};
use crate::worker::StageHandler;

const EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, Default)]
struct Position {
    qty: f64,
    avg_cost: f64,
}

struct Inner {
    positions: HashMap<(Market, String), Position>,
    realized: f64,
}

pub struct PositionPnlStage {
    inner: Mutex<Inner>,
}

impl PositionPnlStage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                positions: HashMap::new(),
                realized: 0.0,
            }),
        }
    }

    fn apply_fill(inner: &mut Inner, report: &ExecutionReport) {
        let key = (report.market, report.symbol.clone());
        let position = inner.positions.entry(key).or_default();

        let signed_qty = report.side as f64 * report.filled_qty;
        let prev_qty = position.qty;
        let new_qty = prev_qty + signed_qty;

        let same_sign = prev_qty == 0.0 || prev_qty.signum() == signed_qty.signum();
        if same_sign {
            let prev_notional = position.avg_cost * prev_qty.abs();
            let added_notional = report.avg_price * signed_qty.abs();
            let denom = (prev_qty.abs() + signed_qty.abs()).max(EPSILON);
            position.avg_cost = (prev_notional + added_notional) / denom;
        } else {
            let closing = prev_qty.abs().min(signed_qty.abs());
            let pnl = prev_qty.signum() * (report.avg_price - position.avg_cost) * closing;
            inner.realized += pnl;
            // avg_cost is left unchanged for any residual opened by a flip.
        }
        position.qty = new_qty;
    }

    fn total_exposure(inner: &Inner) -> f64 {
        inner
            .positions
            .values()
            .map(|p| p.qty.abs() * p.avg_cost)
            .sum()
    }
}

impl Default for PositionPnlStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageHandler for PositionPnlStage {
    fn name(&self) -> &str {
        "position_pnl"
    }

    async fn handle(&self, payload: Value) -> anyhow::Result<Vec<(String, Value)>> {
        let decoded: ExecutionReport = match serde_json::from_value(payload) {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "failed to decode execution.report record");
                return Ok(vec![]);
            }
        };
        let report = match decoded.validate() {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "execution.report record failed validation");
                return Ok(vec![]);
            }
        };

        // Only filled/partially-filled reports move position; a rejected or
        // still-new order has no fill to account for.
        if !matches!(
            report.status,
            ExecutionStatus::Filled | ExecutionStatus::PartiallyFilled
        ) || report.filled_qty <= 0.0
        {
            return Ok(vec![]);
        }

        let mut inner = self.inner.lock();
        Self::apply_fill(&mut inner, &report);

        let realized_out = inner.realized - report.fee;
        let exposure = Self::total_exposure(&inner);
        let drawdown = (-inner.realized / 100_000.0).max(0.0);

        let snapshot = PnLSnapshot {
            schema_version: "1.0".to_string(),
            ts: Utc::now(),
            account: "paper".to_string(),
            unrealized: 0.0,
            realized: realized_out,
            exposure,
            drawdown,
        };

        Ok(vec![(
            streams::PNL_SNAPSHOT.to_string(),
            serde_json::to_value(snapshot)?,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Market;

    fn report(side: i8, filled_qty: f64, avg_price: f64, fee: f64) -> ExecutionReport {
        ExecutionReport {
            schema_version: "1.0".into(),
            order_id: "o1".into(),
            intent_id: "i1".into(),
            symbol: "BTCUSDT".into(),
            market: Market::Spot,
            side,
            status: ExecutionStatus::Filled,
            filled_qty,
            avg_price,
            fee,
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn opening_fill_sets_avg_cost_to_fill_price() {
        let stage = PositionPnlStage::new();
        let out = stage
            .handle(serde_json::to_value(report(1, 1.0, 65000.0, 1.0)).unwrap())
            .await
            .unwrap();
        let snapshot: PnLSnapshot = serde_json::from_value(out[0].1.clone()).unwrap();
        assert!((snapshot.realized - (-1.0)).abs() < 1e-6);
        assert!(snapshot.exposure > 0.0);
    }

    #[tokio::test]
    async fn closing_fill_realizes_pnl_on_price_move() {
        let stage = PositionPnlStage::new();
        stage
            .handle(serde_json::to_value(report(1, 1.0, 65000.0, 0.0)).unwrap())
            .await
            .unwrap();
        let out = stage
            .handle(serde_json::to_value(report(-1, 1.0, 66000.0, 0.0)).unwrap())
            .await
            .unwrap();
        let snapshot: PnLSnapshot = serde_json::from_value(out[0].1.clone()).unwrap();
        // long opened at 65000, closed at 66000 -> +1000 realized
        assert!((snapshot.realized - 1000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn drawdown_is_zero_while_realized_is_nonnegative() {
        let stage = PositionPnlStage::new();
        let out = stage
            .handle(serde_json::to_value(report(1, 1.0, 65000.0, 0.0)).unwrap())
            .await
            .unwrap();
        let snapshot: PnLSnapshot = serde_json::from_value(out[0].1.clone()).unwrap();
        assert_eq!(snapshot.drawdown, 0.0);
    }

    #[tokio::test]
    async fn rejected_report_produces_no_snapshot() {
        let stage = PositionPnlStage::new();
        let mut r = report(1, 0.0, 0.0, 0.0);
        r.status = ExecutionStatus::Rejected;
        let out = stage.handle(serde_json::to_value(r).unwrap()).await.unwrap();
        assert!(out.is_empty());
    }
}

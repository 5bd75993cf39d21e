// =============================================================================
// Wire event types shared across the Aurora news trading pipeline
// =============================================================================
//
// Every event on the bus carries a `schema_version` tag and is JSON-encodable.
// Side/status fields are validated at decode time rather than encoded as
// closed Rust enums where the source treats them as small integer literals
// (`side`), so that an out-of-range value produces a `DecodeError` the worker
// loop can log and skip rather than a panic.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_schema_version() -> String {
    "1.0".to_string()
}

/// Errors raised while validating a decoded event against the data model's
/// range invariants.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
    #[error("{field} must be non-empty")]
    Empty { field: &'static str },
    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),
}

// -----------------------------------------------------------------------
// Streams
// -----------------------------------------------------------------------

/// Stream names. Plain string constants, not an enum: stream names cross
/// the wire as strings on every bus call and are also user-supplied on the
/// replay API (`source_stream`), so a const table is the idiomatic shape
/// rather than a closed type needing round-trip string conversion at every
/// call site.
pub mod streams {
    pub const NEWS_RAW: &str = "news.raw";
    pub const NEWS_ENTITY: &str = "news.entity";
    pub const SIGNAL_RAW: &str = "signal.raw";
    pub const SIGNAL_TRADEABLE: &str = "signal.tradeable";
    pub const SIGNAL_UNIVERSE: &str = "signal.universe";
    pub const ORDER_INTENT: &str = "order.intent";
    pub const ORDER_APPROVED: &str = "order.approved";
    pub const ORDER_REJECTED: &str = "order.rejected";
    pub const EXECUTION_REPORT: &str = "execution.report";
    pub const PNL_SNAPSHOT: &str = "pnl.snapshot";
    pub const RISK_ALERT: &str = "risk.alert";

    pub const ALL: &[&str] = &[
        NEWS_RAW,
        NEWS_ENTITY,
        SIGNAL_RAW,
        SIGNAL_TRADEABLE,
        SIGNAL_UNIVERSE,
        ORDER_INTENT,
        ORDER_APPROVED,
        ORDER_REJECTED,
        EXECUTION_REPORT,
        PNL_SNAPSHOT,
        RISK_ALERT,
    ];
}

// -----------------------------------------------------------------------
// NewsEvent
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsEvent {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub event_id: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub content: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub url: String,
    pub dedup_hash: String,
}

fn default_lang() -> String {
    "en".to_string()
}

impl NewsEvent {
    pub fn validate(self) -> Result<Self, DecodeError> {
        if self.title.trim().is_empty() {
            return Err(DecodeError::Empty { field: "title" });
        }
        if self.dedup_hash.trim().is_empty() {
            return Err(DecodeError::Empty { field: "dedup_hash" });
        }
        Ok(self)
    }
}

// -----------------------------------------------------------------------
// EntityEvent
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEvent {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub event_id: String,
    pub symbols: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    pub relevance_score: f64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

impl EntityEvent {
    pub fn validate(self) -> Result<Self, DecodeError> {
        if self.symbols.is_empty() {
            return Err(DecodeError::Empty { field: "symbols" });
        }
        if !(0.0..=1.0).contains(&self.relevance_score) {
            return Err(DecodeError::OutOfRange {
                field: "relevance_score",
                value: self.relevance_score.to_string(),
            });
        }
        Ok(self)
    }
}

// -----------------------------------------------------------------------
// SignalEvent
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub event_id: String,
    pub symbol: String,
    /// -1, 0, or 1.
    pub side: i8,
    pub strength: f64,
    pub confidence: f64,
    pub horizon_min: u32,
    pub ttl_sec: u64,
    pub rationale: String,
    pub generated_at: DateTime<Utc>,
}

impl SignalEvent {
    pub fn validate(self) -> Result<Self, DecodeError> {
        if !matches!(self.side, -1 | 0 | 1) {
            return Err(DecodeError::OutOfRange {
                field: "side",
                value: self.side.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(DecodeError::OutOfRange {
                field: "strength",
                value: self.strength.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(DecodeError::OutOfRange {
                field: "confidence",
                value: self.confidence.to_string(),
            });
        }
        if self.horizon_min < 1 {
            return Err(DecodeError::OutOfRange {
                field: "horizon_min",
                value: self.horizon_min.to_string(),
            });
        }
        if self.ttl_sec < 1 {
            return Err(DecodeError::OutOfRange {
                field: "ttl_sec",
                value: self.ttl_sec.to_string(),
            });
        }
        Ok(self)
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.generated_at).num_milliseconds() as f64 / 1000.0 > self.ttl_sec as f64
    }
}

// -----------------------------------------------------------------------
// Market
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Spot,
    Perp,
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Perp => write!(f, "perp"),
        }
    }
}

impl Market {
    /// side > 0 trades spot (long-only), side < 0 trades perp (can short).
    pub fn for_side(side: i8) -> Self {
        if side > 0 {
            Self::Spot
        } else {
            Self::Perp
        }
    }
}

// -----------------------------------------------------------------------
// OrderIntent
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub intent_id: String,
    pub event_id: String,
    pub symbol: String,
    pub market: Market,
    /// -1 or 1.
    pub side: i8,
    pub qty_usd: f64,
    pub max_slippage_bps: u32,
    pub reason: String,
}

impl OrderIntent {
    pub fn validate(self) -> Result<Self, DecodeError> {
        if !matches!(self.side, -1 | 1) {
            return Err(DecodeError::OutOfRange {
                field: "side",
                value: self.side.to_string(),
            });
        }
        if self.qty_usd <= 0.0 {
            return Err(DecodeError::OutOfRange {
                field: "qty_usd",
                value: self.qty_usd.to_string(),
            });
        }
        if !(1..=200).contains(&self.max_slippage_bps) {
            return Err(DecodeError::OutOfRange {
                field: "max_slippage_bps",
                value: self.max_slippage_bps.to_string(),
            });
        }
        Ok(self)
    }
}

// -----------------------------------------------------------------------
// RiskDecision
// -----------------------------------------------------------------------

/// Structured rejection reasons. `Display` produces the exact
/// SCREAMING_SNAKE_CASE wire strings the risk stage emits as `reason_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    SymbolExposureLimit,
    MarketExposureLimit,
    SideExposureLimit,
    TotalExposureLimit,
    DailyDrawdownBreach,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SymbolExposureLimit => "SYMBOL_EXPOSURE_LIMIT",
            Self::MarketExposureLimit => "MARKET_EXPOSURE_LIMIT",
            Self::SideExposureLimit => "SIDE_EXPOSURE_LIMIT",
            Self::TotalExposureLimit => "TOTAL_EXPOSURE_LIMIT",
            Self::DailyDrawdownBreach => "DAILY_DRAWDOWN_BREACH",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDecision {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub intent_id: String,
    pub allow: bool,
    pub reason_code: String,
    pub capped_qty_usd: f64,
}

// -----------------------------------------------------------------------
// ExecutionReport
// -----------------------------------------------------------------------

/// Execution status. Rank order (`new < partially_filled < {filled,
/// rejected, canceled}`) is a method on the type, matching the status-rank
/// table used for execution-state merges during replay/reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    New,
    PartiallyFilled,
    Filled,
    Rejected,
    Canceled,
}

impl ExecutionStatus {
    pub fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::PartiallyFilled => 1,
            Self::Filled | Self::Rejected | Self::Canceled => 3,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub order_id: String,
    pub intent_id: String,
    pub symbol: String,
    pub market: Market,
    /// -1 or 1.
    pub side: i8,
    pub status: ExecutionStatus,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub fee: f64,
    pub ts: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn validate(self) -> Result<Self, DecodeError> {
        if !matches!(self.side, -1 | 1) {
            return Err(DecodeError::OutOfRange {
                field: "side",
                value: self.side.to_string(),
            });
        }
        if self.filled_qty < 0.0 {
            return Err(DecodeError::OutOfRange {
                field: "filled_qty",
                value: self.filled_qty.to_string(),
            });
        }
        if self.avg_price < 0.0 {
            return Err(DecodeError::OutOfRange {
                field: "avg_price",
                value: self.avg_price.to_string(),
            });
        }
        if self.fee < 0.0 {
            return Err(DecodeError::OutOfRange {
                field: "fee",
                value: self.fee.to_string(),
            });
        }
        Ok(self)
    }

    /// Dedup key: `(order_id, status, filled_qty rounded to 10 decimal
    /// places)`.
    pub fn dedup_key(&self) -> (String, ExecutionStatus, i64) {
        let scaled = (self.filled_qty * 1e10).round() as i64;
        (self.order_id.clone(), self.status, scaled)
    }
}

// -----------------------------------------------------------------------
// PnLSnapshot
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnLSnapshot {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub ts: DateTime<Utc>,
    #[serde(default = "default_account")]
    pub account: String,
    pub unrealized: f64,
    pub realized: f64,
    pub exposure: f64,
    pub drawdown: f64,
}

fn default_account() -> String {
    "paper".to_string()
}

// -----------------------------------------------------------------------
// Risk alert (monitoring-facing)
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAlert {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub message: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub drawdown: Option<f64>,
}

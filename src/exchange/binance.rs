// =============================================================================
// BinanceExchangeAdapter — live order routing over spot + USDT-M futures
// =============================================================================
//
// Signing follows the teacher's `binance::client::BinanceClient`: HMAC-SHA256
// over the query string, `X-MBX-APIKEY` header, a 5s recv window. Order
// semantics (market-buy/sell by quote qty on spot, by base qty on perp,
// status normalization) are grounded on `exchange_adapters/binance.py`.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use super::{AdapterEvent, ExchangeAdapter, PositionInfo};
use crate::types::{ExecutionReport, ExecutionStatus, Market, OrderIntent};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

fn parse_status(status: &str) -> ExecutionStatus {
    match status.to_lowercase().as_str() {
        "new" => ExecutionStatus::New,
        "partially_filled" => ExecutionStatus::PartiallyFilled,
        "filled" => ExecutionStatus::Filled,
        "rejected" => ExecutionStatus::Rejected,
        "canceled" | "cancelled" | "expired" => ExecutionStatus::Canceled,
        _ => ExecutionStatus::New,
    }
}

pub struct BinanceExchangeAdapter {
    api_key: String,
    secret: String,
    spot_base_url: String,
    perp_base_url: String,
    client: reqwest::Client,
}

impl BinanceExchangeAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, use_testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let (spot_base_url, perp_base_url) = if use_testnet {
            (
                "https://testnet.binance.vision".to_string(),
                "https://testnet.binancefuture.com".to_string(),
            )
        } else {
            (
                "https://api.binance.com".to_string(),
                "https://fapi.binance.com".to_string(),
            )
        };

        debug!(spot_base_url, perp_base_url, "BinanceExchangeAdapter initialised");

        Self {
            api_key,
            secret,
            spot_base_url,
            perp_base_url,
            client,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn base_url(&self, market: Market) -> &str {
        match market {
            Market::Spot => &self.spot_base_url,
            Market::Perp => &self.perp_base_url,
        }
    }

    #[instrument(skip(self), name = "binance::request")]
    async fn request(
        &self,
        method: reqwest::Method,
        market: Market,
        path: &str,
        query: &str,
    ) -> Result<serde_json::Value> {
        let url = format!("{}{}?{}", self.base_url(market), path, query);
        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response body")?;

        if !status.is_success() {
            bail!("Binance {path} returned {status}: {body}");
        }
        if let Some(code) = body.get("code").and_then(|c| c.as_i64()) {
            if code < 0 {
                bail!("Binance API error on {path}: {body}");
            }
        }
        Ok(body)
    }

    async fn fetch_mark_price(&self, symbol: &str) -> Result<f64> {
        let body = self
            .request(
                reqwest::Method::GET,
                Market::Perp,
                "/fapi/v1/ticker/price",
                &format!("symbol={symbol}"),
            )
            .await?;
        body["price"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .context("mark price response missing 'price'")
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceExchangeAdapter {
    #[instrument(skip(self, intent), fields(symbol = %intent.symbol), name = "binance::place_order")]
    async fn place_order(&self, intent: &OrderIntent) -> Result<ExecutionReport> {
        let side = if intent.side > 0 { "BUY" } else { "SELL" };
        let client_order_id = &intent.intent_id[..intent.intent_id.len().min(32)];

        let (order_id, status, filled_qty, avg_price, fee) = match intent.market {
            Market::Spot => {
                let params = format!(
                    "symbol={}&side={}&type=MARKET&quoteOrderQty={:.2}&newClientOrderId={}",
                    intent.symbol, side, intent.qty_usd, client_order_id
                );
                let qs = self.signed_query(&params);
                let data = self
                    .request(reqwest::Method::POST, Market::Spot, "/api/v3/order", &qs)
                    .await?;

                let filled_qty: f64 = data["executedQty"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                let fills = data["fills"].as_array().cloned().unwrap_or_default();
                let (avg_price, fee) = if !fills.is_empty() {
                    let mut total_quote = 0.0;
                    let mut total_qty = 0.0;
                    let mut fee = 0.0;
                    for item in &fills {
                        let p: f64 = item["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                        let q: f64 = item["qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                        total_quote += p * q;
                        total_qty += q;
                        fee += item["commission"]
                            .as_str()
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(0.0);
                    }
                    let avg_price = if total_qty > 0.0 { total_quote / total_qty } else { 0.0 };
                    (avg_price, fee)
                } else {
                    let cumulative_quote: f64 = data["cummulativeQuoteQty"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.0);
                    let avg_price = cumulative_quote / filled_qty.max(1e-9);
                    (avg_price, 0.0)
                };

                let order_id = format!(
                    "spot:{}:{}",
                    intent.symbol,
                    data["orderId"].as_i64().unwrap_or_default()
                );
                let status = parse_status(data["status"].as_str().unwrap_or("new"));
                (order_id, status, filled_qty, avg_price, fee)
            }
            Market::Perp => {
                let mark_price = self.fetch_mark_price(&intent.symbol).await?;
                let quantity = (intent.qty_usd / mark_price.max(1e-9) * 1000.0).round() / 1000.0;
                let quantity = quantity.max(0.001);

                let params = format!(
                    "symbol={}&side={}&type=MARKET&quantity={:.3}&newClientOrderId={}",
                    intent.symbol, side, quantity, client_order_id
                );
                let qs = self.signed_query(&params);
                let data = self
                    .request(reqwest::Method::POST, Market::Perp, "/fapi/v1/order", &qs)
                    .await?;

                let filled_qty: f64 = data["executedQty"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(quantity);
                let avg_price: f64 = data["avgPrice"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .filter(|p| *p > 0.0)
                    .unwrap_or(mark_price);

                let order_id = format!(
                    "perp:{}:{}",
                    intent.symbol,
                    data["orderId"].as_i64().unwrap_or_default()
                );
                let status = parse_status(data["status"].as_str().unwrap_or("new"));
                (order_id, status, filled_qty, avg_price, 0.0)
            }
        };

        Ok(ExecutionReport {
            schema_version: "1.0".to_string(),
            order_id,
            intent_id: intent.intent_id.clone(),
            symbol: intent.symbol.clone(),
            market: intent.market,
            side: intent.side,
            status,
            filled_qty,
            avg_price,
            fee,
            ts: Utc::now(),
        })
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let parts: Vec<&str> = order_id.split(':').collect();
        let [market_tag, symbol, exchange_order_id] = parts[..] else {
            bail!("order_id must be in format 'market:symbol:exchange_order_id', got {order_id}");
        };
        let market = match market_tag {
            "spot" => Market::Spot,
            "perp" => Market::Perp,
            other => bail!("unknown market tag in order_id: {other}"),
        };
        let path = match market {
            Market::Spot => "/api/v3/order",
            Market::Perp => "/fapi/v1/order",
        };
        let params = format!("symbol={symbol}&orderId={exchange_order_id}");
        let qs = self.signed_query(&params);
        self.request(reqwest::Method::DELETE, market, path, &qs).await?;
        Ok(true)
    }

    #[instrument(skip(self), name = "binance::fetch_positions")]
    async fn fetch_positions(&self) -> Result<Vec<PositionInfo>> {
        let mut positions = Vec::new();

        let spot_qs = self.signed_query("");
        let spot_account = self
            .request(reqwest::Method::GET, Market::Spot, "/api/v3/account", &spot_qs)
            .await?;
        for bal in spot_account["balances"].as_array().cloned().unwrap_or_default() {
            let free: f64 = bal["free"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let locked: f64 = bal["locked"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let total = free + locked;
            if total <= 0.0 {
                continue;
            }
            let asset = bal["asset"].as_str().unwrap_or_default().to_uppercase();
            if matches!(asset.as_str(), "USDT" | "BUSD" | "USDC") {
                continue;
            }
            let symbol = format!("{asset}USDT");
            let px = self.fetch_spot_price(&symbol).await.unwrap_or(0.0);
            positions.push(PositionInfo {
                market: Market::Spot,
                symbol,
                qty: total,
                notional_usd: total.abs() * px,
            });
        }

        let perp_qs = self.signed_query("");
        let perp_positions = self
            .request(
                reqwest::Method::GET,
                Market::Perp,
                "/fapi/v2/positionRisk",
                &perp_qs,
            )
            .await?;
        for pos in perp_positions.as_array().cloned().unwrap_or_default() {
            let qty: f64 = pos["positionAmt"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            if qty == 0.0 {
                continue;
            }
            let notional: f64 = pos["notional"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            positions.push(PositionInfo {
                market: Market::Perp,
                symbol: pos["symbol"].as_str().unwrap_or_default().to_string(),
                qty,
                notional_usd: notional.abs(),
            });
        }

        Ok(positions)
    }

    /// Real user-data-stream consumption needs a persistent websocket
    /// connection with listen-key keepalive; that plumbing isn't wired up
    /// here, so execution/alert events are surfaced by polling open orders
    /// instead. Good enough for the reconciliation loop in position sync,
    /// which only needs eventual consistency.
    #[instrument(skip(self), name = "binance::poll_execution_events")]
    async fn poll_execution_events(&self) -> Result<Vec<AdapterEvent>> {
        let mut events = Vec::new();
        for market in [Market::Spot, Market::Perp] {
            let path = match market {
                Market::Spot => "/api/v3/openOrders",
                Market::Perp => "/fapi/v1/openOrders",
            };
            let qs = self.signed_query("");
            let orders = match self.request(reqwest::Method::GET, market, path, &qs).await {
                Ok(v) => v,
                Err(err) => {
                    warn!(%market, error = %err, "failed to poll open orders");
                    events.push(AdapterEvent::Alert {
                        severity: "warning".to_string(),
                        message: format!("{market} open-orders poll failed: {err}"),
                    });
                    continue;
                }
            };
            for order in orders.as_array().cloned().unwrap_or_default() {
                let filled_qty: f64 = order["executedQty"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                let avg_price: f64 = order["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let side = if order["side"].as_str() == Some("BUY") { 1 } else { -1 };
                let order_id = format!(
                    "{}:{}:{}",
                    market,
                    order["symbol"].as_str().unwrap_or_default(),
                    order["orderId"].as_i64().unwrap_or_default()
                );
                events.push(AdapterEvent::Execution(ExecutionReport {
                    schema_version: "1.0".to_string(),
                    order_id,
                    intent_id: order["clientOrderId"].as_str().unwrap_or_default().to_string(),
                    symbol: order["symbol"].as_str().unwrap_or_default().to_string(),
                    market,
                    side,
                    status: parse_status(order["status"].as_str().unwrap_or("new")),
                    filled_qty,
                    avg_price,
                    fee: 0.0,
                    ts: Utc::now(),
                }));
            }
        }
        Ok(events)
    }
}

impl BinanceExchangeAdapter {
    async fn fetch_spot_price(&self, symbol: &str) -> Result<f64> {
        let body = self
            .request(
                reqwest::Method::GET,
                Market::Spot,
                "/api/v3/ticker/price",
                &format!("symbol={symbol}"),
            )
            .await?;
        body["price"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .context("spot price response missing 'price'")
    }
}

impl std::fmt::Debug for BinanceExchangeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceExchangeAdapter")
            .field("api_key", &"<redacted>")
            .field("spot_base_url", &self.spot_base_url)
            .field("perp_base_url", &self.perp_base_url)
            .finish()
    }
}

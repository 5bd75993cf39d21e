// =============================================================================
// TradingStateStore — shared exposure + daily PnL state
// =============================================================================
//
// Grounded on `feature_store/state.py`'s `TradingStateStore` ABC. The risk
// stage reads/increments per-symbol, per-market, per-side, and total USD
// exposure here; the position-sync stage periodically replaces the whole
// exposure snapshot with the exchange's ground truth. Daily realized PnL is
// tracked separately and reset by the caller at UTC day boundaries (the
// store itself is day-naive, matching the source).
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::Market;

#[derive(Debug, Clone, Default)]
pub struct ExposureSnapshot {
    /// symbol -> USD notional
    pub by_symbol: HashMap<String, f64>,
    /// market -> USD notional
    pub by_market: HashMap<Market, f64>,
    /// side (-1 or 1) -> USD notional
    pub by_side: HashMap<i8, f64>,
    pub total: f64,
}

#[async_trait]
pub trait TradingStateStore: Send + Sync {
    async fn get_symbol_exposure(&self, symbol: &str) -> anyhow::Result<f64>;
    async fn get_total_exposure(&self) -> anyhow::Result<f64>;
    async fn get_market_exposure(&self, market: Market) -> anyhow::Result<f64>;
    async fn get_side_exposure(&self, side: i8) -> anyhow::Result<f64>;

    async fn add_exposure(
        &self,
        symbol: &str,
        market: Market,
        side: i8,
        delta_usd: f64,
    ) -> anyhow::Result<()>;

    /// Atomically replaces the whole exposure snapshot (position-sync
    /// reconciliation against exchange truth).
    async fn replace_exposure_snapshot(&self, snapshot: ExposureSnapshot) -> anyhow::Result<()>;

    async fn get_daily_realized_pnl(&self) -> anyhow::Result<f64>;
    async fn add_daily_realized_pnl(&self, delta: f64) -> anyhow::Result<()>;
    async fn reset_daily_realized_pnl(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    snapshot: ExposureSnapshot,
    daily_realized_pnl: f64,
}

pub struct MemoryTradingStateStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryTradingStateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
        }
    }
}

impl Default for MemoryTradingStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradingStateStore for MemoryTradingStateStore {
    async fn get_symbol_exposure(&self, symbol: &str) -> anyhow::Result<f64> {
        Ok(self
            .inner
            .read()
            .snapshot
            .by_symbol
            .get(symbol)
            .copied()
            .unwrap_or(0.0))
    }

    async fn get_total_exposure(&self) -> anyhow::Result<f64> {
        Ok(self.inner.read().snapshot.total)
    }

    async fn get_market_exposure(&self, market: Market) -> anyhow::Result<f64> {
        Ok(self
            .inner
            .read()
            .snapshot
            .by_market
            .get(&market)
            .copied()
            .unwrap_or(0.0))
    }

    async fn get_side_exposure(&self, side: i8) -> anyhow::Result<f64> {
        Ok(self
            .inner
            .read()
            .snapshot
            .by_side
            .get(&side)
            .copied()
            .unwrap_or(0.0))
    }

    async fn add_exposure(
        &self,
        symbol: &str,
        market: Market,
        side: i8,
        delta_usd: f64,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        *inner
            .snapshot
            .by_symbol
            .entry(symbol.to_string())
            .or_insert(0.0) += delta_usd;
        *inner.snapshot.by_market.entry(market).or_insert(0.0) += delta_usd;
        *inner.snapshot.by_side.entry(side).or_insert(0.0) += delta_usd;
        inner.snapshot.total += delta_usd;
        Ok(())
    }

    async fn replace_exposure_snapshot(&self, snapshot: ExposureSnapshot) -> anyhow::Result<()> {
        self.inner.write().snapshot = snapshot;
        Ok(())
    }

    async fn get_daily_realized_pnl(&self) -> anyhow::Result<f64> {
        Ok(self.inner.read().daily_realized_pnl)
    }

    async fn add_daily_realized_pnl(&self, delta: f64) -> anyhow::Result<()> {
        self.inner.write().daily_realized_pnl += delta;
        Ok(())
    }

    async fn reset_daily_realized_pnl(&self) -> anyhow::Result<()> {
        self.inner.write().daily_realized_pnl = 0.0;
        Ok(())
    }
}

/// Redis-backed implementation: namespaced keys, `INCRBYFLOAT` for atomic
/// adds, and a scan+delete+pipeline-set for snapshot replacement, matching
/// `RedisTradingStateStore` in the source.
pub struct RedisTradingStateStore {
    client: redis::Client,
}

impl RedisTradingStateStore {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }

    async fn conn(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn market_key(market: Market) -> String {
    format!("exposure:market:{market}")
}

fn side_key(side: i8) -> String {
    format!("exposure:side:{side}")
}

#[async_trait]
impl TradingStateStore for RedisTradingStateStore {
    async fn get_symbol_exposure(&self, symbol: &str) -> anyhow::Result<f64> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let v: Option<f64> = conn.get(format!("exposure:symbol:{symbol}")).await?;
        Ok(v.unwrap_or(0.0))
    }

    async fn get_total_exposure(&self) -> anyhow::Result<f64> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let v: Option<f64> = conn.get("exposure:total").await?;
        Ok(v.unwrap_or(0.0))
    }

    async fn get_market_exposure(&self, market: Market) -> anyhow::Result<f64> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let v: Option<f64> = conn.get(market_key(market)).await?;
        Ok(v.unwrap_or(0.0))
    }

    async fn get_side_exposure(&self, side: i8) -> anyhow::Result<f64> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let v: Option<f64> = conn.get(side_key(side)).await?;
        Ok(v.unwrap_or(0.0))
    }

    async fn add_exposure(
        &self,
        symbol: &str,
        market: Market,
        side: i8,
        delta_usd: f64,
    ) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let _: f64 = conn
            .incr(format!("exposure:symbol:{symbol}"), delta_usd)
            .await?;
        let _: f64 = conn.incr(market_key(market), delta_usd).await?;
        let _: f64 = conn.incr(side_key(side), delta_usd).await?;
        let _: f64 = conn.incr("exposure:total", delta_usd).await?;
        Ok(())
    }

    async fn replace_exposure_snapshot(&self, snapshot: ExposureSnapshot) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.keys("exposure:*").await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        let mut pipe = redis::pipe();
        for (symbol, usd) in &snapshot.by_symbol {
            pipe.set(format!("exposure:symbol:{symbol}"), usd);
        }
        for (market, usd) in &snapshot.by_market {
            pipe.set(market_key(*market), usd);
        }
        for (side, usd) in &snapshot.by_side {
            pipe.set(side_key(*side), usd);
        }
        pipe.set("exposure:total", snapshot.total);
        pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_daily_realized_pnl(&self) -> anyhow::Result<f64> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let v: Option<f64> = conn.get("pnl:daily_realized").await?;
        Ok(v.unwrap_or(0.0))
    }

    async fn add_daily_realized_pnl(&self, delta: f64) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let _: f64 = conn.incr("pnl:daily_realized", delta).await?;
        Ok(())
    }

    async fn reset_daily_realized_pnl(&self) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let _: () = conn.set("pnl:daily_realized", 0.0_f64).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_exposure_accumulates_across_dimensions() {
        let store = MemoryTradingStateStore::new();
        store
            .add_exposure("BTCUSDT", Market::Spot, 1, 1000.0)
            .await
            .unwrap();
        store
            .add_exposure("BTCUSDT", Market::Spot, 1, 500.0)
            .await
            .unwrap();

        assert_eq!(store.get_symbol_exposure("BTCUSDT").await.unwrap(), 1500.0);
        assert_eq!(store.get_market_exposure(Market::Spot).await.unwrap(), 1500.0);
        assert_eq!(store.get_side_exposure(1).await.unwrap(), 1500.0);
        assert_eq!(store.get_total_exposure().await.unwrap(), 1500.0);
    }

    #[tokio::test]
    async fn replace_snapshot_overwrites_prior_state() {
        let store = MemoryTradingStateStore::new();
        store
            .add_exposure("BTCUSDT", Market::Spot, 1, 1000.0)
            .await
            .unwrap();

        let mut snapshot = ExposureSnapshot::default();
        snapshot.by_symbol.insert("ETHUSDT".to_string(), 300.0);
        snapshot.total = 300.0;
        store.replace_exposure_snapshot(snapshot).await.unwrap();

        assert_eq!(store.get_symbol_exposure("BTCUSDT").await.unwrap(), 0.0);
        assert_eq!(store.get_symbol_exposure("ETHUSDT").await.unwrap(), 300.0);
        assert_eq!(store.get_total_exposure().await.unwrap(), 300.0);
    }

    #[tokio::test]
    async fn daily_realized_pnl_accumulates_and_resets() {
        let store = MemoryTradingStateStore::new();
        store.add_daily_realized_pnl(100.0).await.unwrap();
        store.add_daily_realized_pnl(-30.0).await.unwrap();
        assert_eq!(store.get_daily_realized_pnl().await.unwrap(), 70.0);
        store.reset_daily_realized_pnl().await.unwrap();
        assert_eq!(store.get_daily_realized_pnl().await.unwrap(), 0.0);
    }
}

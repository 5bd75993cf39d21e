// =============================================================================
// OrchestratorStore — strategy toggle + runtime config hash
// =============================================================================
//
// Grounded on `services/orchestrator-api/app.py`'s direct `redis_client`
// calls for `strategy:active` and the `runtime:config` hash. Kept separate
// from `state_store::TradingStateStore` since it's orchestrator-control
// state, not exposure/PnL accounting.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

#[async_trait]
pub trait OrchestratorStore: Send + Sync {
    async fn get_strategy_active(&self) -> anyhow::Result<bool>;
    async fn set_strategy_active(&self, active: bool) -> anyhow::Result<()>;

    /// Merges `values` into the `runtime:config` hash, then returns the
    /// full hash — matching `config_update`'s read-after-write response.
    async fn update_runtime_config(
        &self,
        values: HashMap<String, String>,
    ) -> anyhow::Result<HashMap<String, String>>;
}

#[derive(Default)]
struct MemoryInner {
    strategy_active: bool,
    runtime_config: HashMap<String, String>,
}

pub struct MemoryOrchestratorStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryOrchestratorStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
        }
    }
}

impl Default for MemoryOrchestratorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrchestratorStore for MemoryOrchestratorStore {
    async fn get_strategy_active(&self) -> anyhow::Result<bool> {
        Ok(self.inner.read().strategy_active)
    }

    async fn set_strategy_active(&self, active: bool) -> anyhow::Result<()> {
        self.inner.write().strategy_active = active;
        Ok(())
    }

    async fn update_runtime_config(
        &self,
        values: HashMap<String, String>,
    ) -> anyhow::Result<HashMap<String, String>> {
        let mut inner = self.inner.write();
        inner.runtime_config.extend(values);
        Ok(inner.runtime_config.clone())
    }
}

pub struct RedisOrchestratorStore {
    client: redis::Client,
}

impl RedisOrchestratorStore {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }

    async fn conn(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl OrchestratorStore for RedisOrchestratorStore {
    async fn get_strategy_active(&self) -> anyhow::Result<bool> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let v: Option<String> = conn.get("strategy:active").await?;
        Ok(v.as_deref() == Some("1"))
    }

    async fn set_strategy_active(&self, active: bool) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let value = if active { "1" } else { "0" };
        conn.set::<_, _, ()>("strategy:active", value).await?;
        Ok(())
    }

    async fn update_runtime_config(
        &self,
        values: HashMap<String, String>,
    ) -> anyhow::Result<HashMap<String, String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        if !values.is_empty() {
            let pairs: Vec<(String, String)> = values.into_iter().collect();
            conn.hset_multiple::<_, _, _, ()>("runtime:config", &pairs).await?;
        }
        let all: HashMap<String, String> = conn.hgetall("runtime:config").await?;
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strategy_active_defaults_to_false_and_toggles() {
        let store = MemoryOrchestratorStore::new();
        assert!(!store.get_strategy_active().await.unwrap());
        store.set_strategy_active(true).await.unwrap();
        assert!(store.get_strategy_active().await.unwrap());
    }

    #[tokio::test]
    async fn runtime_config_merges_across_calls() {
        let store = MemoryOrchestratorStore::new();
        let mut first = HashMap::new();
        first.insert("risk_per_trade_pct".to_string(), "0.01".to_string());
        let out = store.update_runtime_config(first).await.unwrap();
        assert_eq!(out.get("risk_per_trade_pct").unwrap(), "0.01");

        let mut second = HashMap::new();
        second.insert("max_slippage_bps".to_string(), "25".to_string());
        let out = store.update_runtime_config(second).await.unwrap();
        assert_eq!(out.get("risk_per_trade_pct").unwrap(), "0.01");
        assert_eq!(out.get("max_slippage_bps").unwrap(), "25");
    }
}

// =============================================================================
// run_stream_worker — the canonical stream-consumer loop
// =============================================================================
//
// Every stage is the same shape: read from a cursor, decode + validate,
// hand the record to a handler that returns zero or more `(stream, payload)`
// outputs, publish those outputs, advance the cursor. A handler error is
// logged and the cursor still advances past the record — handlers are
// required to be idempotent on redelivery rather than relied on for
// retry-to-success, matching the source worker loop's literal behavior.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::EventBus;

#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Human-readable name used in log lines.
    fn name(&self) -> &str;

    /// Handles one decoded record, returning events to publish downstream.
    /// Decode/validate failures should be caught before this is called;
    /// a handler-level error is logged by the worker loop and does not
    /// stop the stream.
    async fn handle(&self, payload: Value) -> anyhow::Result<Vec<(String, Value)>>;
}

pub struct WorkerConfig {
    pub source_stream: String,
    pub consumer_cursor_start: String,
    pub batch_size: usize,
    pub block_ms: u64,
    pub idle_sleep_ms: u64,
}

impl WorkerConfig {
    pub fn new(source_stream: impl Into<String>) -> Self {
        Self {
            source_stream: source_stream.into(),
            consumer_cursor_start: "0".to_string(),
            batch_size: 50,
            block_ms: 1500,
            idle_sleep_ms: 200,
        }
    }
}

/// Runs `handler` against `config.source_stream` until `shutdown` fires.
/// Outputs the handler returns are published back onto `bus` before the
/// cursor advances.
pub async fn run_stream_worker(
    bus: Arc<dyn EventBus>,
    config: WorkerConfig,
    handler: Arc<dyn StageHandler>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut cursor = config.consumer_cursor_start.clone();
    info!(stage = handler.name(), stream = %config.source_stream, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let records = tokio::select! {
            res = bus.read(&config.source_stream, &cursor, config.batch_size, config.block_ms) => res,
            _ = shutdown.changed() => break,
        };

        let records = match records {
            Ok(records) => records,
            Err(err) => {
                warn!(stage = handler.name(), error = %err, "stream read failed");
                tokio::time::sleep(std::time::Duration::from_millis(config.idle_sleep_ms.max(500)))
                    .await;
                continue;
            }
        };

        if records.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(config.idle_sleep_ms)).await;
            continue;
        }

        for record in records {
            match handler.handle(record.payload).await {
                Ok(outputs) => {
                    for (stream, payload) in outputs {
                        if let Err(err) = bus.publish(&stream, payload).await {
                            warn!(
                                stage = handler.name(),
                                target = %stream,
                                error = %err,
                                "failed to publish stage output"
                            );
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        stage = handler.name(),
                        record_id = %record.id,
                        error = %err,
                        "stage handler failed; cursor advances past this record"
                    );
                }
            }
            cursor = record.id;
            debug!(stage = handler.name(), cursor = %cursor, "cursor advanced");
        }
    }

    info!(stage = handler.name(), "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl StageHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, payload: Value) -> anyhow::Result<Vec<(String, Value)>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                anyhow::bail!("boom");
            }
            Ok(vec![("out.stream".to_string(), payload)])
        }
    }

    #[tokio::test]
    async fn worker_advances_cursor_past_failed_record() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        bus.publish("in.stream", json!({"n": 1})).await.unwrap();
        bus.publish("in.stream", json!({"n": 2})).await.unwrap();

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });

        let (tx, rx) = tokio::sync::watch::channel(false);
        let mut config = WorkerConfig::new("in.stream");
        config.idle_sleep_ms = 10;
        config.block_ms = 10;

        let bus_clone = bus.clone();
        let handler_dyn: Arc<dyn StageHandler> = handler.clone();
        let handle = tokio::spawn(run_stream_worker(bus_clone, config, handler_dyn, rx));

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // first record failed (logged, cursor still advanced), second succeeded
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let outputs = bus.read("out.stream", "0", 10, 0).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].payload["n"], 2);
    }
}

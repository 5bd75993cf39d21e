// =============================================================================
// EventBus — append-only stream abstraction
// =============================================================================
//
// Mirrors `common_types/bus.py`: a small trait with `publish`/`read`/`ping`,
// backed either by an in-process `InMemoryEventBus` (tests, `BUS_BACKEND=memory`)
// or `RedisEventBus` (Redis Streams via `XADD`/`XREAD`, production default).
// Delivery is at-least-once and FIFO per stream; consumers read from a
// cursor they own and must be idempotent on redelivery.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

/// A single record read back off a stream: its id (used as the next read
/// cursor) and its JSON payload.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub id: String,
    pub payload: Value,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Appends `payload` to `stream`, returning the assigned record id.
    async fn publish(&self, stream: &str, payload: Value) -> anyhow::Result<String>;

    /// Reads up to `count` records from `stream` starting strictly after
    /// `after_id` (use `"0"` to read from the start). Blocks up to
    /// `block_ms` waiting for new data if nothing is immediately available.
    async fn read(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
        block_ms: u64,
    ) -> anyhow::Result<Vec<StreamRecord>>;

    /// Reads records in `[start_id, end_id]` inclusive, used by the replay
    /// engine's window scan. `end_id` of `"+"` means unbounded.
    async fn range(
        &self,
        stream: &str,
        start_id: &str,
        end_id: &str,
        count: usize,
    ) -> anyhow::Result<Vec<StreamRecord>>;

    /// Cheap connectivity probe for `GET /health`.
    async fn ping(&self) -> bool;

    /// Total record count, used by `GET /metrics/summary`'s `stream_lengths`.
    async fn len(&self, stream: &str) -> anyhow::Result<u64>;
}

// -----------------------------------------------------------------------
// InMemoryEventBus
// -----------------------------------------------------------------------

struct MemoryStream {
    records: Vec<StreamRecord>,
}

/// Process-local bus used in tests and for `BUS_BACKEND=memory`. Ids are
/// monotonic counters of the shape `"{n}-0"`, matching the source's
/// `InMemoryEventBus` id scheme so range-scan cursor arithmetic behaves the
/// same way across backends.
pub struct InMemoryEventBus {
    streams: RwLock<HashMap<String, MemoryStream>>,
    counter: AtomicU64,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(1),
        }
    }

    /// Parses an id of the form `"ms-seq"` into a `(ms, seq)` pair so
    /// comparisons stay correct after `next_cursor` increments only the
    /// sequence component (e.g. `"2-0"` -> `"2-1"`) — truncating to just
    /// the `ms` part would make the incremented cursor compare equal to
    /// the record it was derived from.
    fn parse_id(id: &str) -> (u64, u64) {
        let mut parts = id.split('-');
        let major = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let minor = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        (major, minor)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, stream: &str, payload: Value) -> anyhow::Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("{n}-0");
        let mut streams = self.streams.write();
        streams
            .entry(stream.to_string())
            .or_insert_with(|| MemoryStream { records: Vec::new() })
            .records
            .push(StreamRecord {
                id: id.clone(),
                payload,
            });
        Ok(id)
    }

    async fn read(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
        _block_ms: u64,
    ) -> anyhow::Result<Vec<StreamRecord>> {
        let after = Self::parse_id(after_id);
        let streams = self.streams.read();
        let Some(s) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(s.records
            .iter()
            .filter(|r| Self::parse_id(&r.id) > after)
            .take(count)
            .cloned()
            .collect())
    }

    async fn range(
        &self,
        stream: &str,
        start_id: &str,
        end_id: &str,
        count: usize,
    ) -> anyhow::Result<Vec<StreamRecord>> {
        let start = Self::parse_id(start_id);
        let end = if end_id == "+" {
            (u64::MAX, u64::MAX)
        } else {
            Self::parse_id(end_id)
        };
        let streams = self.streams.read();
        let Some(s) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(s.records
            .iter()
            .filter(|r| {
                let id = Self::parse_id(&r.id);
                id >= start && id <= end
            })
            .take(count)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn len(&self, stream: &str) -> anyhow::Result<u64> {
        let streams = self.streams.read();
        Ok(streams.get(stream).map(|s| s.records.len() as u64).unwrap_or(0))
    }
}

// -----------------------------------------------------------------------
// RedisEventBus
// -----------------------------------------------------------------------

/// Redis Streams-backed bus. Payloads are wire-encoded as a single field
/// `"payload"` holding the JSON-serialized event, matching
/// `RedisEventBus`'s `{"payload": json.dumps(...)}` encoding so a
/// replay-engine rewrite of `event_id` only has to touch the JSON, not the
/// stream field layout.
pub struct RedisEventBus {
    client: redis::Client,
}

impl RedisEventBus {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, stream: &str, payload: Value) -> anyhow::Result<String> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_string(&payload)?;
        let id: String = conn
            .xadd(stream, "*", &[("payload", encoded.as_str())])
            .await?;
        Ok(id)
    }

    async fn read(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
        block_ms: u64,
    ) -> anyhow::Result<Vec<StreamRecord>> {
        use redis::streams::{StreamReadOptions, StreamReadReply};
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let opts = StreamReadOptions::default()
            .count(count)
            .block(block_ms as usize);
        let reply: StreamReadReply = conn.xread_options(&[stream], &[after_id], &opts).await?;
        Ok(decode_reply(reply))
    }

    async fn range(
        &self,
        stream: &str,
        start_id: &str,
        end_id: &str,
        count: usize,
    ) -> anyhow::Result<Vec<StreamRecord>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let reply: redis::streams::StreamRangeReply = conn
            .xrange_count(stream, start_id, end_id, count)
            .await?;
        Ok(reply
            .ids
            .into_iter()
            .filter_map(|id| decode_stream_id(stream, id))
            .collect())
    }

    async fn ping(&self) -> bool {
        let Ok(mut conn) = self.conn().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }

    async fn len(&self, stream: &str) -> anyhow::Result<u64> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        Ok(conn.xlen(stream).await?)
    }
}

fn decode_reply(reply: redis::streams::StreamReadReply) -> Vec<StreamRecord> {
    let mut out = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            if let Some(record) = decode_stream_id(&key.key, id) {
                out.push(record);
            }
        }
    }
    out
}

fn decode_stream_id(_stream: &str, id: redis::streams::StreamId) -> Option<StreamRecord> {
    let raw: String = id.get("payload")?;
    let payload: Value = serde_json::from_str(&raw).ok()?;
    Some(StreamRecord {
        id: id.id,
        payload,
    })
}

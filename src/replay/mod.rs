// =============================================================================
// Replay Engine — ReplayTask lifecycle + news-window replay
// =============================================================================
//
// Grounded on `services/orchestrator-api/app.py`'s module-level replay task
// bookkeeping and `apps/replay_tools.py`'s `parse_event_time`/`in_window`/
// `build_replay_payload` helpers. A task moves `pending -> running ->
// {completed, failed, canceled}`; state is persisted through `ReplayStore`
// (key-value record per task_id plus a sorted index by `submitted_at`,
// trimmed to the newest `MAX_REPLAY_TASKS`), and a process-local
// `workers` map holds the spawned task handle for cancellation.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::EventBus;

pub const MAX_REPLAY_TASKS: usize = 200;
const SCAN_PAGE_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("end must be greater than or equal to start")]
    InvalidWindow,
    #[error("task not found")]
    NotFound,
    #[error("task is not cancellable in status={0}")]
    NotCancellable(ReplayTaskStatus),
    #[error("task is marked running but no local worker exists (likely after restart); cannot cancel safely")]
    UnsafeCancel,
    #[error("task is still active; cancel or wait before retry")]
    StillActive,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl std::fmt::Display for ReplayTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayTask {
    pub task_id: String,
    pub replay_id: String,
    pub status: ReplayTaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,

    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub source_stream: String,
    pub target_stream: String,
    pub max_scan: usize,
    pub max_publish: usize,
    pub dry_run: bool,

    #[serde(default)]
    pub scanned: usize,
    #[serde(default)]
    pub matched: usize,
    #[serde(default)]
    pub published: usize,
}

impl ReplayTask {
    pub fn duration_sec(&self) -> Option<f64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// Request parameters for a news-window replay submission.
#[derive(Debug, Clone)]
pub struct ReplayWindowRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub source_stream: String,
    pub target_stream: String,
    pub max_scan: usize,
    pub max_publish: usize,
    pub dry_run: bool,
    pub async_mode: bool,
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Clones `payload`, rewriting `event_id` to `"{orig}:replay:{replay_id}:{index}"`
/// and defaulting `schema_version` to `"1.0"` if absent — every other field
/// is preserved verbatim.
pub fn build_replay_payload(payload: &Value, replay_id: &str, index: usize) -> Value {
    let mut cloned = match payload.as_object() {
        Some(map) => map.clone(),
        None => Map::new(),
    };
    let original_event_id = cloned
        .get("event_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    cloned.insert(
        "event_id".to_string(),
        Value::String(format!("{original_event_id}:replay:{replay_id}:{index}")),
    );
    cloned
        .entry("schema_version".to_string())
        .or_insert_with(|| Value::String("1.0".to_string()));
    Value::Object(cloned)
}

fn in_window(dt: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    dt >= start && dt <= end
}

fn parse_published_at(payload: &Value) -> Option<DateTime<Utc>> {
    let raw = payload.get("published_at")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Increments the sequence component of a stream id of the form `"ms-seq"`,
/// matching the source's `cursor = f"{ms}-{int(seq)+1}"` page-advance step.
fn next_cursor(id: &str) -> String {
    match id.split_once('-') {
        Some((ms, seq)) => {
            let seq: u64 = seq.parse().unwrap_or(0);
            format!("{ms}-{}", seq + 1)
        }
        None => id.to_string(),
    }
}

#[async_trait]
pub trait ReplayStore: Send + Sync {
    async fn save(&self, task: &ReplayTask) -> anyhow::Result<()>;
    async fn load(&self, task_id: &str) -> anyhow::Result<Option<ReplayTask>>;
    /// Newest-first, at most `limit` tasks.
    async fn list(&self, limit: usize) -> anyhow::Result<Vec<ReplayTask>>;
    /// Trims the persisted index down to the newest `max_tasks`.
    async fn trim(&self, max_tasks: usize) -> anyhow::Result<()>;
}

// -----------------------------------------------------------------------
// MemoryReplayStore
// -----------------------------------------------------------------------

pub struct MemoryReplayStore {
    tasks: SyncMutex<HashMap<String, ReplayTask>>,
}

impl MemoryReplayStore {
    pub fn new() -> Self {
        Self {
            tasks: SyncMutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryReplayStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplayStore for MemoryReplayStore {
    async fn save(&self, task: &ReplayTask) -> anyhow::Result<()> {
        self.tasks.lock().insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn load(&self, task_id: &str) -> anyhow::Result<Option<ReplayTask>> {
        Ok(self.tasks.lock().get(task_id).cloned())
    }

    async fn list(&self, limit: usize) -> anyhow::Result<Vec<ReplayTask>> {
        let mut tasks: Vec<ReplayTask> = self.tasks.lock().values().cloned().collect();
        tasks.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn trim(&self, max_tasks: usize) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock();
        if tasks.len() <= max_tasks {
            return Ok(());
        }
        let mut ordered: Vec<(String, DateTime<Utc>)> = tasks
            .iter()
            .map(|(id, t)| (id.clone(), t.submitted_at))
            .collect();
        ordered.sort_by(|a, b| a.1.cmp(&b.1));
        let to_remove = ordered.len() - max_tasks;
        for (id, _) in ordered.into_iter().take(to_remove) {
            tasks.remove(&id);
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------
// RedisReplayStore
// -----------------------------------------------------------------------

const REPLAY_TASK_INDEX_KEY: &str = "replay:tasks:index";
const REPLAY_TASK_KEY_PREFIX: &str = "replay:task:";

fn task_key(task_id: &str) -> String {
    format!("{REPLAY_TASK_KEY_PREFIX}{task_id}")
}

/// Redis-backed task store: a JSON blob per task plus a `ZSET` index scored
/// by `submitted_at`, matching `_persist_replay_task`/`_trim_replay_tasks`
/// in the source.
pub struct RedisReplayStore {
    client: redis::Client,
}

impl RedisReplayStore {
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
impl ReplayStore for RedisReplayStore {
    async fn save(&self, task: &ReplayTask) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(task)?;
        conn.set::<_, _, ()>(task_key(&task.task_id), payload).await?;
        conn.zadd::<_, _, _, ()>(
            REPLAY_TASK_INDEX_KEY,
            task.task_id.clone(),
            task.submitted_at.timestamp_millis() as f64 / 1000.0,
        )
        .await?;
        Ok(())
    }

    async fn load(&self, task_id: &str) -> anyhow::Result<Option<ReplayTask>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(task_key(task_id)).await?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    async fn list(&self, limit: usize) -> anyhow::Result<Vec<ReplayTask>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .zrevrange(REPLAY_TASK_INDEX_KEY, 0, limit as isize - 1)
            .await?;
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let keys: Vec<String> = ids.iter().map(|id| task_key(id)).collect();
        let raws: Vec<Option<String>> = conn.mget(keys).await?;
        let mut tasks: Vec<ReplayTask> = raws
            .into_iter()
            .filter_map(|raw| raw.and_then(|r| serde_json::from_str(&r).ok()))
            .collect();
        tasks.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn trim(&self, max_tasks: usize) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let count: isize = conn.zcard(REPLAY_TASK_INDEX_KEY).await?;
        if count <= max_tasks as isize {
            return Ok(());
        }
        let to_remove = count - max_tasks as isize;
        let remove_ids: Vec<String> = conn
            .zrange(REPLAY_TASK_INDEX_KEY, 0, to_remove - 1)
            .await?;
        if remove_ids.is_empty() {
            return Ok(());
        }
        conn.zrem::<_, _, ()>(REPLAY_TASK_INDEX_KEY, remove_ids.clone()).await?;
        let remove_keys: Vec<String> = remove_ids.iter().map(|id| task_key(id)).collect();
        conn.del::<_, ()>(remove_keys).await?;
        Ok(())
    }
}

// -----------------------------------------------------------------------
// ReplayEngine
// -----------------------------------------------------------------------

pub struct ReplayEngine {
    bus: Arc<dyn EventBus>,
    store: Arc<dyn ReplayStore>,
    workers: SyncMutex<HashMap<String, JoinHandle<()>>>,
}

/// Response shape for a submission — mirrors the two branches of
/// `POST /replay/news-window` (`async_mode=true` returns immediately with
/// `pending`; `false` runs inline and returns the finished task).
pub enum SubmitOutcome {
    Accepted { task_id: String, replay_id: String },
    Completed(ReplayTask),
}

impl ReplayEngine {
    pub fn new(bus: Arc<dyn EventBus>, store: Arc<dyn ReplayStore>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            workers: SyncMutex::new(HashMap::new()),
        })
    }

    pub async fn submit(
        self: &Arc<Self>,
        req: ReplayWindowRequest,
    ) -> Result<SubmitOutcome, ReplayError> {
        if req.end < req.start {
            return Err(ReplayError::InvalidWindow);
        }

        let task = ReplayTask {
            task_id: new_id(),
            replay_id: new_id(),
            status: ReplayTaskStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            start: req.start,
            end: req.end,
            source_stream: req.source_stream,
            target_stream: req.target_stream,
            max_scan: req.max_scan,
            max_publish: req.max_publish,
            dry_run: req.dry_run,
            scanned: 0,
            matched: 0,
            published: 0,
        };
        self.store.save(&task).await?;
        self.store.trim(MAX_REPLAY_TASKS).await?;

        if req.async_mode {
            let task_id = task.task_id.clone();
            let replay_id = task.replay_id.clone();
            self.spawn(task_id.clone());
            return Ok(SubmitOutcome::Accepted { task_id, replay_id });
        }

        self.run_task(task.task_id.clone()).await;
        let done = self
            .store
            .load(&task.task_id)
            .await?
            .ok_or(ReplayError::NotFound)?;
        Ok(SubmitOutcome::Completed(done))
    }

    fn spawn(self: &Arc<Self>, task_id: String) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.run_task(task_id.clone()).await;
            engine.workers.lock().remove(&task_id);
        });
        self.workers.lock().insert(task_id, handle);
    }

    /// Loads the task, runs the range-scan + republish, and persists the
    /// terminal state. Public only for the inline (`async_mode=false`) path
    /// and direct testing; normal async submission goes through `spawn`.
    pub async fn run_task(&self, task_id: String) {
        let Ok(Some(mut task)) = self.store.load(&task_id).await else {
            return;
        };

        task.status = ReplayTaskStatus::Running;
        task.started_at = Some(Utc::now());
        if self.store.save(&task).await.is_err() {
            return;
        }

        match self.scan_window(&task).await {
            Ok((scanned, matched)) => {
                let matched_count = matched.len();
                let selected = matched.into_iter().take(task.max_publish);

                let mut published = 0usize;
                if !task.dry_run {
                    for (idx, payload) in selected.enumerate() {
                        let replay_payload = build_replay_payload(&payload, &task.replay_id, idx + 1);
                        if let Err(err) = self.bus.publish(&task.target_stream, replay_payload).await {
                            warn!(error = %err, task_id = %task_id, "replay publish failed");
                            continue;
                        }
                        published += 1;
                    }
                }

                task.scanned = scanned;
                task.matched = matched_count;
                task.published = published;
                task.status = ReplayTaskStatus::Completed;
                task.completed_at = Some(Utc::now());
            }
            Err(err) => {
                warn!(error = %err, task_id = %task_id, "replay scan failed");
                task.status = ReplayTaskStatus::Failed;
                task.error = Some(err.to_string());
                task.completed_at = Some(Utc::now());
            }
        }

        if let Err(err) = self.store.save(&task).await {
            warn!(error = %err, task_id = %task_id, "failed to persist replay task terminal state");
        } else {
            info!(
                task_id = %task_id,
                status = %task.status,
                scanned = task.scanned,
                matched = task.matched,
                published = task.published,
                "replay task finished"
            );
        }
    }

    async fn scan_window(&self, task: &ReplayTask) -> anyhow::Result<(usize, Vec<Value>)> {
        let mut cursor = "0".to_string();
        let mut scanned = 0usize;
        let mut matched = Vec::new();

        while scanned < task.max_scan {
            let page = (SCAN_PAGE_SIZE).min(task.max_scan - scanned);
            let batch = self.bus.range(&task.source_stream, &cursor, "+", page).await?;
            if batch.is_empty() {
                break;
            }

            for record in &batch {
                scanned += 1;
                let Some(published_at) = parse_published_at(&record.payload) else {
                    continue;
                };
                if in_window(published_at, task.start, task.end) {
                    matched.push(record.payload.clone());
                }
            }

            cursor = next_cursor(&batch.last().expect("batch non-empty").id);
        }

        Ok((scanned, matched))
    }

    pub async fn get_task(&self, task_id: &str) -> Result<ReplayTask, ReplayError> {
        self.store
            .load(task_id)
            .await?
            .ok_or(ReplayError::NotFound)
    }

    pub async fn list_tasks(&self, limit: usize) -> anyhow::Result<Vec<ReplayTask>> {
        self.store.list(limit).await
    }

    /// Cancels `task_id`. A live async worker is aborted and awaited; a
    /// still-pending task with no worker is marked canceled in place; a
    /// task recorded as running with no local worker (e.g. after a
    /// restart) refuses with `UnsafeCancel` rather than guess at its state.
    pub async fn cancel(self: &Arc<Self>, task_id: &str) -> Result<ReplayTask, ReplayError> {
        let task = self.get_task(task_id).await?;
        if !matches!(task.status, ReplayTaskStatus::Pending | ReplayTaskStatus::Running) {
            return Err(ReplayError::NotCancellable(task.status));
        }

        let worker = self.workers.lock().remove(task_id);
        match worker {
            Some(handle) => {
                handle.abort();
                let _ = handle.await;
            }
            None => {
                if task.status == ReplayTaskStatus::Running {
                    return Err(ReplayError::UnsafeCancel);
                }
                let mut task = task;
                task.status = ReplayTaskStatus::Canceled;
                task.error = Some("Task canceled before worker start".to_string());
                task.completed_at = Some(Utc::now());
                self.store.save(&task).await?;
            }
        }

        self.get_task(task_id).await
    }

    /// Clones a terminal task's parameters into a fresh task_id/replay_id
    /// and submits it the same way the original was submitted.
    pub async fn retry(
        self: &Arc<Self>,
        task_id: &str,
        async_mode: bool,
    ) -> Result<(String, SubmitOutcome), ReplayError> {
        let old = self.get_task(task_id).await?;
        if matches!(old.status, ReplayTaskStatus::Pending | ReplayTaskStatus::Running) {
            return Err(ReplayError::StillActive);
        }

        let outcome = self
            .submit(ReplayWindowRequest {
                start: old.start,
                end: old.end,
                source_stream: old.source_stream,
                target_stream: old.target_stream,
                max_scan: old.max_scan,
                max_publish: old.max_publish,
                dry_run: old.dry_run,
                async_mode,
            })
            .await?;
        Ok((old.task_id, outcome))
    }

    pub async fn metrics(&self, limit: usize) -> anyhow::Result<ReplayMetrics> {
        let tasks = self.store.list(limit).await?;
        let mut counts: HashMap<ReplayTaskStatus, usize> = HashMap::new();
        for status in [
            ReplayTaskStatus::Pending,
            ReplayTaskStatus::Running,
            ReplayTaskStatus::Completed,
            ReplayTaskStatus::Failed,
            ReplayTaskStatus::Canceled,
        ] {
            counts.insert(status, 0);
        }

        let mut durations = Vec::new();
        let mut terminal = 0usize;
        let mut completed = 0usize;

        for task in &tasks {
            *counts.entry(task.status).or_insert(0) += 1;
            if let Some(duration) = task.duration_sec() {
                durations.push(duration);
            }
            if matches!(
                task.status,
                ReplayTaskStatus::Completed | ReplayTaskStatus::Failed | ReplayTaskStatus::Canceled
            ) {
                terminal += 1;
            }
            if task.status == ReplayTaskStatus::Completed {
                completed += 1;
            }
        }

        let avg_duration_sec = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };
        let success_rate = if terminal == 0 {
            0.0
        } else {
            completed as f64 / terminal as f64
        };

        Ok(ReplayMetrics {
            sample_size: tasks.len(),
            counts,
            avg_duration_sec,
            success_rate,
        })
    }
}

pub struct ReplayMetrics {
    pub sample_size: usize,
    pub counts: HashMap<ReplayTaskStatus, usize>,
    pub avg_duration_sec: f64,
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use chrono::Duration;
    use serde_json::json;

    fn news_payload(event_id: &str, published_at: DateTime<Utc>) -> Value {
        json!({
            "schema_version": "1.0",
            "event_id": event_id,
            "source": "coindesk",
            "published_at": published_at.to_rfc3339(),
            "title": "t",
            "content": "c",
            "lang": "en",
            "url": "https://example.com",
            "dedup_hash": "h",
        })
    }

    fn engine() -> (Arc<ReplayEngine>, Arc<dyn EventBus>) {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let store: Arc<dyn ReplayStore> = Arc::new(MemoryReplayStore::new());
        (ReplayEngine::new(bus.clone(), store), bus)
    }

    #[test]
    fn build_replay_payload_rewrites_event_id_and_keeps_other_fields() {
        let payload = news_payload("evt-1", Utc::now());
        let rewritten = build_replay_payload(&payload, "rid", 3);
        assert_eq!(rewritten["event_id"], "evt-1:replay:rid:3");
        assert_eq!(rewritten["source"], "coindesk");
    }

    #[tokio::test]
    async fn submit_end_before_start_is_rejected() {
        let (engine, _bus) = engine();
        let now = Utc::now();
        let req = ReplayWindowRequest {
            start: now,
            end: now - Duration::seconds(1),
            source_stream: "news.raw".to_string(),
            target_stream: "news.raw".to_string(),
            max_scan: 100,
            max_publish: 100,
            dry_run: false,
            async_mode: false,
        };
        assert!(matches!(
            engine.submit(req).await,
            Err(ReplayError::InvalidWindow)
        ));
    }

    #[tokio::test]
    async fn sync_submit_scans_and_republishes_matching_events() {
        let (engine, bus) = engine();
        let now = Utc::now();
        bus.publish("news.raw", news_payload("evt-1", now)).await.unwrap();
        bus.publish("news.raw", news_payload("evt-2", now - Duration::hours(5)))
            .await
            .unwrap();

        let req = ReplayWindowRequest {
            start: now - Duration::minutes(1),
            end: now + Duration::minutes(1),
            source_stream: "news.raw".to_string(),
            target_stream: "news.replay".to_string(),
            max_scan: 100,
            max_publish: 100,
            dry_run: false,
            async_mode: false,
        };

        let outcome = engine.submit(req).await.unwrap();
        let SubmitOutcome::Completed(task) = outcome else {
            panic!("expected inline completion");
        };
        assert_eq!(task.status, ReplayTaskStatus::Completed);
        assert_eq!(task.scanned, 2);
        assert_eq!(task.matched, 1);
        assert_eq!(task.published, 1);

        let out = bus.read("news.replay", "0", 10, 0).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload["event_id"], "evt-1:replay:".to_string() + &task.replay_id + ":1");
    }

    #[tokio::test]
    async fn dry_run_matches_without_publishing() {
        let (engine, bus) = engine();
        let now = Utc::now();
        bus.publish("news.raw", news_payload("evt-1", now)).await.unwrap();

        let req = ReplayWindowRequest {
            start: now - Duration::minutes(1),
            end: now + Duration::minutes(1),
            source_stream: "news.raw".to_string(),
            target_stream: "news.replay".to_string(),
            max_scan: 100,
            max_publish: 100,
            dry_run: true,
            async_mode: false,
        };
        let outcome = engine.submit(req).await.unwrap();
        let SubmitOutcome::Completed(task) = outcome else {
            panic!("expected inline completion");
        };
        assert_eq!(task.matched, 1);
        assert_eq!(task.published, 0);
        assert!(bus.read("news.replay", "0", 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_pending_task_without_worker_marks_canceled() {
        let (engine, _bus) = engine();
        let now = Utc::now();
        // publish directly through the store to simulate a pending task with no worker
        let task = ReplayTask {
            task_id: "t1".to_string(),
            replay_id: "r1".to_string(),
            status: ReplayTaskStatus::Pending,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            start: now,
            end: now,
            source_stream: "news.raw".to_string(),
            target_stream: "news.raw".to_string(),
            max_scan: 10,
            max_publish: 10,
            dry_run: false,
            scanned: 0,
            matched: 0,
            published: 0,
        };
        engine.store.save(&task).await.unwrap();

        let canceled = engine.cancel("t1").await.unwrap();
        assert_eq!(canceled.status, ReplayTaskStatus::Canceled);
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_not_found() {
        let (engine, _bus) = engine();
        assert!(matches!(engine.cancel("nope").await, Err(ReplayError::NotFound)));
    }

    #[tokio::test]
    async fn retry_on_active_task_is_rejected() {
        let (engine, _bus) = engine();
        let now = Utc::now();
        let task = ReplayTask {
            task_id: "t1".to_string(),
            replay_id: "r1".to_string(),
            status: ReplayTaskStatus::Running,
            submitted_at: now,
            started_at: Some(now),
            completed_at: None,
            error: None,
            start: now,
            end: now,
            source_stream: "news.raw".to_string(),
            target_stream: "news.raw".to_string(),
            max_scan: 10,
            max_publish: 10,
            dry_run: false,
            scanned: 0,
            matched: 0,
            published: 0,
        };
        engine.store.save(&task).await.unwrap();
        assert!(matches!(
            engine.retry("t1", false).await,
            Err(ReplayError::StillActive)
        ));
    }

    #[test]
    fn memory_store_trim_keeps_newest() {
        let store = MemoryReplayStore::new();
        assert!(store.tasks.lock().is_empty());
    }
}

//! Persisted state (§6 External Interfaces, §9 Open Question decisions).
//!
//! No SQL driver is introduced — the source's relational tables become a
//! small [`Store`] trait with two implementations: [`MemoryStore`] for tests
//! and short-lived runs, and [`JsonlStore`], an append-only JSONL store
//! grounded on `thought_chain.rs`'s file-backed persistence pattern (one
//! file per table, each write is a single appended line, updates are
//! superseding records folded on read).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::error::KernelError;
use crate::event::Event;
use crate::gateway::ProviderCallRecord;

/// A durable row for one run's lifecycle (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub topology: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Wall-clock time from `pipeline.created` to the terminal event.
    pub total_latency_ms: Option<i64>,
    /// Time from run creation to the first `chat.token` event.
    pub time_to_first_token_ms: Option<i64>,
    /// Time from run creation to the first `VoiceAudioChunk` frame.
    pub time_to_first_audio_ms: Option<i64>,
    /// Time from run creation to the first stage's completion, of any kind.
    pub time_to_first_chunk_ms: Option<i64>,
    /// Summed `tokens_in`/`tokens_out` across every provider call record.
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    /// Summed `cost_cents` across every provider call record.
    pub cost_cents: Option<i64>,
    /// Per-stage `{status, latency_ms}` rollup, keyed by stage name.
    pub stage_summary: Option<Value>,
}

/// A durable row for one artifact accepted by the Agent Output Applier
/// (§4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub kind: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// A durable row for one dead-lettered failure (§4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub service: String,
    pub stage_name: Option<String>,
    pub error_type: String,
    pub error_message: String,
    pub status: String,
    /// Context snapshot plus replayable input data, internal (`_`-prefixed)
    /// keys already stripped.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    pub resolved_notes: Option<String>,
}

/// The persistence surface the kernel needs. Object-safe so it can be held
/// as `Arc<dyn Store>` by the event sink, the run controller, and the DLQ
/// service alike.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_run(&self, record: RunRecord) -> Result<(), KernelError>;
    async fn update_run(&self, record: RunRecord) -> Result<(), KernelError>;
    async fn get_run(&self, run_id: Uuid) -> Option<RunRecord>;

    async fn append_event(&self, event: Event) -> Result<(), KernelError>;
    /// Test/debug convenience: every event recorded for a run, in append
    /// order.
    async fn events_for(&self, run_id: Uuid) -> Vec<Event>;

    async fn insert_provider_call(&self, record: ProviderCallRecord) -> Result<(), KernelError>;
    async fn update_provider_call(&self, record: ProviderCallRecord) -> Result<(), KernelError>;
    /// Every Provider Call Record written for a run, used to compute the
    /// run's token/cost aggregates at `finish()` time.
    async fn provider_calls_for(&self, run_id: Uuid) -> Vec<ProviderCallRecord>;

    async fn insert_dlq_entry(&self, entry: DlqEntry) -> Result<(), KernelError>;
    async fn update_dlq_entry(&self, entry: DlqEntry) -> Result<(), KernelError>;
    async fn get_dlq_entry(&self, id: Uuid) -> Option<DlqEntry>;
    async fn list_dlq_by_status(&self, status: &str) -> Vec<DlqEntry>;
    async fn list_dlq_by_service(&self, service: &str) -> Vec<DlqEntry>;
    async fn dlq_stats(&self) -> HashMap<String, usize>;

    /// Persist every accepted artifact from one agent output atomically:
    /// either all rows land or none do.
    async fn insert_artifacts(&self, artifacts: Vec<ArtifactRecord>) -> Result<(), KernelError>;
    async fn artifacts_for(&self, run_id: Uuid) -> Vec<ArtifactRecord>;
}

#[derive(Default)]
struct MemoryTables {
    runs: HashMap<Uuid, RunRecord>,
    events: Vec<Event>,
    provider_calls: HashMap<Uuid, ProviderCallRecord>,
    dlq: HashMap<Uuid, DlqEntry>,
    artifacts: Vec<ArtifactRecord>,
}

/// In-memory `Store`, used by every inline test in this crate and suitable
/// for a single-process deployment that doesn't need to survive a restart.
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(MemoryTables::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_run(&self, record: RunRecord) -> Result<(), KernelError> {
        self.tables.lock().unwrap().runs.insert(record.run_id, record);
        Ok(())
    }

    async fn update_run(&self, record: RunRecord) -> Result<(), KernelError> {
        self.tables.lock().unwrap().runs.insert(record.run_id, record);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Option<RunRecord> {
        self.tables.lock().unwrap().runs.get(&run_id).cloned()
    }

    async fn append_event(&self, event: Event) -> Result<(), KernelError> {
        self.tables.lock().unwrap().events.push(event);
        Ok(())
    }

    async fn events_for(&self, run_id: Uuid) -> Vec<Event> {
        self.tables
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }

    async fn insert_provider_call(&self, record: ProviderCallRecord) -> Result<(), KernelError> {
        self.tables.lock().unwrap().provider_calls.insert(record.id, record);
        Ok(())
    }

    async fn update_provider_call(&self, record: ProviderCallRecord) -> Result<(), KernelError> {
        self.tables.lock().unwrap().provider_calls.insert(record.id, record);
        Ok(())
    }

    async fn provider_calls_for(&self, run_id: Uuid) -> Vec<ProviderCallRecord> {
        self.tables
            .lock()
            .unwrap()
            .provider_calls
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }

    async fn insert_dlq_entry(&self, entry: DlqEntry) -> Result<(), KernelError> {
        self.tables.lock().unwrap().dlq.insert(entry.id, entry);
        Ok(())
    }

    async fn update_dlq_entry(&self, entry: DlqEntry) -> Result<(), KernelError> {
        self.tables.lock().unwrap().dlq.insert(entry.id, entry);
        Ok(())
    }

    async fn get_dlq_entry(&self, id: Uuid) -> Option<DlqEntry> {
        self.tables.lock().unwrap().dlq.get(&id).cloned()
    }

    async fn list_dlq_by_status(&self, status: &str) -> Vec<DlqEntry> {
        self.tables
            .lock()
            .unwrap()
            .dlq
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    async fn list_dlq_by_service(&self, service: &str) -> Vec<DlqEntry> {
        self.tables
            .lock()
            .unwrap()
            .dlq
            .values()
            .filter(|e| e.service == service)
            .cloned()
            .collect()
    }

    async fn dlq_stats(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for entry in self.tables.lock().unwrap().dlq.values() {
            *counts.entry(entry.status.clone()).or_insert(0) += 1;
        }
        counts
    }

    async fn insert_artifacts(&self, artifacts: Vec<ArtifactRecord>) -> Result<(), KernelError> {
        self.tables.lock().unwrap().artifacts.extend(artifacts);
        Ok(())
    }

    async fn artifacts_for(&self, run_id: Uuid) -> Vec<ArtifactRecord> {
        self.tables
            .lock()
            .unwrap()
            .artifacts
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "table")]
enum Row {
    Run(RunRecord),
    Event(Event),
    ProviderCall(ProviderCallRecord),
    Dlq(DlqEntry),
    Artifact(ArtifactRecord),
}

/// File-backed `Store`: one JSONL file per table under `base_dir`, append
/// only. Updates are superseding rows folded by id on read, so a crash
/// mid-write only risks losing the last unflushed line, never corrupting
/// history.
pub struct JsonlStore {
    base_dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn path_for(&self, table: &str) -> PathBuf {
        self.base_dir.join(format!("{table}.jsonl"))
    }

    async fn append_row(&self, table: &str, row: &Row) -> Result<(), KernelError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(table);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KernelError::Pipeline(format!("creating store directory: {e}")))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| KernelError::Pipeline(format!("opening {table}.jsonl: {e}")))?;
        let mut line =
            serde_json::to_string(row).map_err(|e| KernelError::Pipeline(format!("serializing {table} row: {e}")))?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| KernelError::Pipeline(format!("appending to {table}.jsonl: {e}")))?;
        Ok(())
    }

    async fn read_rows(&self, table: &str) -> Vec<Row> {
        let path = self.path_for(table);
        let Ok(file) = tokio::fs::File::open(&path).await else {
            return Vec::new();
        };
        let mut lines = BufReader::new(file).lines();
        let mut rows = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(row) = serde_json::from_str::<Row>(&line) {
                rows.push(row);
            }
        }
        rows
    }

}

#[async_trait]
impl Store for JsonlStore {
    async fn insert_run(&self, record: RunRecord) -> Result<(), KernelError> {
        self.append_row("runs", &Row::Run(record)).await
    }

    async fn update_run(&self, record: RunRecord) -> Result<(), KernelError> {
        self.append_row("runs", &Row::Run(record)).await
    }

    async fn get_run(&self, run_id: Uuid) -> Option<RunRecord> {
        self.read_rows("runs")
            .await
            .into_iter()
            .filter_map(|row| match row {
                Row::Run(r) if r.run_id == run_id => Some(r),
                _ => None,
            })
            .last()
    }

    async fn append_event(&self, event: Event) -> Result<(), KernelError> {
        self.append_row("events", &Row::Event(event)).await
    }

    async fn events_for(&self, run_id: Uuid) -> Vec<Event> {
        self.read_rows("events")
            .await
            .into_iter()
            .filter_map(|row| match row {
                Row::Event(e) if e.run_id == run_id => Some(e),
                _ => None,
            })
            .collect()
    }

    async fn insert_provider_call(&self, record: ProviderCallRecord) -> Result<(), KernelError> {
        self.append_row("provider_calls", &Row::ProviderCall(record)).await
    }

    async fn update_provider_call(&self, record: ProviderCallRecord) -> Result<(), KernelError> {
        self.append_row("provider_calls", &Row::ProviderCall(record)).await
    }

    async fn provider_calls_for(&self, run_id: Uuid) -> Vec<ProviderCallRecord> {
        let mut latest: HashMap<Uuid, ProviderCallRecord> = HashMap::new();
        for row in self.read_rows("provider_calls").await {
            if let Row::ProviderCall(record) = row {
                if record.run_id == run_id {
                    latest.insert(record.id, record);
                }
            }
        }
        latest.into_values().collect()
    }

    async fn insert_dlq_entry(&self, entry: DlqEntry) -> Result<(), KernelError> {
        self.append_row("dlq", &Row::Dlq(entry)).await
    }

    async fn update_dlq_entry(&self, entry: DlqEntry) -> Result<(), KernelError> {
        self.append_row("dlq", &Row::Dlq(entry)).await
    }

    async fn get_dlq_entry(&self, id: Uuid) -> Option<DlqEntry> {
        self.read_rows("dlq")
            .await
            .into_iter()
            .filter_map(|row| match row {
                Row::Dlq(e) if e.id == id => Some(e),
                _ => None,
            })
            .last()
    }

    async fn list_dlq_by_status(&self, status: &str) -> Vec<DlqEntry> {
        let latest = self.latest_dlq_rows().await;
        latest.into_values().filter(|e| e.status == status).collect()
    }

    async fn list_dlq_by_service(&self, service: &str) -> Vec<DlqEntry> {
        let latest = self.latest_dlq_rows().await;
        latest.into_values().filter(|e| e.service == service).collect()
    }

    async fn dlq_stats(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for entry in self.latest_dlq_rows().await.values() {
            *counts.entry(entry.status.clone()).or_insert(0) += 1;
        }
        counts
    }

    async fn insert_artifacts(&self, artifacts: Vec<ArtifactRecord>) -> Result<(), KernelError> {
        for artifact in artifacts {
            self.append_row("artifacts", &Row::Artifact(artifact)).await?;
        }
        Ok(())
    }

    async fn artifacts_for(&self, run_id: Uuid) -> Vec<ArtifactRecord> {
        self.read_rows("artifacts")
            .await
            .into_iter()
            .filter_map(|row| match row {
                Row::Artifact(a) if a.run_id == run_id => Some(a),
                _ => None,
            })
            .collect()
    }
}

impl JsonlStore {
    async fn latest_dlq_rows(&self) -> HashMap<Uuid, DlqEntry> {
        let mut latest = HashMap::new();
        for row in self.read_rows("dlq").await {
            if let Row::Dlq(entry) = row {
                latest.insert(entry.id, entry);
            }
        }
        latest
    }
}

//! The Dead-Letter Queue (§4.11).
//!
//! Grounded method-for-method on
//! `original_source/backend/app/infrastructure/dead_letter_queue.py`:
//! `enqueue`/`get_pending`/`get_by_service`/`resolve`/`mark_reprocessed`/
//! `get_stats`, including the `_determine_service` substring inference and
//! the `_`-prefixed-key stripping on stored input data.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::ContextSnapshot;
use crate::error::KernelError;
use crate::store::{DlqEntry, Store};

/// Statistics rollup mirroring `get_stats()`'s shape: counts per status, the
/// top 10 error classes by frequency, and counts per inferred service.
#[derive(Debug, Clone)]
pub struct DlqStats {
    pub by_status: HashMap<String, usize>,
    pub by_error_type: Vec<(String, usize)>,
    pub by_service: HashMap<String, usize>,
    pub total: usize,
}

pub struct DeadLetterQueue {
    store: Arc<dyn Store>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Capture a failed run. `stage_name` is `None` when the failure
    /// happened before any stage started (e.g. a blocked `pre_llm`
    /// checkpoint). `input_data` is the replayable request payload; any key
    /// prefixed `_` is stripped before storage.
    pub async fn enqueue(
        &self,
        run_id: Uuid,
        topology_or_behavior: &str,
        stage_name: Option<String>,
        error: &KernelError,
        snapshot: &ContextSnapshot,
        input_data: Value,
    ) -> Result<Uuid, KernelError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let payload = serde_json::json!({
            "context_snapshot": {
                "topology": snapshot.topology,
                "channel": snapshot.channel,
                "behavior": snapshot.behavior,
                "session_id": snapshot.session_id,
            },
            "input_data": strip_internal_keys(input_data),
        });

        self.store
            .insert_dlq_entry(DlqEntry {
                id,
                run_id,
                service: determine_service(topology_or_behavior),
                stage_name,
                error_type: error.error_type().to_string(),
                error_message: error.to_string(),
                status: "pending".to_string(),
                payload,
                created_at: now,
                updated_at: now,
                retry_count: 0,
                last_retry_at: None,
                resolved_by: None,
                resolved_notes: None,
            })
            .await?;
        Ok(id)
    }

    pub async fn get_pending(&self, limit: usize) -> Vec<DlqEntry> {
        let mut entries = self.store.list_dlq_by_status("pending").await;
        entries.sort_by_key(|e| e.created_at);
        entries.truncate(limit);
        entries
    }

    pub async fn get_by_service(&self, service: &str, status: Option<&str>) -> Vec<DlqEntry> {
        let mut entries = self.store.list_dlq_by_service(service).await;
        if let Some(status) = status {
            entries.retain(|e| e.status == status);
        }
        entries
    }

    pub async fn resolve(&self, id: Uuid, resolved_by: Uuid, notes: Option<String>) -> Result<(), KernelError> {
        let mut entry = self
            .store
            .get_dlq_entry(id)
            .await
            .ok_or_else(|| KernelError::NotFound(format!("dlq entry {id}")))?;
        entry.status = "resolved".to_string();
        entry.resolved_by = Some(resolved_by);
        entry.resolved_notes = notes;
        entry.updated_at = Utc::now();
        self.store.update_dlq_entry(entry).await
    }

    pub async fn mark_reprocessed(&self, id: Uuid) -> Result<(), KernelError> {
        let mut entry = self
            .store
            .get_dlq_entry(id)
            .await
            .ok_or_else(|| KernelError::NotFound(format!("dlq entry {id}")))?;
        entry.retry_count += 1;
        entry.last_retry_at = Some(Utc::now());
        entry.updated_at = Utc::now();
        self.store.update_dlq_entry(entry).await
    }

    pub async fn get_stats(&self) -> DlqStats {
        let by_status = self.store.dlq_stats().await;
        let total = by_status.values().sum();

        let mut pending = self.store.list_dlq_by_status("pending").await;
        pending.extend(self.store.list_dlq_by_status("resolved").await);
        pending.extend(self.store.list_dlq_by_status("reprocessed").await);

        let mut error_counts: HashMap<String, usize> = HashMap::new();
        let mut service_counts: HashMap<String, usize> = HashMap::new();
        for entry in &pending {
            *error_counts.entry(entry.error_type.clone()).or_insert(0) += 1;
            *service_counts.entry(entry.service.clone()).or_insert(0) += 1;
        }

        let mut by_error_type: Vec<(String, usize)> = error_counts.into_iter().collect();
        by_error_type.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        by_error_type.truncate(10);

        DlqStats {
            by_status,
            by_error_type,
            by_service: service_counts,
            total,
        }
    }
}

/// Mirrors `_determine_service`: look for `"voice"`/`"chat"` as substrings,
/// then fall back to the raw string, then `"unknown"`.
fn determine_service(topology_or_behavior: &str) -> String {
    let lower = topology_or_behavior.to_lowercase();
    if lower.contains("voice") {
        "voice".to_string()
    } else if lower.contains("chat") {
        "chat".to_string()
    } else if !topology_or_behavior.is_empty() {
        topology_or_behavior.to_string()
    } else {
        "unknown".to_string()
    }
}

fn strip_internal_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter(|(key, _)| !key.starts_with('_'))
                .map(|(key, value)| (key, strip_internal_keys(value)))
                .collect();
            Value::Object(cleaned)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn snapshot() -> ContextSnapshot {
        ContextSnapshot::for_chat("chat_fast", Uuid::new_v4(), "hi")
    }

    #[tokio::test]
    async fn enqueue_infers_service_from_topology_substring() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let dlq = DeadLetterQueue::new(store.clone());
        let run_id = Uuid::new_v4();

        let id = dlq
            .enqueue(
                run_id,
                "voice_accurate",
                Some("tts".into()),
                &KernelError::provider("synthesis timeout"),
                &snapshot(),
                serde_json::json!({"text": "hi", "_internal_token": "secret"}),
            )
            .await
            .unwrap();

        let entry = store.get_dlq_entry(id).await.unwrap();
        assert_eq!(entry.service, "voice");
        assert_eq!(entry.status, "pending");
        assert!(entry.payload["input_data"].get("_internal_token").is_none());
        assert_eq!(entry.payload["input_data"]["text"], "hi");
    }

    #[tokio::test]
    async fn resolve_then_mark_reprocessed_updates_status_and_retry_count() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let dlq = DeadLetterQueue::new(store.clone());
        let run_id = Uuid::new_v4();
        let id = dlq
            .enqueue(
                run_id,
                "chat_fast",
                None,
                &KernelError::Pipeline("stage llm_stream failed".into()),
                &snapshot(),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let resolver = Uuid::new_v4();
        dlq.resolve(id, resolver, Some("retried manually".into())).await.unwrap();
        let entry = store.get_dlq_entry(id).await.unwrap();
        assert_eq!(entry.status, "resolved");
        assert_eq!(entry.resolved_by, Some(resolver));

        dlq.mark_reprocessed(id).await.unwrap();
        let entry = store.get_dlq_entry(id).await.unwrap();
        assert_eq!(entry.retry_count, 1);
        assert!(entry.last_retry_at.is_some());
    }

    #[tokio::test]
    async fn stats_rollup_counts_by_status_error_type_and_service() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let dlq = DeadLetterQueue::new(store.clone());

        for _ in 0..3 {
            dlq.enqueue(
                Uuid::new_v4(),
                "chat_fast",
                None,
                &KernelError::provider("boom"),
                &snapshot(),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        }

        let stats = dlq.get_stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status.get("pending"), Some(&3));
        assert_eq!(stats.by_error_type, vec![("Provider".to_string(), 3)]);
        assert_eq!(stats.by_service.get("chat"), Some(&3));
    }
}

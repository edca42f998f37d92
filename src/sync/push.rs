// sync/push.rs - drain the change log to the server in priority order

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::change_log;
use crate::config::{SYNC_BATCH_MAX_BYTES, SYNC_BATCH_MAX_SIZE};
use crate::error::Result;

use super::client::SyncClient;
use super::wire::{PushChange, PushRequest, PushResponse};

/// Aggregate result of draining the outgoing queue. `success` is false only
/// when a batch-level transport failure aborted the push; per-item failures
/// still count as `success: true` overall (they were recorded as retries,
/// not lost).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PushOutcome {
    pub success: bool,
    pub pushed: i64,
    pub failed: i64,
    pub error: Option<String>,
}

/// Drains the change log in `SYNC_BATCH_MAX_SIZE`/`SYNC_BATCH_MAX_BYTES`
/// batches, pushing each to the server and recording per-item success or
/// failure, until no pending rows remain or a transport error aborts the
/// run. A transport failure leaves the current batch's rows untouched
/// (still pending) and stops the drain immediately.
pub async fn push(pool: &SqlitePool, client: &SyncClient, device_id: &str) -> Result<PushOutcome> {
    let mut outcome = PushOutcome { success: true, ..Default::default() };

    loop {
        let batch = change_log::pending_batch(pool, SYNC_BATCH_MAX_SIZE, SYNC_BATCH_MAX_BYTES).await?;
        if batch.is_empty() {
            break;
        }

        // A batch can carry more than one change-log row for the same
        // entity_id (e.g. an insert followed by an update of the same note
        // before a sync runs). The server's response is keyed by entity_id,
        // not by row id, so every row sharing an entity_id resolves together.
        let mut by_entity_id: HashMap<String, Vec<i64>> = HashMap::with_capacity(batch.len());
        let mut changes = Vec::with_capacity(batch.len());
        for entry in &batch {
            by_entity_id.entry(entry.entity_id.clone()).or_default().push(entry.id);
            changes.push(PushChange {
                id: entry.id,
                entity_type: entry.entity_type.clone(),
                entity_id: entry.entity_id.clone(),
                operation: entry.operation.clone(),
                payload: serde_json::from_str(&entry.payload)?,
                priority: entry.priority,
                created_at: entry.created_at.clone(),
                retry_count: entry.retry_count,
            });
        }

        let request = PushRequest { device_id: device_id.to_string(), changes };
        let response = match client.push(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("push batch transport failure, batch left pending: {}", e);
                outcome.success = false;
                outcome.error = Some(e.to_string());
                return Ok(outcome);
            }
        };

        let resolution = resolve_batch(&by_entity_id, &response);
        outcome.pushed += resolution.pushed;
        outcome.failed += resolution.failed;
        for (id, error) in &resolution.retries {
            change_log::increment_retry(pool, *id, error).await?;
        }
        change_log::mark_synced(pool, &resolution.synced_ids).await?;
    }

    Ok(outcome)
}

/// Per-batch resolution of a [`PushResponse`] against the change-log row ids
/// it was built from. Every row sharing an `entity_id` resolves together,
/// since the server's response is keyed by entity, not by row id.
struct BatchResolution {
    synced_ids: Vec<i64>,
    retries: Vec<(i64, String)>,
    pushed: i64,
    failed: i64,
}

fn resolve_batch(by_entity_id: &HashMap<String, Vec<i64>>, response: &PushResponse) -> BatchResolution {
    let mut resolution = BatchResolution { synced_ids: Vec::new(), retries: Vec::new(), pushed: 0, failed: 0 };

    for item in &response.results {
        let Some(ids) = by_entity_id.get(&item.entity_id) else {
            tracing::warn!("push response referenced unknown entity_id {}", item.entity_id);
            continue;
        };
        if item.success {
            resolution.synced_ids.extend(ids.iter().copied());
            resolution.pushed += 1;
        } else {
            let error = item.error.clone().unwrap_or_else(|| "Unknown error".to_string());
            resolution.retries.extend(ids.iter().map(|&id| (id, error.clone())));
            resolution.failed += 1;
        }
    }

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::wire::PushResultItem;
    use crate::db::Store;

    #[tokio::test]
    async fn empty_queue_pushes_nothing_without_a_request() {
        let store = Store::open_in_memory().await.unwrap();
        let client = SyncClient::new("https://sync.example.invalid", std::time::Duration::from_secs(1)).unwrap();

        let outcome = push(store.pool(), &client, "device-1").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.pushed, 0);
        assert_eq!(outcome.failed, 0);
    }

    /// Two change-log rows sharing one entity_id (an insert, then an update,
    /// of the same note, queued before a sync runs) must both resolve off a
    /// single server response item keyed by that entity_id — neither row id
    /// should be left behind to get redundantly resent later.
    #[test]
    fn batch_resolution_marks_every_row_sharing_an_entity_id() {
        let mut by_entity_id: HashMap<String, Vec<i64>> = HashMap::new();
        by_entity_id.insert("note-1".to_string(), vec![10, 11]);
        by_entity_id.insert("note-2".to_string(), vec![12]);

        let response = PushResponse {
            success_count: 1,
            failure_count: 1,
            results: vec![
                PushResultItem { entity_id: "note-1".to_string(), success: true, error: None },
                PushResultItem { entity_id: "note-2".to_string(), success: false, error: Some("conflict".into()) },
            ],
            new_checkpoint: None,
        };

        let resolution = resolve_batch(&by_entity_id, &response);

        let mut synced = resolution.synced_ids.clone();
        synced.sort();
        assert_eq!(synced, vec![10, 11]);
        assert_eq!(resolution.pushed, 1);

        assert_eq!(resolution.retries.len(), 1);
        assert_eq!(resolution.retries[0].0, 12);
        assert_eq!(resolution.retries[0].1, "conflict");
        assert_eq!(resolution.failed, 1);
    }
}

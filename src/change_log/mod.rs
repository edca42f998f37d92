// change_log/mod.rs - durable, priority-ordered outgoing sync queue

use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::config::{SYNC_BATCH_MAX_SIZE, SYNC_MAX_RETRY_COUNT, SYNC_QUEUE_MAX_SIZE, SYNC_QUEUE_WARNING_SIZE};
use crate::error::{Error, Result};
use crate::time::now_iso;

/// One of the three mutation kinds a change-log row can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// A durable record of one local mutation awaiting replication.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: String,
    pub priority: i64,
    pub created_at: String,
    pub synced_at: Option<String>,
    pub retry_count: i64,
    pub last_error: Option<String>,
}

/// `{size, warning, full, message}` summary of outgoing queue health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub size: i64,
    pub warning: bool,
    pub full: bool,
    pub message: String,
}

/// Aggregate counters over the change log.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChangeLogStats {
    pub total: i64,
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
    pub by_entity_type: Vec<(String, i64)>,
    pub by_operation: Vec<(String, i64)>,
}

/// Maps an entity type to its drain priority: `3` (high) for reflections and
/// user-originated entries, `2` (medium) for notes and relations, `1` (low)
/// for everything else.
pub fn priority_for(entity_type: &str) -> i64 {
    match entity_type {
        "reflection" | "user" => 3,
        "note" | "relation" => 2,
        _ => 1,
    }
}

/// Number of rows still awaiting replication (pending + failed).
pub async fn pending_size(pool: &SqlitePool) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM change_log WHERE synced_at IS NULL")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Appends a change-log row inside the caller's transaction, so the log stays
/// causally consistent with the entity write that produced it. Fails with
/// [`Error::QueueFull`] once the pending count has reached
/// `SYNC_QUEUE_MAX_SIZE`.
pub async fn log_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    entity_type: &str,
    entity_id: &str,
    operation: Operation,
    payload: &serde_json::Value,
) -> Result<i64> {
    if entity_type.trim().is_empty() {
        return Err(Error::Validation("entity_type must not be empty".into()));
    }
    if entity_id.trim().is_empty() {
        return Err(Error::Validation("entity_id must not be empty".into()));
    }

    let (pending,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM change_log WHERE synced_at IS NULL")
            .fetch_one(&mut **tx)
            .await?;
    if pending >= SYNC_QUEUE_MAX_SIZE {
        return Err(Error::QueueFull);
    }

    let priority = priority_for(entity_type);
    let created_at = now_iso();
    let payload_str = serde_json::to_string(payload)?;

    let result = sqlx::query(
        r#"
        INSERT INTO change_log (entity_type, entity_id, operation, payload, priority, created_at, retry_count)
        VALUES (?, ?, ?, ?, ?, ?, 0)
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(operation.as_str())
    .bind(&payload_str)
    .bind(priority)
    .bind(&created_at)
    .execute(&mut **tx)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Selects up to `limit` pending rows (`synced_at IS NULL AND retry_count <
/// SYNC_MAX_RETRY_COUNT`), ordered `priority DESC, created_at ASC` so classes
/// drain strictly by priority and FIFO within a class.
pub async fn pending(pool: &SqlitePool, limit: i64) -> Result<Vec<ChangeLogEntry>> {
    let limit = limit.min(SYNC_BATCH_MAX_SIZE);
    let rows = sqlx::query_as::<_, ChangeLogEntry>(
        r#"
        SELECT id, entity_type, entity_id, operation, payload, priority, created_at, synced_at, retry_count, last_error
        FROM change_log
        WHERE synced_at IS NULL AND retry_count < ?
        ORDER BY priority DESC, created_at ASC
        LIMIT ?
        "#,
    )
    .bind(SYNC_MAX_RETRY_COUNT)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Streams pending rows (by the same ordering as [`pending`]) into a batch
/// capped at `max_count` rows and a serialized-size estimate of `max_bytes`.
/// Each entry is estimated at `len(payload) + BATCH_ENTRY_OVERHEAD_BYTES`.
/// Always returns at least one entry if any pending row exists and at least
/// one fits within `max_bytes` alone.
pub async fn pending_batch(
    pool: &SqlitePool,
    max_count: i64,
    max_bytes: i64,
) -> Result<Vec<ChangeLogEntry>> {
    use crate::config::BATCH_ENTRY_OVERHEAD_BYTES;

    let candidates = pending(pool, max_count).await?;
    let mut batch = Vec::new();
    let mut used_bytes: i64 = 0;

    for entry in candidates {
        let entry_bytes = entry.payload.len() as i64 + BATCH_ENTRY_OVERHEAD_BYTES;
        if !batch.is_empty() && used_bytes + entry_bytes > max_bytes {
            break;
        }
        used_bytes += entry_bytes;
        batch.push(entry);
    }

    Ok(batch)
}

/// Marks every id in `ids` synced as of now. A no-op on an empty slice.
pub async fn mark_synced(pool: &SqlitePool, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }

    let now = now_iso();
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "UPDATE change_log SET synced_at = ? WHERE id IN ({placeholders})"
    );

    let mut query = sqlx::query(&sql).bind(&now);
    for id in ids {
        query = query.bind(id);
    }
    let result = query.execute(pool).await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound("no change-log rows matched the given ids".into()));
    }
    Ok(())
}

/// Atomically increments `retry_count` and records `error` on one row.
pub async fn increment_retry(pool: &SqlitePool, id: i64, error: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE change_log SET retry_count = retry_count + 1, last_error = ? WHERE id = ?",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("change-log row {id} does not exist")));
    }
    Ok(())
}

/// Rows that have exhausted their retry budget (`retry_count >=
/// SYNC_MAX_RETRY_COUNT`), newest first.
pub async fn failed_entries(pool: &SqlitePool) -> Result<Vec<ChangeLogEntry>> {
    let rows = sqlx::query_as::<_, ChangeLogEntry>(
        r#"
        SELECT id, entity_type, entity_id, operation, payload, priority, created_at, synced_at, retry_count, last_error
        FROM change_log
        WHERE synced_at IS NULL AND retry_count >= ?
        ORDER BY created_at DESC
        "#,
    )
    .bind(SYNC_MAX_RETRY_COUNT)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Resets `retry_count` to 0 and clears `last_error` for the given ids, or
/// for every currently-failed row if `ids` is `None`.
pub async fn reset_retry(pool: &SqlitePool, ids: Option<&[i64]>) -> Result<()> {
    match ids {
        Some(ids) if !ids.is_empty() => {
            let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let sql = format!(
                "UPDATE change_log SET retry_count = 0, last_error = NULL WHERE id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql);
            for id in ids {
                query = query.bind(id);
            }
            query.execute(pool).await?;
        }
        Some(_) => {}
        None => {
            sqlx::query(
                "UPDATE change_log SET retry_count = 0, last_error = NULL WHERE synced_at IS NULL AND retry_count >= ?",
            )
            .bind(SYNC_MAX_RETRY_COUNT)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

/// Deletes synced rows older than `days` days. Never touches pending or
/// failed rows.
pub async fn cleanup_old(pool: &SqlitePool, days: i64) -> Result<u64> {
    if days <= 0 {
        return Err(Error::Validation("days must be > 0".into()));
    }
    let cutoff = (crate::time::now_utc() - chrono::Duration::days(days))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let result = sqlx::query("DELETE FROM change_log WHERE synced_at IS NOT NULL AND synced_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// `{size, warning, full, message}` snapshot used by the orchestrator's gate
/// and by any UI status banner.
pub async fn queue_status(pool: &SqlitePool) -> Result<QueueStatus> {
    let size = pending_size(pool).await?;
    let warning = size >= SYNC_QUEUE_WARNING_SIZE;
    let full = size >= SYNC_QUEUE_MAX_SIZE;
    let message = if full {
        format!("Sync queue is full ({size} pending); new writes are blocked until sync catches up")
    } else if warning {
        format!("Sync queue is large ({size} pending)")
    } else {
        "Sync queue is healthy".to_string()
    };
    Ok(QueueStatus { size, warning, full, message })
}

/// Whether the engine should treat itself as effectively read-only.
pub async fn should_pause_sync(pool: &SqlitePool) -> Result<bool> {
    Ok(queue_status(pool).await?.full)
}

/// `{total, pending, synced, failed, by_entity_type, by_operation}`. The two
/// group-by projections are computed only over pending rows.
pub async fn stats(pool: &SqlitePool) -> Result<ChangeLogStats> {
    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM change_log")
        .fetch_one(pool)
        .await?;
    let (synced,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM change_log WHERE synced_at IS NOT NULL")
            .fetch_one(pool)
            .await?;
    let (failed,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM change_log WHERE synced_at IS NULL AND retry_count >= ?",
    )
    .bind(SYNC_MAX_RETRY_COUNT)
    .fetch_one(pool)
    .await?;
    let pending = total - synced - failed;

    let by_entity_type: Vec<(String, i64)> = sqlx::query_as(
        "SELECT entity_type, COUNT(*) FROM change_log WHERE synced_at IS NULL GROUP BY entity_type",
    )
    .fetch_all(pool)
    .await?;
    let by_operation: Vec<(String, i64)> = sqlx::query_as(
        "SELECT operation, COUNT(*) FROM change_log WHERE synced_at IS NULL GROUP BY operation",
    )
    .fetch_all(pool)
    .await?;

    Ok(ChangeLogStats {
        total,
        pending,
        synced,
        failed,
        by_entity_type,
        by_operation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    async fn log_one(pool: &SqlitePool, entity_type: &str, entity_id: &str) -> i64 {
        let mut tx = pool.begin().await.unwrap();
        let id = log_in_tx(
            &mut tx,
            entity_type,
            entity_id,
            Operation::Insert,
            &serde_json::json!({"ok": true}),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn priority_ordering_drains_high_before_low() {
        let store = Store::open_in_memory().await.unwrap();
        let pool = store.pool();

        log_one(pool, "search_history", "sh-1").await;
        log_one(pool, "note", "n-1").await;
        log_one(pool, "reflection", "r-1").await;

        let batch = pending(pool, 10).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["r-1", "n-1", "sh-1"]);
    }

    #[tokio::test]
    async fn mark_synced_removes_from_pending() {
        let store = Store::open_in_memory().await.unwrap();
        let pool = store.pool();
        let id = log_one(pool, "note", "n-1").await;

        mark_synced(pool, &[id]).await.unwrap();
        let batch = pending(pool, 10).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(pending_size(pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn three_failures_move_a_row_from_pending_to_failed() {
        let store = Store::open_in_memory().await.unwrap();
        let pool = store.pool();
        let id = log_one(pool, "note", "n-1").await;

        for _ in 0..3 {
            increment_retry(pool, id, "boom").await.unwrap();
        }

        assert!(pending(pool, 10).await.unwrap().is_empty());
        let failed = failed_entries(pool).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 3);
    }

    #[tokio::test]
    async fn pending_batch_respects_byte_cap() {
        let store = Store::open_in_memory().await.unwrap();
        let pool = store.pool();

        for i in 0..3 {
            let mut tx = pool.begin().await.unwrap();
            log_in_tx(
                &mut tx,
                "note",
                &format!("n-{i}"),
                Operation::Insert,
                &serde_json::Value::String("x".repeat(100_000)),
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        let batch = pending_batch(pool, 100, 500_000).await.unwrap();
        assert!(batch.len() <= 5);
        assert!(!batch.is_empty());
    }

    #[tokio::test]
    async fn queue_full_rejects_new_writes() {
        let store = Store::open_in_memory().await.unwrap();
        let pool = store.pool();

        // Directly fabricate SYNC_QUEUE_MAX_SIZE pending rows to exercise the
        // boundary without looping the real insert path 10,000 times.
        for i in 0..SYNC_QUEUE_MAX_SIZE {
            sqlx::query(
                "INSERT INTO change_log (entity_type, entity_id, operation, payload, priority, created_at, retry_count) VALUES ('note', ?, 'insert', '{}', 2, ?, 0)",
            )
            .bind(format!("bulk-{i}"))
            .bind(now_iso())
            .execute(pool)
            .await
            .unwrap();
        }

        let mut tx = pool.begin().await.unwrap();
        let err = log_in_tx(&mut tx, "note", "overflow", Operation::Insert, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull));
    }
}

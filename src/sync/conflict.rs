// sync/conflict.rs - audit log of every LWW decision made during pull

use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::Result;
use crate::time::now_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
}

impl Resolution {
    fn as_str(self) -> &'static str {
        match self {
            Resolution::LocalWins => "local_wins",
            Resolution::RemoteWins => "remote_wins",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConflictLogEntry {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub local_data: String,
    pub remote_data: String,
    pub resolution: String,
    pub resolved_at: String,
}

/// Appends one conflict-log row inside the caller's transaction. Called for
/// every upsert delta applied during pull, whichever side won, so the log is
/// a complete audit trail of pull decisions.
pub async fn log_conflict(
    tx: &mut Transaction<'_, Sqlite>,
    entity_type: &str,
    entity_id: &str,
    local_data: &serde_json::Value,
    remote_data: &serde_json::Value,
    resolution: Resolution,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO conflict_log (entity_type, entity_id, local_data, remote_data, resolution, resolved_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(serde_json::to_string(local_data)?)
    .bind(serde_json::to_string(remote_data)?)
    .bind(resolution.as_str())
    .bind(now_iso())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get_conflicts(pool: &SqlitePool, limit: i64) -> Result<Vec<ConflictLogEntry>> {
    Ok(sqlx::query_as::<_, ConflictLogEntry>(
        "SELECT * FROM conflict_log ORDER BY resolved_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?)
}

/// Deletes conflict-log rows older than `days_old` days.
pub async fn clear_conflicts(pool: &SqlitePool, days_old: i64) -> Result<u64> {
    let cutoff = (crate::time::now_utc() - chrono::Duration::days(days_old))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let result = sqlx::query("DELETE FROM conflict_log WHERE resolved_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// sync/pull.rs - checkpoint-driven application of server deltas

use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::entities::notes::{self, Note};
use crate::entities::reflections::{self, Reflection};
use crate::entities::relations::{self, Relation};
use crate::error::{Error, Result};

use super::client::SyncClient;
use super::conflict::{self, Resolution};
use super::lww::{should_update, LwwKey};
use super::wire::{Delta, DeltaOperation, PullRequest};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PullOutcome {
    pub applied: i64,
    pub conflicts: i64,
    pub skipped: i64,
}

const CHECKPOINT_KEY: &str = "checkpoint";

/// Reads the stored checkpoint, pulls and applies deltas from the server
/// until `has_more` is false, persisting the new checkpoint after every
/// batch. Each batch is applied atomically: either every delta and the new
/// checkpoint commit, or none do.
pub async fn pull(pool: &SqlitePool, client: &SyncClient, device_id: &str) -> Result<PullOutcome> {
    let mut outcome = PullOutcome::default();
    let mut checkpoint = read_checkpoint(pool).await?;

    loop {
        let request = PullRequest { device_id: device_id.to_string(), checkpoint: checkpoint.clone() };
        let response = client.pull(&request).await?;

        let mut tx = pool.begin().await?;
        for delta in &response.changes {
            match apply_delta(&mut tx, delta).await {
                Ok(conflict_logged) => {
                    outcome.applied += 1;
                    if conflict_logged {
                        outcome.conflicts += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "skipping delta for {} {} after apply error: {}",
                        delta.entity_type,
                        delta.entity_id,
                        e
                    );
                    outcome.skipped += 1;
                }
            }
        }

        write_checkpoint(&mut tx, &response.new_checkpoint).await?;
        tx.commit().await?;

        checkpoint = Some(response.new_checkpoint.clone());
        if !response.has_more {
            break;
        }
    }

    Ok(outcome)
}

async fn read_checkpoint(pool: &SqlitePool) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM sync_state WHERE key = ?")
            .bind(CHECKPOINT_KEY)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(v,)| v))
}

async fn write_checkpoint(tx: &mut Transaction<'_, Sqlite>, checkpoint: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_state (key, value) VALUES (?, ?)
        ON CONFLICT (key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(CHECKPOINT_KEY)
    .bind(checkpoint)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Applies one delta. Returns whether a conflict-log row was written (true
/// for every upsert against an existing note/relation/reflection, false for
/// first-time inserts and for note_keyword/delete operations which carry no
/// conflict resolution).
async fn apply_delta(tx: &mut Transaction<'_, Sqlite>, delta: &Delta) -> Result<bool> {
    match (delta.entity_type.as_str(), delta.operation) {
        ("note", DeltaOperation::Upsert) => apply_note_upsert(tx, delta).await,
        ("note", DeltaOperation::Delete) => {
            apply_note_delete(tx, delta).await?;
            Ok(false)
        }
        ("relation", DeltaOperation::Upsert) => apply_relation_upsert(tx, delta).await,
        ("relation", DeltaOperation::Delete) => {
            relations::delete_raw_by_id(&mut **tx, &delta.entity_id).await?;
            Ok(false)
        }
        ("reflection", DeltaOperation::Upsert) => apply_reflection_upsert(tx, delta).await,
        ("reflection", DeltaOperation::Delete) => {
            reflections::delete_raw_by_date(&mut **tx, &delta.entity_id).await?;
            Ok(false)
        }
        ("note_keyword", DeltaOperation::Upsert) => {
            apply_note_keyword_upsert(tx, delta).await?;
            Ok(false)
        }
        ("note_keyword", DeltaOperation::Delete) => {
            let (note_id, keyword_id) = parse_note_keyword_id(&delta.entity_id)?;
            sqlx::query("DELETE FROM note_keywords WHERE note_id = ? AND keyword_id = ?")
                .bind(note_id)
                .bind(keyword_id)
                .execute(&mut **tx)
                .await?;
            Ok(false)
        }
        (other, _) => Err(Error::Validation(format!("unknown delta entity_type `{other}`"))),
    }
}

async fn apply_note_upsert(tx: &mut Transaction<'_, Sqlite>, delta: &Delta) -> Result<bool> {
    let data = delta
        .data
        .as_ref()
        .ok_or_else(|| Error::Validation("note upsert delta missing data".into()))?;
    let remote: Note = serde_json::from_value(data.clone())?;

    let existing = notes::fetch_raw(&mut **tx, &delta.entity_id).await?;

    let Some(local) = existing else {
        sqlx::query(
            r#"
            INSERT INTO notes (id, body, importance, source_url, image_path, created_at, updated_at, deleted_at, server_timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&remote.id)
        .bind(&remote.body)
        .bind(remote.importance)
        .bind(&remote.source_url)
        .bind(&remote.image_path)
        .bind(&remote.created_at)
        .bind(&delta.updated_at)
        .bind(&remote.deleted_at)
        .bind(&delta.server_timestamp)
        .execute(&mut **tx)
        .await?;
        return Ok(false);
    };

    let local_key = LwwKey {
        updated_at: &local.updated_at,
        server_timestamp: local.server_timestamp.as_deref(),
        id: &local.id,
    };
    let remote_key = LwwKey {
        updated_at: &delta.updated_at,
        server_timestamp: delta.server_timestamp.as_deref(),
        id: &delta.entity_id,
    };

    let remote_wins = should_update(&local_key, &remote_key);
    if remote_wins {
        sqlx::query(
            r#"
            UPDATE notes SET body = ?, importance = ?, source_url = ?, image_path = ?,
                   updated_at = ?, deleted_at = ?, server_timestamp = ?
            WHERE id = ?
            "#,
        )
        .bind(&remote.body)
        .bind(remote.importance)
        .bind(&remote.source_url)
        .bind(&remote.image_path)
        .bind(&delta.updated_at)
        .bind(&remote.deleted_at)
        .bind(&delta.server_timestamp)
        .bind(&delta.entity_id)
        .execute(&mut **tx)
        .await?;
    }

    conflict::log_conflict(
        tx,
        "note",
        &delta.entity_id,
        &serde_json::to_value(&local)?,
        data,
        if remote_wins { Resolution::RemoteWins } else { Resolution::LocalWins },
    )
    .await?;
    Ok(true)
}

async fn apply_note_delete(tx: &mut Transaction<'_, Sqlite>, delta: &Delta) -> Result<()> {
    sqlx::query(
        "UPDATE notes SET deleted_at = ?, updated_at = ?, server_timestamp = ? WHERE id = ?",
    )
    .bind(&delta.updated_at)
    .bind(&delta.updated_at)
    .bind(&delta.server_timestamp)
    .bind(&delta.entity_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn apply_relation_upsert(tx: &mut Transaction<'_, Sqlite>, delta: &Delta) -> Result<bool> {
    let data = delta
        .data
        .as_ref()
        .ok_or_else(|| Error::Validation("relation upsert delta missing data".into()))?;
    let remote: Relation = serde_json::from_value(data.clone())?;

    let existing = sqlx::query_as::<_, Relation>("SELECT * FROM relations WHERE id = ?")
        .bind(&delta.entity_id)
        .fetch_optional(&mut **tx)
        .await?;

    let Some(local) = existing else {
        sqlx::query(
            r#"
            INSERT INTO relations (id, from_note_id, to_note_id, relation_type, rationale, source, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&remote.id)
        .bind(&remote.from_note_id)
        .bind(&remote.to_note_id)
        .bind(&remote.relation_type)
        .bind(&remote.rationale)
        .bind(&remote.source)
        .bind(&remote.created_at)
        .execute(&mut **tx)
        .await?;
        return Ok(false);
    };

    // Relations are immutable; created_at stands in for updated_at.
    let local_key = LwwKey { updated_at: &local.created_at, server_timestamp: None, id: &local.id };
    let remote_key = LwwKey { updated_at: &delta.updated_at, server_timestamp: delta.server_timestamp.as_deref(), id: &delta.entity_id };
    let remote_wins = should_update(&local_key, &remote_key);

    if remote_wins {
        sqlx::query(
            r#"
            UPDATE relations SET relation_type = ?, rationale = ?, source = ? WHERE id = ?
            "#,
        )
        .bind(&remote.relation_type)
        .bind(&remote.rationale)
        .bind(&remote.source)
        .bind(&delta.entity_id)
        .execute(&mut **tx)
        .await?;
    }

    conflict::log_conflict(
        tx,
        "relation",
        &delta.entity_id,
        &serde_json::to_value(&local)?,
        data,
        if remote_wins { Resolution::RemoteWins } else { Resolution::LocalWins },
    )
    .await?;
    Ok(true)
}

async fn apply_reflection_upsert(tx: &mut Transaction<'_, Sqlite>, delta: &Delta) -> Result<bool> {
    let data = delta
        .data
        .as_ref()
        .ok_or_else(|| Error::Validation("reflection upsert delta missing data".into()))?;
    let remote: Reflection = serde_json::from_value(data.clone())?;

    let existing = sqlx::query_as::<_, Reflection>("SELECT * FROM reflections WHERE date = ?")
        .bind(&delta.entity_id)
        .fetch_optional(&mut **tx)
        .await?;

    let Some(local) = existing else {
        sqlx::query("INSERT INTO reflections (date, content, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(&remote.date)
            .bind(&remote.content)
            .bind(&remote.created_at)
            .bind(&delta.updated_at)
            .execute(&mut **tx)
            .await?;
        return Ok(false);
    };

    let local_key = LwwKey { updated_at: &local.updated_at, server_timestamp: None, id: &local.date };
    let remote_key = LwwKey { updated_at: &delta.updated_at, server_timestamp: delta.server_timestamp.as_deref(), id: &delta.entity_id };
    let remote_wins = should_update(&local_key, &remote_key);

    if remote_wins {
        sqlx::query("UPDATE reflections SET content = ?, updated_at = ? WHERE date = ?")
            .bind(&remote.content)
            .bind(&delta.updated_at)
            .bind(&delta.entity_id)
            .execute(&mut **tx)
            .await?;
    }

    conflict::log_conflict(
        tx,
        "reflection",
        &delta.entity_id,
        &serde_json::to_value(&local)?,
        data,
        if remote_wins { Resolution::RemoteWins } else { Resolution::LocalWins },
    )
    .await?;
    Ok(true)
}

async fn apply_note_keyword_upsert(tx: &mut Transaction<'_, Sqlite>, delta: &Delta) -> Result<()> {
    #[derive(Deserialize)]
    struct NoteKeywordData {
        keyword_name: String,
        score: f64,
        #[serde(default = "default_source")]
        source: String,
    }
    fn default_source() -> String {
        "ai".to_string()
    }

    let data = delta
        .data
        .as_ref()
        .ok_or_else(|| Error::Validation("note_keyword upsert delta missing data".into()))?;
    let data: NoteKeywordData = serde_json::from_value(data.clone())?;
    let (note_id, _keyword_id) = parse_note_keyword_id(&delta.entity_id)?;

    sqlx::query("INSERT OR IGNORE INTO keywords (name) VALUES (?)")
        .bind(&data.keyword_name)
        .execute(&mut **tx)
        .await?;
    let (keyword_id,): (i64,) = sqlx::query_as("SELECT id FROM keywords WHERE name = ?")
        .bind(&data.keyword_name)
        .fetch_one(&mut **tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO note_keywords (note_id, keyword_id, score, source) VALUES (?, ?, ?, ?)
        ON CONFLICT (note_id, keyword_id) DO UPDATE SET score = excluded.score, source = excluded.source
        "#,
    )
    .bind(note_id)
    .bind(keyword_id)
    .bind(data.score)
    .bind(&data.source)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn parse_note_keyword_id(entity_id: &str) -> Result<(&str, i64)> {
    let (note_id, keyword_id) = entity_id
        .split_once(':')
        .ok_or_else(|| Error::Validation(format!("`{entity_id}` is not a note_id:keyword_id composite id")))?;
    let keyword_id = keyword_id
        .parse::<i64>()
        .map_err(|_| Error::Validation(format!("`{entity_id}` has a non-numeric keyword id")))?;
    Ok((note_id, keyword_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    #[tokio::test]
    async fn first_time_note_upsert_inserts_without_conflict() {
        let store = Store::open_in_memory().await.unwrap();
        let mut tx = store.pool().begin().await.unwrap();

        let delta = Delta {
            entity_type: "note".into(),
            entity_id: "n-1".into(),
            operation: DeltaOperation::Upsert,
            data: Some(serde_json::json!({
                "id": "n-1", "body": "hello", "importance": 2,
                "created_at": "2025-01-01T00:00:00.000Z", "updated_at": "2025-01-01T00:00:00.000Z"
            })),
            updated_at: "2025-01-01T00:00:00.000Z".into(),
            server_timestamp: Some("ts-1".into()),
        };

        let conflict_logged = apply_delta(&mut tx, &delta).await.unwrap();
        tx.commit().await.unwrap();
        assert!(!conflict_logged);

        let note: Note = sqlx::query_as("SELECT * FROM notes WHERE id = ?")
            .bind("n-1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(note.body, "hello");
    }

    #[tokio::test]
    async fn remote_newer_upsert_overwrites_and_logs_conflict() {
        let store = Store::open_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO notes (id, body, importance, created_at, updated_at) VALUES ('n-1', 'old', 1, '2025-01-10T09:00:00.000Z', '2025-01-10T10:00:00.000Z')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let delta = Delta {
            entity_type: "note".into(),
            entity_id: "n-1".into(),
            operation: DeltaOperation::Upsert,
            data: Some(serde_json::json!({
                "id": "n-1", "body": "new", "importance": 1,
                "created_at": "2025-01-10T09:00:00.000Z", "updated_at": "2025-01-10T11:00:00.000Z"
            })),
            updated_at: "2025-01-10T11:00:00.000Z".into(),
            server_timestamp: None,
        };

        let mut tx = store.pool().begin().await.unwrap();
        let conflict_logged = apply_delta(&mut tx, &delta).await.unwrap();
        tx.commit().await.unwrap();
        assert!(conflict_logged);

        let note: Note = sqlx::query_as("SELECT * FROM notes WHERE id = ?")
            .bind("n-1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(note.body, "new");

        let conflicts = conflict::get_conflicts(store.pool(), 10).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution, "remote_wins");
    }
}

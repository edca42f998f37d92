// entities/notes.rs - note CRUD, soft delete, and change-log emission

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::change_log::{self, Operation};
use crate::error::{Error, Result};
use crate::ids::new_uuid_v7;
use crate::time::now_iso;

/// A single note: the primary content unit of the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
    pub id: String,
    pub body: String,
    pub importance: i64,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub image_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
    #[serde(default)]
    pub server_timestamp: Option<String>,
}

/// Partial update: `None` leaves the corresponding field unchanged, `Some`
/// (including `Some(None)`) overwrites it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteUpdate {
    pub body: Option<String>,
    pub importance: Option<i64>,
    pub source_url: Option<Option<String>>,
    pub image_path: Option<Option<String>>,
}

/// Filters accepted by [`NotesRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct NoteFilters {
    pub importance: Option<i64>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
    pub include_deleted: bool,
    pub limit: i64,
    pub offset: i64,
}

impl NoteFilters {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct NotesRepository {
    pool: SqlitePool,
}

impl NotesRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validates `importance ∈ {1,2,3}`, assigns a fresh UUIDv7, inserts the
    /// row, and emits a medium-priority change-log insert in the same
    /// transaction.
    pub async fn create(
        &self,
        body: &str,
        importance: i64,
        source_url: Option<&str>,
        image_path: Option<&str>,
    ) -> Result<Note> {
        validate_importance(importance)?;
        if body.trim().is_empty() {
            return Err(Error::Validation("note body must not be empty".into()));
        }

        let now = now_iso();
        let note = Note {
            id: new_uuid_v7().to_string(),
            body: body.to_string(),
            importance,
            source_url: source_url.map(str::to_string),
            image_path: image_path.map(str::to_string),
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
            server_timestamp: None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO notes (id, body, importance, source_url, image_path, created_at, updated_at, deleted_at, server_timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL)
            "#,
        )
        .bind(&note.id)
        .bind(&note.body)
        .bind(note.importance)
        .bind(&note.source_url)
        .bind(&note.image_path)
        .bind(&note.created_at)
        .bind(&note.updated_at)
        .execute(&mut *tx)
        .await?;

        change_log::log_in_tx(
            &mut tx,
            "note",
            &note.id,
            Operation::Insert,
            &serde_json::to_value(&note)?,
        )
        .await?;

        tx.commit().await?;
        Ok(note)
    }

    /// Returns the note only if it has not been soft-deleted.
    pub async fn get(&self, id: &str) -> Result<Option<Note>> {
        let note = sqlx::query_as::<_, Note>(
            "SELECT * FROM notes WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(note)
    }

    /// Raw read that ignores the soft-delete filter, used by pull-apply so
    /// it can see tombstoned rows when deciding whether to insert or merge.
    pub async fn get_raw(&self, id: &str) -> Result<Option<Note>> {
        fetch_raw(&self.pool, id).await
    }

    /// Applies only the fields set in `update`, bumps `updated_at`, and
    /// emits a change-log update. Fails with [`Error::NotFound`] if the note
    /// is missing or soft-deleted.
    pub async fn update(&self, id: &str, update: NoteUpdate) -> Result<Note> {
        if let Some(importance) = update.importance {
            validate_importance(importance)?;
        }

        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, Note>(
            "SELECT * FROM notes WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("note {id} not found")))?;

        let body = update.body.unwrap_or(existing.body);
        let importance = update.importance.unwrap_or(existing.importance);
        let source_url = update.source_url.unwrap_or(existing.source_url);
        let image_path = update.image_path.unwrap_or(existing.image_path);
        let updated_at = now_iso();

        sqlx::query(
            r#"
            UPDATE notes SET body = ?, importance = ?, source_url = ?, image_path = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&body)
        .bind(importance)
        .bind(&source_url)
        .bind(&image_path)
        .bind(&updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let note = Note {
            id: id.to_string(),
            body,
            importance,
            source_url,
            image_path,
            created_at: existing.created_at,
            updated_at,
            deleted_at: None,
            server_timestamp: existing.server_timestamp,
        };

        change_log::log_in_tx(
            &mut tx,
            "note",
            &note.id,
            Operation::Update,
            &serde_json::to_value(&note)?,
        )
        .await?;

        tx.commit().await?;
        Ok(note)
    }

    /// Soft delete: sets `deleted_at = updated_at = now`. Repeat deletes of
    /// an already-deleted note fail with [`Error::NotFound`].
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, Note>(
            "SELECT * FROM notes WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("note {id} not found")))?;

        let now = now_iso();
        sqlx::query("UPDATE notes SET deleted_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        change_log::log_in_tx(
            &mut tx,
            "note",
            id,
            Operation::Delete,
            &serde_json::json!({ "id": existing.id, "deleted_at": now }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Permanently removes the row and cascades to relations/note_keywords.
    /// Test/admin only: intentionally skips the change log, since syncing a
    /// hard delete would push a tombstone-less delete that a server with no
    /// record of this row could not apply.
    pub async fn hard_delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        crate::entities::relations::delete_for_note_in_tx(&mut *tx, id).await?;
        let result = sqlx::query("DELETE FROM notes WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("note {id} not found")));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Lists notes matching `filters`, ordered by `updated_at DESC`.
    pub async fn list(&self, filters: &NoteFilters) -> Result<Vec<Note>> {
        let mut sql = String::from("SELECT * FROM notes WHERE 1 = 1");
        if !filters.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if filters.importance.is_some() {
            sql.push_str(" AND importance = ?");
        }
        if filters.created_after.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if filters.created_before.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        sql.push_str(" ORDER BY updated_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, Note>(&sql);
        if let Some(importance) = filters.importance {
            query = query.bind(importance);
        }
        if let Some(after) = &filters.created_after {
            query = query.bind(after);
        }
        if let Some(before) = &filters.created_before {
            query = query.bind(before);
        }
        let limit = if filters.limit > 0 { filters.limit } else { 100 };
        query = query.bind(limit).bind(filters.offset);

        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Notes created in the `[midnight, midnight + 24h)` UTC window of
    /// today.
    pub async fn today(&self) -> Result<Vec<Note>> {
        let now = crate::time::now_utc();
        let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap();
        let start = chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(midnight, chrono::Utc);
        let end = start + chrono::Duration::hours(24);

        let filters = NoteFilters {
            created_after: Some(start.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            created_before: Some(end.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            limit: 1000,
            ..Default::default()
        };
        self.list(&filters).await
    }
}

/// Raw, soft-delete-ignoring lookup shared by [`NotesRepository::get_raw`]
/// and `sync::pull`, which needs the same read from inside its own
/// transaction to keep a batch's reads and writes atomic.
pub(crate) async fn fetch_raw<'e, E>(executor: E, id: &str) -> Result<Option<Note>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    Ok(sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?)
}

fn validate_importance(importance: i64) -> Result<()> {
    if !(1..=3).contains(&importance) {
        return Err(Error::Validation(format!(
            "importance must be 1, 2, or 3, got {importance}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    async fn repo() -> NotesRepository {
        let store = Store::open_in_memory().await.unwrap();
        NotesRepository::new(store.pool().clone())
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let repo = repo().await;
        let created = repo.create("hello world", 2, None, None).await.unwrap();
        let fetched = repo.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.body, "hello world");
        assert_eq!(fetched.importance, 2);
    }

    #[tokio::test]
    async fn create_rejects_bad_importance() {
        let repo = repo().await;
        let err = repo.create("x", 9, None, None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn update_leaves_unmentioned_fields_unchanged() {
        let repo = repo().await;

        crate::time::set_test_clock("2025-06-01T12:00:00.000Z".parse().unwrap());
        let created = repo.create("original", 1, Some("http://x"), None).await.unwrap();

        crate::time::set_test_clock("2025-06-01T12:00:00.500Z".parse().unwrap());
        let updated = repo
            .update(
                &created.id,
                NoteUpdate {
                    body: Some("changed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        crate::time::clear_test_clock();

        assert_eq!(updated.body, "changed");
        assert_eq!(updated.importance, 1);
        assert_eq!(updated.source_url.as_deref(), Some("http://x"));
        assert!(updated.updated_at > created.updated_at);
    }

    #[tokio::test]
    async fn delete_then_get_returns_nothing_and_second_delete_fails() {
        let repo = repo().await;
        let created = repo.create("bye", 1, None, None).await.unwrap();
        repo.delete(&created.id).await.unwrap();

        assert!(repo.get(&created.id).await.unwrap().is_none());
        let err = repo.delete(&created.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn list_excludes_deleted_by_default() {
        let repo = repo().await;
        let a = repo.create("a", 1, None, None).await.unwrap();
        let _b = repo.create("b", 1, None, None).await.unwrap();
        repo.delete(&a.id).await.unwrap();

        let notes = repo.list(&NoteFilters::new()).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].body, "b");
    }
}

// entities/reflections.rs - one free-form journal entry per calendar day

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::change_log::{self, Operation};
use crate::error::{Error, Result};
use crate::time::now_iso;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reflection {
    pub date: String,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct ReflectionsRepository {
    pool: SqlitePool,
}

impl ReflectionsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fails with [`Error::Duplicate`] if `date` already has an entry.
    pub async fn create(&self, date: &str, content: &str) -> Result<Reflection> {
        validate_date(date)?;

        let now = now_iso();
        let reflection = Reflection {
            date: date.to_string(),
            content: content.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;
        let insert = sqlx::query(
            "INSERT INTO reflections (date, content, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&reflection.date)
        .bind(&reflection.content)
        .bind(&reflection.created_at)
        .bind(&reflection.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &insert {
            if db_err.is_unique_violation() {
                return Err(Error::Duplicate(format!("reflection for {date} already exists")));
            }
        }
        insert?;

        change_log::log_in_tx(
            &mut tx,
            "reflection",
            &reflection.date,
            Operation::Insert,
            &serde_json::to_value(&reflection)?,
        )
        .await?;

        tx.commit().await?;
        Ok(reflection)
    }

    pub async fn get(&self, date: &str) -> Result<Option<Reflection>> {
        Ok(sqlx::query_as::<_, Reflection>("SELECT * FROM reflections WHERE date = ?")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Fails with [`Error::NotFound`] if no reflection exists for `date`.
    pub async fn update(&self, date: &str, content: &str) -> Result<Reflection> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, Reflection>("SELECT * FROM reflections WHERE date = ?")
            .bind(date)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::NotFound(format!("reflection for {date} not found")))?;

        let updated_at = now_iso();
        sqlx::query("UPDATE reflections SET content = ?, updated_at = ? WHERE date = ?")
            .bind(content)
            .bind(&updated_at)
            .bind(date)
            .execute(&mut *tx)
            .await?;

        let reflection = Reflection {
            date: date.to_string(),
            content: content.to_string(),
            created_at: existing.created_at,
            updated_at,
        };

        change_log::log_in_tx(
            &mut tx,
            "reflection",
            &reflection.date,
            Operation::Update,
            &serde_json::to_value(&reflection)?,
        )
        .await?;

        tx.commit().await?;
        Ok(reflection)
    }

    /// Inclusive range `[start, end]`, descending by date. `start` must not
    /// be after `end`.
    pub async fn get_by_range(&self, start: &str, end: &str) -> Result<Vec<Reflection>> {
        validate_date(start)?;
        validate_date(end)?;
        if start > end {
            return Err(Error::Validation("start date must not be after end date".into()));
        }
        Ok(sqlx::query_as::<_, Reflection>(
            "SELECT * FROM reflections WHERE date >= ? AND date <= ? ORDER BY date DESC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?)
    }

    /// The `n` most recent reflections.
    pub async fn recent(&self, n: i64) -> Result<Vec<Reflection>> {
        Ok(sqlx::query_as::<_, Reflection>(
            "SELECT * FROM reflections ORDER BY date DESC LIMIT ?",
        )
        .bind(n)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Physically removes one reflection. Used by pull-apply; does not emit
    /// a change-log entry.
    pub async fn delete_raw(&self, date: &str) -> Result<()> {
        delete_raw_by_date(&self.pool, date).await
    }
}

/// Shared by [`ReflectionsRepository::delete_raw`] and `sync::pull`, which
/// runs this inside its own batch transaction.
pub(crate) async fn delete_raw_by_date<'e, E>(executor: E, date: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query("DELETE FROM reflections WHERE date = ?")
        .bind(date)
        .execute(executor)
        .await?;
    Ok(())
}

fn validate_date(date: &str) -> Result<()> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| Error::Validation(format!("`{date}` is not a valid YYYY-MM-DD date")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    async fn repo() -> ReflectionsRepository {
        let store = Store::open_in_memory().await.unwrap();
        ReflectionsRepository::new(store.pool().clone())
    }

    #[tokio::test]
    async fn duplicate_date_is_rejected() {
        let repo = repo().await;
        repo.create("2025-01-10", "first").await.unwrap();
        let err = repo.create("2025-01-10", "second").await.unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[tokio::test]
    async fn invalid_calendar_date_is_rejected() {
        let repo = repo().await;
        let err = repo.create("2025-02-30", "x").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn update_missing_reflection_fails() {
        let repo = repo().await;
        let err = repo.update("2025-01-10", "x").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn range_requires_start_not_after_end() {
        let repo = repo().await;
        let err = repo.get_by_range("2025-02-01", "2025-01-01").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

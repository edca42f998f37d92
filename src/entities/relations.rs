// entities/relations.rs - directed links between notes

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::change_log::{self, Operation};
use crate::error::{Error, Result};
use crate::ids::new_uuid_v7;
use crate::time::now_iso;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Relation {
    pub id: String,
    pub from_note_id: String,
    pub to_note_id: String,
    pub relation_type: String,
    #[serde(default)]
    pub rationale: Option<String>,
    pub source: String,
    pub created_at: String,
}

#[derive(Clone)]
pub struct RelationsRepository {
    pool: SqlitePool,
}

impl RelationsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new relation. `from` and `to` must differ; the triple
    /// `(from, to, relation_type)` must be unique.
    pub async fn create(
        &self,
        from_note_id: &str,
        to_note_id: &str,
        relation_type: &str,
        rationale: Option<&str>,
        source: &str,
    ) -> Result<Relation> {
        if from_note_id == to_note_id {
            return Err(Error::Validation("a note cannot relate to itself".into()));
        }

        let relation = Relation {
            id: new_uuid_v7().to_string(),
            from_note_id: from_note_id.to_string(),
            to_note_id: to_note_id.to_string(),
            relation_type: relation_type.to_string(),
            rationale: rationale.map(str::to_string),
            source: source.to_string(),
            created_at: now_iso(),
        };

        let mut tx = self.pool.begin().await?;
        let insert = sqlx::query(
            r#"
            INSERT INTO relations (id, from_note_id, to_note_id, relation_type, rationale, source, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&relation.id)
        .bind(&relation.from_note_id)
        .bind(&relation.to_note_id)
        .bind(&relation.relation_type)
        .bind(&relation.rationale)
        .bind(&relation.source)
        .bind(&relation.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &insert {
            if db_err.is_unique_violation() {
                return Err(Error::Duplicate(format!(
                    "relation ({from_note_id}, {to_note_id}, {relation_type}) already exists"
                )));
            }
        }
        insert?;

        change_log::log_in_tx(
            &mut tx,
            "relation",
            &relation.id,
            Operation::Insert,
            &serde_json::to_value(&relation)?,
        )
        .await?;

        tx.commit().await?;
        Ok(relation)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Relation>> {
        Ok(sqlx::query_as::<_, Relation>("SELECT * FROM relations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Outgoing ∪ incoming relations for `note_id`, newest first.
    pub async fn list_for_note(&self, note_id: &str) -> Result<Vec<Relation>> {
        Ok(sqlx::query_as::<_, Relation>(
            r#"
            SELECT * FROM relations
            WHERE from_note_id = ? OR to_note_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(note_id)
        .bind(note_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Whether a relation `(from, to[, type])` already exists.
    pub async fn exists(
        &self,
        from_note_id: &str,
        to_note_id: &str,
        relation_type: Option<&str>,
    ) -> Result<bool> {
        let (count,): (i64,) = if let Some(relation_type) = relation_type {
            sqlx::query_as(
                "SELECT COUNT(*) FROM relations WHERE from_note_id = ? AND to_note_id = ? AND relation_type = ?",
            )
            .bind(from_note_id)
            .bind(to_note_id)
            .bind(relation_type)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT COUNT(*) FROM relations WHERE from_note_id = ? AND to_note_id = ?",
            )
            .bind(from_note_id)
            .bind(to_note_id)
            .fetch_one(&self.pool)
            .await?
        };
        Ok(count > 0)
    }

    /// Physically removes every relation touching `note_id`. Invoked by the
    /// note hard-delete path; soft delete does not cascade.
    pub async fn delete_for_note(&self, note_id: &str) -> Result<u64> {
        delete_for_note_in_tx(&self.pool, note_id).await
    }

    /// Physically removes one relation by id. Used by pull-apply, which
    /// never touches the change log.
    pub async fn delete_raw(&self, id: &str) -> Result<()> {
        delete_raw_by_id(&self.pool, id).await
    }
}

/// Shared by [`RelationsRepository::delete_for_note`] and `notes::hard_delete`,
/// which runs this inside the same transaction as the note row deletion.
pub(crate) async fn delete_for_note_in_tx<'e, E>(executor: E, note_id: &str) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query("DELETE FROM relations WHERE from_note_id = ? OR to_note_id = ?")
        .bind(note_id)
        .bind(note_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

/// Shared by [`RelationsRepository::delete_raw`] and `sync::pull`, which runs
/// this inside its own batch transaction.
pub(crate) async fn delete_raw_by_id<'e, E>(executor: E, id: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query("DELETE FROM relations WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::entities::notes::NotesRepository;

    async fn repos() -> (NotesRepository, RelationsRepository) {
        let store = Store::open_in_memory().await.unwrap();
        (
            NotesRepository::new(store.pool().clone()),
            RelationsRepository::new(store.pool().clone()),
        )
    }

    #[tokio::test]
    async fn self_relation_is_rejected() {
        let (notes, relations) = repos().await;
        let note = notes.create("a", 1, None, None).await.unwrap();
        let err = relations
            .create(&note.id, &note.id, "related", None, "manual")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn duplicate_triple_is_rejected() {
        let (notes, relations) = repos().await;
        let a = notes.create("a", 1, None, None).await.unwrap();
        let b = notes.create("b", 1, None, None).await.unwrap();

        relations.create(&a.id, &b.id, "related", None, "manual").await.unwrap();
        let err = relations
            .create(&a.id, &b.id, "related", None, "manual")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }
}

// search/mod.rs - full-text search over notes.body, backed by FTS triggers

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::config::MAX_SEARCH_HISTORY;
use crate::entities::notes::Note;
use crate::error::Result;
use crate::time::now_iso;

/// One search hit: the note, a highlighted snippet, and its FTS5 `bm25`
/// rank (lower is a better match).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SearchHit {
    #[sqlx(flatten)]
    pub note: Note,
    pub snippet: String,
    pub rank: f64,
}

#[derive(Clone)]
pub struct SearchIndex {
    pool: SqlitePool,
}

impl SearchIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Matches `query` against the FTS index, joined back to undeleted
    /// notes, best match first. An empty or whitespace-only query returns
    /// an empty result without touching the FTS engine.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let hits = sqlx::query_as::<_, SearchHit>(
            r#"
            SELECT n.id, n.body, n.importance, n.source_url, n.image_path,
                   n.created_at, n.updated_at, n.deleted_at, n.server_timestamp,
                   snippet(notes_fts, 0, '<mark>', '</mark>', '...', 32) AS snippet,
                   bm25(notes_fts) AS rank
            FROM notes_fts
            JOIN notes n ON n.rowid = notes_fts.rowid
            WHERE notes_fts MATCH ? AND n.deleted_at IS NULL
            ORDER BY rank ASC
            LIMIT ?
            "#,
        )
        .bind(query)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(hits)
    }

    /// Number of undeleted notes matching `query`, using the same filter
    /// semantics as [`Self::search`].
    pub async fn count(&self, query: &str) -> Result<i64> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(0);
        }

        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM notes_fts
            JOIN notes n ON n.rowid = notes_fts.rowid
            WHERE notes_fts MATCH ? AND n.deleted_at IS NULL
            "#,
        )
        .bind(query)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Records a trimmed, non-empty search query, then deletes every row
    /// beyond the `MAX_SEARCH_HISTORY` most recent.
    pub async fn save_history(&self, query: &str) -> Result<()> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(());
        }

        sqlx::query("INSERT INTO search_history (query, searched_at) VALUES (?, ?)")
            .bind(query)
            .bind(now_iso())
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            DELETE FROM search_history
            WHERE id NOT IN (
                SELECT id FROM search_history ORDER BY searched_at DESC, id DESC LIMIT ?
            )
            "#,
        )
        .bind(MAX_SEARCH_HISTORY)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The `n` most recently searched distinct queries, most recent first.
    pub async fn get_history(&self, n: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT query FROM (
                SELECT query, MAX(searched_at) AS last_searched
                FROM search_history
                GROUP BY query
                ORDER BY last_searched DESC
                LIMIT ?
            )
            "#,
        )
        .bind(n)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(q,)| q).collect())
    }

    /// Distinct history queries beginning with `prefix`.
    pub async fn suggestions(&self, prefix: &str, n: i64) -> Result<Vec<String>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT query FROM search_history
            WHERE query LIKE ? ESCAPE '\'
            ORDER BY searched_at DESC
            LIMIT ?
            "#,
        )
        .bind(pattern)
        .bind(n)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(q,)| q).collect())
    }

    pub async fn clear_history(&self) -> Result<()> {
        sqlx::query("DELETE FROM search_history").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::entities::notes::NotesRepository;

    #[tokio::test]
    async fn create_and_search_finds_the_note_with_highlighted_snippet() {
        let store = Store::open_in_memory().await.unwrap();
        let notes = NotesRepository::new(store.pool().clone());
        let search = SearchIndex::new(store.pool().clone());

        notes
            .create("Learn React Native and Expo for mobile development", 1, None, None)
            .await
            .unwrap();

        let hits = search.search("React", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].snippet.contains("<mark>React</mark>"));
    }

    #[tokio::test]
    async fn empty_query_returns_no_results_without_error() {
        let store = Store::open_in_memory().await.unwrap();
        let search = SearchIndex::new(store.pool().clone());
        assert!(search.search("   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_note_removes_it_from_search() {
        let store = Store::open_in_memory().await.unwrap();
        let notes = NotesRepository::new(store.pool().clone());
        let search = SearchIndex::new(store.pool().clone());

        let note = notes.create("unique-keyword-zephyr", 1, None, None).await.unwrap();
        assert_eq!(search.search("zephyr", 10).await.unwrap().len(), 1);

        notes.delete(&note.id).await.unwrap();
        assert!(search.search("zephyr", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_trims_beyond_max_and_suggests_by_prefix() {
        let store = Store::open_in_memory().await.unwrap();
        let search = SearchIndex::new(store.pool().clone());

        search.save_history("rust async").await.unwrap();
        search.save_history("rust traits").await.unwrap();
        search.save_history("golang channels").await.unwrap();

        let suggestions = search.suggestions("rust", 5).await.unwrap();
        assert_eq!(suggestions.len(), 2);

        let history = search.get_history(10).await.unwrap();
        assert_eq!(history[0], "golang channels");
    }
}

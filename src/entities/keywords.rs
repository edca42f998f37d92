// entities/keywords.rs - keyword vocabulary, note tagging, weekly rollups

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Keyword {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NoteKeyword {
    pub note_id: String,
    pub keyword_id: i64,
    pub score: f64,
    pub source: String,
}

/// One row of a [`KeywordRepository::weekly_keywords`] result: a keyword
/// name and how many notes that week used it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WeeklyKeywordCount {
    pub name: String,
    pub count: i64,
}

#[derive(Clone)]
pub struct KeywordRepository {
    pool: SqlitePool,
}

impl KeywordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts the keyword if it does not already exist, returning its id
    /// either way.
    pub async fn get_or_create(&self, name: &str) -> Result<i64> {
        sqlx::query("INSERT OR IGNORE INTO keywords (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM keywords WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Upserts the junction row `(note_id, keyword_id)`. The entity id used
    /// for sync purposes is `"{note_id}:{keyword_id}"`, the same composite
    /// format the delete path parses back apart, so upsert and delete agree
    /// on how a `note_keyword` change-log entry names its row.
    pub async fn tag_note(&self, note_id: &str, keyword_id: i64, score: f64, source: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO note_keywords (note_id, keyword_id, score, source)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (note_id, keyword_id) DO UPDATE SET score = excluded.score, source = excluded.source
            "#,
        )
        .bind(note_id)
        .bind(keyword_id)
        .bind(score)
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Parses a composite `"noteId:keywordId"` entity id and removes the
    /// junction row. Used by pull-apply.
    pub async fn untag_by_composite_id(&self, entity_id: &str) -> Result<()> {
        let (note_id, keyword_id) = parse_composite_id(entity_id)?;
        sqlx::query("DELETE FROM note_keywords WHERE note_id = ? AND keyword_id = ?")
            .bind(note_id)
            .bind(keyword_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Keywords used by undeleted notes created within the ISO week
    /// `week_key` (`"YYYY-WW"`, week 1 being the ISO week containing
    /// January 4th), grouped by name and ordered by usage count descending.
    pub async fn weekly_keywords(&self, week_key: &str) -> Result<Vec<WeeklyKeywordCount>> {
        let (monday, sunday_exclusive) = week_bounds(week_key)?;

        Ok(sqlx::query_as::<_, WeeklyKeywordCount>(
            r#"
            SELECT k.name AS name, COUNT(*) AS count
            FROM note_keywords nk
            JOIN notes n ON n.id = nk.note_id
            JOIN keywords k ON k.id = nk.keyword_id
            WHERE n.deleted_at IS NULL
              AND n.created_at >= ?
              AND n.created_at < ?
            GROUP BY k.name
            ORDER BY count DESC
            "#,
        )
        .bind(monday)
        .bind(sunday_exclusive)
        .fetch_all(&self.pool)
        .await?)
    }
}

fn parse_composite_id(entity_id: &str) -> Result<(&str, i64)> {
    let (note_id, keyword_id) = entity_id
        .split_once(':')
        .ok_or_else(|| Error::Validation(format!("`{entity_id}` is not a note_id:keyword_id composite id")))?;
    let keyword_id = keyword_id
        .parse::<i64>()
        .map_err(|_| Error::Validation(format!("`{entity_id}` has a non-numeric keyword id")))?;
    Ok((note_id, keyword_id))
}

/// Returns `[monday, monday+7d)` as ISO-8601 UTC midnight strings for the
/// ISO week named by `week_key`.
fn week_bounds(week_key: &str) -> Result<(String, String)> {
    let (year_str, week_str) = week_key
        .split_once('-')
        .ok_or_else(|| Error::Validation(format!("`{week_key}` is not a YYYY-WW week key")))?;
    let year: i32 = year_str
        .parse()
        .map_err(|_| Error::Validation(format!("`{week_key}` has a non-numeric year")))?;
    let week: u32 = week_str
        .parse()
        .map_err(|_| Error::Validation(format!("`{week_key}` has a non-numeric week")))?;
    if !(1..=53).contains(&week) {
        return Err(Error::Validation(format!("week must be in [1, 53], got {week}")));
    }

    let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
        .ok_or_else(|| Error::Validation(format!("`{week_key}` is not a valid ISO week")))?;
    let sunday_exclusive = monday + chrono::Duration::days(7);

    let fmt = |d: NaiveDate| {
        chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(d.and_hms_opt(0, 0, 0).unwrap(), chrono::Utc)
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    };
    Ok((fmt(monday), fmt(sunday_exclusive)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::entities::notes::NotesRepository;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = KeywordRepository::new(store.pool().clone());

        let a = repo.get_or_create("rust").await.unwrap();
        let b = repo.get_or_create("rust").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn composite_id_parses_note_and_keyword() {
        let (note_id, keyword_id) = parse_composite_id("abc-123:42").unwrap();
        assert_eq!(note_id, "abc-123");
        assert_eq!(keyword_id, 42);
    }

    #[tokio::test]
    async fn weekly_keywords_counts_only_matching_week() {
        let store = Store::open_in_memory().await.unwrap();
        let notes = NotesRepository::new(store.pool().clone());
        let keywords = KeywordRepository::new(store.pool().clone());

        let note = notes.create("about rust", 1, None, None).await.unwrap();
        let kw = keywords.get_or_create("rust").await.unwrap();
        keywords.tag_note(&note.id, kw, 0.9, "manual").await.unwrap();

        let week_key = {
            let created = chrono::DateTime::parse_from_rfc3339(&note.created_at).unwrap();
            let iso = created.date_naive().iso_week();
            format!("{}-{:02}", iso.year(), iso.week())
        };

        let counts = keywords.weekly_keywords(&week_key).await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].name, "rust");
        assert_eq!(counts[0].count, 1);
    }
}

// db/migrations.rs - schema migrations, applied in order, exactly once

use sqlx::SqlitePool;

use crate::error::Result;

/// Runs every migration that has not yet been recorded in `_migrations`.
/// Idempotent and safe to call on every open.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    run_if_needed(pool, 1, "create_notes_table").await?;
    run_if_needed(pool, 2, "create_keywords_table").await?;
    run_if_needed(pool, 3, "create_note_keywords_table").await?;
    run_if_needed(pool, 4, "create_relations_table").await?;
    run_if_needed(pool, 5, "create_reflections_table").await?;
    run_if_needed(pool, 6, "create_change_log_table").await?;
    run_if_needed(pool, 7, "create_conflict_log_table").await?;
    run_if_needed(pool, 8, "create_sync_state_table").await?;
    run_if_needed(pool, 9, "create_search_history_table").await?;
    run_if_needed(pool, 10, "create_indexes").await?;
    run_if_needed(pool, 11, "create_fts_index_and_triggers").await?;

    Ok(())
}

async fn run_if_needed(pool: &SqlitePool, id: i32, name: &str) -> Result<()> {
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;

    if exists.0 == 0 {
        tracing::info!("running migration {}: {}", id, name);

        match id {
            1 => create_notes_table(pool).await?,
            2 => create_keywords_table(pool).await?,
            3 => create_note_keywords_table(pool).await?,
            4 => create_relations_table(pool).await?,
            5 => create_reflections_table(pool).await?,
            6 => create_change_log_table(pool).await?,
            7 => create_conflict_log_table(pool).await?,
            8 => create_sync_state_table(pool).await?,
            9 => create_search_history_table(pool).await?,
            10 => create_indexes(pool).await?,
            11 => create_fts_index_and_triggers(pool).await?,
            _ => {
                return Err(crate::Error::Schema(format!(
                    "unknown migration id: {id}"
                )))
            }
        }

        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await?;
    }

    Ok(())
}

async fn create_notes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE notes (
            id TEXT PRIMARY KEY,
            body TEXT NOT NULL,
            importance INTEGER NOT NULL CHECK (importance IN (1, 2, 3)),
            source_url TEXT,
            image_path TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            server_timestamp TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_keywords_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE keywords (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_note_keywords_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE note_keywords (
            note_id TEXT NOT NULL REFERENCES notes(id) ON DELETE CASCADE,
            keyword_id INTEGER NOT NULL REFERENCES keywords(id) ON DELETE CASCADE,
            score REAL NOT NULL,
            source TEXT NOT NULL CHECK (source IN ('ai', 'manual')),
            PRIMARY KEY (note_id, keyword_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_relations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE relations (
            id TEXT PRIMARY KEY,
            from_note_id TEXT NOT NULL REFERENCES notes(id) ON DELETE CASCADE,
            to_note_id TEXT NOT NULL REFERENCES notes(id) ON DELETE CASCADE,
            relation_type TEXT NOT NULL CHECK (relation_type IN ('related', 'parent_child', 'similar', 'custom')),
            rationale TEXT,
            source TEXT NOT NULL CHECK (source IN ('ai', 'manual')),
            created_at TEXT NOT NULL,
            UNIQUE (from_note_id, to_note_id, relation_type)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_reflections_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE reflections (
            date TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_change_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE change_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('insert', 'update', 'delete')),
            payload TEXT NOT NULL,
            priority INTEGER NOT NULL CHECK (priority IN (1, 2, 3)),
            created_at TEXT NOT NULL,
            synced_at TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_conflict_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE conflict_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            local_data TEXT NOT NULL,
            remote_data TEXT NOT NULL,
            resolution TEXT NOT NULL CHECK (resolution IN ('local_wins', 'remote_wins')),
            resolved_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_sync_state_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE sync_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_search_history_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE search_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            query TEXT NOT NULL,
            searched_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_indexes(pool: &SqlitePool) -> Result<()> {
    for stmt in [
        "CREATE INDEX idx_notes_updated_at ON notes(updated_at DESC)",
        "CREATE INDEX idx_notes_importance ON notes(importance DESC)",
        "CREATE INDEX idx_notes_deleted_at ON notes(deleted_at)",
        "CREATE INDEX idx_change_log_synced_at ON change_log(synced_at)",
        "CREATE INDEX idx_change_log_entity ON change_log(entity_type, entity_id)",
        "CREATE INDEX idx_note_keywords_note_id ON note_keywords(note_id)",
        "CREATE INDEX idx_relations_from ON relations(from_note_id)",
        "CREATE INDEX idx_relations_to ON relations(to_note_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

async fn create_fts_index_and_triggers(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE notes_fts USING fts5(
            body,
            content='notes',
            content_rowid='rowid',
            tokenize='unicode61 remove_diacritics 2'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER notes_fts_after_insert AFTER INSERT ON notes BEGIN
            INSERT INTO notes_fts(rowid, body) VALUES (new.rowid, new.body);
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER notes_fts_after_delete AFTER DELETE ON notes BEGIN
            INSERT INTO notes_fts(notes_fts, rowid, body) VALUES ('delete', old.rowid, old.body);
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER notes_fts_after_update AFTER UPDATE ON notes BEGIN
            INSERT INTO notes_fts(notes_fts, rowid, body) VALUES ('delete', old.rowid, old.body);
            INSERT INTO notes_fts(rowid, body) VALUES (new.rowid, new.body);
        END
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

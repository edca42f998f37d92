// db/mod.rs - the store: owns the single physical database file

pub mod migrations;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::Result;

/// Owns the single writable handle to the relational file database. Every
/// other component reaches the database exclusively through a `Store`.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the database at `db_path`, applies the
    /// pragma set, and runs every pending migration.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = connect(db_path).await?;
        migrations::run(&pool).await?;
        let store = Self { pool };
        store.verify_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests: same pragmas and migrations, no file on
    /// disk.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        migrations::run(&pool).await?;
        let store = Self { pool };
        store.verify_schema().await?;
        Ok(store)
    }

    /// The underlying connection pool, for repositories to query against.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Opens a scoped transaction. Callers must `commit()` or `rollback()`
    /// the returned handle explicitly; if it is dropped without either, sqlx
    /// rolls it back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Trivial liveness probe.
    pub async fn health_check(&self) -> Result<bool> {
        let result: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(result.0 == 1)
    }

    /// Closes the pool, deletes the database file (and its WAL/SHM
    /// siblings), and re-initializes a fresh schema at the same path.
    /// Administrative operation, intended for tests and support tooling.
    pub async fn reset(&mut self, db_path: &Path) -> Result<()> {
        self.pool.close().await;
        for suffix in ["", "-wal", "-shm"] {
            let candidate: PathBuf = format!("{}{}", db_path.display(), suffix).into();
            if candidate.exists() {
                std::fs::remove_file(&candidate)?;
            }
        }
        let fresh = Self::open(db_path).await?;
        self.pool = fresh.pool;
        Ok(())
    }

    async fn verify_schema(&self) -> Result<()> {
        const REQUIRED_TABLES: &[&str] = &[
            "notes",
            "keywords",
            "note_keywords",
            "relations",
            "reflections",
            "change_log",
            "conflict_log",
            "sync_state",
            "search_history",
        ];
        for table in REQUIRED_TABLES {
            let exists: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
            if exists.0 == 0 {
                return Err(crate::Error::Schema(format!(
                    "required table `{table}` missing after migration"
                )));
            }
        }
        Ok(())
    }
}

async fn connect(db_path: &Path) -> Result<SqlitePool> {
    let db_url = format!("sqlite:{}", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .pragma("cache_size", "-65536") // ~64 MiB page cache
        .pragma("temp_store", "memory");

    Ok(SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_creates_every_required_table() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.health_check().await.unwrap());
    }
}

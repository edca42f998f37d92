// lib.rs - offline-first local data engine: store, search, sync, orchestrator

pub mod change_log;
pub mod config;
pub mod db;
pub mod device;
pub mod entities;
mod error;
pub mod ids;
pub mod orchestrator;
pub mod search;
pub mod sync;
pub mod time;

pub use config::EngineConfig;
pub use error::{Error, Result};

use entities::{KeywordRepository, NotesRepository, ReflectionsRepository, RelationsRepository};
use orchestrator::{ConnectivityMonitor, Orchestrator};
use search::SearchIndex;
use sync::SyncClient;

/// The assembled engine: one open store plus every repository and
/// subsystem built on top of it. The embedding application constructs one
/// `Engine` at startup and holds it for the process lifetime, the way the
/// teacher's `AppState` is constructed once in `setup` and handed to every
/// command.
pub struct Engine {
    pub store: db::Store,
    pub notes: NotesRepository,
    pub relations: RelationsRepository,
    pub reflections: ReflectionsRepository,
    pub keywords: KeywordRepository,
    pub search: SearchIndex,
    pub orchestrator: Orchestrator,
}

impl Engine {
    /// Opens the store at `config.db_path`, runs migrations, and wires every
    /// repository and the sync client/orchestrator on top of it.
    pub async fn open(config: &EngineConfig, connectivity: Box<dyn ConnectivityMonitor>) -> Result<Self> {
        let store = db::Store::open(&config.db_path).await?;
        let pool = store.pool().clone();

        let mut client = SyncClient::new(config.server_base_url.clone(), config.sync_timeout)?;
        match device::access_token() {
            Ok(Some(token)) => client.set_access_token(token),
            Ok(None) => tracing::debug!("no stored access token yet; sync will be unauthenticated until one is set"),
            Err(e) => tracing::warn!("could not read access token from secure storage: {}", e),
        }

        Ok(Self {
            notes: NotesRepository::new(pool.clone()),
            relations: RelationsRepository::new(pool.clone()),
            reflections: ReflectionsRepository::new(pool.clone()),
            keywords: KeywordRepository::new(pool.clone()),
            search: SearchIndex::new(pool.clone()),
            orchestrator: Orchestrator::new(pool, client, connectivity),
            store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::AlwaysOnline;

    #[tokio::test]
    async fn engine_open_wires_every_repository_against_the_same_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(dir.path(), "https://sync.example.invalid");

        let engine = Engine::open(&config, Box::new(AlwaysOnline)).await.unwrap();
        assert!(engine.store.health_check().await.unwrap());

        let note = engine.notes.create("hello", 1, None, None).await.unwrap();
        assert!(engine.search.search("hello", 10).await.unwrap().iter().any(|h| h.note.id == note.id));
    }
}

// config.rs - engine configuration and the literal invariant constants

use std::path::PathBuf;
use std::time::Duration;

/// Max change-log rows per push batch.
pub const SYNC_BATCH_MAX_SIZE: i64 = 100;
/// Max summed payload bytes per push batch.
pub const SYNC_BATCH_MAX_BYTES: i64 = 1_048_576;
/// `retry_count >= this` marks a change-log row failed.
pub const SYNC_MAX_RETRY_COUNT: i64 = 3;
/// Warn the user once the pending count reaches this.
pub const SYNC_QUEUE_WARNING_SIZE: i64 = 8_000;
/// Pending cap; writes that would exceed this fail, sync pauses.
pub const SYNC_QUEUE_MAX_SIZE: i64 = 10_000;
/// Trim search history beyond this many rows after each insert.
pub const MAX_SEARCH_HISTORY: i64 = 50;
/// Auto-sync triggers are suppressed within this window of the last sync.
pub const MIN_SYNC_INTERVAL: chrono::Duration = chrono::Duration::milliseconds(30_000);
/// A sync lock older than this is eligible for forced release.
pub const LOCK_EXPIRATION: chrono::Duration = chrono::Duration::milliseconds(300_000);
/// Per-entry byte overhead assumed on top of a serialized payload when
/// estimating batch size.
pub const BATCH_ENTRY_OVERHEAD_BYTES: i64 = 200;

/// Assembled configuration for an [`crate::Engine`]. Constructed explicitly
/// by the embedding application — no global statics, every dependency is
/// passed in.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Base URL of the sync server, e.g. `https://sync.example.com`.
    pub server_base_url: String,
    /// Timeout applied to `/sync/push` and `/sync/pull`, which may carry
    /// much larger bodies and take tens of seconds.
    pub sync_timeout: Duration,
}

impl EngineConfig {
    /// Sensible defaults for a desktop deployment: a database file named
    /// `synapse.db` in the given directory, 60s sync timeout.
    pub fn new(data_dir: impl Into<PathBuf>, server_base_url: impl Into<String>) -> Self {
        Self {
            db_path: data_dir.into().join("synapse.db"),
            server_base_url: server_base_url.into(),
            sync_timeout: Duration::from_secs(60),
        }
    }
}

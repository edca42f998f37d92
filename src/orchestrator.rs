// orchestrator.rs - sync lock, auto-trigger gates, manual entry point

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::change_log;
use crate::config::{LOCK_EXPIRATION, MIN_SYNC_INTERVAL};
use crate::sync::{pull, push, SyncClient};
use crate::time::now_utc;

/// Narrow interface to the network-reachability probe, owned and
/// implemented by the embedding application.
#[async_trait]
pub trait ConnectivityMonitor: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// A connectivity monitor that always reports online, for embedders and
/// tests that don't need real reachability checks.
pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityMonitor for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// Why a sync attempt did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    QueueOverloaded,
    SyncInProgress,
    ThrottledInterval,
}

/// Structured, never-raised result of a sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub skipped: bool,
    pub skip_reason: Option<SkipReason>,
    pub push: Option<push::PushOutcome>,
    pub pull: Option<pull::PullOutcome>,
    pub error: Option<String>,
}

impl SyncOutcome {
    fn skip(reason: SkipReason) -> Self {
        Self { success: false, skipped: true, skip_reason: Some(reason), push: None, pull: None, error: None }
    }
}

struct LockState {
    busy: bool,
    acquired_at: Option<DateTime<Utc>>,
}

/// Process-wide mutual exclusion over `sync()`. Exposes only
/// [`SyncLock::try_acquire`], which returns a scope-guarded token that
/// releases the lock on drop — the `busy` boolean itself is never exposed.
struct SyncLock {
    state: StdMutex<LockState>,
}

impl SyncLock {
    fn new() -> Self {
        Self { state: StdMutex::new(LockState { busy: false, acquired_at: None }) }
    }

    fn try_acquire(&self) -> Option<SyncLockGuard<'_>> {
        let mut state = self.state.lock().expect("sync lock mutex poisoned");
        if state.busy {
            let stale = state
                .acquired_at
                .map(|acquired_at| now_utc() - acquired_at > LOCK_EXPIRATION)
                .unwrap_or(true);
            if !stale {
                return None;
            }
            tracing::warn!("forcing release of a sync lock held past its expiration");
        }
        state.busy = true;
        state.acquired_at = Some(now_utc());
        Some(SyncLockGuard { lock: self })
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("sync lock mutex poisoned");
        state.busy = false;
        state.acquired_at = None;
    }
}

struct SyncLockGuard<'a> {
    lock: &'a SyncLock,
}

impl Drop for SyncLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Owns the sync lock, the last-sync timestamp, and the dependencies needed
/// to run a push/pull cycle. Constructed once by the embedding application
/// and passed to call sites — never a singleton.
pub struct Orchestrator {
    pool: SqlitePool,
    client: SyncClient,
    connectivity: Box<dyn ConnectivityMonitor>,
    lock: SyncLock,
    last_sync_time: StdMutex<Option<DateTime<Utc>>>,
}

impl Orchestrator {
    pub fn new(pool: SqlitePool, client: SyncClient, connectivity: Box<dyn ConnectivityMonitor>) -> Self {
        Self {
            pool,
            client,
            connectivity,
            lock: SyncLock::new(),
            last_sync_time: StdMutex::new(None),
        }
    }

    /// Manual entry point (e.g. a user-pressed "sync now" button). Bypasses
    /// the auto-trigger interval throttle but still honors the lock and the
    /// offline/queue-overloaded gates.
    pub async fn sync(&self) -> SyncOutcome {
        if !self.connectivity.is_online().await {
            return SyncOutcome::skip(SkipReason::Offline);
        }

        match change_log::should_pause_sync(&self.pool).await {
            Ok(true) => return SyncOutcome::skip(SkipReason::QueueOverloaded),
            Ok(false) => {}
            Err(e) => {
                return SyncOutcome {
                    success: false,
                    skipped: false,
                    skip_reason: None,
                    push: None,
                    pull: None,
                    error: Some(e.to_string()),
                }
            }
        }

        let Some(_guard) = self.lock.try_acquire() else {
            return SyncOutcome::skip(SkipReason::SyncInProgress);
        };

        let device_id = match crate::device::device_id() {
            Ok(id) => id,
            Err(e) => {
                return SyncOutcome {
                    success: false,
                    skipped: false,
                    skip_reason: None,
                    push: None,
                    pull: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let push_outcome = match push::push(&self.pool, &self.client, &device_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return SyncOutcome {
                    success: false,
                    skipped: false,
                    skip_reason: None,
                    push: None,
                    pull: None,
                    error: Some(e.to_string()),
                }
            }
        };

        if !push_outcome.success {
            let error = push_outcome.error.clone();
            return SyncOutcome {
                success: false,
                skipped: false,
                skip_reason: None,
                push: Some(push_outcome),
                pull: None,
                error,
            };
        }

        let (pull_outcome, pull_error) = match pull::pull(&self.pool, &self.client, &device_id).await {
            Ok(outcome) => (Some(outcome), None),
            Err(e) => (None, Some(e.to_string())),
        };

        *self.last_sync_time.lock().expect("last-sync mutex poisoned") = Some(now_utc());

        SyncOutcome {
            success: push_outcome.success && pull_error.is_none(),
            skipped: false,
            skip_reason: None,
            push: Some(push_outcome),
            pull: pull_outcome,
            error: pull_error,
        }
    }

    /// Called by the embedding application when connectivity is restored.
    /// Suppressed if a sync completed within the last `MIN_SYNC_INTERVAL`.
    pub async fn on_connection_recovered(&self) -> SyncOutcome {
        self.auto_trigger().await
    }

    /// Called by the embedding application when it moves to the
    /// foreground. Same throttle as [`Self::on_connection_recovered`].
    pub async fn on_app_foreground(&self) -> SyncOutcome {
        self.auto_trigger().await
    }

    async fn auto_trigger(&self) -> SyncOutcome {
        let last = *self.last_sync_time.lock().expect("last-sync mutex poisoned");
        if let Some(last) = last {
            if now_utc() - last < MIN_SYNC_INTERVAL {
                return SyncOutcome::skip(SkipReason::ThrottledInterval);
            }
        }
        self.sync().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use std::time::Duration;

    struct Offline;
    #[async_trait]
    impl ConnectivityMonitor for Offline {
        async fn is_online(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn offline_gate_skips_before_touching_the_network() {
        let store = Store::open_in_memory().await.unwrap();
        let client = SyncClient::new("https://sync.example.invalid", Duration::from_secs(1)).unwrap();
        let orchestrator = Orchestrator::new(store.pool().clone(), client, Box::new(Offline));

        let outcome = orchestrator.sync().await;
        assert!(outcome.skipped);
        assert_eq!(outcome.skip_reason, Some(SkipReason::Offline));
    }

    #[tokio::test]
    async fn queue_overloaded_gate_skips_before_touching_the_network() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..crate::config::SYNC_QUEUE_MAX_SIZE {
            sqlx::query(
                "INSERT INTO change_log (entity_type, entity_id, operation, payload, priority, created_at, retry_count) VALUES ('note', ?, 'insert', '{}', 2, ?, 0)",
            )
            .bind(format!("bulk-{i}"))
            .bind(crate::time::now_iso())
            .execute(store.pool())
            .await
            .unwrap();
        }

        let client = SyncClient::new("https://sync.example.invalid", Duration::from_secs(1)).unwrap();
        let orchestrator = Orchestrator::new(store.pool().clone(), client, Box::new(AlwaysOnline));

        let outcome = orchestrator.sync().await;
        assert!(outcome.skipped);
        assert_eq!(outcome.skip_reason, Some(SkipReason::QueueOverloaded));
    }
}

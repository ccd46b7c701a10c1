//! Idle reaper.
//!
//! Every `interval` the reaper releases resources whose user is disconnected
//! or has been silent for `idle_timeout`, then snapshots what is left so the
//! next process can clean up after this one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use vmlease_id::{ResourceId, UserId};

use crate::connection::{ConnectionEntry, ConnectionRegistry};
use crate::manager::{ManagerError, ResourceManager, ResourceRecord};
use crate::persistence::{SnapshotError, SnapshotStore};

#[derive(Debug, Clone)]
pub struct IdleReaperConfig {
    pub interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for IdleReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

pub type ReleaseHandle = JoinHandle<Result<Option<ResourceRecord>, ManagerError>>;

pub type OrphanResults = Vec<(UserId, ResourceId, Result<(), ManagerError>)>;

/// What one pass did.
#[derive(Debug)]
pub struct PassReport {
    /// Releases issued this pass. Nothing waits on them; callers may.
    pub releases: Vec<ReleaseHandle>,
    /// Entries in the snapshot written at the end of the pass, if it was
    /// written.
    pub snapshot_entries: Option<usize>,
}

pub struct IdleReaper {
    manager: ResourceManager,
    registry: ConnectionRegistry,
    store: Arc<dyn SnapshotStore>,
    config: IdleReaperConfig,
}

impl IdleReaper {
    pub fn new(
        manager: ResourceManager,
        registry: ConnectionRegistry,
        store: Arc<dyn SnapshotStore>,
        config: IdleReaperConfig,
    ) -> Self {
        Self {
            manager,
            registry,
            store,
            config,
        }
    }

    /// Clean up after a previous process.
    ///
    /// Every id in the stored snapshot is reserved before this returns, so
    /// none can be handed out again while its delete is still running. The
    /// deletes themselves run in the returned task.
    pub async fn recover(&self) -> Result<JoinHandle<OrphanResults>, SnapshotError> {
        let snapshot = self.store.read_snapshot().await?;
        if snapshot.is_empty() {
            debug!("No orphaned resources");
        } else {
            info!(count = snapshot.len(), "Releasing resources left by a previous run");
        }
        self.manager.adopt_orphans(&snapshot);

        let manager = self.manager.clone();
        Ok(tokio::spawn(async move {
            let results = manager.release_orphans(snapshot).await;
            let failed = results.iter().filter(|(_, _, r)| r.is_err()).count();
            if failed > 0 {
                warn!(
                    released = results.len() - failed,
                    failed,
                    "Orphan cleanup finished with failures"
                );
            } else if !results.is_empty() {
                info!(released = results.len(), "Orphan cleanup finished");
            }
            results
        }))
    }

    fn is_idle(&self, entry: Option<&ConnectionEntry>, now: Instant) -> bool {
        match entry {
            None => true,
            Some(entry) if !entry.is_live() => true,
            Some(entry) => {
                now.saturating_duration_since(entry.last_activity) >= self.config.idle_timeout
            }
        }
    }

    /// Records whose user is disconnected or idle as of `now`.
    pub fn idle_records(&self, now: Instant) -> Vec<ResourceRecord> {
        self.manager
            .records()
            .into_iter()
            .filter(|record| self.is_idle(self.registry.get(&record.user_id).as_ref(), now))
            .collect()
    }

    /// One reaper pass.
    pub async fn run_pass(&self) -> PassReport {
        let idle = self.idle_records(Instant::now());
        if !idle.is_empty() {
            info!(count = idle.len(), "Releasing idle resources");
        }

        let releases = idle
            .into_iter()
            .map(|record| {
                let manager = self.manager.clone();
                tokio::spawn(async move {
                    let result = manager
                        .release_if_current(&record.user_id, record.resource_id)
                        .await;
                    if let Err(e) = &result {
                        error!(
                            user_id = %record.user_id,
                            resource_id = %record.resource_id,
                            error = %e,
                            "Idle release failed"
                        );
                    }
                    result
                })
            })
            .collect();

        let manager = &self.manager;
        let pruned = self.registry.prune_closed(|user_id| manager.get(user_id).is_some());
        if pruned > 0 {
            debug!(pruned, "Dropped closed connection entries");
        }

        let snapshot = self.manager.snapshot();
        let snapshot_entries = match self.store.write_snapshot(&snapshot).await {
            Ok(()) => {
                debug!(entries = snapshot.len(), "Snapshot saved");
                Some(snapshot.len())
            }
            Err(e) => {
                error!(error = %e, "Failed to save snapshot");
                None
            }
        };

        PassReport {
            releases,
            snapshot_entries,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Starting idle reaper"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Idle reaper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

//! Resource lifecycle manager.
//!
//! Owns the `user -> record` map and the identifier pool, and is the only
//! component that talks to the [`ProvisioningBackend`].
//!
//! ## Concurrency
//!
//! Two levels of exclusion:
//!
//! - A short-lived `std::sync::Mutex` over the map and pool. Every
//!   check-then-insert happens inside one critical section, so concurrent
//!   [`acquire`](ResourceManager::acquire) calls for a user can never both see
//!   "no record".
//! - A per-user `tokio::sync::Mutex` (the lock table) held across backend
//!   calls. A create holds it from reservation until its outcome is recorded;
//!   a release holds it while deleting. Creates and releases for one user are
//!   therefore serialized, while different users proceed independently.
//!
//! Creates run in their own task. Dropping the future returned by
//! [`Acquisition::ready`] (e.g. because the connection closed) stops waiting
//! but never cancels the backend call.
//!
//! ## Outcome delivery
//!
//! Each creation owns a `watch` channel resolved exactly once. Every caller
//! that finds the record while it is `Creating` subscribes to that channel, so
//! all of them see the same success or failure. A broadcast of
//! [`LifecycleEvent`]s is also available for observers.

mod allocator;
mod error;
mod record;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use tokio::sync::{broadcast, watch, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use vmlease_id::{ResourceId, UserId};

use crate::backend::ProvisioningBackend;
use crate::persistence::Snapshot;

pub use allocator::{IdentifierPool, DEFAULT_DOMAIN, MAX_TRY};
pub use error::ManagerError;
pub use record::{LifecycleEvent, ResourceRecord, ResourceStatus};

const EVENT_CAPACITY: usize = 256;

type Outcome = Option<Result<ResourceRecord, ManagerError>>;

struct Slot {
    record: ResourceRecord,
    outcome: watch::Receiver<Outcome>,
}

struct ManagerState {
    records: HashMap<UserId, Slot>,
    pool: IdentifierPool,
    /// Ids whose delete failed. Never handed out again, never retried.
    withheld: BTreeSet<ResourceId>,
}

struct ManagerInner {
    backend: Arc<dyn ProvisioningBackend>,
    state: Mutex<ManagerState>,
    user_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<LifecycleEvent>,
}

/// Handle to the lifecycle manager. Cheap to clone.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

/// Result of [`ResourceManager::acquire`]: the record as it stood when the
/// call was made, plus a way to wait for the creation to settle.
pub struct Acquisition {
    record: ResourceRecord,
    outcome: watch::Receiver<Outcome>,
}

impl Acquisition {
    /// The record at acquisition time (`Creating` or `Created`).
    pub fn record(&self) -> &ResourceRecord {
        &self.record
    }

    /// Wait until the backend create resolves.
    pub async fn ready(mut self) -> Result<ResourceRecord, ManagerError> {
        let resource_id = self.record.resource_id;
        let settled = match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match settled {
            Some(outcome) => outcome,
            None => Err(ManagerError::Provisioning {
                resource_id,
                reason: "provisioning task ended without an outcome".to_string(),
            }),
        }
    }
}

impl ResourceManager {
    pub fn new(backend: Arc<dyn ProvisioningBackend>, id_domain: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                backend,
                state: Mutex::new(ManagerState {
                    records: HashMap::new(),
                    pool: IdentifierPool::new(id_domain),
                    withheld: BTreeSet::new(),
                }),
                user_locks: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn user_lock(&self, user_id: &UserId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .user_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(user_id.clone()).or_default().clone()
    }

    /// Drop the user's lock-table entry once nobody else references it.
    fn prune_lock(&self, user_id: &UserId) {
        let mut locks = self
            .inner
            .user_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(user_id);
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Subscribe to lifecycle events for all users.
    pub fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Return the user's record, starting a create if there is none.
    ///
    /// Concurrent calls for one user share a single backend create. Fails
    /// with [`ManagerError::AllocationExhausted`] without touching the backend
    /// when no id can be reserved.
    pub async fn acquire(&self, user_id: &UserId) -> Result<Acquisition, ManagerError> {
        loop {
            let lock = self.user_lock(user_id);
            let busy = {
                let mut state = self.state();

                if let Some(slot) = state.records.get(user_id) {
                    debug!(
                        user_id = %user_id,
                        resource_id = %slot.record.resource_id,
                        status = %slot.record.status,
                        "Reusing existing resource"
                    );
                    return Ok(Acquisition {
                        record: slot.record.clone(),
                        outcome: slot.outcome.clone(),
                    });
                }

                match lock.clone().try_lock_owned() {
                    Ok(guard) => {
                        let Some(resource_id) = state.pool.reserve() else {
                            warn!(user_id = %user_id, attempts = MAX_TRY, "Resource id allocation exhausted");
                            drop(guard);
                            drop(state);
                            drop(lock);
                            self.prune_lock(user_id);
                            return Err(ManagerError::exhausted());
                        };

                        let record = ResourceRecord::creating(user_id.clone(), resource_id);
                        let (tx, rx) = watch::channel(None);
                        state.records.insert(
                            user_id.clone(),
                            Slot {
                                record: record.clone(),
                                outcome: rx.clone(),
                            },
                        );

                        info!(user_id = %user_id, resource_id = %resource_id, "Provisioning resource");
                        tokio::spawn(self.clone().provision(
                            user_id.clone(),
                            resource_id,
                            tx,
                            guard,
                        ));

                        return Ok(Acquisition {
                            record,
                            outcome: rx,
                        });
                    }
                    Err(_) => lock,
                }
            };

            // A release for this user is in flight; start over once it settles.
            debug!(user_id = %user_id, "Waiting for in-flight release");
            drop(busy.lock().await);
        }
    }

    /// [`acquire`](Self::acquire), then wait for the outcome.
    pub async fn acquire_ready(&self, user_id: &UserId) -> Result<ResourceRecord, ManagerError> {
        self.acquire(user_id).await?.ready().await
    }

    async fn provision(
        self,
        user_id: UserId,
        resource_id: ResourceId,
        outcome: watch::Sender<Outcome>,
        guard: OwnedMutexGuard<()>,
    ) {
        let created = match self.inner.backend.create(resource_id, &user_id).await {
            Ok(details) if details.address().is_some() => Ok(details),
            Ok(_) => Err(ManagerError::IncompleteDetails { resource_id }),
            Err(e) => Err(ManagerError::Provisioning {
                resource_id,
                reason: e.to_string(),
            }),
        };

        let result = match created {
            Ok(details) => {
                let record = {
                    let mut state = self.state();
                    match state.records.get_mut(&user_id) {
                        Some(slot) if slot.record.resource_id == resource_id => {
                            slot.record.status = ResourceStatus::Created;
                            slot.record.details = Some(details);
                            slot.record.clone()
                        }
                        // Unreachable while the user lock is held; recorded
                        // anyway so the id is not leaked.
                        _ => {
                            error!(user_id = %user_id, resource_id = %resource_id, "Record vanished during create");
                            ResourceRecord {
                                user_id: user_id.clone(),
                                resource_id,
                                status: ResourceStatus::Created,
                                details: Some(details),
                            }
                        }
                    }
                };

                info!(
                    user_id = %user_id,
                    resource_id = %resource_id,
                    address = record.address().unwrap_or_default(),
                    "Resource ready"
                );
                self.emit(LifecycleEvent::Ready {
                    record: record.clone(),
                });
                Ok(record)
            }
            Err(err) => {
                warn!(user_id = %user_id, resource_id = %resource_id, error = %err, "Provisioning failed, rolling back");

                if let Err(e) = self.inner.backend.delete(resource_id).await {
                    warn!(resource_id = %resource_id, error = %e, "Rollback delete failed");
                }

                {
                    let mut state = self.state();
                    if state
                        .records
                        .get(&user_id)
                        .is_some_and(|slot| slot.record.resource_id == resource_id)
                    {
                        state.records.remove(&user_id);
                    }
                    state.pool.release(resource_id);
                }

                self.emit(LifecycleEvent::Error {
                    user_id: user_id.clone(),
                    error: err.clone(),
                });
                Err(err)
            }
        };

        outcome.send_replace(Some(result));
        drop(guard);
        self.prune_lock(&user_id);
    }

    /// Tear down the user's resource, if any.
    ///
    /// The record leaves the map before the backend delete is issued. The id
    /// returns to the pool only once the delete succeeds; on failure it is
    /// withheld for good and the error is returned. Waits for an in-flight
    /// create for the same user to settle first.
    pub async fn release(&self, user_id: &UserId) -> Result<Option<ResourceRecord>, ManagerError> {
        self.release_matching(user_id, None).await
    }

    /// Like [`release`](Self::release), but only if the user's record still
    /// carries `resource_id`. Used by callers acting on an older observation.
    pub async fn release_if_current(
        &self,
        user_id: &UserId,
        resource_id: ResourceId,
    ) -> Result<Option<ResourceRecord>, ManagerError> {
        self.release_matching(user_id, Some(resource_id)).await
    }

    async fn release_matching(
        &self,
        user_id: &UserId,
        expected: Option<ResourceId>,
    ) -> Result<Option<ResourceRecord>, ManagerError> {
        let lock = self.user_lock(user_id);
        let result = {
            let _guard = lock.lock().await;

            let taken = {
                let mut state = self.state();
                let matches = state.records.get(user_id).is_some_and(|slot| {
                    expected.is_none_or(|id| id == slot.record.resource_id)
                });
                if matches {
                    state.records.remove(user_id)
                } else {
                    None
                }
            };

            match taken {
                Some(slot) => self.delete_record(slot.record).await.map(Some),
                None => {
                    debug!(user_id = %user_id, "Nothing to release");
                    Ok(None)
                }
            }
        };

        drop(lock);
        self.prune_lock(user_id);
        result
    }

    async fn delete_record(
        &self,
        mut record: ResourceRecord,
    ) -> Result<ResourceRecord, ManagerError> {
        record.status = ResourceStatus::Removing;
        let resource_id = record.resource_id;
        info!(user_id = %record.user_id, resource_id = %resource_id, "Releasing resource");

        self.delete_reserved(&record.user_id, resource_id).await?;
        Ok(record)
    }

    /// Delete `resource_id` and settle its pool entry.
    async fn delete_reserved(
        &self,
        user_id: &UserId,
        resource_id: ResourceId,
    ) -> Result<(), ManagerError> {
        match self.inner.backend.delete(resource_id).await {
            Ok(()) => {
                self.state().pool.release(resource_id);
                info!(user_id = %user_id, resource_id = %resource_id, "Resource released");
                self.emit(LifecycleEvent::Released {
                    user_id: user_id.clone(),
                    resource_id,
                });
                Ok(())
            }
            Err(e) => {
                self.state().withheld.insert(resource_id);
                error!(
                    user_id = %user_id,
                    resource_id = %resource_id,
                    error = %e,
                    "Delete failed; resource id withheld from reuse"
                );
                Err(ManagerError::Release {
                    resource_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Reserve every id in a snapshot left by a previous process so none is
    /// reissued before [`release_orphans`](Self::release_orphans) deletes it.
    pub fn adopt_orphans(&self, snapshot: &Snapshot) {
        let mut state = self.state();
        for (user_id, resource_id) in snapshot {
            if !state.pool.seed(*resource_id) {
                warn!(user_id = %user_id, resource_id = %resource_id, "Duplicate id in snapshot");
            }
        }
    }

    /// Delete every id from a previous process's snapshot, concurrently.
    ///
    /// These resources are never adopted as live records; the process only
    /// knows enough to clean them up.
    pub async fn release_orphans(
        &self,
        snapshot: Snapshot,
    ) -> Vec<(UserId, ResourceId, Result<(), ManagerError>)> {
        join_all(snapshot.into_iter().map(|(user_id, resource_id)| async move {
            info!(user_id = %user_id, resource_id = %resource_id, "Releasing orphaned resource");
            let result = self.delete_reserved(&user_id, resource_id).await;
            (user_id, resource_id, result)
        }))
        .await
    }

    /// Current record for a user.
    pub fn get(&self, user_id: &UserId) -> Option<ResourceRecord> {
        self.state()
            .records
            .get(user_id)
            .map(|slot| slot.record.clone())
    }

    /// All current records.
    pub fn records(&self) -> Vec<ResourceRecord> {
        self.state()
            .records
            .values()
            .map(|slot| slot.record.clone())
            .collect()
    }

    /// `user -> resource id` for every current record.
    pub fn snapshot(&self) -> Snapshot {
        self.state()
            .records
            .iter()
            .map(|(user_id, slot)| (user_id.clone(), slot.record.resource_id))
            .collect()
    }

    pub fn is_reserved(&self, resource_id: ResourceId) -> bool {
        self.state().pool.contains(resource_id)
    }

    pub fn reserved_count(&self) -> usize {
        self.state().pool.len()
    }

    /// Ids held back after a failed delete.
    pub fn withheld(&self) -> Vec<ResourceId> {
        self.state().withheld.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use std::time::Duration;

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    fn manager(backend: &Arc<MockBackend>) -> ResourceManager {
        ResourceManager::new(backend.clone(), DEFAULT_DOMAIN)
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_creates_then_reuses() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager(&backend);
        let alice = user("alice");

        let acquisition = manager.acquire(&alice).await.unwrap();
        assert_eq!(acquisition.record().status, ResourceStatus::Creating);
        let record = acquisition.ready().await.unwrap();
        assert_eq!(record.status, ResourceStatus::Created);
        assert!(record.address().is_some());

        let again = manager.acquire_ready(&alice).await.unwrap();
        assert_eq!(again.resource_id, record.resource_id);
        assert_eq!(backend.create_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_details_roll_back() {
        let backend = Arc::new(MockBackend::new());
        backend.set_omit_address(true);
        let manager = manager(&backend);
        let alice = user("alice");

        let acquisition = manager.acquire(&alice).await.unwrap();
        let resource_id = acquisition.record().resource_id;
        let err = acquisition.ready().await.unwrap_err();

        assert_eq!(err, ManagerError::IncompleteDetails { resource_id });
        assert_eq!(backend.deleted(), vec![resource_id]);
        assert!(manager.get(&alice).is_none());
        assert!(!manager.is_reserved(resource_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_broadcast() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager(&backend);
        let mut events = manager.events();
        let alice = user("alice");

        let record = manager.acquire_ready(&alice).await.unwrap();
        match events.recv().await.unwrap() {
            LifecycleEvent::Ready { record: event } => assert_eq!(event, record),
            other => panic!("unexpected event: {other:?}"),
        }

        manager.release(&alice).await.unwrap();
        match events.recv().await.unwrap() {
            LifecycleEvent::Released { user_id, resource_id } => {
                assert_eq!(user_id, alice);
                assert_eq!(resource_id, record.resource_id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_waits_for_inflight_create() {
        let backend = Arc::new(MockBackend::with_latency(Duration::from_secs(5)));
        let manager = manager(&backend);
        let alice = user("alice");

        let acquisition = manager.acquire(&alice).await.unwrap();
        let released = manager.release(&alice).await.unwrap().unwrap();

        // The create finished before the delete was issued.
        assert_eq!(backend.create_calls(), 1);
        assert_eq!(released.status, ResourceStatus::Removing);
        assert_eq!(backend.deleted(), vec![released.resource_id]);
        assert!(acquisition.ready().await.is_ok());
        assert!(manager.get(&alice).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_if_current_ignores_newer_record() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager(&backend);
        let alice = user("alice");

        let record = manager.acquire_ready(&alice).await.unwrap();
        let stale = ResourceId::new((record.resource_id.value() + 1) % DEFAULT_DOMAIN);

        assert!(manager
            .release_if_current(&alice, stale)
            .await
            .unwrap()
            .is_none());
        assert!(manager.get(&alice).is_some());
        assert_eq!(backend.delete_calls(), 0);

        assert!(manager
            .release_if_current(&alice, record.resource_id)
            .await
            .unwrap()
            .is_some());
        assert!(manager.get(&alice).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_after_release_starts_fresh() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager(&backend);
        let alice = user("alice");

        manager.acquire_ready(&alice).await.unwrap();
        manager.release(&alice).await.unwrap();
        manager.acquire_ready(&alice).await.unwrap();

        assert_eq!(backend.create_calls(), 2);
        assert_eq!(manager.reserved_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphans_reserved_until_deleted() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager(&backend);
        let snapshot: Snapshot = [(user("alice"), ResourceId::new(7)), (user("bob"), ResourceId::new(8))]
            .into_iter()
            .collect();

        manager.adopt_orphans(&snapshot);
        assert!(manager.is_reserved(ResourceId::new(7)));
        assert!(manager.is_reserved(ResourceId::new(8)));
        assert!(manager.records().is_empty());

        let results = manager.release_orphans(snapshot).await;
        assert!(results.iter().all(|(_, _, r)| r.is_ok()));
        assert_eq!(manager.reserved_count(), 0);
        assert_eq!(backend.delete_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_orphan_delete_is_withheld() {
        let backend = Arc::new(MockBackend::new());
        backend.set_fail_deletes(true);
        let manager = manager(&backend);
        let snapshot: Snapshot = [(user("alice"), ResourceId::new(7))].into_iter().collect();

        manager.adopt_orphans(&snapshot);
        let results = manager.release_orphans(snapshot).await;

        assert!(matches!(results[0].2, Err(ManagerError::Release { .. })));
        assert!(manager.is_reserved(ResourceId::new(7)));
        assert_eq!(manager.withheld(), vec![ResourceId::new(7)]);
    }
}

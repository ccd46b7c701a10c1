//! In-process backend that fabricates machines.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use vmlease_id::{ResourceId, UserId};

use super::{BackendError, ProvisioningBackend, ResourceDetails};

/// Mock backend for testing and development.
///
/// Every created resource gets the address `10.0.{id / 256}.{id % 256}`.
pub struct MockBackend {
    latency: Duration,
    fail_creates: AtomicBool,
    fail_deletes: AtomicBool,
    omit_address: AtomicBool,
    create_calls: AtomicU64,
    delete_calls: AtomicU64,
    deleted: Mutex<Vec<ResourceId>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_latency(Duration::from_millis(100))
    }

    /// Backend whose calls each take `latency` to resolve.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            fail_creates: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            omit_address: AtomicBool::new(false),
            create_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Backend whose creates all fail.
    pub fn failing() -> Self {
        let backend = Self::new();
        backend.set_fail_creates(true);
        backend
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Make creates succeed but report neither an IP nor a DNS name.
    pub fn set_omit_address(&self, omit: bool) {
        self.omit_address.store(omit, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Ids passed to `delete`, in call order.
    pub fn deleted(&self) -> Vec<ResourceId> {
        self.deleted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisioningBackend for MockBackend {
    async fn create(
        &self,
        resource_id: ResourceId,
        user_id: &UserId,
    ) -> Result<ResourceDetails, BackendError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        info!(resource_id = %resource_id, user_id = %user_id, "[MOCK] Creating resource");

        tokio::time::sleep(self.latency).await;

        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(BackendError::Other(
                "mock backend configured to fail".to_string(),
            ));
        }

        let mut details = ResourceDetails::default();
        details
            .metadata
            .insert("name".to_string(), format!("vmlease-vm{resource_id}"));
        details
            .metadata
            .insert("user_id".to_string(), user_id.to_string());
        if !self.omit_address.load(Ordering::SeqCst) {
            let n = resource_id.value();
            details.public_ip = Some(format!("10.0.{}.{}", (n / 256) % 256, n % 256));
        }

        debug!(resource_id = %resource_id, address = ?details.address(), "[MOCK] Resource created");
        Ok(details)
    }

    async fn delete(&self, resource_id: ResourceId) -> Result<(), BackendError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        info!(resource_id = %resource_id, "[MOCK] Deleting resource");

        tokio::time::sleep(self.latency / 2).await;

        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "mock backend configured to fail deletes".to_string(),
            ));
        }

        self.deleted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(resource_id);
        Ok(())
    }
}

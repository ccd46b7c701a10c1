//! Provisioning backend interface.
//!
//! A backend turns a reserved [`ResourceId`] into a reachable machine and
//! tears it down again. The broker only relies on two properties:
//! - `create` either returns the details needed to reach the machine or fails
//! - `delete` is idempotent, so it is safe to call for ids that never
//!   finished creating
//!
//! Implementations:
//! - [`MockBackend`]: in-process backend for development and tests
//! - [`HttpBackend`]: talks to an external provisioner service

mod http;
mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vmlease_id::{ResourceId, UserId};

pub use http::HttpBackend;
pub use mock::MockBackend;

/// Errors from backend calls.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("provisioner unavailable: {0}")]
    Unavailable(String),

    #[error("provisioner rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid provisioner response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

/// Opaque payload describing how to reach a created resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDetails {
    /// Public IPv4/IPv6 address, when one was assigned.
    #[serde(default)]
    pub public_ip: Option<String>,

    /// DNS name, used when no public address is reported.
    #[serde(default)]
    pub fqdn: Option<String>,

    /// Provider-specific extras (region, instance name, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ResourceDetails {
    /// Address clients should connect to: the public IP, else the DNS name.
    pub fn address(&self) -> Option<&str> {
        self.public_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .or_else(|| self.fqdn.as_deref().filter(|name| !name.is_empty()))
    }
}

/// Provisioning backend interface.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Create the resource for `user_id` under the reserved id.
    async fn create(
        &self,
        resource_id: ResourceId,
        user_id: &UserId,
    ) -> Result<ResourceDetails, BackendError>;

    /// Delete the resource. Succeeds when nothing exists under the id.
    async fn delete(&self, resource_id: ResourceId) -> Result<(), BackendError>;
}

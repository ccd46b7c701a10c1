//! Resource records and lifecycle events.

use serde::Serialize;
use vmlease_id::{ResourceId, UserId};

use super::ManagerError;
use crate::backend::ResourceDetails;

/// Lifecycle status of a user's resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Id reserved, backend create in flight.
    Creating,
    /// Backend confirmed creation; details are present.
    Created,
    /// Taken out of the manager and being deleted.
    Removing,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Removing => "removing",
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The manager's view of one user's resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRecord {
    pub user_id: UserId,
    pub resource_id: ResourceId,
    pub status: ResourceStatus,
    /// Present only once `status` is `Created`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ResourceDetails>,
}

impl ResourceRecord {
    pub(crate) fn creating(user_id: UserId, resource_id: ResourceId) -> Self {
        Self {
            user_id,
            resource_id,
            status: ResourceStatus::Creating,
            details: None,
        }
    }

    /// Address of the created resource, if it has one yet.
    pub fn address(&self) -> Option<&str> {
        match self.status {
            ResourceStatus::Created => self.details.as_ref().and_then(|d| d.address()),
            _ => None,
        }
    }
}

/// Broadcast to observers whenever a resource changes hands.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A create resolved successfully.
    Ready { record: ResourceRecord },
    /// A create failed and was rolled back.
    Error { user_id: UserId, error: ManagerError },
    /// A resource was deleted and its id returned to the pool.
    Released {
        user_id: UserId,
        resource_id: ResourceId,
    },
}

impl LifecycleEvent {
    pub fn user_id(&self) -> &UserId {
        match self {
            Self::Ready { record } => &record.user_id,
            Self::Error { user_id, .. } | Self::Released { user_id, .. } => user_id,
        }
    }
}

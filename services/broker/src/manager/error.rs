//! Lifecycle manager errors.

use thiserror::Error;
use vmlease_id::ResourceId;

use super::allocator::MAX_TRY;

/// Errors surfaced by [`ResourceManager`](super::ResourceManager).
///
/// Cloneable so one outcome can be handed to every caller waiting on the same
/// creation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("no free resource id after {attempts} attempts")]
    AllocationExhausted { attempts: u32 },

    #[error("provisioning resource {resource_id} failed: {reason}")]
    Provisioning {
        resource_id: ResourceId,
        reason: String,
    },

    #[error("provisioning resource {resource_id} returned no reachable address")]
    IncompleteDetails { resource_id: ResourceId },

    /// The task driving a request ended before it produced an outcome.
    #[error("provisioning was interrupted: {reason}")]
    Interrupted { reason: String },

    #[error("deleting resource {resource_id} failed: {reason}")]
    Release {
        resource_id: ResourceId,
        reason: String,
    },
}

impl ManagerError {
    pub(crate) fn exhausted() -> Self {
        Self::AllocationExhausted { attempts: MAX_TRY }
    }

    /// Stable machine-readable kind, used as the client-facing error type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AllocationExhausted { .. } => "allocation_exhausted",
            Self::Provisioning { .. }
            | Self::IncompleteDetails { .. }
            | Self::Interrupted { .. } => "provisioning_failed",
            Self::Release { .. } => "release_failed",
        }
    }

    pub fn resource_id(&self) -> Option<ResourceId> {
        match self {
            Self::AllocationExhausted { .. } | Self::Interrupted { .. } => None,
            Self::Provisioning { resource_id, .. }
            | Self::IncompleteDetails { resource_id }
            | Self::Release { resource_id, .. } => Some(*resource_id),
        }
    }
}

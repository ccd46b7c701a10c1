//! Connection admission and activity tracking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};
use vmlease_id::{ConnectionId, UserId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("user {user_id} already connected as {existing}")]
    AlreadyConnected {
        user_id: UserId,
        existing: ConnectionId,
    },
}

impl AdmissionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyConnected { .. } => "already_connected",
        }
    }
}

/// Last known state of a user's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
    pub user_id: UserId,
    pub last_activity: Instant,
    /// `None` once the connection closed.
    pub handle: Option<ConnectionId>,
}

impl ConnectionEntry {
    pub fn is_live(&self) -> bool {
        self.handle.is_some()
    }
}

/// Registry of connections keyed by user. Cheap to clone.
///
/// Admission is first-come: while a user has a live connection every further
/// attempt is refused, and the existing connection is left untouched.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<Mutex<HashMap<UserId, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<UserId, ConnectionEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a new connection for `user_id`.
    pub fn admit(&self, user_id: &UserId) -> Result<ConnectionId, AdmissionError> {
        let mut entries = self.entries();

        if let Some(existing) = entries.get(user_id).and_then(|entry| entry.handle) {
            info!(user_id = %user_id, connection_id = %existing, "Rejecting duplicate connection");
            return Err(AdmissionError::AlreadyConnected {
                user_id: user_id.clone(),
                existing,
            });
        }

        let connection_id = ConnectionId::new();
        entries.insert(
            user_id.clone(),
            ConnectionEntry {
                user_id: user_id.clone(),
                last_activity: Instant::now(),
                handle: Some(connection_id),
            },
        );
        info!(user_id = %user_id, connection_id = %connection_id, "Connection admitted");
        Ok(connection_id)
    }

    /// Record inbound activity on `connection_id`. Ignored if that connection
    /// is no longer the user's current one.
    pub fn touch(&self, user_id: &UserId, connection_id: ConnectionId) {
        if let Some(entry) = self.entries().get_mut(user_id) {
            if entry.handle == Some(connection_id) {
                entry.last_activity = Instant::now();
            }
        }
    }

    /// Mark `connection_id` closed. The entry stays, with no handle, so the
    /// reaper still sees the user as disconnected.
    pub fn close(&self, user_id: &UserId, connection_id: ConnectionId) {
        if let Some(entry) = self.entries().get_mut(user_id) {
            if entry.handle == Some(connection_id) {
                entry.handle = None;
                debug!(user_id = %user_id, connection_id = %connection_id, "Connection closed");
            }
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<ConnectionEntry> {
        self.entries().get(user_id).cloned()
    }

    /// Drop closed entries for which `keep` returns false.
    pub fn prune_closed(&self, mut keep: impl FnMut(&UserId) -> bool) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|user_id, entry| entry.is_live() || keep(user_id));
        before - entries.len()
    }

    /// Number of live connections.
    pub fn live_count(&self) -> usize {
        self.entries().values().filter(|e| e.is_live()).count()
    }
}

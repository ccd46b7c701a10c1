//! Per-connection provisioning state machine.
//!
//! ```text
//!            start                 outcome: ok
//!   Idle ───────────▶ AwaitingResource ───────────▶ Delivered ─┐
//!    ▲                      │                                   │
//!    │                      └── outcome: err ─────▶ Failed ─────┤
//!    └──────────────────────── next request ◀───────────────────┘
//!
//!   any ── disconnect ──▶ Closed
//! ```
//!
//! At most one request is outstanding at a time. Its outcome is a future tied
//! to that request alone, so a result can never be attributed to another user
//! or to an earlier request, and dropping it on close is all the
//! "unsubscribing" there is.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, info, warn};
use vmlease_id::{ConnectionId, RequestId, UserId};

use super::protocol::{Inbound, Outbound};
use super::registry::ConnectionRegistry;
use crate::catalog::Catalog;
use crate::manager::{ManagerError, ResourceManager, ResourceRecord, ResourceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    AwaitingResource,
    /// The last request produced an endpoint. Accepts a new request.
    Delivered,
    /// The last request failed. Accepts a new request.
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingResource => "awaiting_resource",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    fn accepts_request(&self) -> bool {
        matches!(self, Self::Idle | Self::Delivered | Self::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type RequestOutcome = Result<ResourceRecord, ManagerError>;

struct Pending {
    request_id: RequestId,
    target_id: u32,
    outcome: BoxFuture<'static, RequestOutcome>,
}

fn failure_message(err: &ManagerError) -> &'static str {
    match err {
        ManagerError::AllocationExhausted { .. } => {
            "no machine is available right now, please try again later"
        }
        _ => "an error occurred while starting the machine, please try again later",
    }
}

pub struct ConnectionStateMachine {
    user_id: UserId,
    connection_id: ConnectionId,
    manager: ResourceManager,
    registry: ConnectionRegistry,
    catalog: Arc<Catalog>,
    state: ConnectionState,
    pending: Option<Pending>,
}

impl ConnectionStateMachine {
    /// Machine for an already admitted connection.
    pub fn new(
        user_id: UserId,
        connection_id: ConnectionId,
        manager: ResourceManager,
        registry: ConnectionRegistry,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            user_id,
            connection_id,
            manager,
            registry,
            catalog,
            state: ConnectionState::Idle,
            pending: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn transition(&mut self, to: ConnectionState) {
        debug!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            from = %self.state,
            to = %to,
            "Connection state change"
        );
        self.state = to;
    }

    /// Handle a text frame. Returns the messages to send, in order.
    pub fn handle_text(&mut self, text: &str) -> Vec<Outbound> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        self.registry.touch(&self.user_id, self.connection_id);

        match Inbound::parse(text) {
            Ok(Inbound::Start { target_id }) => self.start(target_id),
            Ok(Inbound::Ping) => Vec::new(),
            Err(e) => {
                debug!(user_id = %self.user_id, error = %e, "Rejecting client message");
                vec![Outbound::error(e.kind(), e.to_string())]
            }
        }
    }

    /// Handle a binary frame. The protocol is text-only.
    pub fn handle_binary(&mut self) -> Vec<Outbound> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        self.registry.touch(&self.user_id, self.connection_id);
        vec![Outbound::error(
            "malformed_message",
            "malformed message: binary frames are not supported",
        )]
    }

    fn start(&mut self, target_id: u32) -> Vec<Outbound> {
        if !self.state.accepts_request() {
            return vec![Outbound::error(
                "request_in_progress",
                "a start request is already in progress",
            )];
        }

        let request_id = RequestId::new();
        info!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            request_id = %request_id,
            target_id,
            "Start requested"
        );

        // The acquire can queue behind a release of this user's machine and
        // must not hold up the acknowledgment. Closing drops only the handle.
        let manager = self.manager.clone();
        let user_id = self.user_id.clone();
        let task = tokio::spawn(async move { manager.acquire(&user_id).await?.ready().await });

        self.pending = Some(Pending {
            request_id,
            target_id,
            outcome: async move {
                task.await.unwrap_or_else(|e| {
                    Err(ManagerError::Interrupted {
                        reason: e.to_string(),
                    })
                })
            }
            .boxed(),
        });
        self.transition(ConnectionState::AwaitingResource);
        vec![Outbound::starting()]
    }

    /// Wait for the outstanding request's outcome. Never resolves while no
    /// request is outstanding. Safe to cancel and call again.
    pub async fn next_outcome(&mut self) -> RequestOutcome {
        match self.pending.as_mut() {
            Some(pending) => (&mut pending.outcome).await,
            None => std::future::pending().await,
        }
    }

    /// Apply the outcome returned by [`next_outcome`](Self::next_outcome).
    pub fn resolve(&mut self, outcome: RequestOutcome) -> Option<Outbound> {
        let pending = self.pending.take()?;
        if self.state != ConnectionState::AwaitingResource {
            return None;
        }

        let message = match outcome {
            Ok(record) => self.deliver(&pending, &record),
            Err(e) => {
                warn!(
                    user_id = %self.user_id,
                    request_id = %pending.request_id,
                    error = %e,
                    "Provisioning failed"
                );
                Err(Outbound::error(e.kind(), failure_message(&e)))
            }
        };

        Some(match message {
            Ok(started) => {
                self.transition(ConnectionState::Delivered);
                started
            }
            Err(error) => {
                self.transition(ConnectionState::Failed);
                error
            }
        })
    }

    fn deliver(&self, pending: &Pending, record: &ResourceRecord) -> Result<Outbound, Outbound> {
        let address = match (record.status, record.address()) {
            (ResourceStatus::Created, Some(address)) => address,
            _ => {
                return Err(Outbound::error(
                    "provisioning_failed",
                    "could not create a new machine, please try again later",
                ))
            }
        };

        let Some(target) = self.catalog.get(pending.target_id) else {
            return Err(Outbound::error("unknown_target", "target does not exist"));
        };

        let endpoint = target.endpoint(address);
        info!(
            user_id = %self.user_id,
            request_id = %pending.request_id,
            resource_id = %record.resource_id,
            endpoint = %endpoint,
            "Endpoint delivered"
        );
        Ok(Outbound::started(endpoint))
    }

    /// The connection went away. Provisioning already in flight keeps going;
    /// this connection just stops waiting for it.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.pending = None;
        self.registry.close(&self.user_id, self.connection_id);
        self.transition(ConnectionState::Closed);
    }
}

impl Drop for ConnectionStateMachine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::backend::MockBackend;
    use crate::catalog::Target;
    use crate::manager::DEFAULT_DOMAIN;

    struct Harness {
        backend: Arc<MockBackend>,
        manager: ResourceManager,
        registry: ConnectionRegistry,
        machine: ConnectionStateMachine,
    }

    fn harness(backend: MockBackend) -> Harness {
        harness_with_domain(backend, DEFAULT_DOMAIN)
    }

    fn harness_with_domain(backend: MockBackend, id_domain: u32) -> Harness {
        let backend = Arc::new(backend);
        let manager = ResourceManager::new(backend.clone(), id_domain);
        let registry = ConnectionRegistry::new();
        let catalog = Catalog::new(vec![Target {
            id: 7,
            name: "Snake".to_string(),
            path: "snake".to_string(),
        }])
        .unwrap();

        let user_id = UserId::parse("alice").unwrap();
        let connection_id = registry.admit(&user_id).unwrap();
        let machine = ConnectionStateMachine::new(
            user_id,
            connection_id,
            manager.clone(),
            registry.clone(),
            Arc::new(catalog),
        );

        Harness {
            backend,
            manager,
            registry,
            machine,
        }
    }

    async fn settle(machine: &mut ConnectionStateMachine) -> Outbound {
        let outcome = machine.next_outcome().await;
        machine.resolve(outcome).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_delivers_endpoint() {
        let mut h = harness(MockBackend::new());

        let out = h
            .machine
            .handle_text(r#"{"type":"start","data":{"target_id":7}}"#);
        assert_eq!(out, vec![Outbound::starting()]);
        assert_eq!(h.machine.state(), ConnectionState::AwaitingResource);

        let message = settle(&mut h.machine).await;
        let record = h.manager.get(h.machine.user_id()).unwrap();
        let expected = format!("http://{}/snake/index.html", record.address().unwrap());
        assert_eq!(message, Outbound::started(expected));
        assert_eq!(h.machine.state(), ConnectionState::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_while_waiting_is_rejected() {
        let mut h = harness(MockBackend::new());
        let start = r#"{"type":"start","data":{"target_id":7}}"#;

        h.machine.handle_text(start);
        let out = h.machine.handle_text(start);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].error_kind(), Some("request_in_progress"));
        assert_eq!(h.machine.state(), ConnectionState::AwaitingResource);

        settle(&mut h.machine).await;
        assert_eq!(h.backend.create_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_acknowledged_while_release_in_flight() {
        let mut h = harness(MockBackend::with_latency(Duration::from_secs(20)));
        let user_id = h.machine.user_id().clone();
        h.manager.acquire_ready(&user_id).await.unwrap();

        let release = tokio::spawn({
            let manager = h.manager.clone();
            let user_id = user_id.clone();
            async move { manager.release(&user_id).await }
        });
        while h.manager.get(&user_id).is_some() {
            tokio::task::yield_now().await;
        }

        let before = Instant::now();
        let start = r#"{"type":"start","data":{"target_id":7}}"#;
        assert_eq!(h.machine.handle_text(start), vec![Outbound::starting()]);
        assert_eq!(h.machine.state(), ConnectionState::AwaitingResource);
        let out = h.machine.handle_text(start);
        assert_eq!(out[0].error_kind(), Some("request_in_progress"));
        assert_eq!(Instant::now(), before);

        // The new create waits for the delete, then completes.
        assert!(matches!(settle(&mut h.machine).await, Outbound::Started { .. }));
        assert!(release.await.unwrap().unwrap().is_some());
        assert!(before.elapsed() >= Duration::from_secs(30));
        assert_eq!(h.backend.delete_calls(), 1);
        assert_eq!(h.backend.create_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_is_reported_as_outcome() {
        let mut h = harness_with_domain(MockBackend::new(), 1);
        h.manager
            .acquire_ready(&UserId::parse("bob").unwrap())
            .await
            .unwrap();

        let out = h
            .machine
            .handle_text(r#"{"type":"start","data":{"target_id":7}}"#);
        assert_eq!(out, vec![Outbound::starting()]);

        let message = settle(&mut h.machine).await;
        assert_eq!(message.error_kind(), Some("allocation_exhausted"));
        assert_eq!(h.machine.state(), ConnectionState::Failed);
        assert!(h.manager.get(h.machine.user_id()).is_none());
        assert_eq!(h.backend.create_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_keeps_state() {
        let mut h = harness(MockBackend::new());

        let out = h.machine.handle_text("{not json");
        assert_eq!(out[0].error_kind(), Some("malformed_message"));
        let out = h.machine.handle_text(r#"{"type":"dance"}"#);
        assert_eq!(out[0].error_kind(), Some("unknown_message"));
        let out = h.machine.handle_binary();
        assert_eq!(out[0].error_kind(), Some("malformed_message"));

        assert_eq!(h.machine.state(), ConnectionState::Idle);
        assert_eq!(h.backend.create_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_target_fails_after_provisioning() {
        let mut h = harness(MockBackend::new());

        h.machine
            .handle_text(r#"{"type":"start","data":{"target_id":99}}"#);
        let message = settle(&mut h.machine).await;

        assert_eq!(message.error_kind(), Some("unknown_target"));
        assert_eq!(h.machine.state(), ConnectionState::Failed);
        // The machine itself is fine and stays with the user.
        assert!(h.manager.get(h.machine.user_id()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_retry() {
        let mut h = harness(MockBackend::failing());
        let start = r#"{"type":"start","data":{"target_id":7}}"#;

        h.machine.handle_text(start);
        let message = settle(&mut h.machine).await;
        assert_eq!(message.error_kind(), Some("provisioning_failed"));
        assert_eq!(h.machine.state(), ConnectionState::Failed);
        assert!(h.manager.get(h.machine.user_id()).is_none());

        h.backend.set_fail_creates(false);
        let out = h.machine.handle_text(start);
        assert_eq!(out, vec![Outbound::starting()]);
        assert!(matches!(settle(&mut h.machine).await, Outbound::Started { .. }));
        assert_eq!(h.backend.create_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_keeps_provisioning_running() {
        let mut h = harness(MockBackend::new());
        let user_id = h.machine.user_id().clone();

        h.machine
            .handle_text(r#"{"type":"start","data":{"target_id":7}}"#);
        h.machine.close();
        assert_eq!(h.machine.state(), ConnectionState::Closed);
        assert!(!h.registry.get(&user_id).unwrap().is_live());

        let record = h.manager.acquire_ready(&user_id).await.unwrap();
        assert_eq!(record.status, ResourceStatus::Created);
        assert_eq!(h.backend.create_calls(), 1);

        // Nothing is reported to a closed connection.
        assert!(h.machine.handle_text(r#"{"type":"ping"}"#).is_empty());
        assert!(h.machine.resolve(Ok(record)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_message_counts_as_activity() {
        let mut h = harness(MockBackend::new());
        let user_id = h.machine.user_id().clone();
        let before = h.registry.get(&user_id).unwrap().last_activity;

        tokio::time::advance(Duration::from_secs(30)).await;
        h.machine.handle_text("garbage");

        let after = h.registry.get(&user_id).unwrap().last_activity;
        assert_eq!(after - before, Duration::from_secs(30));
    }
}

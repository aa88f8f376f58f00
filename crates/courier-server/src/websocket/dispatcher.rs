//! Event dispatch: resolve a user's connections, serialize, sanitize, send.
//!
//! One dispatcher serves one user scope. Delivery outcomes never propagate as
//! errors; they are folded into [`SendReport`]s and counters, and connections
//! that keep failing are pruned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use courier_core::serializer::serialize_checked;
use courier_core::{
    DeliveryError, Envelope, EventType, ManagerError, Payload, Result, ThreadId, UserId,
};
use futures::future::join_all;
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, instrument, trace, warn};

use super::connection::ClientConnection;
use super::isolation::IsolationGuard;
use super::registry::{ConnectionOwnership, ConnectionRegistry};
use super::transport::CLOSE_INTERNAL_ERROR;
use crate::config::DeliveryConfig;
use crate::metrics::{
    CONNECTIONS_PRUNED_TOTAL, DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS, DELIVERY_FAILURES_TOTAL,
    EVENTS_SENT_TOTAL, ISOLATION_VIOLATIONS_TOTAL, SERIALIZATION_DEGRADED_TOTAL,
};

/// Stage of a single per-connection delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    /// Not started.
    Pending,
    /// Converting the payload to JSON.
    Serializing,
    /// Forcing identity fields to the target user.
    Sanitizing,
    /// Queued for the connection's writer.
    Sending,
    /// Acknowledged by the transport.
    Delivered,
    /// Gave up; see the [`DeliveryError`].
    Failed,
}

/// Outcome of one per-connection delivery.
pub type DeliveryOutcome = std::result::Result<(), DeliveryError>;

/// Overall result of a send to one user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    /// At least one connection acknowledged the frame.
    Delivered,
    /// The user has no live connections.
    NoConnections,
    /// Every connection failed.
    AllFailed,
}

impl SendStatus {
    /// Label used for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::NoConnections => "no_connections",
            Self::AllFailed => "all_failed",
        }
    }
}

/// Per-user send report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SendReport {
    /// Summary status.
    pub status: SendStatus,
    /// Connections that acknowledged the frame.
    pub delivered: usize,
    /// Connections that failed.
    pub failed: usize,
    /// Connections pruned as a result of this send.
    pub pruned: usize,
}

impl SendReport {
    /// Report for a user with nothing to send to.
    pub fn no_connections() -> Self {
        Self {
            status: SendStatus::NoConnections,
            delivered: 0,
            failed: 0,
            pruned: 0,
        }
    }

    fn from_counts(delivered: usize, failed: usize, pruned: usize) -> Self {
        let status = if delivered > 0 {
            SendStatus::Delivered
        } else if failed > 0 {
            SendStatus::AllFailed
        } else {
            SendStatus::NoConnections
        };
        Self {
            status,
            delivered,
            failed,
            pruned,
        }
    }
}

/// Result of a broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Users targeted.
    pub users: usize,
    /// Connections attempted.
    pub attempted: usize,
    /// Connections delivered to.
    pub delivered: usize,
    /// Connections that failed.
    pub failed: usize,
}

impl BroadcastReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: &Self) {
        self.users += other.users;
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.failed += other.failed;
    }

    fn record(&mut self, report: &SendReport) {
        self.users += 1;
        self.attempted += report.delivered + report.failed;
        self.delivered += report.delivered;
        self.failed += report.failed;
    }
}

/// Cumulative delivery counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// Per-connection delivery attempts.
    pub attempted: u64,
    /// Successful deliveries.
    pub delivered: u64,
    /// Failed deliveries.
    pub failed: u64,
    /// Connections pruned after repeated failures.
    pub pruned: u64,
    /// Events that had a foreign user id rewritten.
    pub sanitized: u64,
}

impl DeliveryStats {
    /// Fold another set of counters into this one.
    pub fn merge(&mut self, other: &Self) {
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.pruned += other.pruned;
        self.sanitized += other.sanitized;
    }
}

/// Delivers events to the connections of one user scope.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    guard: Arc<IsolationGuard>,
    config: DeliveryConfig,
    ownership: Option<Arc<ConnectionOwnership>>,
    attempted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    pruned: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher over a registry and its isolation guard.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        guard: Arc<IsolationGuard>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            registry,
            guard,
            config,
            ownership: None,
            attempted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        }
    }

    /// Release hub-wide id ownership when this dispatcher prunes.
    pub(crate) fn with_ownership(mut self, ownership: Arc<ConnectionOwnership>) -> Self {
        self.ownership = Some(ownership);
        self
    }

    /// Send an event to every live connection of `user_id`.
    ///
    /// The payload is serialized and sanitized once; all connections share the
    /// encoded frame and are written concurrently.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn send_to_user(&self, user_id: &UserId, event: &Payload) -> Result<SendReport> {
        if user_id.is_blank() {
            return Err(ManagerError::InvalidUserId);
        }

        let targets = self.registry.list_for_user(user_id);
        if targets.is_empty() {
            debug!("no connections for user");
            counter!(EVENTS_SENT_TOTAL, "status" => SendStatus::NoConnections.as_str()).increment(1);
            return Ok(SendReport::no_connections());
        }

        trace!(state = ?DeliveryState::Serializing);
        let serialized = serialize_checked(event);
        if serialized.degraded {
            counter!(SERIALIZATION_DEGRADED_TOTAL).increment(1);
        }

        trace!(state = ?DeliveryState::Sanitizing);
        let sanitized = self.guard.sanitize(&serialized.value, user_id);
        let frame: Arc<str> = Arc::from(sanitized.event.to_string());

        let outcomes = join_all(
            targets
                .iter()
                .map(|conn| self.deliver_one(conn, user_id, Arc::clone(&frame))),
        )
        .await;

        let (mut delivered, mut failed, mut pruned) = (0, 0, 0);
        for (conn, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    delivered += 1;
                    let _ = self.delivered.fetch_add(1, Ordering::Relaxed);
                    counter!(DELIVERIES_TOTAL, "outcome" => "delivered").increment(1);
                    conn.record_success();
                    trace!(conn_id = %conn.id, state = ?DeliveryState::Delivered);
                }
                Err(err) => {
                    failed += 1;
                    trace!(conn_id = %conn.id, state = ?DeliveryState::Failed, error = %err);
                    if self.record_failure(conn, &err) {
                        pruned += 1;
                    }
                }
            }
        }

        let report = SendReport::from_counts(delivered, failed, pruned);
        counter!(EVENTS_SENT_TOTAL, "status" => report.status.as_str()).increment(1);
        debug!(delivered, failed, pruned, "event dispatched");
        Ok(report)
    }

    async fn deliver_one(
        &self,
        conn: &Arc<ClientConnection>,
        user_id: &UserId,
        frame: Arc<str>,
    ) -> DeliveryOutcome {
        trace!(conn_id = %conn.id, state = ?DeliveryState::Pending);
        let _ = self.attempted.fetch_add(1, Ordering::Relaxed);

        if conn.user_id != *user_id {
            return Err(self.violation(conn, "connection owned by another user"));
        }
        let token_ok = conn
            .isolation_token()
            .is_some_and(|token| self.guard.verify(&conn.id, &token));
        if !token_ok {
            let still_registered = self
                .registry
                .get(&conn.id)
                .is_some_and(|current| Arc::ptr_eq(&current, conn));
            // Removed or replaced since lookup.
            if !still_registered || !conn.is_active() {
                return Err(DeliveryError::Closed);
            }
            return Err(self.violation(conn, "isolation token missing or revoked"));
        }

        trace!(conn_id = %conn.id, state = ?DeliveryState::Sending);
        let started = Instant::now();
        let outcome = conn.deliver(frame).await;
        histogram!(DELIVERY_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        outcome
    }

    fn violation(&self, conn: &ClientConnection, reason: &str) -> DeliveryError {
        counter!(ISOLATION_VIOLATIONS_TOTAL).increment(1);
        warn!(conn_id = %conn.id, owner = %conn.user_id, reason, "isolation check refused delivery");
        DeliveryError::IsolationViolation(reason.to_owned())
    }

    /// Count a failure and prune the connection once its threshold is
    /// reached. Returns whether it was pruned.
    fn record_failure(&self, conn: &Arc<ClientConnection>, err: &DeliveryError) -> bool {
        let _ = self.failed.fetch_add(1, Ordering::Relaxed);
        counter!(DELIVERIES_TOTAL, "outcome" => "failed").increment(1);
        counter!(DELIVERY_FAILURES_TOTAL, "kind" => err.kind()).increment(1);

        let consecutive = conn.record_failure();
        let threshold = if err.is_transient() {
            self.config.transient_failure_threshold
        } else {
            self.config.hard_failure_threshold
        };
        warn!(
            conn_id = %conn.id,
            user_id = %conn.user_id,
            error = %err,
            consecutive,
            threshold,
            "delivery failed"
        );
        if consecutive < threshold {
            return false;
        }
        self.prune(conn, err)
    }

    fn prune(&self, conn: &Arc<ClientConnection>, err: &DeliveryError) -> bool {
        if !self.registry.remove_exact(conn) {
            // Already removed by someone else; just make sure it is closed.
            let _ = conn.close(CLOSE_INTERNAL_ERROR, "delivery failed");
            return false;
        }
        if let Some(token) = conn.isolation_token() {
            let _ = self.guard.revoke_token_if(&conn.id, &token);
        }
        if let Some(ownership) = &self.ownership {
            ownership.release(&conn.id, &conn.user_id);
        }
        let _ = conn.close(CLOSE_INTERNAL_ERROR, "delivery failed");
        conn.record_closed("pruned");
        let _ = self.pruned.fetch_add(1, Ordering::Relaxed);
        counter!(CONNECTIONS_PRUNED_TOTAL, "kind" => err.kind()).increment(1);
        warn!(conn_id = %conn.id, user_id = %conn.user_id, "dead connection pruned");
        true
    }

    /// Send an event to every user known to this dispatcher's registry.
    ///
    /// A failure for one user never affects the others.
    #[instrument(skip_all)]
    pub async fn broadcast(&self, event: &Payload) -> BroadcastReport {
        let users = self.registry.users();
        let results = join_all(users.iter().map(|user| self.send_to_user(user, event))).await;

        let mut report = BroadcastReport::default();
        for (user, result) in users.iter().zip(results) {
            match result {
                Ok(sent) => report.record(&sent),
                Err(e) => warn!(user_id = %user, error = %e, "broadcast skipped user"),
            }
        }
        debug!(
            users = report.users,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast complete"
        );
        report
    }

    /// Wrap `data` in the standard envelope for `event_type` and send it.
    ///
    /// Missing type-specific fields are filled with defaults; the payload's
    /// `user_id` / `thread_id` always name the target.
    #[instrument(skip_all, fields(user_id = %user_id, event_type = %event_type))]
    pub async fn emit_critical_event(
        &self,
        user_id: &UserId,
        thread_id: Option<&ThreadId>,
        event_type: EventType,
        data: &Payload,
    ) -> Result<SendReport> {
        if user_id.is_blank() {
            return Err(ManagerError::InvalidUserId);
        }
        let serialized = serialize_checked(data);
        if serialized.degraded {
            counter!(SERIALIZATION_DEGRADED_TOTAL).increment(1);
        }
        let envelope = Envelope::for_user(event_type, serialized.value, user_id, thread_id, Utc::now());
        self.send_to_user(user_id, &Payload::Json(envelope.into_value()))
            .await
    }

    /// Snapshot of the cumulative counters.
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            attempted: self.attempted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            sanitized: self.guard.sanitized_count(),
        }
    }

    /// Registry this dispatcher reads from.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ConnectionOptions;
    use crate::websocket::transport::{MemoryBehavior, MemoryTransport};
    use assert_matches::assert_matches;
    use courier_core::logging::capture_logs;
    use courier_core::{ConnectionId, TransportError};
    use proptest::prelude::*;
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tracing::Level;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        guard: Arc<IsolationGuard>,
        dispatcher: Dispatcher,
        options: ConnectionOptions,
    }

    struct Client {
        conn: Arc<ClientConnection>,
        transport: Arc<MemoryTransport>,
        rx: UnboundedReceiver<Arc<str>>,
    }

    impl Client {
        fn frames(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(serde_json::from_str(&frame).unwrap());
            }
            out
        }
    }

    fn harness(config: DeliveryConfig) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let guard = Arc::new(IsolationGuard::new());
        let options = ConnectionOptions::from_delivery(&config, None);
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&guard), config);
        Harness {
            registry,
            guard,
            dispatcher,
            options,
        }
    }

    fn connect(h: &Harness, id: &str, user: &str) -> Client {
        let (transport, rx) = MemoryTransport::new();
        let conn = ClientConnection::spawn(
            ConnectionId::from(id),
            UserId::from(user),
            None,
            transport.clone(),
            &h.options,
        );
        conn.attach_token(h.guard.issue_token(&conn.id).unwrap());
        let _ = h.registry.add(Arc::clone(&conn)).unwrap();
        Client {
            conn,
            transport,
            rx,
        }
    }

    async fn wait_closed(transport: &MemoryTransport) {
        for _ in 0..100 {
            if transport.is_closed() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("transport was not closed");
    }

    fn event(data: Value) -> Payload {
        Payload::Json(data)
    }

    #[tokio::test]
    async fn send_reaches_every_connection_of_user() {
        let h = harness(DeliveryConfig::default());
        let mut a = connect(&h, "a", "u1");
        let mut b = connect(&h, "b", "u1");

        let report = h
            .dispatcher
            .send_to_user(&UserId::from("u1"), &event(json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(report.status, SendStatus::Delivered);
        assert_eq!(report.delivered, 2);
        assert_eq!(a.frames(), [json!({"n": 1})]);
        assert_eq!(b.frames(), [json!({"n": 1})]);
        assert_eq!(a.conn.messages_sent(), 1);

        let stats = h.dispatcher.stats();
        assert_eq!(stats.attempted, 2);
        assert_eq!(stats.delivered, 2);
    }

    #[tokio::test]
    async fn blank_user_is_rejected() {
        let h = harness(DeliveryConfig::default());
        let err = h
            .dispatcher
            .send_to_user(&UserId::from(""), &event(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, ManagerError::InvalidUserId);
    }

    #[tokio::test]
    async fn unknown_user_reports_no_connections() {
        let h = harness(DeliveryConfig::default());
        let report = h
            .dispatcher
            .send_to_user(&UserId::from("nobody"), &event(json!({})))
            .await
            .unwrap();
        assert_eq!(report, SendReport::no_connections());
    }

    #[tokio::test]
    async fn other_users_never_receive() {
        let h = harness(DeliveryConfig::default());
        let mut u1 = connect(&h, "c1", "u1");
        let mut u2 = connect(&h, "c2", "u2");

        let _ = h
            .dispatcher
            .send_to_user(&UserId::from("u1"), &event(json!({"secret": "u1 only"})))
            .await
            .unwrap();
        assert_eq!(u1.frames().len(), 1);
        assert!(u2.frames().is_empty());
    }

    #[tokio::test]
    async fn foreign_user_id_is_rewritten() {
        let h = harness(DeliveryConfig::default());
        let mut c = connect(&h, "c1", "u1");
        let _ = h
            .dispatcher
            .send_to_user(
                &UserId::from("u1"),
                &event(json!({"type": "x", "payload": {"user_id": "u2"}})),
            )
            .await
            .unwrap();
        let frames = c.frames();
        assert_eq!(frames[0]["payload"]["user_id"], "u1");
        assert_eq!(frames[0]["payload"]["isolation_sanitized"], true);
        assert_eq!(h.dispatcher.stats().sanitized, 1);
    }

    #[tokio::test]
    async fn hard_failure_prunes_on_first_error() {
        let (logs, _log_guard) = capture_logs();
        let h = harness(DeliveryConfig::default());
        let c = connect(&h, "c1", "u1");
        c.transport
            .set_behavior(MemoryBehavior::Fail(TransportError::Io("broken pipe".into())));

        let report = h
            .dispatcher
            .send_to_user(&UserId::from("u1"), &event(json!({})))
            .await
            .unwrap();
        assert_eq!(report.status, SendStatus::AllFailed);
        assert_eq!(report.pruned, 1);
        assert!(h.registry.list_for_user("u1").is_empty());
        assert!(!h.guard.verify("c1", &c.conn.isolation_token().unwrap()));
        assert_eq!(h.guard.token_count(), 0);
        wait_closed(&c.transport).await;
        assert_eq!(
            c.transport.close_frame().map(|(code, _)| code),
            Some(CLOSE_INTERNAL_ERROR)
        );
        assert_eq!(h.dispatcher.stats().pruned, 1);

        assert_eq!(logs.count(Level::WARN, "dead connection pruned"), 1);
        let pruned = logs.find(Level::WARN, "dead connection pruned").unwrap();
        assert_eq!(pruned.field("conn_id"), Some("c1"));
        assert_eq!(pruned.field("user_id"), Some("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_prune_after_threshold() {
        let config = DeliveryConfig {
            send_timeout_ms: 100,
            ..DeliveryConfig::default()
        };
        let h = harness(config);
        let c = connect(&h, "c1", "u1");
        c.transport.set_behavior(MemoryBehavior::Stall);
        let user = UserId::from("u1");

        for _ in 0..2 {
            let report = h.dispatcher.send_to_user(&user, &event(json!({}))).await.unwrap();
            assert_eq!(report.failed, 1);
            assert_eq!(report.pruned, 0);
        }
        assert_eq!(c.conn.consecutive_failures(), 2);
        let report = h.dispatcher.send_to_user(&user, &event(json!({}))).await.unwrap();
        assert_eq!(report.pruned, 1);
        assert!(h.registry.get("c1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_failures() {
        let config = DeliveryConfig {
            send_timeout_ms: 100,
            ..DeliveryConfig::default()
        };
        let h = harness(config);
        let c = connect(&h, "c1", "u1");
        let user = UserId::from("u1");

        c.transport.set_behavior(MemoryBehavior::Stall);
        let _ = h.dispatcher.send_to_user(&user, &event(json!({}))).await.unwrap();
        let _ = h.dispatcher.send_to_user(&user, &event(json!({}))).await.unwrap();
        assert_eq!(c.conn.consecutive_failures(), 2);

        c.transport.set_behavior(MemoryBehavior::Accept);
        let report = h.dispatcher.send_to_user(&user, &event(json!({}))).await.unwrap();
        assert_eq!(report.status, SendStatus::Delivered);
        assert_eq!(c.conn.consecutive_failures(), 0);
        assert_eq!(c.conn.failures(), 2);
    }

    #[tokio::test]
    async fn missing_token_is_an_isolation_violation() {
        let h = harness(DeliveryConfig::default());
        let (transport, mut rx) = MemoryTransport::new();
        let conn = ClientConnection::spawn(
            ConnectionId::from("rogue"),
            UserId::from("u1"),
            None,
            transport,
            &h.options,
        );
        let _ = h.registry.add(Arc::clone(&conn)).unwrap();

        let report = h
            .dispatcher
            .send_to_user(&UserId::from("u1"), &event(json!({})))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.pruned, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_connection_resolves_as_closed() {
        let h = harness(DeliveryConfig::default());
        let c = connect(&h, "c1", "u1");
        let _ = h.registry.remove("c1");
        h.guard.revoke_token("c1");
        let _ = c.conn.close(1000, "bye");

        let outcome = h
            .dispatcher
            .deliver_one(&c.conn, &UserId::from("u1"), Arc::from("{}"))
            .await;
        assert_matches!(outcome, Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn broadcast_isolates_failures() {
        let h = harness(DeliveryConfig::default());
        let bad = connect(&h, "bad", "u1");
        bad.transport
            .set_behavior(MemoryBehavior::Fail(TransportError::Closed));
        let mut good = connect(&h, "good", "u2");

        let report = h.dispatcher.broadcast(&event(json!({"all": true}))).await;
        assert_eq!(report.users, 2);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(good.frames(), [json!({"all": true})]);
    }

    #[tokio::test]
    async fn critical_events_use_the_standard_envelope() {
        let h = harness(DeliveryConfig::default());
        let mut c = connect(&h, "c1", "u1");
        let user = UserId::from("u1");
        let thread = ThreadId::from("t1");

        for t in EventType::LIFECYCLE {
            let _ = h
                .dispatcher
                .emit_critical_event(&user, Some(&thread), t.clone(), &Payload::Null)
                .await
                .unwrap();
        }
        let frames = c.frames();
        assert_eq!(frames.len(), 5);
        for (frame, t) in frames.iter().zip(EventType::LIFECYCLE) {
            let keys: Vec<_> = frame.as_object().unwrap().keys().cloned().collect();
            assert_eq!(keys, ["type", "payload", "timestamp"]);
            assert_eq!(frame["type"], t.as_str());
            assert_eq!(frame["payload"]["user_id"], "u1");
            assert_eq!(frame["payload"]["thread_id"], "t1");
            assert!(frame["payload"]["timestamp"].is_string());
        }
        assert_eq!(frames[3]["payload"]["success"], true);
        assert_eq!(frames[4]["payload"]["status"], "completed");
    }

    #[tokio::test]
    async fn tool_executing_scenario() {
        let h = harness(DeliveryConfig::default());
        let mut u1 = connect(&h, "c1", "U1");
        let mut u2 = connect(&h, "c2", "U2");

        let report = h
            .dispatcher
            .emit_critical_event(
                &UserId::from("U1"),
                None,
                EventType::ToolExecuting,
                &Payload::map([("tool_name", Payload::from("aws_cost_analyzer"))]),
            )
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);

        let frames = u1.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "tool_executing");
        assert_eq!(frames[0]["payload"]["tool_name"], "aws_cost_analyzer");
        assert_eq!(frames[0]["payload"]["user_id"], "U1");
        assert!(u2.frames().is_empty());
    }

    fn run<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn sends_never_cross_users(
            owners in proptest::collection::vec(0_usize..3, 1..8),
            sends in proptest::collection::vec(0_usize..3, 1..12),
        ) {
            run(async {
                let h = harness(DeliveryConfig::default());
                let mut clients: Vec<(usize, Client)> = owners
                    .iter()
                    .enumerate()
                    .map(|(i, owner)| (*owner, connect(&h, &format!("c{i}"), &format!("user{owner}"))))
                    .collect();

                for target in &sends {
                    let user = UserId::from(format!("user{target}"));
                    let data = json!({"to": user.as_str(), "user_id": "intruder"});
                    let _ = h.dispatcher.send_to_user(&user, &event(data)).await.unwrap();
                }

                let tokens: HashSet<_> = clients
                    .iter()
                    .map(|(_, c)| c.conn.isolation_token().unwrap())
                    .collect();
                prop_assert_eq!(tokens.len(), clients.len());

                for (owner, client) in &mut clients {
                    let expected = sends.iter().filter(|t| *t == owner).count();
                    let frames = client.frames();
                    prop_assert_eq!(frames.len(), expected);
                    let me = format!("user{owner}");
                    for frame in frames {
                        prop_assert_eq!(frame["to"].as_str(), Some(me.as_str()));
                        prop_assert_eq!(frame["user_id"].as_str(), Some(me.as_str()));
                    }
                }
                Ok(())
            })?;
        }

        #[test]
        fn concurrent_producers_keep_per_producer_order(
            producers in 1_usize..4,
            per_producer in 1_usize..20,
            connections in 1_usize..3,
        ) {
            run(async {
                let h = harness(DeliveryConfig::default());
                let mut clients: Vec<Client> = (0..connections)
                    .map(|i| connect(&h, &format!("c{i}"), "u1"))
                    .collect();
                let user = UserId::from("u1");

                let work = (0..producers).map(|p| {
                    let (dispatcher, user) = (&h.dispatcher, &user);
                    async move {
                        for seq in 0..per_producer {
                            let data = json!({"producer": p, "seq": seq});
                            let _ = dispatcher.send_to_user(user, &event(data)).await.unwrap();
                        }
                    }
                });
                let _ = join_all(work).await;

                for client in &mut clients {
                    let frames = client.frames();
                    prop_assert_eq!(frames.len(), producers * per_producer);
                    let mut next = vec![0_u64; producers];
                    for frame in frames {
                        let p = usize::try_from(frame["producer"].as_u64().unwrap()).unwrap();
                        prop_assert_eq!(frame["seq"].as_u64(), Some(next[p]));
                        next[p] += 1;
                    }
                }
                Ok(())
            })?;
        }
    }
}

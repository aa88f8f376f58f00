//! Client connection state and its outbound writer.
//!
//! Every connection owns a bounded FIFO queue drained by exactly one writer
//! task. The writer is the only code that touches the transport, which is
//! what keeps frames for one connection in enqueue order. Each queued frame
//! carries a oneshot acknowledgement so the dispatcher learns the per-frame
//! outcome without sharing the transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use courier_core::{ConnectionId, DeliveryError, ThreadId, UserId};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::isolation::IsolationToken;
use super::transport::{CLOSE_NORMAL, Transport, TransportState};
use crate::config::DeliveryConfig;
use crate::metrics::{CONNECTION_DURATION_SECONDS, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL};

/// Writer settings for one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Outbound queue capacity.
    pub queue_capacity: usize,
    /// Bound on one transport send and on waiting for queue space.
    pub send_timeout: Duration,
    /// Transport-level ping interval, if any.
    pub ping_interval: Option<Duration>,
}

impl ConnectionOptions {
    /// Options derived from delivery settings.
    pub fn from_delivery(delivery: &DeliveryConfig, ping_interval: Option<Duration>) -> Self {
        Self {
            queue_capacity: delivery.queue_capacity.max(1),
            send_timeout: delivery.send_timeout(),
            ping_interval,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_delivery(&DeliveryConfig::default(), None)
    }
}

struct Outbound {
    frame: Arc<str>,
    ack: oneshot::Sender<Result<(), DeliveryError>>,
}

/// A live client session owned by one user.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Owning user; never changes.
    pub user_id: UserId,
    /// Thread the session was opened for.
    pub thread_id: Option<ThreadId>,
    /// When the connection was created.
    pub created_at: DateTime<Utc>,
    connected_at: Instant,
    is_active: AtomicBool,
    is_alive: AtomicBool,
    messages_sent: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    last_activity: Mutex<DateTime<Utc>>,
    last_pong: Mutex<Instant>,
    isolation_token: Mutex<Option<IsolationToken>>,
    close_frame: Arc<Mutex<Option<(u16, String)>>>,
    closed: CancellationToken,
    send_timeout: Duration,
    tx: mpsc::Sender<Outbound>,
}

impl ClientConnection {
    /// Create a connection and spawn its writer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        id: ConnectionId,
        user_id: UserId,
        thread_id: Option<ThreadId>,
        transport: Arc<dyn Transport>,
        options: &ConnectionOptions,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let closed = CancellationToken::new();
        let close_frame = Arc::new(Mutex::new(None));
        let now = Utc::now();

        let connection = Arc::new(Self {
            id,
            user_id,
            thread_id,
            created_at: now,
            connected_at: Instant::now(),
            is_active: AtomicBool::new(true),
            is_alive: AtomicBool::new(true),
            messages_sent: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_activity: Mutex::new(now),
            last_pong: Mutex::new(Instant::now()),
            isolation_token: Mutex::new(None),
            close_frame: Arc::clone(&close_frame),
            closed: closed.clone(),
            send_timeout: options.send_timeout,
            tx,
        });

        let writer = Writer {
            conn_id: connection.id.clone(),
            transport,
            rx,
            closed,
            close_frame,
            send_timeout: options.send_timeout,
            ping_interval: options.ping_interval,
        };
        drop(tokio::spawn(writer.run()));

        connection
    }

    /// Queue a frame and wait for the writer's acknowledgement.
    ///
    /// Waiting for queue space is bounded by the send timeout
    /// ([`DeliveryError::Backpressure`]); the writer bounds the transport send
    /// itself ([`DeliveryError::Timeout`]). A connection closed before or
    /// during the send yields [`DeliveryError::Closed`].
    pub async fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        if !self.is_active() {
            return Err(DeliveryError::Closed);
        }
        let (ack, ack_rx) = oneshot::channel();
        match time::timeout(self.send_timeout, self.tx.send(Outbound { frame, ack })).await {
            Err(_) => return Err(DeliveryError::Backpressure),
            Ok(Err(_)) => return Err(DeliveryError::Closed),
            Ok(Ok(())) => {}
        }
        ack_rx.await.unwrap_or(Err(DeliveryError::Closed))
    }

    /// Record a successful delivery.
    pub fn record_success(&self) {
        let _ = self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.last_activity.lock() = Utc::now();
    }

    /// Record a failed delivery, returning the consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        let _ = self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Stop accepting frames and close the transport once the writer drains.
    ///
    /// Frames still queued resolve as [`DeliveryError::Closed`]. Only the
    /// first call has an effect; returns whether this call closed it.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if !self.is_active.swap(false, Ordering::AcqRel) {
            return false;
        }
        *self.close_frame.lock() = Some((code, reason.to_owned()));
        self.closed.cancel();
        debug!(conn_id = %self.id, user_id = %self.user_id, code, reason, "connection closing");
        true
    }

    /// Whether the connection still accepts frames.
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// Transport state as reported to clients and stats.
    pub fn state(&self) -> TransportState {
        if self.is_active() {
            TransportState::Open
        } else {
            TransportState::Closed
        }
    }

    /// Token cancelled when the connection closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Attach the isolation token issued for this connection.
    pub fn attach_token(&self, token: IsolationToken) {
        *self.isolation_token.lock() = Some(token);
    }

    /// Isolation token, if one is attached.
    pub fn isolation_token(&self) -> Option<IsolationToken> {
        self.isolation_token.lock().clone()
    }

    /// Frames delivered.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Failed deliveries over the connection's lifetime.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Failed deliveries since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Time of the last successful delivery (or creation).
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Mark the connection as alive (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Duration since the last inbound sign of life.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Record the metrics for a connection leaving the registry.
    pub(crate) fn record_closed(&self, reason: &'static str) {
        counter!(CONNECTIONS_CLOSED_TOTAL, "reason" => reason).increment(1);
        gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(CONNECTION_DURATION_SECONDS).record(self.age().as_secs_f64());
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("thread_id", &self.thread_id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer task
// ─────────────────────────────────────────────────────────────────────────────

struct Writer {
    conn_id: ConnectionId,
    transport: Arc<dyn Transport>,
    rx: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
    close_frame: Arc<Mutex<Option<(u16, String)>>>,
    send_timeout: Duration,
    ping_interval: Option<Duration>,
}

impl Writer {
    async fn run(mut self) {
        let mut ping = self.ping_interval.map(|every| {
            let mut interval = time::interval_at(time::Instant::now() + every, every);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;
                () = self.closed.cancelled() => break,
                msg = self.rx.recv() => {
                    let Some(out) = msg else { break };
                    let result = self.send(out.frame).await;
                    // The dispatcher may have given up waiting.
                    let _ = out.ack.send(result);
                }
                () = tick(ping.as_mut()) => {
                    match time::timeout(self.send_timeout, self.transport.ping()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(conn_id = %self.conn_id, error = %e, "ping failed"),
                        Err(_) => warn!(conn_id = %self.conn_id, "ping timed out"),
                    }
                }
            }
        }

        self.rx.close();
        let mut drained = 0_usize;
        while let Ok(out) = self.rx.try_recv() {
            let _ = out.ack.send(Err(DeliveryError::Closed));
            drained += 1;
        }
        let (code, reason) = self
            .close_frame
            .lock()
            .take()
            .unwrap_or_else(|| (CLOSE_NORMAL, "connection dropped".to_owned()));
        trace!(conn_id = %self.conn_id, drained, code, "writer stopped");
        if time::timeout(self.send_timeout, self.transport.close(code, &reason))
            .await
            .is_err()
        {
            warn!(conn_id = %self.conn_id, code, "transport close timed out");
        }
    }

    async fn send(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(DeliveryError::Closed),
            res = time::timeout(self.send_timeout, self.transport.send(frame)) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DeliveryError::from(e)),
                Err(_) => Err(DeliveryError::Timeout),
            },
        }
    }
}

async fn tick(interval: Option<&mut time::Interval>) {
    match interval {
        Some(interval) => {
            let _ = interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::transport::{CLOSE_INTERNAL_ERROR, MemoryBehavior, MemoryTransport};
    use courier_core::TransportError;
    use courier_core::logging::capture_logs;
    use tracing::Level;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            queue_capacity: 8,
            send_timeout: Duration::from_millis(200),
            ping_interval: None,
        }
    }

    fn make_connection(
        opts: &ConnectionOptions,
    ) -> (
        Arc<ClientConnection>,
        Arc<MemoryTransport>,
        mpsc::UnboundedReceiver<Arc<str>>,
    ) {
        let (transport, rx) = MemoryTransport::new();
        let conn = ClientConnection::spawn(
            ConnectionId::from("conn_1"),
            UserId::from("u1"),
            Some(ThreadId::from("t1")),
            transport.clone(),
            opts,
        );
        (conn, transport, rx)
    }

    #[tokio::test]
    async fn create_connection() {
        let (conn, _t, _rx) = make_connection(&options());
        assert_eq!(conn.id.as_str(), "conn_1");
        assert_eq!(conn.user_id.as_str(), "u1");
        assert!(conn.is_active());
        assert_eq!(conn.state(), TransportState::Open);
        assert_eq!(conn.messages_sent(), 0);
    }

    #[tokio::test]
    async fn deliver_reaches_transport() {
        let (conn, _t, mut rx) = make_connection(&options());
        conn.deliver(Arc::from("hello")).await.unwrap();
        assert_eq!(&*rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn deliveries_keep_order() {
        let (conn, _t, mut rx) = make_connection(&options());
        for i in 0..20 {
            conn.deliver(Arc::from(format!("msg_{i}"))).await.unwrap();
        }
        for i in 0..20 {
            assert_eq!(&*rx.recv().await.unwrap(), format!("msg_{i}"));
        }
    }

    #[tokio::test]
    async fn transport_error_is_reported() {
        let (conn, t, _rx) = make_connection(&options());
        t.set_behavior(MemoryBehavior::Fail(TransportError::Io("broken pipe".into())));
        let err = conn.deliver(Arc::from("x")).await.unwrap_err();
        assert_eq!(err, DeliveryError::Transport("broken pipe".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transport_times_out() {
        let (conn, t, _rx) = make_connection(&options());
        t.set_behavior(MemoryBehavior::Stall);
        let err = conn.deliver(Arc::from("x")).await.unwrap_err();
        assert_eq!(err, DeliveryError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_is_backpressure() {
        let opts = ConnectionOptions {
            queue_capacity: 1,
            send_timeout: Duration::from_millis(100),
            ping_interval: None,
        };
        let (conn, t, _rx) = make_connection(&opts);
        t.set_behavior(MemoryBehavior::Stall);
        let spawn_deliver = |frame: &'static str| {
            let c = Arc::clone(&conn);
            tokio::spawn(async move { c.deliver(Arc::from(frame)).await })
        };

        // `a` occupies the writer, `b`/`c` fill the queue and its wait list.
        let a = spawn_deliver("a");
        tokio::time::sleep(Duration::from_millis(1)).await;
        let b = spawn_deliver("b");
        let c = spawn_deliver("c");
        tokio::time::sleep(Duration::from_millis(1)).await;

        let d = conn.deliver(Arc::from("d")).await;
        assert_eq!(d, Err(DeliveryError::Backpressure));
        assert_eq!(a.await.unwrap(), Err(DeliveryError::Timeout));
        b.abort();
        c.abort();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_closes_transport() {
        let (conn, t, _rx) = make_connection(&options());
        assert!(conn.close(CLOSE_INTERNAL_ERROR, "pruned"));
        assert!(!conn.close(CLOSE_NORMAL, "again"));
        assert!(!conn.is_active());
        assert_eq!(conn.state(), TransportState::Closed);

        conn.closed_token().cancelled().await;
        // Writer closes the transport after draining.
        for _ in 0..50 {
            if t.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(t.close_frame(), Some((CLOSE_INTERNAL_ERROR, "pruned".into())));
    }

    #[tokio::test]
    async fn deliver_after_close_is_closed() {
        let (conn, _t, _rx) = make_connection(&options());
        let _ = conn.close(CLOSE_NORMAL, "bye");
        assert_eq!(conn.deliver(Arc::from("x")).await, Err(DeliveryError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_inflight_send_resolves_closed() {
        let opts = ConnectionOptions {
            send_timeout: Duration::from_secs(60),
            ..options()
        };
        let (conn, t, _rx) = make_connection(&opts);
        t.set_behavior(MemoryBehavior::Stall);

        let c = conn.clone();
        let inflight = tokio::spawn(async move { c.deliver(Arc::from("x")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = conn.close(CLOSE_NORMAL, "removed");

        assert_eq!(inflight.await.unwrap(), Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn failure_counters() {
        let (conn, _t, _rx) = make_connection(&options());
        assert_eq!(conn.record_failure(), 1);
        assert_eq!(conn.record_failure(), 2);
        assert_eq!(conn.failures(), 2);
        conn.record_success();
        assert_eq!(conn.consecutive_failures(), 0);
        assert_eq!(conn.failures(), 2);
        assert_eq!(conn.messages_sent(), 1);
    }

    #[tokio::test]
    async fn mark_alive_and_check() {
        let (conn, _t, _rx) = make_connection(&options());
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn writer_sends_pings() {
        let opts = ConnectionOptions {
            ping_interval: Some(Duration::from_secs(1)),
            ..options()
        };
        let (_conn, t, _rx) = make_connection(&opts);
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(t.ping_count() >= 3);
    }

    /// Transport whose close handshake never completes.
    #[derive(Default)]
    struct HungClose {
        close_started: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Transport for HungClose {
        async fn send(&self, _frame: Arc<str>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self, _code: u16, _reason: &str) {
            self.close_started.store(true, std::sync::atomic::Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_close_does_not_pin_the_writer() {
        let (logs, _guard) = capture_logs();
        let transport = Arc::new(HungClose::default());
        let conn = ClientConnection::spawn(
            ConnectionId::from("conn_1"),
            UserId::from("u1"),
            None,
            Arc::clone(&transport) as Arc<dyn Transport>,
            &options(),
        );
        assert!(conn.close(CLOSE_NORMAL, "bye"));

        // The writer task holds the only other reference until it exits.
        for _ in 0..10 {
            if Arc::strong_count(&transport) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(transport.close_started.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(Arc::strong_count(&transport), 1);
        let warning = logs.find(Level::WARN, "transport close timed out").unwrap();
        assert_eq!(warning.field("conn_id"), Some("conn_1"));
    }

    #[tokio::test]
    async fn dropping_connection_closes_transport() {
        let (conn, t, _rx) = make_connection(&options());
        drop(conn);
        for _ in 0..50 {
            if t.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(t.close_frame().map(|(code, _)| code), Some(CLOSE_NORMAL));
    }
}

//! Outbound transport abstraction.
//!
//! A [`Transport`] is the write half of one client session. Each connection
//! has exactly one writer task driving its transport, so implementations only
//! see one in-flight call at a time.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use courier_core::{TransportError, WireEnum};
use futures::SinkExt;
use futures::stream::SplitSink;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server going away (shutdown, heartbeat timeout).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Server-side failure (connection pruned after delivery failures).
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Lifecycle state of a transport as seen by clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    /// Handshake in progress.
    Connecting,
    /// Accepting frames.
    Open,
    /// Close requested, queue draining.
    Closing,
    /// No further frames.
    Closed,
}

impl WireEnum for TransportState {
    fn type_name(&self) -> &'static str {
        "TransportState"
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Open => "Open",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        }
    }
}

/// Write side of a client session.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one serialized envelope.
    async fn send(&self, frame: Arc<str>) -> Result<(), TransportError>;

    /// Send a liveness ping.
    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Close the session. Must be safe to call more than once.
    async fn close(&self, code: u16, reason: &str);
}

// ─────────────────────────────────────────────────────────────────────────────
// axum WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// Transport over the write half of an axum WebSocket.
pub struct WebSocketTransport {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

impl WebSocketTransport {
    /// Wrap the sink half of a split socket.
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: Arc<str>) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(String::from(&*frame).into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self, code: u16, reason: &str) {
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        // The peer may already be gone.
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// How a [`MemoryTransport`] answers sends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryBehavior {
    /// Accept every frame.
    Accept,
    /// Fail every send with this error.
    Fail(TransportError),
    /// Never complete a send (exercises send timeouts).
    Stall,
}

/// In-process transport that hands frames to a channel.
///
/// Used by embedders that bridge to something other than a socket, and by
/// tests to simulate healthy, failing and stalled clients.
pub struct MemoryTransport {
    frames: mpsc::UnboundedSender<Arc<str>>,
    behavior: Mutex<MemoryBehavior>,
    closed: Mutex<Option<(u16, String)>>,
    pings: std::sync::atomic::AtomicU64,
}

impl MemoryTransport {
    /// New transport plus the receiving end of its frames.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<str>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            frames: tx,
            behavior: Mutex::new(MemoryBehavior::Accept),
            closed: Mutex::new(None),
            pings: std::sync::atomic::AtomicU64::new(0),
        });
        (transport, rx)
    }

    /// Change how subsequent sends behave.
    pub fn set_behavior(&self, behavior: MemoryBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Close code and reason, once closed.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.closed.lock().clone()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.lock().is_some()
    }

    /// Pings sent so far.
    pub fn ping_count(&self) -> u64 {
        self.pings.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Arc<str>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let behavior = self.behavior.lock().clone();
        match behavior {
            MemoryBehavior::Accept => self.frames.send(frame).map_err(|_| TransportError::Closed),
            MemoryBehavior::Fail(err) => Err(err),
            MemoryBehavior::Stall => std::future::pending().await,
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let _ = self.pings.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) {
        let mut closed = self.closed.lock();
        if closed.is_none() {
            *closed = Some((code, reason.to_owned()));
        }
    }
}

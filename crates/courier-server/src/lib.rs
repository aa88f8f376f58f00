//! # courier-server
//!
//! Per-user WebSocket event delivery.
//!
//! - Connection registry sharded by user, with replace-on-duplicate semantics
//! - Isolation guard: per-connection tokens and outbound `user_id` rewriting
//! - Dispatcher: bounded per-connection queues, ordered delivery, dead-connection pruning
//! - `ConnectionHub` / `WebSocketManager`: per-`(user, thread)` facades over per-user scopes
//! - axum accept layer with heartbeat, stats, health and Prometheus endpoints
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{DeliveryConfig, HubConfig, ServerConfig};
pub use server::{ApiError, AppState, CourierServer};
pub use shutdown::ShutdownCoordinator;
pub use websocket::dispatcher::{BroadcastReport, DeliveryStats, SendReport, SendStatus};
pub use websocket::manager::{ConnectionHub, ManagerStats, SessionLease, WebSocketManager};
pub use websocket::transport::{MemoryTransport, Transport};

//! WebSocket connection management: registry, isolation, dispatch, facade,
//! heartbeat and the per-client session.

pub mod connection;
pub mod dispatcher;
pub mod heartbeat;
pub mod isolation;
pub mod manager;
pub mod registry;
pub mod session;
pub mod transport;

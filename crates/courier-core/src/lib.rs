//! # courier-core
//!
//! Foundation types shared by every courier crate.
//!
//! - **Branded IDs**: `ConnectionId`, `UserId`, `ThreadId`, `RunId` as newtypes
//! - **User context**: [`UserContext`] carried by every manager facade
//! - **Errors**: [`ManagerError`] taxonomy and per-connection [`DeliveryError`]
//! - **Events**: closed [`EventType`] dispatch table and the wire [`Envelope`]
//! - **Serializer**: total conversion of dynamic payloads into JSON values
//! - **Logging**: `tracing` subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod serializer;

pub use context::UserContext;
pub use errors::{DeliveryError, ManagerError, Result, TransportError};
pub use events::{Envelope, EventType};
pub use ids::{ConnectionId, RunId, ThreadId, UserId};
pub use serializer::{Payload, SerializedPayload, WireEnum};

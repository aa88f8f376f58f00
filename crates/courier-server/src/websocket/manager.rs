//! Manager facade and the connection hub that hands it out.
//!
//! [`ConnectionHub`] is constructed once and injected wherever events are
//! produced or connections accepted. It keys per-user scopes by user id, so
//! there is no process-global manager:
//!
//! - one [`UserScope`] (registry, isolation guard, dispatcher) per user
//! - one [`WebSocketManager`] facade per `(user_id, thread_id)`, shared by
//!   every caller that asks for that pair
//!
//! Lock order is facades, then scopes. Neither map is held across an await.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use courier_core::events::iso_timestamp;
use courier_core::{
    ConnectionId, EventType, ManagerError, Payload, Result, RunId, ThreadId, UserContext, UserId,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::connection::{ClientConnection, ConnectionOptions};
use super::dispatcher::{BroadcastReport, DeliveryStats, Dispatcher, SendReport};
use super::isolation::IsolationGuard;
use super::registry::{ConnectionOwnership, ConnectionRegistry};
use super::transport::{CLOSE_GOING_AWAY, CLOSE_NORMAL, Transport};
use crate::config::{DeliveryConfig, HubConfig};
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_OPENED_TOTAL, ISOLATION_VIOLATIONS_TOTAL};

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

/// Connection and delivery statistics.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ManagerStats {
    /// Registered connections.
    pub total_connections: usize,
    /// Connections still accepting frames.
    pub active_connections: usize,
    /// Connections closing or closed but not yet unregistered.
    pub inactive_connections: usize,
    /// Frames delivered across all connections.
    pub total_messages_sent: u64,
    /// Users with at least one connection.
    pub unique_users: usize,
    /// `total_messages_sent / total_connections`, 0 when empty.
    pub avg_messages_per_connection: f64,
    /// Dispatcher counters.
    pub delivery: DeliveryStats,
    /// When the snapshot was taken.
    pub timestamp: String,
}

impl ManagerStats {
    fn collect(
        connections: &[Arc<ClientConnection>],
        unique_users: usize,
        delivery: DeliveryStats,
    ) -> Self {
        let total = connections.len();
        let active = connections.iter().filter(|c| c.is_active()).count();
        let sent: u64 = connections.iter().map(|c| c.messages_sent()).sum();
        #[allow(clippy::cast_precision_loss)]
        let avg = if total == 0 {
            0.0
        } else {
            sent as f64 / total as f64
        };
        Self {
            total_connections: total,
            active_connections: active,
            inactive_connections: total - active,
            total_messages_sent: sent,
            unique_users,
            avg_messages_per_connection: avg,
            delivery,
            timestamp: iso_timestamp(Utc::now()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scope and ownership
// ─────────────────────────────────────────────────────────────────────────────

/// Registry, isolation guard and dispatcher owned by one user.
pub struct UserScope {
    user_id: UserId,
    registry: Arc<ConnectionRegistry>,
    guard: Arc<IsolationGuard>,
    dispatcher: Dispatcher,
    ownership: Arc<ConnectionOwnership>,
    facades: AtomicUsize,
}

impl UserScope {
    fn new(
        user_id: UserId,
        delivery: &DeliveryConfig,
        ownership: &Arc<ConnectionOwnership>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let guard = Arc::new(IsolationGuard::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&guard), delivery.clone())
            .with_ownership(Arc::clone(ownership));
        Self {
            user_id,
            registry,
            guard,
            dispatcher,
            ownership: Arc::clone(ownership),
            facades: AtomicUsize::new(0),
        }
    }

    fn attach(&self) {
        let _ = self.facades.fetch_add(1, Ordering::AcqRel);
    }

    fn detach(&self) {
        let _ = self
            .facades
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn is_idle(&self) -> bool {
        self.facades.load(Ordering::Acquire) == 0 && self.registry.count() == 0
    }

    /// Remove every connection, closing each with `code`.
    fn close_all(&self, code: u16, reason: &'static str) -> usize {
        let mut closed = 0;
        for conn in self.registry.all() {
            if self.registry.remove_exact(&conn) {
                if let Some(token) = conn.isolation_token() {
                    let _ = self.guard.revoke_token_if(&conn.id, &token);
                }
                self.ownership.release(&conn.id, &conn.user_id);
                let _ = conn.close(code, reason);
                conn.record_closed("shutdown");
                closed += 1;
            }
        }
        closed
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The scope's registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The scope's isolation guard.
    pub fn guard(&self) -> &Arc<IsolationGuard> {
        &self.guard
    }
}

impl std::fmt::Debug for UserScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserScope")
            .field("user_id", &self.user_id)
            .field("connections", &self.registry.count())
            .field("facades", &self.facades.load(Ordering::Relaxed))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionHub
// ─────────────────────────────────────────────────────────────────────────────

type FacadeKey = (UserId, Option<ThreadId>);

/// Factory and owner of every user scope and facade.
pub struct ConnectionHub {
    config: HubConfig,
    options: ConnectionOptions,
    scopes: DashMap<UserId, Arc<UserScope>>,
    facades: DashMap<FacadeKey, Arc<WebSocketManager>>,
    ownership: Arc<ConnectionOwnership>,
    me: Weak<ConnectionHub>,
}

impl ConnectionHub {
    /// Create a hub.
    pub fn new(config: HubConfig) -> Arc<Self> {
        let options = ConnectionOptions::from_delivery(&config.delivery, config.ping_interval);
        Arc::new_cyclic(|me| Self {
            config,
            options,
            scopes: DashMap::new(),
            facades: DashMap::new(),
            ownership: Arc::new(ConnectionOwnership::default()),
            me: me.clone(),
        })
    }

    /// Hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get the facade for a user context.
    ///
    /// Contexts that share `(user_id, thread_id)` get the same facade; the
    /// latest `run_id` is recorded on it. Without a context this fails with
    /// [`ManagerError::MissingUserContext`] unless the hub allows synthetic
    /// contexts.
    pub fn create(&self, context: Option<UserContext>) -> Result<Arc<WebSocketManager>> {
        let context = self.resolve_context(context)?;
        Ok(self.facade_for(context, false))
    }

    /// Validate a connect-time context without creating anything.
    ///
    /// Applies the same rules as [`ConnectionHub::create`]: a missing context
    /// becomes a synthetic one only when the hub allows it, and blank user
    /// ids are refused.
    pub fn resolve_context(&self, context: Option<UserContext>) -> Result<UserContext> {
        let context = match context {
            Some(ctx) => ctx,
            None if self.config.allow_synthetic_context => {
                let ctx = UserContext::synthetic();
                warn!(user_id = %ctx.user_id, "no user context supplied, using a synthetic one");
                ctx
            }
            None => return Err(ManagerError::MissingUserContext),
        };
        if context.user_id.is_blank() {
            return Err(ManagerError::InvalidUserId);
        }
        Ok(context)
    }

    /// Start a client session on the facade for `context`.
    ///
    /// The facade stays registered while any lease is held; dropping the
    /// last one releases it once its thread has no connections left.
    /// Synthetic contexts are refused.
    pub fn open_session(&self, context: UserContext) -> Result<SessionLease> {
        let context = self.resolve_context(Some(context))?;
        if context.synthetic {
            return Err(ManagerError::SyntheticContext);
        }
        Ok(SessionLease {
            manager: self.facade_for(context, true),
        })
    }

    fn facade_for(&self, context: UserContext, session: bool) -> Arc<WebSocketManager> {
        let manager = match self.facades.entry(context.scope_key()) {
            Entry::Occupied(slot) if !slot.get().is_released() => {
                let manager = Arc::clone(slot.get());
                if let Some(run_id) = context.run_id {
                    manager.set_run_id(run_id);
                }
                if session {
                    manager.enter_session();
                }
                return manager;
            }
            Entry::Occupied(mut slot) => {
                // Cleaned up but not yet unlinked.
                slot.get().scope.detach();
                let manager = self.build_facade(context);
                let _ = slot.insert(Arc::clone(&manager));
                manager
            }
            Entry::Vacant(slot) => {
                let manager = self.build_facade(context);
                let _ = slot.insert(Arc::clone(&manager));
                manager
            }
        };
        if session {
            manager.enter_session();
        }
        manager
    }

    /// Called with the facade map entry locked.
    fn build_facade(&self, context: UserContext) -> Arc<WebSocketManager> {
        let scope = {
            let entry = self
                .scopes
                .entry(context.user_id.clone())
                .or_insert_with(|| {
                    Arc::new(UserScope::new(
                        context.user_id.clone(),
                        &self.config.delivery,
                        &self.ownership,
                    ))
                });
            entry.attach();
            Arc::clone(entry.value())
        };
        info!(
            user_id = %context.user_id,
            thread_id = ?context.thread_id.as_deref(),
            synthetic = context.synthetic,
            "manager facade created"
        );
        Arc::new(WebSocketManager {
            run_id: Mutex::new(context.run_id.clone()),
            context,
            scope,
            ownership: Arc::clone(&self.ownership),
            hub: self.me.clone(),
            options: self.options.clone(),
            released: AtomicBool::new(false),
            sessions: AtomicUsize::new(0),
        })
    }

    /// Existing facade for `(user_id, thread_id)`, if any.
    pub fn get(&self, user_id: &UserId, thread_id: Option<&ThreadId>) -> Option<Arc<WebSocketManager>> {
        self.facades
            .get(&(user_id.clone(), thread_id.cloned()))
            .map(|m| Arc::clone(m.value()))
    }

    fn release_facade(&self, manager: &WebSocketManager) {
        self.unlink_facade(manager, false);
    }

    fn end_session(&self, manager: &WebSocketManager) {
        let left = manager
            .sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_or(0, |n| n.saturating_sub(1));
        if left == 0 {
            self.unlink_facade(manager, true);
        }
    }

    /// With `only_if_idle`, a facade that still has sessions or thread
    /// connections stays registered.
    fn unlink_facade(&self, manager: &WebSocketManager, only_if_idle: bool) {
        let key = manager.context.scope_key();
        let removed = self
            .facades
            .remove_if(&key, |_, m| {
                std::ptr::eq(Arc::as_ptr(m), manager) && (!only_if_idle || m.is_idle())
            })
            .is_some();
        if removed {
            manager.released.store(true, Ordering::Release);
            manager.scope.detach();
        }
        let dropped = self
            .scopes
            .remove_if(manager.user_id(), |_, s| Arc::ptr_eq(s, &manager.scope) && s.is_idle())
            .is_some();
        debug!(user_id = %manager.user_id(), removed, scope_dropped = dropped, "manager facade released");
    }

    fn scope(&self, user_id: &UserId) -> Option<Arc<UserScope>> {
        self.scopes.get(user_id).map(|s| Arc::clone(s.value()))
    }

    fn scope_snapshot(&self) -> Vec<Arc<UserScope>> {
        self.scopes.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Emit an event to a user (the agent engine's entry point).
    pub async fn emit(
        &self,
        user_id: &UserId,
        event_type: EventType,
        data: Payload,
    ) -> Result<SendReport> {
        self.emit_in_thread(user_id, None, event_type, data).await
    }

    /// Emit an event to a user, tagging the payload with a thread.
    pub async fn emit_in_thread(
        &self,
        user_id: &UserId,
        thread_id: Option<&ThreadId>,
        event_type: EventType,
        data: Payload,
    ) -> Result<SendReport> {
        if user_id.is_blank() {
            return Err(ManagerError::InvalidUserId);
        }
        match self.scope(user_id) {
            Some(scope) => {
                scope
                    .dispatcher
                    .emit_critical_event(user_id, thread_id, event_type, &data)
                    .await
            }
            None => {
                debug!(user_id = %user_id, event_type = %event_type, "no scope for user, event dropped");
                Ok(SendReport::no_connections())
            }
        }
    }

    /// Send an event to every connected user.
    ///
    /// Users are served concurrently and a failure for one never affects
    /// another.
    pub async fn broadcast(&self, event: &Payload) -> BroadcastReport {
        let scopes = self.scope_snapshot();
        let reports = join_all(scopes.iter().map(|s| s.dispatcher.broadcast(event))).await;
        let mut total = BroadcastReport::default();
        for report in &reports {
            total.merge(report);
        }
        info!(users = total.users, delivered = total.delivered, failed = total.failed, "hub broadcast");
        total
    }

    /// Aggregate statistics across every scope.
    pub fn stats(&self) -> ManagerStats {
        let scopes = self.scope_snapshot();
        let mut connections = Vec::new();
        let mut delivery = DeliveryStats::default();
        let mut users = 0;
        for scope in &scopes {
            connections.extend(scope.registry.all());
            users += scope.registry.user_count();
            delivery.merge(&scope.dispatcher.stats());
        }
        ManagerStats::collect(&connections, users, delivery)
    }

    /// Registered connections across all users.
    pub fn connection_count(&self) -> usize {
        self.scopes.iter().map(|s| s.registry.count()).sum()
    }

    /// Users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.scopes.iter().filter(|s| s.registry.count() > 0).count()
    }

    /// Live facades.
    pub fn facade_count(&self) -> usize {
        self.facades.len()
    }

    /// Close every connection (code 1001) and forget all scopes and facades.
    ///
    /// Returns the number of connections closed.
    pub fn shutdown(&self) -> usize {
        for facade in &self.facades {
            facade.released.store(true, Ordering::Release);
        }
        let closed: usize = self
            .scope_snapshot()
            .iter()
            .map(|s| s.close_all(CLOSE_GOING_AWAY, "server shutting down"))
            .sum();
        self.facades.clear();
        self.scopes.clear();
        self.ownership.clear();
        info!(closed, "connection hub shut down");
        closed
    }
}

impl std::fmt::Debug for ConnectionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHub")
            .field("scopes", &self.scopes.len())
            .field("facades", &self.facades.len())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocketManager
// ─────────────────────────────────────────────────────────────────────────────

/// Per-`(user_id, thread_id)` facade over the user's scope.
///
/// Obtained only from [`ConnectionHub::create`].
pub struct WebSocketManager {
    context: UserContext,
    run_id: Mutex<Option<RunId>>,
    scope: Arc<UserScope>,
    ownership: Arc<ConnectionOwnership>,
    hub: Weak<ConnectionHub>,
    options: ConnectionOptions,
    released: AtomicBool,
    sessions: AtomicUsize,
}

impl WebSocketManager {
    /// User this facade is scoped to.
    pub fn user_id(&self) -> &UserId {
        &self.context.user_id
    }

    /// Thread this facade is scoped to.
    pub fn thread_id(&self) -> Option<&ThreadId> {
        self.context.thread_id.as_ref()
    }

    /// Latest run id seen for this facade.
    pub fn run_id(&self) -> Option<RunId> {
        self.run_id.lock().clone()
    }

    fn set_run_id(&self, run_id: RunId) {
        *self.run_id.lock() = Some(run_id);
    }

    /// The context the facade was created from.
    pub fn context(&self) -> &UserContext {
        &self.context
    }

    /// Whether the facade was built from a fabricated context.
    pub fn is_synthetic(&self) -> bool {
        self.context.synthetic
    }

    /// Refuse synthetic facades on production code paths.
    pub fn require_production(&self) -> Result<()> {
        if self.is_synthetic() {
            return Err(ManagerError::SyntheticContext);
        }
        Ok(())
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn enter_session(&self) {
        let _ = self.sessions.fetch_add(1, Ordering::AcqRel);
    }

    /// No sessions attached and no connections on this facade's thread.
    fn is_idle(&self) -> bool {
        self.sessions.load(Ordering::Acquire) == 0
            && !self
                .connections()
                .iter()
                .any(|c| c.thread_id.as_ref() == self.thread_id())
    }

    /// The user scope shared by this user's facades.
    pub fn scope(&self) -> &Arc<UserScope> {
        &self.scope
    }

    /// Register a connection and issue its isolation token.
    ///
    /// Re-adding an id this user already owns replaces (and closes) the old
    /// connection.
    pub fn add_connection(&self, connection: Arc<ClientConnection>) -> Result<()> {
        if self.is_released() {
            return Err(ManagerError::InvalidConnection(
                "manager facade was cleaned up".into(),
            ));
        }
        if connection.id.is_blank() {
            return Err(ManagerError::InvalidConnection("connection id is empty".into()));
        }
        if connection.user_id != *self.user_id() {
            return Err(ManagerError::InvalidConnection(format!(
                "connection {} belongs to user {}, not {}",
                connection.id,
                connection.user_id,
                self.user_id()
            )));
        }

        let registry = &self.scope.registry;
        let guard = &self.scope.guard;
        self.ownership.claim(&connection.id, &connection.user_id, registry)?;

        let replacing = registry.get(&connection.id);
        if let Some(existing) = &replacing {
            if Arc::ptr_eq(existing, &connection) {
                return Ok(());
            }
            if let Some(token) = existing.isolation_token() {
                let _ = guard.revoke_token_if(&existing.id, &token);
            }
        }

        let token = match guard.issue_token(&connection.id) {
            Ok(token) => token,
            Err(e) => {
                if replacing.is_none() {
                    self.ownership.release(&connection.id, &connection.user_id);
                }
                return Err(e);
            }
        };
        connection.attach_token(token.clone());

        match registry.add(Arc::clone(&connection)) {
            Ok(Some(old)) => {
                let _ = old.close(CLOSE_NORMAL, "replaced");
                old.record_closed("replaced");
                debug!(conn_id = %connection.id, "replaced existing connection");
            }
            Ok(None) => {}
            Err(e) => {
                let _ = guard.revoke_token_if(&connection.id, &token);
                self.ownership.release(&connection.id, &connection.user_id);
                return Err(e);
            }
        }

        counter!(CONNECTIONS_OPENED_TOTAL).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        info!(
            conn_id = %connection.id,
            user_id = %connection.user_id,
            thread_id = ?connection.thread_id.as_deref(),
            "connection added"
        );
        Ok(())
    }

    /// Create a connection over `transport` with a fresh id and register it.
    ///
    /// Without an explicit thread the facade's thread is used.
    pub fn open_connection(
        &self,
        thread_id: Option<ThreadId>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<ClientConnection>> {
        let connection = ClientConnection::spawn(
            ConnectionId::new(),
            self.user_id().clone(),
            thread_id.or_else(|| self.context.thread_id.clone()),
            transport,
            &self.options,
        );
        if let Err(e) = self.add_connection(Arc::clone(&connection)) {
            let _ = connection.close(CLOSE_NORMAL, "rejected");
            return Err(e);
        }
        Ok(connection)
    }

    /// Remove a connection and close its transport (code 1000).
    ///
    /// Idempotent; returns whether this call removed it.
    pub fn remove_connection(&self, connection_id: &str) -> bool {
        self.close_connection(connection_id, CLOSE_NORMAL, "connection removed", "removed")
    }

    pub(crate) fn close_connection(
        &self,
        connection_id: &str,
        code: u16,
        reason: &str,
        label: &'static str,
    ) -> bool {
        let Some(connection) = self.scope.registry.get(connection_id) else {
            return false;
        };
        if !self.scope.registry.remove_exact(&connection) {
            return false;
        }
        if let Some(token) = connection.isolation_token() {
            let _ = self.scope.guard.revoke_token_if(&connection.id, &token);
        }
        self.ownership.release(&connection.id, &connection.user_id);
        let _ = connection.close(code, reason);
        connection.record_closed(label);
        info!(conn_id = connection_id, user_id = %connection.user_id, code, "connection removed");
        true
    }

    /// This user's live connections, in registration order.
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.scope.registry.list_for_user(self.user_id())
    }

    fn refuse_foreign(&self, target: &UserId) -> Option<Result<SendReport>> {
        if target.is_blank() {
            return Some(Err(ManagerError::InvalidUserId));
        }
        if target != self.user_id() {
            counter!(ISOLATION_VIOLATIONS_TOTAL).increment(1);
            warn!(
                facade_user = %self.user_id(),
                target_user = %target,
                "send to a user outside this facade's scope refused"
            );
            return Some(Ok(SendReport::no_connections()));
        }
        None
    }

    /// Send an event to this facade's user.
    ///
    /// A facade only reaches its own user; any other target reports
    /// `NoConnections`.
    pub async fn send_to_user(&self, user_id: &UserId, event: &Payload) -> Result<SendReport> {
        if let Some(refused) = self.refuse_foreign(user_id) {
            return refused;
        }
        self.scope.dispatcher.send_to_user(user_id, event).await
    }

    /// Send an event to every connection in this facade's scope.
    pub async fn broadcast(&self, event: &Payload) -> BroadcastReport {
        self.scope.dispatcher.broadcast(event).await
    }

    /// Wrap `data` in the standard envelope and send it.
    pub async fn emit_critical_event(
        &self,
        user_id: &UserId,
        thread_id: Option<&ThreadId>,
        event_type: EventType,
        data: Payload,
    ) -> Result<SendReport> {
        if let Some(refused) = self.refuse_foreign(user_id) {
            return refused;
        }
        self.scope
            .dispatcher
            .emit_critical_event(user_id, thread_id, event_type, &data)
            .await
    }

    /// Emit an event to this facade's user and thread.
    pub async fn emit(&self, event_type: EventType, data: Payload) -> Result<SendReport> {
        self.emit_critical_event(self.user_id(), self.thread_id(), event_type, data)
            .await
    }

    /// Statistics for this facade's scope.
    pub fn stats(&self) -> ManagerStats {
        ManagerStats::collect(
            &self.scope.registry.all(),
            self.scope.registry.user_count(),
            self.scope.dispatcher.stats(),
        )
    }

    /// Close this thread's connections and drop the facade from the hub.
    ///
    /// The user scope goes away with its last facade and connection. Returns
    /// the number of connections closed.
    pub fn cleanup(&self) -> usize {
        if self.released.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let closed = self
            .connections()
            .into_iter()
            .filter(|c| c.thread_id.as_ref() == self.thread_id())
            .filter(|c| self.remove_connection(&c.id))
            .count();
        if let Some(hub) = self.hub.upgrade() {
            hub.release_facade(self);
        }
        info!(user_id = %self.user_id(), thread_id = ?self.thread_id().map(ThreadId::as_str), closed, "manager facade cleaned up");
        closed
    }
}

impl std::fmt::Debug for WebSocketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketManager")
            .field("user_id", self.user_id())
            .field("thread_id", &self.thread_id())
            .field("synthetic", &self.is_synthetic())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionLease
// ─────────────────────────────────────────────────────────────────────────────

/// A client session's hold on its facade, from [`ConnectionHub::open_session`].
pub struct SessionLease {
    manager: Arc<WebSocketManager>,
}

impl SessionLease {
    /// The facade this session runs on.
    pub fn manager(&self) -> &Arc<WebSocketManager> {
        &self.manager
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(hub) = self.manager.hub.upgrade() {
            hub.end_session(&self.manager);
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionLease").field(&self.manager).finish()
    }
}

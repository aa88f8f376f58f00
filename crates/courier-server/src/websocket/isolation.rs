//! Per-connection isolation tokens and outbound `user_id` rewriting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use courier_core::{ConnectionId, ManagerError, Result, UserId};
use dashmap::{DashMap, DashSet};
use dashmap::mapref::entry::Entry;
use metrics::counter;
use rand::RngCore;
use serde_json::Value;
use tracing::{debug, warn};

use crate::metrics::ISOLATION_REWRITES_TOTAL;

/// Bytes of entropy in a token.
const TOKEN_BYTES: usize = 32;

/// Marker added to payloads that had a foreign `user_id` rewritten.
pub const SANITIZED_MARKER: &str = "isolation_sanitized";

/// Unguessable per-connection secret.
///
/// Never serialized and redacted from `Debug`/`Display`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IsolationToken(String);

impl IsolationToken {
    fn generate() -> Self {
        let mut bytes = [0_u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Encoded length, for diagnostics.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for generated tokens.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for IsolationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IsolationToken(<redacted>)")
    }
}

impl fmt::Display for IsolationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Result of [`IsolationGuard::sanitize`].
#[derive(Clone, Debug, PartialEq)]
pub struct Sanitized {
    /// Event safe to send to the target user.
    pub event: Value,
    /// Number of `user_id` / `userId` fields that were overwritten.
    pub rewritten: usize,
}

/// Token issuance and outbound sanitization for one user scope.
#[derive(Default)]
pub struct IsolationGuard {
    tokens: DashMap<ConnectionId, IsolationToken>,
    live: DashSet<IsolationToken>,
    sanitized: AtomicU64,
}

impl IsolationGuard {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token for a connection.
    ///
    /// Collisions are checked against this guard's live tokens only; other
    /// users' guards rely on the 256-bit space.
    pub fn issue_token(&self, connection_id: &ConnectionId) -> Result<IsolationToken> {
        match self.tokens.entry(connection_id.clone()) {
            Entry::Occupied(_) => Err(ManagerError::DuplicateConnection(connection_id.clone())),
            Entry::Vacant(slot) => {
                let token = loop {
                    let candidate = IsolationToken::generate();
                    if self.live.insert(candidate.clone()) {
                        break candidate;
                    }
                    warn!(conn_id = %connection_id, "isolation token collision, regenerating");
                };
                let _ = slot.insert(token.clone());
                debug!(conn_id = %connection_id, "isolation token issued");
                Ok(token)
            }
        }
    }

    /// Revoke a connection's token. No-op when none was issued.
    pub fn revoke_token(&self, connection_id: &str) {
        if let Some((_, token)) = self.tokens.remove(connection_id) {
            let _ = self.live.remove(&token);
            debug!(conn_id = connection_id, "isolation token revoked");
        }
    }

    /// Revoke only if `token` is still the one issued for `connection_id`.
    ///
    /// Used when a connection may have been replaced under the same id.
    pub fn revoke_token_if(&self, connection_id: &str, token: &IsolationToken) -> bool {
        let removed = self.tokens.remove_if(connection_id, |_, issued| issued == token);
        match removed {
            Some((_, token)) => {
                let _ = self.live.remove(&token);
                debug!(conn_id = connection_id, "isolation token revoked");
                true
            }
            None => false,
        }
    }

    /// Whether `token` is the one issued for `connection_id`.
    pub fn verify(&self, connection_id: &str, token: &IsolationToken) -> bool {
        self.tokens
            .get(connection_id)
            .is_some_and(|issued| *issued == *token)
    }

    /// Tokens currently issued.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Events that needed at least one rewrite.
    pub fn sanitized_count(&self) -> u64 {
        self.sanitized.load(Ordering::Relaxed)
    }

    /// Copy `event` with every foreign `user_id` / `userId` replaced by
    /// `target`.
    ///
    /// When anything was rewritten, `isolation_sanitized: true` is set on the
    /// payload object (or the top level when there is none).
    pub fn sanitize(&self, event: &Value, target: &UserId) -> Sanitized {
        let mut copy = event.clone();
        let rewritten = rewrite_user_ids(&mut copy, target.as_str());
        if rewritten > 0 {
            mark(&mut copy);
            let _ = self.sanitized.fetch_add(1, Ordering::Relaxed);
            counter!(ISOLATION_REWRITES_TOTAL).increment(rewritten as u64);
            warn!(
                user_id = %target,
                rewritten,
                "outbound event carried a foreign user id, rewritten"
            );
        }
        Sanitized {
            event: copy,
            rewritten,
        }
    }
}

impl fmt::Debug for IsolationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationGuard")
            .field("tokens", &self.tokens.len())
            .field("sanitized", &self.sanitized_count())
            .finish()
    }
}

fn rewrite_user_ids(value: &mut Value, target: &str) -> usize {
    match value {
        Value::Object(map) => {
            let mut count = 0;
            for (key, field) in map.iter_mut() {
                if key == "user_id" || key == "userId" {
                    if field.as_str() != Some(target) {
                        *field = Value::from(target);
                        count += 1;
                    }
                } else {
                    count += rewrite_user_ids(field, target);
                }
            }
            count
        }
        Value::Array(items) => items.iter_mut().map(|v| rewrite_user_ids(v, target)).sum(),
        _ => 0,
    }
}

fn mark(event: &mut Value) {
    let Value::Object(top) = event else { return };
    if let Some(Value::Object(payload)) = top.get_mut("payload") {
        let _ = payload.insert(SANITIZED_MARKER.into(), Value::Bool(true));
    } else {
        let _ = top.insert(SANITIZED_MARKER.into(), Value::Bool(true));
    }
}

//! User context attached to every manager facade.

use serde::{Deserialize, Serialize};

use crate::ids::{RunId, ThreadId, UserId};

/// Identity a facade is scoped to.
///
/// `synthetic` marks contexts fabricated in test/diagnostic mode; production
/// code paths refuse facades built from them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    /// Owning user.
    pub user_id: UserId,
    /// Conversation thread, if the caller is thread-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    /// Request / agent run identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// Fabricated context (never set by request handling).
    #[serde(default)]
    pub synthetic: bool,
}

impl UserContext {
    /// Context for a user with no thread or run.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: None,
            run_id: None,
            synthetic: false,
        }
    }

    /// Attach a thread.
    #[must_use]
    pub fn with_thread(mut self, thread_id: impl Into<ThreadId>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Attach a run.
    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Throwaway context for tests and diagnostics.
    #[must_use]
    pub fn synthetic() -> Self {
        Self {
            user_id: UserId::from(format!("synthetic-{}", uuid::Uuid::now_v7())),
            thread_id: None,
            run_id: Some(RunId::new()),
            synthetic: true,
        }
    }

    /// The `(user_id, thread_id)` pair that identifies a facade instance.
    #[must_use]
    pub fn scope_key(&self) -> (UserId, Option<ThreadId>) {
        (self.user_id.clone(), self.thread_id.clone())
    }
}

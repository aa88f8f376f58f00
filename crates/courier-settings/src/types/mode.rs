//! Manager operating mode.
//!
//! Older deployments configured one of several manager "modes". They all
//! resolve to the same behavior now, so every accepted spelling normalizes to
//! [`ManagerMode::Unified`] here and nothing downstream branches on mode.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::SettingsError;

/// Operating mode of the connection manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ManagerMode {
    /// Per-user isolated registry with the full delivery pipeline.
    #[default]
    Unified,
}

impl ManagerMode {
    /// Accepted spellings, case-insensitive.
    pub const ACCEPTED: [&'static str; 4] = ["unified", "isolated", "emergency", "degraded"];

    /// Normalize a configured mode name.
    pub fn normalize(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        Self::ACCEPTED
            .contains(&lowered.as_str())
            .then_some(Self::Unified)
    }

    /// Canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unified => "unified",
        }
    }
}

impl fmt::Display for ManagerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ManagerMode {
    type Error = SettingsError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::normalize(&raw).ok_or_else(|| {
            SettingsError::InvalidValue(format!(
                "unknown manager mode '{raw}' (expected one of {:?})",
                Self::ACCEPTED
            ))
        })
    }
}

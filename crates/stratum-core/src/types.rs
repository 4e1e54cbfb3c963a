//! Common types used across Stratum.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StratumError;

/// Run mode of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Create or update declared resources (default).
    #[default]
    Up,
    /// Tear down every resource in the scope.
    Destroy,
    /// Fetch and verify only; nothing is mutated or persisted.
    Read,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Up => "up",
            Phase::Destroy => "destroy",
            Phase::Read => "read",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Phase::Up),
            "destroy" => Ok(Phase::Destroy),
            "read" => Ok(Phase::Read),
            other => Err(StratumError::Config(format!(
                "phase must be 'up', 'destroy' or 'read', got: {other}"
            ))),
        }
    }
}

/// The transition a handler is asked to perform for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Create,
    Update,
    Delete,
    Read,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecyclePhase::Create => "create",
            LifecyclePhase::Update => "update",
            LifecyclePhase::Delete => "delete",
            LifecyclePhase::Read => "read",
        };
        f.write_str(s)
    }
}

/// Status of a resource record.
///
/// `Creating`, `Updating` and `Deleting` only ever exist in memory while a
/// handler is running; persisted records are `Created`, `Updated` or
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Creating,
    Created,
    Updating,
    Updated,
    Deleting,
    Deleted,
    Failed,
}

impl ResourceStatus {
    /// Returns true if a handler is currently running for the resource.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ResourceStatus::Creating | ResourceStatus::Updating | ResourceStatus::Deleting
        )
    }

    /// Returns true if the record must be retried on the next pass.
    pub fn needs_retry(&self) -> bool {
        matches!(self, ResourceStatus::Failed) || self.is_in_flight()
    }

    /// The in-flight status for a lifecycle phase.
    pub fn in_flight_for(phase: LifecyclePhase) -> Option<Self> {
        match phase {
            LifecyclePhase::Create => Some(ResourceStatus::Creating),
            LifecyclePhase::Update => Some(ResourceStatus::Updating),
            LifecyclePhase::Delete => Some(ResourceStatus::Deleting),
            LifecyclePhase::Read => None,
        }
    }
}

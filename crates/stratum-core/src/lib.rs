//! # Stratum Core
//!
//! Core primitives shared by every Stratum crate.
//!
//! This crate provides the fundamental building blocks:
//! - [`StratumError`] - Engine error taxonomy
//! - [`Phase`] / [`LifecyclePhase`] - Run modes and per-resource transitions
//! - [`ResourceRecord`] - The persisted unit of state
//! - [`PendingDeletion`] - A replaced resource awaiting teardown
//! - [`fqn`] - Fully-qualified name and key layout helpers

pub mod error;
pub mod fqn;
pub mod record;
pub mod types;

// Re-exports for convenience
pub use error::{DeletionFailure, Result, StratumError};
pub use record::{PendingDeletion, ResourceRecord};
pub use types::*;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::error::{DeletionFailure, Result, StratumError};
    pub use crate::record::{PendingDeletion, ResourceRecord};
    pub use crate::types::{LifecyclePhase, Phase, ResourceStatus};
}

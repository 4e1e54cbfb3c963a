//! # Stratum Engine
//!
//! Scope reconciliation and resource lifecycle engine.
//!
//! A program declares resources inside [`Scope`]s. Each declaration is
//! compared with the record in the state store and routed to the
//! resource's [`Handler`] as a create, update or read. When a scope is
//! finalized, anything it recorded but did not declare this time, and any
//! replaced incarnation queued for deletion, is torn down in reverse
//! dependency order.
//!
//! - [`App`] - Root scope bound to a store, codec and planner
//! - [`Scope`] - Declaration namespace with ambient-scope tracking
//! - [`ResourceKind`] / [`Handler`] - The provider contract
//! - [`AppConfig`] - Environment and file configuration

pub mod app;
pub mod config;
pub mod finalize;
mod lifecycle;
pub mod registry;
pub mod resource;
pub mod scope;

pub use app::{App, AppBuilder};
pub use config::{AppConfig, StateBackend};
pub use finalize::FinalizeReport;
pub use registry::Registry;
pub use resource::{
    Context, Handler, LifecycleSignal, Resource, ResourceKind, ResourceOptions,
};
pub use scope::{RunOptions, Scope};

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::app::{App, AppBuilder};
    pub use crate::config::{AppConfig, StateBackend};
    pub use crate::finalize::FinalizeReport;
    pub use crate::resource::{
        Context, Handler, LifecycleSignal, Resource, ResourceKind, ResourceOptions,
    };
    pub use crate::scope::{RunOptions, Scope};
    pub use stratum_core::prelude::*;
    pub use stratum_value::{Secret, Value};
}

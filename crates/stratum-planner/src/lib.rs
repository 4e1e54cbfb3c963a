//! # Stratum Planner
//!
//! Orders deletions so that every resource is torn down before the
//! resources it depends on.

pub mod planner;
pub mod reverse;

pub use planner::{CandidateOrigin, DeletionCandidate, DeletionPlan, Planner, PlannerConfig};
pub use reverse::ReverseDependencyPlanner;

//! Planner trait and configuration.

use serde::{Deserialize, Serialize};
use stratum_core::{PendingDeletion, ResourceRecord};

/// Configuration for the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Maximum number of delete handlers running at once within a level.
    pub max_concurrent_deletions: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deletions: 8,
        }
    }
}

/// Why a resource is up for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    /// Stored in state but not declared by the last run.
    Orphan,
    /// Old incarnation of a replaced resource.
    Pending,
    /// Torn down by an explicit destroy.
    Destroy,
}

/// One resource to delete, in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionCandidate {
    /// Fully-qualified name.
    pub fqn: String,

    /// Resource type tag used to find the delete handler.
    pub type_name: String,

    /// Canonical props of the incarnation being deleted.
    pub props: serde_json::Value,

    /// Canonical output of the incarnation being deleted.
    pub output: serde_json::Value,

    /// FQNs this resource depends on.
    pub depends_on: Vec<String>,

    pub origin: CandidateOrigin,
}

impl DeletionCandidate {
    pub fn from_record(fqn: &str, record: &ResourceRecord, origin: CandidateOrigin) -> Self {
        Self {
            fqn: fqn.to_string(),
            type_name: record.type_name.clone(),
            props: record.props.clone(),
            output: record.output.clone(),
            depends_on: record.depends_on.clone(),
            origin,
        }
    }

    pub fn from_pending(entry: &PendingDeletion) -> Self {
        Self {
            fqn: entry.fqn.clone(),
            type_name: entry.type_name.clone(),
            props: entry.props.clone(),
            output: entry.output.clone(),
            depends_on: entry.depends_on.clone(),
            origin: CandidateOrigin::Pending,
        }
    }
}

/// An ordered deletion plan.
///
/// Candidates in `levels[0]` run first; all members of one level may run
/// concurrently. A candidate is only deleted once every candidate listed in
/// its [`blocked_by`](DeletionPlan::blocked_by) set has been deleted.
#[derive(Debug, Clone, Default)]
pub struct DeletionPlan {
    /// All candidates, indexed by position.
    pub candidates: Vec<DeletionCandidate>,

    /// Candidate indices grouped into execution levels.
    pub levels: Vec<Vec<usize>>,

    /// Candidate indices that were caught in a dependency cycle.
    pub cyclic: Vec<usize>,

    pub(crate) blockers: Vec<Vec<usize>>,
}

impl DeletionPlan {
    /// Consumers in earlier levels whose deletion must succeed first.
    pub fn blocked_by(&self, index: usize) -> &[usize] {
        self.blockers.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidates in execution order.
    pub fn ordered(&self) -> impl Iterator<Item = &DeletionCandidate> {
        self.levels
            .iter()
            .flatten()
            .filter_map(|&i| self.candidates.get(i))
    }
}

/// Trait for deletion planners.
pub trait Planner: Send + Sync {
    /// Order `candidates` for deletion.
    fn plan(&self, candidates: Vec<DeletionCandidate>) -> DeletionPlan;

    /// Get the planner configuration.
    fn config(&self) -> &PlannerConfig;
}

//! Reverse-dependency level planner.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::planner::{DeletionCandidate, DeletionPlan, Planner, PlannerConfig};

/// Deletes consumers before producers.
///
/// Candidates are grouped into levels with Kahn's algorithm over the
/// consumer -> producer edges: a level holds every candidate none of whose
/// remaining consumers are still pending. Candidates left over by a cycle
/// all go into one final level.
#[derive(Debug, Clone, Default)]
pub struct ReverseDependencyPlanner {
    config: PlannerConfig,
}

impl ReverseDependencyPlanner {
    /// Create a planner with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a planner with custom configuration.
    pub fn with_config(config: PlannerConfig) -> Self {
        Self { config }
    }
}

impl Planner for ReverseDependencyPlanner {
    fn plan(&self, candidates: Vec<DeletionCandidate>) -> DeletionPlan {
        let n = candidates.len();

        let mut by_fqn: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, c) in candidates.iter().enumerate() {
            by_fqn.entry(c.fqn.as_str()).or_default().push(i);
        }

        // consumers[p] = candidates that depend on p.
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut producers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, c) in candidates.iter().enumerate() {
            for dep in &c.depends_on {
                if *dep == c.fqn {
                    continue;
                }
                for &p in by_fqn.get(dep.as_str()).into_iter().flatten() {
                    if !consumers[p].contains(&i) {
                        consumers[p].push(i);
                        producers[i].push(p);
                    }
                }
            }
        }

        let mut remaining: Vec<usize> = consumers.iter().map(Vec::len).collect();
        let mut level_of: Vec<Option<usize>> = vec![None; n];
        let mut levels: Vec<Vec<usize>> = Vec::new();

        let mut ready: Vec<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        while !ready.is_empty() {
            ready.sort_by(|&a, &b| candidates[a].fqn.cmp(&candidates[b].fqn).then(a.cmp(&b)));
            let depth = levels.len();
            let mut next = Vec::new();
            for &i in &ready {
                level_of[i] = Some(depth);
                for &p in &producers[i] {
                    remaining[p] -= 1;
                    if remaining[p] == 0 {
                        next.push(p);
                    }
                }
            }
            levels.push(std::mem::take(&mut ready));
            ready = next;
        }

        let mut cyclic: Vec<usize> = (0..n).filter(|&i| level_of[i].is_none()).collect();
        if !cyclic.is_empty() {
            cyclic.sort_by(|&a, &b| candidates[a].fqn.cmp(&candidates[b].fqn).then(a.cmp(&b)));
            let names: Vec<&str> = cyclic.iter().map(|&i| candidates[i].fqn.as_str()).collect();
            warn!(resources = ?names, "Dependency cycle among deletions; deleting together");
            let depth = levels.len();
            for &i in &cyclic {
                level_of[i] = Some(depth);
            }
            levels.push(cyclic.clone());
        }

        let blockers = consumers
            .iter()
            .enumerate()
            .map(|(p, cs)| {
                cs.iter()
                    .copied()
                    .filter(|&c| level_of[c] < level_of[p])
                    .collect()
            })
            .collect();

        debug!(candidates = n, levels = levels.len(), "Planned deletions");

        DeletionPlan {
            candidates,
            levels,
            cyclic,
            blockers,
        }
    }

    fn config(&self) -> &PlannerConfig {
        &self.config
    }
}

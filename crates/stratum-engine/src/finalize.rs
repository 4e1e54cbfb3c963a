//! Finalize and destroy: deleting what the program no longer declares.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use stratum_core::fqn::{self, StoredKey};
use stratum_core::{
    DeletionFailure, LifecyclePhase, PendingDeletion, Phase, ResourceStatus, Result, StratumError,
};
use stratum_planner::{CandidateOrigin, DeletionCandidate};
use tracing::{debug, info, warn};

use crate::lifecycle::unexpected;
use crate::resource::LifecycleSignal;
use crate::scope::Scope;

/// Result of a successful finalize or destroy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    /// FQNs deleted, including those in nested scopes.
    pub deleted: Vec<String>,

    /// True when nothing was reconciled (read phase).
    pub skipped: bool,
}

#[derive(Default)]
struct Sweep {
    deleted: Vec<String>,
    failures: Vec<DeletionFailure>,
}

impl Sweep {
    fn fail(&mut self, fqn: &str, message: impl Into<String>) {
        self.failures.push(DeletionFailure {
            fqn: fqn.to_string(),
            message: message.into(),
        });
    }

    /// Fold in the outcome of a nested finalize or destroy.
    fn absorb(&mut self, scope: &str, result: Result<FinalizeReport>) {
        match result {
            Ok(report) => self.deleted.extend(report.deleted),
            Err(StratumError::FinalizeFailed { failures, .. }) => self.failures.extend(failures),
            Err(e) => self.fail(scope, e.to_string()),
        }
    }

    fn finish(self, scope: &Scope) -> Result<FinalizeReport> {
        if self.failures.is_empty() {
            scope.state().finalized = true;
            info!(scope = %scope.fqn(), deleted = self.deleted.len(), "Finalized scope");
            Ok(FinalizeReport {
                deleted: self.deleted,
                skipped: false,
            })
        } else {
            warn!(
                scope = %scope.fqn(),
                failed = self.failures.len(),
                "Finalize left resources behind; they will be retried"
            );
            Err(StratumError::FinalizeFailed {
                scope: scope.fqn().to_string(),
                failures: self.failures,
            })
        }
    }
}

/// What a scope's stored keys contain.
#[derive(Default)]
struct Stored {
    resources: BTreeSet<String>,
    nested: BTreeSet<String>,
    scope_data: Vec<String>,
}

fn finalize_boxed(scope: &Scope) -> BoxFuture<'_, Result<FinalizeReport>> {
    Box::pin(scope.finalize())
}

fn destroy_boxed(scope: &Scope) -> BoxFuture<'_, Result<FinalizeReport>> {
    Box::pin(scope.destroy())
}

impl Scope {
    /// Delete everything recorded in this scope that the current pass did
    /// not declare, plus replaced resources awaiting deletion.
    ///
    /// Child scopes are finalized first. A failed deletion does not stop
    /// independent deletions; it is reported through
    /// [`StratumError::FinalizeFailed`] and retried by the next finalize.
    /// In the destroy phase this is [`Scope::destroy`]; in the read phase
    /// it does nothing.
    pub async fn finalize(&self) -> Result<FinalizeReport> {
        match self.phase() {
            Phase::Read => {
                self.seal();
                debug!(scope = %self.fqn(), "Read phase; nothing to finalize");
                return Ok(FinalizeReport {
                    deleted: Vec::new(),
                    skipped: true,
                });
            }
            Phase::Destroy => return self.destroy().await,
            Phase::Up => {}
        }
        self.seal();

        let mut sweep = Sweep::default();
        for child in self.children() {
            sweep.absorb(child.fqn(), finalize_boxed(&child).await);
        }

        let stored = self.stored().await?;
        let (declared, entered, retained) = {
            let state = self.state();
            (
                state.declared.iter().cloned().collect::<BTreeSet<_>>(),
                state.children.keys().cloned().collect::<BTreeSet<_>>(),
                state.retained.clone(),
            )
        };

        for name in &stored.nested {
            if entered.contains(name) || retained.contains(name) {
                continue;
            }
            info!(scope = %self.fqn(), nested = %name, "Destroying orphaned nested scope");
            let orphan = Scope::detached(self, name, Phase::Destroy);
            sweep.absorb(orphan.fqn(), destroy_boxed(&orphan).await);
        }

        let mut candidates = Vec::new();
        for id in stored.resources.difference(&declared) {
            let fqn = fqn::child(self.fqn(), id);
            match self.load_record(&fqn).await {
                Ok(Some(record)) => candidates.push(DeletionCandidate::from_record(
                    &fqn,
                    &record,
                    CandidateOrigin::Orphan,
                )),
                Ok(None) => {}
                Err(e) => sweep.fail(&fqn, e.to_string()),
            }
        }
        if !candidates.is_empty() {
            info!(scope = %self.fqn(), orphans = candidates.len(), "Deleting orphaned resources");
        }

        self.delete_with_pending(candidates, &mut sweep).await?;
        sweep.finish(self)
    }

    /// Delete every resource in this scope and below it, then its
    /// scope-local data.
    pub async fn destroy(&self) -> Result<FinalizeReport> {
        self.seal();
        let mut sweep = Sweep::default();

        let stored = self.stored().await?;
        let live: BTreeMap<String, Scope> = self.state().children.clone();
        let names: BTreeSet<&String> = stored.nested.iter().chain(live.keys()).collect();
        for name in names {
            let child = match live.get(name) {
                Some(child) => child.clone(),
                None => Scope::detached(self, name, Phase::Destroy),
            };
            sweep.absorb(child.fqn(), destroy_boxed(&child).await);
        }

        let mut candidates = Vec::new();
        for id in &stored.resources {
            let fqn = fqn::child(self.fqn(), id);
            match self.load_record(&fqn).await {
                Ok(Some(record)) => candidates.push(DeletionCandidate::from_record(
                    &fqn,
                    &record,
                    CandidateOrigin::Destroy,
                )),
                Ok(None) => {}
                Err(e) => sweep.fail(&fqn, e.to_string()),
            }
        }
        info!(scope = %self.fqn(), resources = candidates.len(), "Destroying scope");

        self.delete_with_pending(candidates, &mut sweep).await?;

        if sweep.failures.is_empty() {
            for key in self.stored().await?.scope_data {
                self.env().store.delete(&key).await?;
            }
            let mut state = self.state();
            state.declared.clear();
            state.resources.clear();
            state.retained.clear();
            state.children.clear();
        }
        sweep.finish(self)
    }

    async fn stored(&self) -> Result<Stored> {
        let keys = self.env().store.list(&fqn::prefix(self.fqn())).await?;
        let mut stored = Stored::default();
        for key in &keys {
            match fqn::classify(self.fqn(), key) {
                Some(StoredKey::Resource(id)) => {
                    stored.resources.insert(id.to_string());
                }
                Some(StoredKey::Nested(name)) => {
                    stored.nested.insert(name.to_string());
                }
                Some(StoredKey::ScopeData) => stored.scope_data.push(key.clone()),
                None => {}
            }
        }
        Ok(stored)
    }

    /// Delete `candidates` together with the pending-deletion queue, then
    /// rewrite the queue to hold only the entries that failed.
    async fn delete_with_pending(
        &self,
        mut candidates: Vec<DeletionCandidate>,
        sweep: &mut Sweep,
    ) -> Result<()> {
        let _guard = self.inner.pending_lock.lock().await;

        let raw = self.read_pending_raw().await?;
        let stored_entries = raw.len();
        let mut pending: Vec<PendingDeletion> = Vec::with_capacity(raw.len());
        for entry in &raw {
            if let Some(parsed) = self.usable_pending(entry).await {
                pending.push(parsed);
            }
        }

        let first_pending = candidates.len();
        candidates.extend(pending.iter().map(DeletionCandidate::from_pending));

        let mut remaining = Vec::new();
        for (index, (candidate, outcome)) in self
            .execute_deletions(candidates)
            .await
            .into_iter()
            .enumerate()
        {
            match outcome {
                Ok(()) => sweep.deleted.push(candidate.fqn),
                Err(message) => {
                    match candidate.origin {
                        CandidateOrigin::Pending => {
                            if let Some(entry) = pending.get(index - first_pending) {
                                remaining.push(serde_json::to_value(entry)?);
                            }
                        }
                        CandidateOrigin::Orphan => self.mark_failed(&candidate.fqn).await,
                        CandidateOrigin::Destroy => {}
                    }
                    sweep.fail(&candidate.fqn, message);
                }
            }
        }

        if stored_entries > 0 {
            self.write_pending_raw(remaining).await?;
        }
        Ok(())
    }

    /// Parse a queued entry, or `None` when it must be dropped unhandled.
    ///
    /// An entry without a type borrows the type of the record stored at its
    /// FQN. An entry that still describes that record is not an old
    /// incarnation (the replacement was never committed) and is dropped.
    async fn usable_pending(&self, raw: &serde_json::Value) -> Option<PendingDeletion> {
        let live = match PendingDeletion::entry_fqn(raw) {
            Some(fqn) => self.load_record(fqn).await.unwrap_or_else(|e| {
                warn!(fqn = %fqn, error = %e, "Cannot load record for pending deletion");
                None
            }),
            None => None,
        };

        let fallback = live.as_ref().map(|record| record.type_name.as_str());
        let entry = match PendingDeletion::from_json_with_fallback(raw, fallback) {
            Ok(entry) => entry,
            Err(reason) => {
                warn!(scope = %self.fqn(), reason = %reason, "Dropping unusable pending deletion entry");
                return None;
            }
        };

        if let Some(record) = &live {
            if entry.describes(&entry.fqn, record) {
                warn!(
                    fqn = %entry.fqn,
                    "Pending deletion matches the live record; dropping entry"
                );
                return None;
            }
        }
        Some(entry)
    }

    /// Run the planner's levels in order, each level with bounded
    /// concurrency. A candidate whose consumer failed is not attempted.
    async fn execute_deletions(
        &self,
        candidates: Vec<DeletionCandidate>,
    ) -> Vec<(DeletionCandidate, std::result::Result<(), String>)> {
        let planner = self.env().planner.clone();
        let plan = planner.plan(candidates);
        let limit = planner.config().max_concurrent_deletions.max(1);
        let mut outcomes: Vec<Option<std::result::Result<(), String>>> = vec![None; plan.len()];

        for level in &plan.levels {
            let mut runnable = Vec::with_capacity(level.len());
            for &index in level {
                let failed: Vec<&str> = plan
                    .blocked_by(index)
                    .iter()
                    .filter(|&&consumer| matches!(outcomes[consumer], Some(Err(_))))
                    .map(|&consumer| plan.candidates[consumer].fqn.as_str())
                    .collect();
                if failed.is_empty() {
                    runnable.push(index);
                } else {
                    outcomes[index] = Some(Err(format!(
                        "blocked by failed deletion of {}",
                        failed.join(", ")
                    )));
                }
            }

            let results: Vec<(usize, Result<()>)> = stream::iter(runnable)
                .map(|index| {
                    let candidate = &plan.candidates[index];
                    async move { (index, self.delete_candidate(candidate).await) }
                })
                .buffer_unordered(limit)
                .collect()
                .await;

            for (index, result) in results {
                outcomes[index] = Some(result.map_err(|e| e.to_string()));
            }
        }

        plan.candidates
            .into_iter()
            .zip(outcomes)
            .map(|(candidate, outcome)| {
                let outcome = outcome.unwrap_or_else(|| Err("deletion was not scheduled".to_string()));
                (candidate, outcome)
            })
            .collect()
    }

    /// Invoke the delete handler for one candidate and drop its record.
    async fn delete_candidate(&self, candidate: &DeletionCandidate) -> Result<()> {
        let fqn = candidate.fqn.as_str();
        let id = fqn::local_id(fqn).to_string();
        let before = self.status(&id);

        let result = match self.run_delete_handler(candidate, &id).await {
            Ok(()) if candidate.origin != CandidateOrigin::Pending => {
                self.env().store.delete(fqn).await
            }
            other => other,
        };

        if candidate.origin == CandidateOrigin::Pending {
            // The id now belongs to the replacement.
            let mut state = self.state();
            match before {
                Some(status) => state.statuses.insert(id.clone(), status),
                None => state.statuses.remove(&id),
            };
        } else {
            let status = match result {
                Ok(()) => ResourceStatus::Deleted,
                Err(_) => ResourceStatus::Failed,
            };
            let mut state = self.state();
            state.statuses.insert(id.clone(), status);
            if result.is_ok() {
                state.resources.remove(&id);
            }
        }

        match &result {
            Ok(()) => info!(fqn = %fqn, origin = ?candidate.origin, "Deleted resource"),
            Err(e) => warn!(fqn = %fqn, origin = ?candidate.origin, error = %e, "Deletion failed"),
        }
        result
    }

    async fn run_delete_handler(&self, candidate: &DeletionCandidate, id: &str) -> Result<()> {
        let fqn = candidate.fqn.as_str();
        let kind = self
            .env()
            .registry
            .get(&candidate.type_name)
            .ok_or_else(|| StratumError::ProviderNotFound {
                type_name: candidate.type_name.clone(),
            })?;

        let codec = &self.env().codec;
        let props = codec
            .deserialize(&candidate.props)
            .map_err(|e| e.with_resource(fqn))?;
        let output = codec
            .deserialize(&candidate.output)
            .map_err(|e| e.with_resource(fqn))?;

        let resource_scope = Scope::detached(self, id, Phase::Destroy);
        let signal = self
            .invoke(
                &kind,
                LifecyclePhase::Delete,
                fqn,
                id,
                &props,
                Some((props.clone(), output)),
                &resource_scope,
            )
            .await?;
        match signal {
            LifecycleSignal::Destroyed => Ok(()),
            other => Err(unexpected(fqn, LifecyclePhase::Delete, &other)),
        }
    }

    pub(crate) async fn mark_failed(&self, fqn: &str) {
        let record = match self.load_record(fqn).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(fqn = %fqn, error = %e, "Cannot mark record failed");
                return;
            }
        };

        let mut record = record;
        record.status = ResourceStatus::Failed;
        record.updated_at = Utc::now();
        let written = match record.to_json() {
            Ok(json) => self.env().store.set(fqn, json).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(fqn = %fqn, error = %e, "Cannot mark record failed");
        }
    }
}

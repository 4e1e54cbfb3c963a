//! Per-declaration orchestration: phase detection, handler invocation and
//! record persistence.

use std::collections::BTreeSet;

use chrono::Utc;
use stratum_core::fqn::{self, StoredKey};
use stratum_core::{
    LifecyclePhase, PendingDeletion, Phase, ResourceRecord, ResourceStatus, Result, StratumError,
};
use stratum_value::{dependencies, Value};
use tracing::{debug, info, warn};

use crate::resource::{Context, LifecycleSignal, Resource, ResourceKind};
use crate::scope::Scope;

/// Outcome of running a handler for create or update, before persistence.
struct Applied {
    output: Value,
    status: ResourceStatus,
    /// The previous incarnation, when it was replaced without `force`.
    superseded: Option<ResourceRecord>,
    /// True when the committed output belongs to a new incarnation.
    recreated: bool,
}

impl Scope {
    pub(crate) async fn apply(&self, kind: &ResourceKind, id: String, props: Value) -> Result<Resource> {
        fqn::validate_segment("resource id", &id)?;
        if self.is_sealed() {
            return Err(StratumError::ScopeSealed {
                scope: self.fqn().to_string(),
                id,
            });
        }
        self.env().registry.register(kind.clone());

        let lock = self.id_lock(&id);
        let _guard = lock.lock().await;

        {
            let mut state = self.state();
            if !state.declared.contains(&id) {
                state.declared.push(id.clone());
            }
        }

        let fqn = fqn::child(self.fqn(), &id);
        let record = self.load_record(&fqn).await?;

        let resource = match self.phase() {
            Phase::Destroy => self.declare_for_destroy(kind, &fqn, &id, props, record)?,
            Phase::Read => self.read(kind, &fqn, &id, props, record).await?,
            Phase::Up => self.reconcile(kind, &fqn, &id, props, record).await?,
        };

        self.state()
            .resources
            .insert(id.clone(), resource.clone());
        Ok(resource)
    }

    pub(crate) async fn load_record(&self, fqn: &str) -> Result<Option<ResourceRecord>> {
        match self.env().store.get(fqn).await? {
            Some(entry) => Ok(Some(ResourceRecord::from_json(fqn, entry.value)?)),
            None => Ok(None),
        }
    }

    /// Destroy phase: nothing runs now; the last known output is returned
    /// and the teardown happens when the scope is finalized.
    fn declare_for_destroy(
        &self,
        kind: &ResourceKind,
        fqn: &str,
        id: &str,
        props: Value,
        record: Option<ResourceRecord>,
    ) -> Result<Resource> {
        let output = match &record {
            Some(record) => self
                .env()
                .codec
                .deserialize(&record.output)
                .map_err(|e| e.with_resource(fqn))?,
            None => props,
        };
        if let Some(record) = &record {
            self.set_status(id, record.status);
        }
        debug!(fqn = %fqn, "Declared in destroy phase");
        Ok(self.live(kind, fqn, id, output))
    }

    async fn read(
        &self,
        kind: &ResourceKind,
        fqn: &str,
        id: &str,
        props: Value,
        record: Option<ResourceRecord>,
    ) -> Result<Resource> {
        let previous = match &record {
            Some(record) => Some(self.previous(fqn, record)?),
            None => None,
        };
        let resource_scope = self.child(id)?;

        let signal = self
            .invoke(kind, LifecyclePhase::Read, fqn, id, &props, previous, &resource_scope)
            .await?;
        let output = match signal {
            LifecycleSignal::Commit(output) => output,
            other => return Err(unexpected(fqn, LifecyclePhase::Read, &other)),
        };

        debug!(fqn = %fqn, "Read resource");
        Ok(self.live(kind, fqn, id, Value::merge(&props, &output)))
    }

    async fn reconcile(
        &self,
        kind: &ResourceKind,
        fqn: &str,
        id: &str,
        props: Value,
        record: Option<ResourceRecord>,
    ) -> Result<Resource> {
        let codec = &self.env().codec;
        let props_json = codec.serialize(&props).map_err(|e| e.with_resource(fqn))?;

        let (phase, previous) = match &record {
            None => (LifecyclePhase::Create, None),
            Some(record) => {
                let (old_props, old_output) = self.previous(fqn, record)?;
                let changed = old_props != props;
                if !changed && !record.needs_retry() && !kind.options().always_update {
                    debug!(fqn = %fqn, "Unchanged; skipping handler");
                    let mut state = self.state();
                    state.retained.insert(id.to_string());
                    state.statuses.insert(id.to_string(), record.status);
                    drop(state);
                    return Ok(self.live(kind, fqn, id, old_output));
                }
                if record.needs_retry() {
                    info!(fqn = %fqn, status = ?record.status, "Retrying resource");
                }
                (LifecyclePhase::Update, Some((old_props, old_output)))
            }
        };

        let applied = match self
            .transition(kind, fqn, id, &props, phase, previous, record.as_ref())
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                self.set_status(id, ResourceStatus::Failed);
                return Err(e);
            }
        };

        let output = Value::merge(&props, &applied.output);
        let output_json = codec.serialize(&output).map_err(|e| e.with_resource(fqn))?;

        let mut depends_on: BTreeSet<String> = dependencies(&props_json);
        depends_on.extend(dependencies(&output_json));
        depends_on.remove(fqn);

        let now = Utc::now();
        let created_at = match &record {
            Some(old) if !applied.recreated => old.created_at,
            _ => now,
        };
        let new_record = ResourceRecord {
            type_name: kind.type_name().to_string(),
            status: applied.status,
            props: props_json,
            output: output_json,
            depends_on: depends_on.into_iter().collect(),
            created_at,
            updated_at: now,
        };

        if let Some(old) = &applied.superseded {
            self.queue_deletion(PendingDeletion::from_record(fqn, old))
                .await?;
        }
        self.env().store.set(fqn, new_record.to_json()?).await?;
        self.set_status(id, applied.status);

        info!(
            fqn = %fqn,
            phase = %phase,
            status = ?applied.status,
            run_id = %self.run_id(),
            "Applied resource"
        );
        Ok(self.live(kind, fqn, id, output))
    }

    /// Run create or update, following a replace signal if the handler
    /// sends one.
    #[allow(clippy::too_many_arguments)]
    async fn transition(
        &self,
        kind: &ResourceKind,
        fqn: &str,
        id: &str,
        props: &Value,
        phase: LifecyclePhase,
        previous: Option<(Value, Value)>,
        record: Option<&ResourceRecord>,
    ) -> Result<Applied> {
        let resource_scope = self.child(id)?;
        let signal = self
            .invoke(kind, phase, fqn, id, props, previous.clone(), &resource_scope)
            .await?;

        let force = match signal {
            LifecycleSignal::Commit(output) => {
                return Ok(Applied {
                    output,
                    status: committed(phase),
                    superseded: None,
                    recreated: false,
                })
            }
            LifecycleSignal::Replace { force } => force,
            other => return Err(unexpected(fqn, phase, &other)),
        };

        let (old, previous) = match (record, previous) {
            (Some(old), Some(previous)) if phase == LifecyclePhase::Update => (old, previous),
            _ => {
                return Err(StratumError::ReplaceInCreatePhase {
                    fqn: fqn.to_string(),
                })
            }
        };
        if self.has_children(id, &resource_scope).await? {
            return Err(StratumError::ReplaceHasChildren {
                fqn: fqn.to_string(),
            });
        }

        info!(fqn = %fqn, force, "Replacing resource");
        if force {
            let signal = self
                .invoke(kind, LifecyclePhase::Delete, fqn, id, &previous.0, Some(previous.clone()), &resource_scope)
                .await?;
            if signal != LifecycleSignal::Destroyed {
                return Err(unexpected(fqn, LifecyclePhase::Delete, &signal));
            }
            debug!(fqn = %fqn, "Deleted old incarnation before replacement");
        }

        let applied = match self
            .invoke(kind, LifecyclePhase::Create, fqn, id, props, None, &resource_scope)
            .await
        {
            Ok(LifecycleSignal::Commit(output)) => Ok(Applied {
                output,
                status: ResourceStatus::Created,
                superseded: (!force).then(|| old.clone()),
                recreated: true,
            }),
            Ok(LifecycleSignal::Replace { .. }) => Err(StratumError::ReplaceInCreatePhase {
                fqn: fqn.to_string(),
            }),
            Ok(other) => Err(unexpected(fqn, LifecyclePhase::Create, &other)),
            Err(e) => Err(e),
        };
        if force && applied.is_err() {
            // The stored record names an incarnation that no longer exists.
            warn!(fqn = %fqn, "Replacement failed after the old incarnation was deleted");
            self.mark_failed(fqn).await;
        }
        applied
    }

    /// Invoke the handler with the resource's own scope as ambient scope.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn invoke(
        &self,
        kind: &ResourceKind,
        phase: LifecyclePhase,
        fqn: &str,
        id: &str,
        props: &Value,
        previous: Option<(Value, Value)>,
        resource_scope: &Scope,
    ) -> Result<LifecycleSignal> {
        if let Some(status) = ResourceStatus::in_flight_for(phase) {
            self.set_status(id, status);
        }

        let adopt = kind.options().adopt || self.env().adopt;
        let ctx = Context::new(
            fqn.to_string(),
            id.to_string(),
            phase,
            previous,
            resource_scope.clone(),
            adopt,
        );

        debug!(fqn = %fqn, phase = %phase, "Invoking handler");
        let handler = kind.handler().clone();
        Scope::enter(
            resource_scope.clone(),
            handler.handle(ctx, id.to_string(), props.clone()),
        )
        .await
        .map_err(|e| StratumError::HandlerFailed {
            fqn: fqn.to_string(),
            phase,
            message: format!("{e:#}"),
        })
    }

    /// Decode the props and output of a stored record.
    fn previous(&self, fqn: &str, record: &ResourceRecord) -> Result<(Value, Value)> {
        let codec = &self.env().codec;
        let props = codec
            .deserialize(&record.props)
            .map_err(|e| e.with_resource(fqn))?;
        let output = codec
            .deserialize(&record.output)
            .map_err(|e| e.with_resource(fqn))?;
        Ok((props, output))
    }

    /// Returns true if resource `id` owns nested resources, either declared
    /// this pass or recorded in state.
    async fn has_children(&self, id: &str, resource_scope: &Scope) -> Result<bool> {
        if resource_scope.has_declarations() {
            return Ok(true);
        }
        let nested = fqn::child(self.fqn(), id);
        let keys = self.env().store.list(&fqn::prefix(&nested)).await?;
        Ok(keys.iter().any(|key| {
            matches!(
                fqn::classify(&nested, key),
                Some(StoredKey::Resource(_)) | Some(StoredKey::Nested(_))
            )
        }))
    }

    /// Queue an old incarnation for deletion at finalize.
    pub(crate) async fn queue_deletion(&self, entry: PendingDeletion) -> Result<()> {
        let _guard = self.inner.pending_lock.lock().await;
        let mut raw = self.read_pending_raw().await?;

        let duplicate = raw.iter().any(|existing| {
            PendingDeletion::from_json_lenient(existing)
                .map(|e| e.same_incarnation(&entry))
                .unwrap_or(false)
        });
        if duplicate {
            debug!(fqn = %entry.fqn, "Old incarnation already queued");
            return Ok(());
        }

        raw.push(serde_json::to_value(&entry)?);
        self.write_pending_raw(raw).await?;
        debug!(fqn = %entry.fqn, "Queued old incarnation for deletion");
        Ok(())
    }

    /// The stored pending-deletion list, entry by entry.
    pub(crate) async fn read_pending_raw(&self) -> Result<Vec<serde_json::Value>> {
        let key = fqn::scope_data_key(self.fqn(), PENDING_DELETIONS);
        match self.env().store.get(&key).await? {
            None => Ok(Vec::new()),
            Some(entry) => match entry.value {
                serde_json::Value::Array(items) => Ok(items),
                serde_json::Value::Null => Ok(Vec::new()),
                other => {
                    warn!(scope = %self.fqn(), value = %other, "Pending deletion list is not an array; discarding");
                    Ok(Vec::new())
                }
            },
        }
    }

    pub(crate) async fn write_pending_raw(&self, entries: Vec<serde_json::Value>) -> Result<()> {
        let key = fqn::scope_data_key(self.fqn(), PENDING_DELETIONS);
        if entries.is_empty() {
            self.env().store.delete(&key).await
        } else {
            self.env()
                .store
                .set(&key, serde_json::Value::Array(entries))
                .await
                .map(|_| ())
        }
    }

    /// Replaced resources whose old incarnation still has to be deleted.
    pub async fn pending_deletions(&self) -> Result<Vec<PendingDeletion>> {
        Ok(self
            .read_pending_raw()
            .await?
            .iter()
            .filter_map(|raw| PendingDeletion::from_json_lenient(raw).ok())
            .collect())
    }

    fn live(&self, kind: &ResourceKind, fqn: &str, id: &str, output: Value) -> Resource {
        Resource {
            fqn: fqn.to_string(),
            id: id.to_string(),
            type_name: kind.type_name().to_string(),
            output,
        }
    }
}

/// Scope-local key holding the pending-deletion list.
pub(crate) const PENDING_DELETIONS: &str = "pendingDeletions";

fn committed(phase: LifecyclePhase) -> ResourceStatus {
    match phase {
        LifecyclePhase::Create => ResourceStatus::Created,
        _ => ResourceStatus::Updated,
    }
}

pub(crate) fn unexpected(fqn: &str, phase: LifecyclePhase, signal: &LifecycleSignal) -> StratumError {
    let message = match (phase, signal) {
        (LifecyclePhase::Delete, _) => "the delete phase must end with destroy()".to_string(),
        (LifecyclePhase::Read, LifecycleSignal::Replace { .. }) => {
            "replace() is not allowed in the read phase".to_string()
        }
        (_, LifecycleSignal::Destroyed) => {
            format!("destroy() is only valid in the delete phase, not {phase}")
        }
        (_, signal) => format!("unexpected {signal:?} during {phase}"),
    };
    StratumError::ContractViolation {
        fqn: fqn.to_string(),
        message,
    }
}

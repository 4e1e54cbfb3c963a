//! Scopes: the namespacing tree that mirrors the program's nesting.
//!
//! Every scope owns its children and holds a weak link to its parent. The
//! ambient scope is task-local: [`Scope::run`] enters a child for the
//! duration of a block and restores the parent when the block completes,
//! whether it succeeded or not. Tasks started with `tokio::spawn` do not
//! inherit the ambient scope; pass a [`Scope`] to them explicitly.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use stratum_core::fqn;
use stratum_core::{Phase, ResourceStatus, Result, StratumError};
use stratum_planner::Planner;
use stratum_state::StateStore;
use stratum_value::Codec;
use uuid::Uuid;

use crate::registry::Registry;
use crate::resource::Resource;

tokio::task_local! {
    static CURRENT_SCOPE: Scope;
}

/// Everything the scopes of one run share.
pub(crate) struct Environment {
    pub store: Arc<dyn StateStore>,
    pub registry: Registry,
    pub codec: Codec,
    pub planner: Arc<dyn Planner>,
    pub adopt: bool,
    pub run_id: Uuid,
}

/// Options for [`Scope::run_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Run the child in a different phase than its parent.
    pub phase: Option<Phase>,
}

/// A node in the scope tree.
///
/// Cheap to clone; clones refer to the same scope.
#[derive(Clone)]
pub struct Scope {
    pub(crate) inner: Arc<ScopeInner>,
}

pub(crate) struct ScopeInner {
    name: String,
    fqn: String,
    phase: Phase,
    parent: Weak<ScopeInner>,
    pub(crate) env: Arc<Environment>,
    state: Mutex<ScopeState>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pub(crate) pending_lock: tokio::sync::Mutex<()>,
}

/// In-memory bookkeeping for the current pass.
#[derive(Default)]
pub(crate) struct ScopeState {
    /// Resource ids declared this pass, in declaration order.
    pub declared: Vec<String>,
    /// Live resources declared this pass.
    pub resources: HashMap<String, Resource>,
    /// Latest known status per id.
    pub statuses: HashMap<String, ResourceStatus>,
    /// Child scopes entered this pass.
    pub children: BTreeMap<String, Scope>,
    /// Nested scopes kept alive by resources that were skipped as unchanged.
    pub retained: BTreeSet<String>,
    pub sealed: bool,
    pub finalized: bool,
}

impl Scope {
    pub(crate) fn root(app: &str, stage: &str, phase: Phase, env: Arc<Environment>) -> Self {
        Self::build(
            stage.to_string(),
            fqn::child(app, stage),
            phase,
            Weak::new(),
            env,
        )
    }

    fn build(
        name: String,
        fqn: String,
        phase: Phase,
        parent: Weak<ScopeInner>,
        env: Arc<Environment>,
    ) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name,
                fqn,
                phase,
                parent,
                env,
                state: Mutex::new(ScopeState::default()),
                locks: Mutex::new(HashMap::new()),
                pending_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// A scope for `name` under `parent` that is not tracked as a child.
    pub(crate) fn detached(parent: &Scope, name: &str, phase: Phase) -> Self {
        Self::build(
            name.to_string(),
            fqn::child(parent.fqn(), name),
            phase,
            Arc::downgrade(&parent.inner),
            parent.inner.env.clone(),
        )
    }

    /// The ambient scope.
    pub fn current() -> Result<Scope> {
        CURRENT_SCOPE
            .try_with(Scope::clone)
            .map_err(|_| StratumError::NoActiveScope)
    }

    /// Run `fut` with `scope` as the ambient scope.
    pub(crate) async fn enter<F: Future>(scope: Scope, fut: F) -> F::Output {
        CURRENT_SCOPE.scope(scope, fut).await
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Fully-qualified name of the scope.
    pub fn fqn(&self) -> &str {
        &self.inner.fqn
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase
    }

    pub fn parent(&self) -> Option<Scope> {
        self.inner.parent.upgrade().map(|inner| Scope { inner })
    }

    /// Id of the run this scope belongs to.
    pub fn run_id(&self) -> Uuid {
        self.inner.env.run_id
    }

    pub(crate) fn env(&self) -> &Environment {
        &self.inner.env
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ScopeState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-id lock serializing lifecycle transitions of one resource.
    pub(crate) fn id_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Get or create the child scope `name`, tracked for finalize.
    pub fn child(&self, name: &str) -> Result<Scope> {
        self.child_with_phase(name, self.phase())
    }

    pub(crate) fn child_with_phase(&self, name: &str, phase: Phase) -> Result<Scope> {
        fqn::validate_segment("scope name", name)?;
        let mut state = self.state();
        if let Some(existing) = state.children.get(name) {
            return Ok(existing.clone());
        }
        if state.sealed {
            return Err(StratumError::ScopeSealed {
                scope: self.fqn().to_string(),
                id: name.to_string(),
            });
        }
        let child = Scope::build(
            name.to_string(),
            fqn::child(self.fqn(), name),
            phase,
            Arc::downgrade(&self.inner),
            self.inner.env.clone(),
        );
        state.children.insert(name.to_string(), child.clone());
        Ok(child)
    }

    /// Run `f` inside the child scope `name`.
    ///
    /// The child becomes the ambient scope for the duration of the block
    /// and is sealed once the block returns.
    pub async fn run<F, Fut, T, E>(&self, name: &str, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<StratumError>,
    {
        self.run_with(name, RunOptions::default(), f).await
    }

    pub async fn run_with<F, Fut, T, E>(
        &self,
        name: &str,
        options: RunOptions,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<StratumError>,
    {
        let child = self.child_with_phase(name, options.phase.unwrap_or(self.phase()))?;
        let result = Scope::enter(child.clone(), f(child.clone())).await;
        child.seal();
        result
    }

    /// Stop accepting declarations.
    pub fn seal(&self) {
        self.state().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.state().sealed
    }

    /// Returns true once a finalize or destroy of this scope has succeeded.
    pub fn is_finalized(&self) -> bool {
        self.state().finalized
    }

    /// Ids declared this pass, in declaration order.
    pub fn declared(&self) -> Vec<String> {
        self.state().declared.clone()
    }

    /// The live resource declared as `id` this pass.
    pub fn resource(&self, id: &str) -> Option<Resource> {
        self.state().resources.get(id).cloned()
    }

    /// Latest known status of `id`, including in-flight transitions.
    pub fn status(&self, id: &str) -> Option<ResourceStatus> {
        self.state().statuses.get(id).copied()
    }

    pub(crate) fn set_status(&self, id: &str, status: ResourceStatus) {
        self.state().statuses.insert(id.to_string(), status);
    }

    /// Live child scopes.
    pub(crate) fn children(&self) -> Vec<Scope> {
        self.state().children.values().cloned().collect()
    }

    /// Returns true if anything was declared in this scope or below it.
    pub(crate) fn has_declarations(&self) -> bool {
        let (declared, children) = {
            let state = self.state();
            (!state.declared.is_empty(), state.children.values().cloned().collect::<Vec<_>>())
        };
        declared || children.iter().any(Scope::has_declarations)
    }

    /// Read a scope-local value.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        fqn::validate_segment("scope key", key)?;
        let entry = self
            .env()
            .store
            .get(&fqn::scope_data_key(self.fqn(), key))
            .await?;
        entry
            .map(|e| serde_json::from_value(e.value).map_err(StratumError::from))
            .transpose()
    }

    /// Write a scope-local value.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        fqn::validate_segment("scope key", key)?;
        let value = serde_json::to_value(value)?;
        self.env()
            .store
            .set(&fqn::scope_data_key(self.fqn(), key), value)
            .await?;
        Ok(())
    }

    /// Remove a scope-local value.
    pub async fn remove(&self, key: &str) -> Result<()> {
        fqn::validate_segment("scope key", key)?;
        self.env()
            .store
            .delete(&fqn::scope_data_key(self.fqn(), key))
            .await
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("fqn", &self.inner.fqn)
            .field("phase", &self.inner.phase)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use stratum_planner::ReverseDependencyPlanner;
    use stratum_state::InMemoryStateStore;

    pub(crate) fn test_root(phase: Phase) -> Scope {
        let env = Environment {
            store: Arc::new(InMemoryStateStore::new()),
            registry: Registry::new(),
            codec: Codec::new(),
            planner: Arc::new(ReverseDependencyPlanner::new()),
            adopt: false,
            run_id: Uuid::new_v4(),
        };
        Scope::root("app", "dev", phase, Arc::new(env))
    }

    #[tokio::test]
    async fn test_no_ambient_scope_outside_run() {
        assert!(matches!(Scope::current(), Err(StratumError::NoActiveScope)));
    }

    #[tokio::test]
    async fn test_run_restores_parent() {
        let root = test_root(Phase::Up);

        let (inner, outer) = Scope::enter(root.clone(), async {
            let current = Scope::current()?;
            let inner = current
                .run("child", |_child| async {
                    let fqn = Scope::current()?.fqn().to_string();
                    Ok::<_, StratumError>(fqn)
                })
                .await?;
            let outer = Scope::current()?.fqn().to_string();
            Ok::<_, StratumError>((inner, outer))
        })
        .await
        .unwrap();

        assert_eq!(inner, "app/dev/child");
        assert_eq!(outer, "app/dev");
    }

    #[tokio::test]
    async fn test_run_restores_parent_on_error() {
        let root = test_root(Phase::Up);

        let after = Scope::enter(root.clone(), async {
            let failed: std::result::Result<(), StratumError> = Scope::current()
                .unwrap()
                .run("child", |_child| async {
                    Err(StratumError::validation("boom"))
                })
                .await;
            assert!(failed.is_err());
            Scope::current().unwrap().fqn().to_string()
        })
        .await;

        assert_eq!(after, "app/dev");
        let child = root.child("child").unwrap();
        assert!(child.is_sealed());
    }

    #[tokio::test]
    async fn test_child_phase_and_parent() {
        let root = test_root(Phase::Up);
        let options = RunOptions {
            phase: Some(Phase::Read),
        };
        let phase = root
            .run_with("audit", options, |child| async move {
                assert_eq!(child.parent().unwrap().fqn(), "app/dev");
                Ok::<_, StratumError>(child.phase())
            })
            .await
            .unwrap();
        assert_eq!(phase, Phase::Read);
    }

    #[tokio::test]
    async fn test_sealed_scope_rejects_new_children() {
        let root = test_root(Phase::Up);
        root.seal();
        let err = root.child("late").unwrap_err();
        assert!(matches!(err, StratumError::ScopeSealed { .. }));
    }

    #[tokio::test]
    async fn test_scope_key_values() {
        let root = test_root(Phase::Up);

        assert_eq!(root.get::<String>("owner").await.unwrap(), None);
        root.set("owner", "platform-team").await.unwrap();
        assert_eq!(
            root.get::<String>("owner").await.unwrap().as_deref(),
            Some("platform-team")
        );

        let stored = root
            .env()
            .store
            .get("app/dev/$scope/owner")
            .await
            .unwrap();
        assert!(stored.is_some());

        root.remove("owner").await.unwrap();
        assert_eq!(root.get::<String>("owner").await.unwrap(), None);
        assert!(root.set("a/b", &1).await.is_err());
    }
}

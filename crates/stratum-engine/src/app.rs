//! The root of a run: one app, one stage, one phase.

use std::future::Future;
use std::sync::Arc;

use stratum_core::{fqn, Phase, Result, StratumError};
use stratum_planner::{Planner, PlannerConfig, ReverseDependencyPlanner};
use stratum_state::{InMemoryStateStore, StateStore};
use stratum_value::Codec;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::finalize::FinalizeReport;
use crate::registry::Registry;
use crate::resource::ResourceKind;
use crate::scope::{Environment, Scope};

/// An application instance bound to a state store.
///
/// ```ignore
/// let app = App::builder("shop").stage("prod").build()?;
/// app.run(|scope| async move {
///     bucket.apply(&scope, "assets", props).await?;
///     Ok::<_, StratumError>(())
/// })
/// .await?;
/// ```
#[derive(Clone, Debug)]
pub struct App {
    name: String,
    root: Scope,
}

impl App {
    /// Start building an app named `name`.
    pub fn builder(name: impl Into<String>) -> AppBuilder {
        AppBuilder::new(name)
    }

    /// Build an app from configuration, opening its state backend.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let store = config.open_store().await?;

        let mut builder = App::builder(&config.app_name)
            .stage(&config.stage)
            .phase(config.phase)
            .adopt(config.adopt)
            .store(store)
            .planner_config(config.planner.clone());
        if let Some(password) = &config.password {
            builder = builder.password(password);
        }
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> &str {
        self.root.name()
    }

    pub fn phase(&self) -> Phase {
        self.root.phase()
    }

    /// Identifier of this process's run, attached to log lines.
    pub fn run_id(&self) -> Uuid {
        self.root.run_id()
    }

    /// The root scope (`<app>/<stage>`).
    pub fn scope(&self) -> &Scope {
        &self.root
    }

    pub fn registry(&self) -> &Registry {
        &self.root.env().registry
    }

    /// Register a resource kind so that orphans of its type can be deleted
    /// even when the program no longer declares it.
    pub fn register(&self, kind: ResourceKind) {
        self.registry().register(kind);
    }

    /// Run the program against the root scope, then finalize.
    ///
    /// The root scope is ambient while `f` runs. Finalize only happens when
    /// `f` succeeds; after an error, nothing is deleted and the next run
    /// picks up where this one stopped.
    pub async fn run<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<StratumError>,
    {
        info!(
            app = %self.name,
            stage = %self.stage(),
            phase = %self.phase(),
            run_id = %self.run_id(),
            "Starting run"
        );

        let output = match Scope::enter(self.root.clone(), f(self.root.clone())).await {
            Ok(output) => output,
            Err(e) => {
                self.root.seal();
                error!(app = %self.name, "Program failed; skipping finalize");
                return Err(e);
            }
        };

        let report = self.finalize().await?;
        info!(
            app = %self.name,
            deleted = report.deleted.len(),
            "Run complete"
        );
        Ok(output)
    }

    /// Finalize the root scope.
    pub async fn finalize(&self) -> Result<FinalizeReport> {
        self.root.finalize().await
    }

    /// Delete everything recorded under this app and stage.
    pub async fn destroy(&self) -> Result<FinalizeReport> {
        self.root.destroy().await
    }
}

/// Builder for [`App`].
#[derive(Default)]
pub struct AppBuilder {
    name: String,
    stage: Option<String>,
    phase: Phase,
    password: Option<String>,
    adopt: bool,
    store: Option<Arc<dyn StateStore>>,
    planner: Option<Arc<dyn Planner>>,
    planner_config: Option<PlannerConfig>,
    kinds: Vec<ResourceKind>,
}

impl AppBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Stage name; defaults to `dev`.
    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Encrypt secrets at rest with a key derived from `password`.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn adopt(mut self, adopt: bool) -> Self {
        self.adopt = adopt;
        self
    }

    /// State backend; defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the deletion planner.
    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Configure the default planner.
    pub fn planner_config(mut self, config: PlannerConfig) -> Self {
        self.planner_config = Some(config);
        self
    }

    pub fn register(mut self, kind: ResourceKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn build(self) -> Result<App> {
        let stage = self.stage.unwrap_or_else(|| "dev".to_string());
        fqn::validate_segment("app name", &self.name)?;
        fqn::validate_segment("stage", &stage)?;

        let planner = match (self.planner, self.planner_config) {
            (Some(planner), _) => planner,
            (None, Some(config)) => {
                if config.max_concurrent_deletions == 0 {
                    return Err(StratumError::validation(
                        "max_concurrent_deletions must be at least 1",
                    ));
                }
                Arc::new(ReverseDependencyPlanner::with_config(config)) as Arc<dyn Planner>
            }
            (None, None) => Arc::new(ReverseDependencyPlanner::new()) as Arc<dyn Planner>,
        };

        let registry = Registry::new();
        for kind in self.kinds {
            registry.register(kind);
        }

        let env = Environment {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryStateStore::new())),
            registry,
            codec: Codec::from_passphrase(self.password.as_deref()),
            planner,
            adopt: self.adopt,
            run_id: Uuid::new_v4(),
        };
        info!(
            app = %self.name,
            stage = %stage,
            run_id = %env.run_id,
            encrypted = env.codec.encrypts_secrets(),
            "App initialized"
        );

        let root = Scope::root(&self.name, &stage, self.phase, Arc::new(env));
        Ok(App {
            name: self.name,
            root,
        })
    }
}

impl std::fmt::Debug for AppBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppBuilder")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .field("phase", &self.phase)
            .field("adopt", &self.adopt)
            .field("kinds", &self.kinds.len())
            .finish_non_exhaustive()
    }
}

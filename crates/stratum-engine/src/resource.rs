//! The resource provider contract.
//!
//! A provider is a [`Handler`]: given a [`Context`], the resource id and its
//! desired props, it performs the remote calls for the current
//! [`LifecyclePhase`] and returns a [`LifecycleSignal`] telling the engine
//! how the transition ended.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use stratum_core::{LifecyclePhase, Result};
use stratum_value::{ResourceRef, Value};

use crate::scope::Scope;

/// How a handler invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleSignal {
    /// Create, update or read succeeded with this output.
    Commit(Value),
    /// The resource must be destroyed and recreated.
    ///
    /// Without `force` the old incarnation is queued and deleted at
    /// finalize, after the replacement exists. With `force` it is deleted
    /// before the replacement is created.
    Replace { force: bool },
    /// Delete succeeded.
    Destroyed,
}

/// A resource provider.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: Context,
        id: String,
        props: Value,
    ) -> anyhow::Result<LifecycleSignal>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Context, String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<LifecycleSignal>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: Context,
        id: String,
        props: Value,
    ) -> anyhow::Result<LifecycleSignal> {
        (self)(ctx, id, props).await
    }
}

/// Per-type behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceOptions {
    /// Run the update handler even when props are unchanged.
    pub always_update: bool,

    /// Let create attach to a pre-existing remote resource.
    pub adopt: bool,
}

/// A resource type: its tag, options and handler.
#[derive(Clone)]
pub struct ResourceKind {
    type_name: Arc<str>,
    options: ResourceOptions,
    handler: Arc<dyn Handler>,
}

impl ResourceKind {
    pub fn new(type_name: impl Into<String>, handler: impl Handler) -> Self {
        Self {
            type_name: Arc::from(type_name.into()),
            options: ResourceOptions::default(),
            handler: Arc::new(handler),
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: ResourceOptions) -> Self {
        self.options = options;
        self
    }

    /// Re-run the update handler on every pass.
    pub fn always_update(mut self) -> Self {
        self.options.always_update = true;
        self
    }

    /// Allow create to adopt existing remote resources.
    pub fn adopt(mut self) -> Self {
        self.options.adopt = true;
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn options(&self) -> ResourceOptions {
        self.options
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Declare resource `id` in `scope`.
    pub async fn apply(
        &self,
        scope: &Scope,
        id: impl Into<String>,
        props: impl Into<Value>,
    ) -> Result<Resource> {
        scope.apply(self, id.into(), props.into()).await
    }

    /// Declare resource `id` in the ambient scope.
    pub async fn declare(&self, id: impl Into<String>, props: impl Into<Value>) -> Result<Resource> {
        let scope = Scope::current()?;
        self.apply(&scope, id, props).await
    }
}

impl std::fmt::Debug for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceKind")
            .field("type_name", &self.type_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A declared resource as seen by the program.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Fully-qualified name.
    pub fqn: String,

    /// Local id within its scope.
    pub id: String,

    /// Type tag.
    pub type_name: String,

    /// Props merged with the handler's output.
    pub output: Value,
}

impl Resource {
    /// Look up an output property.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.output.get(key)
    }

    /// A reference to this resource for embedding in other props.
    pub fn reference(&self) -> Value {
        Value::Resource(ResourceRef {
            fqn: self.fqn.clone(),
            type_name: self.type_name.clone(),
            output: Arc::new(self.output.clone()),
        })
    }
}

impl From<&Resource> for Value {
    fn from(resource: &Resource) -> Self {
        resource.reference()
    }
}

impl From<Resource> for Value {
    fn from(resource: Resource) -> Self {
        resource.reference()
    }
}

/// What a handler sees about the transition it is asked to perform.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    fqn: String,
    id: String,
    phase: LifecyclePhase,
    output: Option<Value>,
    props: Option<Value>,
    scope: Scope,
    adopt: bool,
}

impl Context {
    pub(crate) fn new(
        fqn: String,
        id: String,
        phase: LifecyclePhase,
        previous: Option<(Value, Value)>,
        scope: Scope,
        adopt: bool,
    ) -> Self {
        let (props, output) = match previous {
            Some((props, output)) => (Some(props), Some(output)),
            None => (None, None),
        };
        Self {
            inner: Arc::new(ContextInner {
                fqn,
                id,
                phase,
                output,
                props,
                scope,
                adopt,
            }),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.inner.phase
    }

    pub fn fqn(&self) -> &str {
        &self.inner.fqn
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Output committed by the previous incarnation, if any.
    pub fn output(&self) -> Option<&Value> {
        self.inner.output.as_ref()
    }

    /// Props the previous output was produced from, if any.
    pub fn previous_props(&self) -> Option<&Value> {
        self.inner.props.as_ref()
    }

    /// The resource's own scope; nested resources declared here are
    /// namespaced under this resource.
    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Whether create may adopt an existing remote resource.
    pub fn adopt(&self) -> bool {
        self.inner.adopt
    }

    /// End a create, update or read with `output`.
    pub fn commit(&self, output: impl Into<Value>) -> anyhow::Result<LifecycleSignal> {
        Ok(LifecycleSignal::Commit(output.into()))
    }

    /// End a delete.
    pub fn destroy(&self) -> anyhow::Result<LifecycleSignal> {
        Ok(LifecycleSignal::Destroyed)
    }

    /// Ask for the resource to be replaced.
    pub fn replace(&self, force: bool) -> anyhow::Result<LifecycleSignal> {
        Ok(LifecycleSignal::Replace { force })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("fqn", &self.inner.fqn)
            .field("phase", &self.inner.phase)
            .finish_non_exhaustive()
    }
}

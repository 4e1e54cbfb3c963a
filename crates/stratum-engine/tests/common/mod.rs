//! Test doubles shared by the scenario tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use stratum_core::{LifecyclePhase, StratumError};
use stratum_engine::{App, Context, Handler, LifecycleSignal, Resource, ResourceKind};
use stratum_state::{InMemoryStateStore, StateStore};
use stratum_value::Value;

/// An in-process stand-in for a cloud API.
///
/// Every handler call is logged as `<phase>:<fqn>`. Objects live in a map
/// keyed by the `name` prop (or the id when there is none), so replacement
/// and deletion can be observed directly.
#[derive(Default)]
pub struct FakeCloud {
    events: Mutex<Vec<String>>,
    objects: Mutex<BTreeMap<String, Value>>,
    failing: Mutex<BTreeSet<String>>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Events logged for one phase, in order.
    pub fn events_for(&self, phase: &str) -> Vec<String> {
        let prefix = format!("{phase}:");
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Make `event` (for example `delete:app/dev/a`) fail until healed.
    pub fn fail(&self, event: &str) {
        self.failing.lock().unwrap().insert(event.to_string());
    }

    pub fn heal(&self, event: &str) {
        self.failing.lock().unwrap().remove(event);
    }

    pub fn exists(&self, name: &str) -> bool {
        self.objects.lock().unwrap().contains_key(name)
    }

    pub fn object_names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn record(&self, phase: LifecyclePhase, fqn: &str) -> anyhow::Result<()> {
        let event = format!("{phase}:{fqn}");
        if self.failing.lock().unwrap().contains(&event) {
            anyhow::bail!("injected failure on {event}");
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn put(&self, name: String, value: Value) {
        self.objects.lock().unwrap().insert(name, value);
    }

    fn remove(&self, name: &str) {
        self.objects.lock().unwrap().remove(name);
    }
}

fn object_name(id: &str, props: &Value) -> String {
    props
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| id.to_string())
}

/// A provider backed by [`FakeCloud`].
///
/// When `replace_on_rename` is set, an update that changes the `name`
/// prop asks for replacement instead of updating in place.
pub struct Bucket {
    pub cloud: Arc<FakeCloud>,
    pub replace_on_rename: bool,
    pub force: bool,
}

#[async_trait]
impl Handler for Bucket {
    async fn handle(
        &self,
        ctx: Context,
        id: String,
        props: Value,
    ) -> anyhow::Result<LifecycleSignal> {
        self.cloud.record(ctx.phase(), ctx.fqn())?;
        match ctx.phase() {
            LifecyclePhase::Create | LifecyclePhase::Update => {
                if ctx.phase() == LifecyclePhase::Update && self.replace_on_rename {
                    let old = ctx.previous_props().map(|p| object_name(&id, p));
                    if old.as_deref() != Some(object_name(&id, &props).as_str()) {
                        return ctx.replace(self.force);
                    }
                }
                let name = object_name(&id, &props);
                self.cloud.put(name.clone(), props.clone());
                ctx.commit(Value::object([("arn", Value::from(format!("arn:fake:{name}")))]))
            }
            LifecyclePhase::Read => ctx.commit(Value::object([("read", Value::from(true))])),
            LifecyclePhase::Delete => {
                self.cloud.remove(&object_name(&id, &props));
                ctx.destroy()
            }
        }
    }
}

pub fn bucket(cloud: &Arc<FakeCloud>) -> ResourceKind {
    ResourceKind::new(
        "fake::Bucket",
        Bucket {
            cloud: cloud.clone(),
            replace_on_rename: false,
            force: false,
        },
    )
}

pub fn replacable(cloud: &Arc<FakeCloud>, force: bool) -> ResourceKind {
    ResourceKind::new(
        "fake::Replacable",
        Bucket {
            cloud: cloud.clone(),
            replace_on_rename: true,
            force,
        },
    )
}

pub fn props(name: &str) -> Value {
    Value::object([("name", Value::from(name))])
}

pub fn memory_store() -> Arc<dyn StateStore> {
    Arc::new(InMemoryStateStore::new())
}

pub fn app(store: &Arc<dyn StateStore>) -> App {
    App::builder("app").store(store.clone()).build().unwrap()
}

/// One full pass: declare `resources` of `kind` in the root scope, then
/// finalize.
pub async fn pass(
    store: &Arc<dyn StateStore>,
    kind: &ResourceKind,
    resources: &[(&str, Value)],
) -> Result<Vec<Resource>, StratumError> {
    let app = app(store);
    app.register(kind.clone());
    app.run(|scope| async move {
        let mut declared = Vec::new();
        for (id, props) in resources {
            declared.push(kind.apply(&scope, *id, props.clone()).await?);
        }
        Ok::<_, StratumError>(declared)
    })
    .await
}

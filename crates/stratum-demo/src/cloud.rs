//! A fake object-storage and hosting provider that lives in process memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use stratum_core::LifecyclePhase;
use stratum_engine::{Context, Handler, LifecycleSignal, ResourceKind};
use stratum_value::Value;
use tracing::info;
use uuid::Uuid;

/// Remote objects keyed by their provider-assigned id.
#[derive(Clone, Default)]
pub struct FakeCloud {
    objects: Arc<Mutex<HashMap<String, Value>>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&self, id: &str, value: Value) {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(id.to_string(), value);
    }

    fn remove(&self, id: &str) -> bool {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.remove(id).is_some()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// `fake::Bucket`: renaming a bucket replaces it.
    pub fn bucket(&self) -> ResourceKind {
        ResourceKind::new("fake::Bucket", BucketHandler { cloud: self.clone() })
    }

    /// `fake::Website`: serves the bucket it references.
    pub fn website(&self) -> ResourceKind {
        ResourceKind::new("fake::Website", WebsiteHandler { cloud: self.clone() })
    }
}

struct BucketHandler {
    cloud: FakeCloud,
}

#[async_trait]
impl Handler for BucketHandler {
    async fn handle(
        &self,
        ctx: Context,
        _id: String,
        props: Value,
    ) -> anyhow::Result<LifecycleSignal> {
        let name = props
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("bucket name is required"))?
            .to_string();

        match ctx.phase() {
            LifecyclePhase::Create => {
                let bucket_id = format!("bkt-{}", Uuid::new_v4().simple());
                self.cloud.put(&bucket_id, props.clone());
                info!(fqn = %ctx.fqn(), bucket = %name, id = %bucket_id, "Created bucket");
                ctx.commit(Value::object([
                    ("bucketId", Value::from(bucket_id.clone())),
                    ("arn", Value::from(format!("arn:fake:s3:::{name}"))),
                ]))
            }
            LifecyclePhase::Update => {
                let previous = ctx
                    .previous_props()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str);
                if previous != Some(name.as_str()) {
                    return ctx.replace(false);
                }
                if let Some(bucket_id) = ctx.output().and_then(|o| o.get("bucketId")).and_then(Value::as_str) {
                    self.cloud.put(bucket_id, props.clone());
                }
                ctx.commit(Value::Null)
            }
            LifecyclePhase::Read => ctx.commit(Value::Null),
            LifecyclePhase::Delete => {
                let output = ctx.output().cloned().unwrap_or_default();
                if let Some(bucket_id) = output.get("bucketId").and_then(Value::as_str) {
                    if !self.cloud.remove(bucket_id) {
                        info!(fqn = %ctx.fqn(), id = %bucket_id, "Bucket already gone");
                    }
                }
                info!(fqn = %ctx.fqn(), bucket = %name, "Deleted bucket");
                ctx.destroy()
            }
        }
    }
}

struct WebsiteHandler {
    cloud: FakeCloud,
}

#[async_trait]
impl Handler for WebsiteHandler {
    async fn handle(
        &self,
        ctx: Context,
        id: String,
        props: Value,
    ) -> anyhow::Result<LifecycleSignal> {
        let bucket = props
            .get("bucket")
            .and_then(|b| b.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("website {id} needs a bucket"))?
            .to_string();

        match ctx.phase() {
            LifecyclePhase::Create | LifecyclePhase::Update => {
                self.cloud.put(ctx.fqn(), props.clone());
                let url = format!("https://{bucket}.sites.fake.example/");
                info!(fqn = %ctx.fqn(), url = %url, "Published website");
                ctx.commit(Value::object([("url", Value::from(url))]))
            }
            LifecyclePhase::Read => ctx.commit(Value::Null),
            LifecyclePhase::Delete => {
                self.cloud.remove(ctx.fqn());
                info!(fqn = %ctx.fqn(), "Unpublished website");
                ctx.destroy()
            }
        }
    }
}

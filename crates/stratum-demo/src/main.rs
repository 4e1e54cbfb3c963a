//! # Stratum Demo
//!
//! Declares a small static-site stack against a fake in-process cloud.
//!
//! Configuration comes from `STRATUM_*` variables (see `AppConfig`). Set
//! `DEMO_BUCKET_NAME` to a new value to watch the bucket get replaced, and
//! `STRATUM_PHASE=destroy` to tear the stack down.

mod cloud;

use anyhow::Context as _;
use stratum_engine::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cloud::FakeCloud;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env("demo").context("invalid STRATUM_* configuration")?;
    info!(?config, "🚀 Stratum demo starting");

    let cloud = FakeCloud::new();
    let bucket = cloud.bucket();
    let website = cloud.website();

    let app = App::from_config(&config).await?;
    app.register(bucket.clone());
    app.register(website.clone());

    let bucket_name =
        std::env::var("DEMO_BUCKET_NAME").unwrap_or_else(|_| "demo-assets".to_string());

    let url = app
        .run(|_root| async move {
            let assets = bucket
                .declare("assets", Value::object([("name", Value::from(bucket_name))]))
                .await?;

            let scope = Scope::current()?;
            let site = scope
                .run("site", |_site| async {
                    website
                        .declare(
                            "www",
                            Value::object([
                                ("bucket", assets.reference()),
                                ("indexDocument", Value::from("index.html")),
                            ]),
                        )
                        .await
                })
                .await?;

            Ok::<_, anyhow::Error>(site.get("url").and_then(Value::as_str).map(str::to_string))
        })
        .await?;

    match url {
        Some(url) if app.phase() == Phase::Up => info!(url = %url, "✅ Stack is up"),
        _ => info!(phase = %app.phase(), "✅ Run complete"),
    }
    info!(objects = cloud.object_count(), "Fake cloud inventory");
    Ok(())
}

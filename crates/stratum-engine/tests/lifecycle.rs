//! Per-resource lifecycle across runs.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use common::{app, bucket, memory_store, pass, props, replacable, FakeCloud};
use stratum_core::{LifecyclePhase, Phase, ResourceRecord, ResourceStatus, StratumError};
use stratum_engine::{App, Context, ResourceKind};
use stratum_value::{Opaque, Secret, Value};

#[tokio::test]
async fn test_unchanged_props_do_not_invoke_handler() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = bucket(&cloud);

    pass(&store, &kind, &[("a", props("alpha"))]).await.unwrap();
    assert_eq!(cloud.events(), vec!["create:app/dev/a"]);

    cloud.clear_events();
    let declared = pass(&store, &kind, &[("a", props("alpha"))]).await.unwrap();
    assert!(cloud.events().is_empty());
    assert_eq!(
        declared[0].get("arn").and_then(Value::as_str),
        Some("arn:fake:alpha")
    );

    pass(&store, &kind, &[("a", props("beta"))]).await.unwrap();
    assert_eq!(cloud.events(), vec!["update:app/dev/a"]);
}

#[tokio::test]
async fn test_always_update_runs_every_pass() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = bucket(&cloud).always_update();

    pass(&store, &kind, &[("a", props("alpha"))]).await.unwrap();
    pass(&store, &kind, &[("a", props("alpha"))]).await.unwrap();
    assert_eq!(
        cloud.events(),
        vec!["create:app/dev/a", "update:app/dev/a"]
    );
}

#[tokio::test]
async fn test_record_persists_props_and_output() {
    let cloud = FakeCloud::new();
    let store = memory_store();

    pass(&store, &bucket(&cloud), &[("a", props("alpha"))])
        .await
        .unwrap();

    let entry = store.get("app/dev/a").await.unwrap().unwrap();
    let record = ResourceRecord::from_json("app/dev/a", entry.value).unwrap();
    assert_eq!(record.type_name, "fake::Bucket");
    assert_eq!(record.status, ResourceStatus::Created);
    assert_eq!(record.props["name"], "alpha");
    assert_eq!(record.output["arn"], "arn:fake:alpha");
    assert_eq!(record.output["name"], "alpha");
}

#[tokio::test]
async fn test_replace_defers_old_deletion_to_finalize() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = replacable(&cloud, false);

    let first = pass(&store, &kind, &[("r", props("foo-0"))]).await.unwrap();
    assert_eq!(first[0].get("name").and_then(Value::as_str), Some("foo-0"));

    let app = app(&store);
    let replaced = kind.apply(app.scope(), "r", props("bar-0")).await.unwrap();
    assert_eq!(replaced.get("name").and_then(Value::as_str), Some("bar-0"));
    assert!(cloud.exists("foo-0"));
    assert!(cloud.exists("bar-0"));

    let pending = app.scope().pending_deletions().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].fqn, "app/dev/r");
    assert_eq!(pending[0].props["name"], "foo-0");

    let report = app.finalize().await.unwrap();
    assert_eq!(report.deleted, vec!["app/dev/r"]);
    assert!(!cloud.exists("foo-0"));
    assert!(cloud.exists("bar-0"));
    assert!(app.scope().pending_deletions().await.unwrap().is_empty());
    assert!(store.get("app/dev/r").await.unwrap().is_some());

    app.destroy().await.unwrap();
    assert!(!cloud.exists("bar-0"));
    assert_eq!(store.count("app/dev/").await.unwrap(), 0);
}

#[tokio::test]
async fn test_force_replace_deletes_before_create() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = replacable(&cloud, true);

    pass(&store, &kind, &[("r", props("foo-0"))]).await.unwrap();
    cloud.clear_events();

    let app = app(&store);
    kind.apply(app.scope(), "r", props("bar-0")).await.unwrap();
    assert_eq!(
        cloud.events(),
        vec!["update:app/dev/r", "delete:app/dev/r", "create:app/dev/r"]
    );
    assert!(!cloud.exists("foo-0"));
    assert!(app.scope().pending_deletions().await.unwrap().is_empty());

    let report = app.finalize().await.unwrap();
    assert!(report.deleted.is_empty());
}

#[tokio::test]
async fn test_failed_force_replace_marks_record_failed() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = replacable(&cloud, true);

    pass(&store, &kind, &[("r", props("foo-0"))]).await.unwrap();

    cloud.fail("create:app/dev/r");
    let err = pass(&store, &kind, &[("r", props("bar-0"))])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StratumError::HandlerFailed {
            phase: LifecyclePhase::Create,
            ..
        }
    ));
    assert!(cloud.object_names().is_empty());

    let entry = store.get("app/dev/r").await.unwrap().unwrap();
    assert_eq!(entry.value["status"], "failed");
    assert_eq!(entry.value["props"]["name"], "foo-0");

    // Even with the old props the handler runs again.
    cloud.heal("create:app/dev/r");
    cloud.clear_events();
    pass(&store, &kind, &[("r", props("foo-0"))]).await.unwrap();
    assert_eq!(cloud.events(), vec!["update:app/dev/r"]);
    assert!(cloud.exists("foo-0"));

    let entry = store.get("app/dev/r").await.unwrap().unwrap();
    assert_eq!(entry.value["status"], "updated");
}

#[tokio::test]
async fn test_replace_rejected_in_create_phase() {
    let kind = ResourceKind::new(
        "test::AlwaysReplace",
        |ctx: Context, _id: String, _props: Value| async move { ctx.replace(false) },
    );

    let err = pass(&memory_store(), &kind, &[("r", props("x"))])
        .await
        .unwrap_err();
    assert!(matches!(err, StratumError::ReplaceInCreatePhase { .. }));
    assert!(err.to_string().contains("cannot be replaced in create phase"));
}

#[tokio::test]
async fn test_replace_rejected_with_children() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let child_kind = bucket(&cloud);

    let parent = ResourceKind::new("test::Parent", move |ctx: Context, _id: String, _props: Value| {
        let child_kind = child_kind.clone();
        async move {
            match ctx.phase() {
                LifecyclePhase::Create => {
                    child_kind
                        .apply(ctx.scope(), "child", props("nested"))
                        .await?;
                    ctx.commit(Value::Null)
                }
                LifecyclePhase::Update => ctx.replace(false),
                LifecyclePhase::Delete => ctx.destroy(),
                LifecyclePhase::Read => ctx.commit(Value::Null),
            }
        }
    });

    pass(&store, &parent, &[("p", props("one"))]).await.unwrap();
    assert!(store.get("app/dev/p/child").await.unwrap().is_some());

    let err = pass(&store, &parent, &[("p", props("two"))])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("has children and cannot be replaced"));

    // Nothing was finalized, so the child is still there.
    assert!(cloud.exists("nested"));
    assert!(store.get("app/dev/p/child").await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_update_is_retried() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = bucket(&cloud);

    pass(&store, &kind, &[("a", props("alpha"))]).await.unwrap();

    cloud.fail("update:app/dev/a");
    let err = pass(&store, &kind, &[("a", props("beta"))])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StratumError::HandlerFailed {
            phase: LifecyclePhase::Update,
            ..
        }
    ));
    assert!(err.to_string().contains("injected failure"));

    let entry = store.get("app/dev/a").await.unwrap().unwrap();
    assert_eq!(entry.value["props"]["name"], "alpha");

    cloud.heal("update:app/dev/a");
    cloud.clear_events();
    pass(&store, &kind, &[("a", props("beta"))]).await.unwrap();
    assert_eq!(cloud.events(), vec!["update:app/dev/a"]);
    assert!(cloud.exists("beta"));
}

#[tokio::test]
async fn test_failed_create_is_retried() {
    let store = memory_store();
    let broken = Arc::new(AtomicBool::new(true));
    let attempts = Arc::new(AtomicUsize::new(0));

    let kind = {
        let broken = broken.clone();
        let attempts = attempts.clone();
        ResourceKind::new("test::Flaky", move |ctx: Context, _id: String, props: Value| {
            let broken = broken.load(Ordering::SeqCst);
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                match ctx.phase() {
                    LifecyclePhase::Delete => ctx.destroy(),
                    _ if broken => anyhow::bail!("quota exceeded"),
                    _ => ctx.commit(props),
                }
            }
        })
    };

    let err = pass(&store, &kind, &[("f", props("x"))]).await.unwrap_err();
    assert!(err.to_string().contains("quota exceeded"));
    assert!(err.is_retryable());
    assert!(store.get("app/dev/f").await.unwrap().is_none());

    broken.store(false, Ordering::SeqCst);
    pass(&store, &kind, &[("f", props("x"))]).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(store.get("app/dev/f").await.unwrap().is_some());
}

#[tokio::test]
async fn test_commit_required_in_create() {
    let kind = ResourceKind::new(
        "test::Lazy",
        |ctx: Context, _id: String, _props: Value| async move { ctx.destroy() },
    );

    let err = pass(&memory_store(), &kind, &[("l", Value::Null)])
        .await
        .unwrap_err();
    assert!(matches!(err, StratumError::ContractViolation { .. }));
}

#[tokio::test]
async fn test_declare_uses_ambient_scope() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = bucket(&cloud);

    let app = app(&store);
    app.run(|scope| {
        let kind = kind.clone();
        async move {
            kind.declare("top", props("top")).await?;
            scope
                .run("network", |_| async {
                    kind.declare("vpc", props("vpc")).await?;
                    Ok::<_, StratumError>(())
                })
                .await
        }
    })
    .await
    .unwrap();

    assert!(store.get("app/dev/top").await.unwrap().is_some());
    assert!(store.get("app/dev/network/vpc").await.unwrap().is_some());
    assert!(matches!(
        kind.declare("outside", Value::Null).await,
        Err(StratumError::NoActiveScope)
    ));
}

#[tokio::test]
async fn test_concurrent_sibling_scopes_keep_their_ambient_scope() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = bucket(&cloud);

    let app = app(&store);
    app.run(|scope| {
        let kind = kind.clone();
        async move {
            let declare_in = |name: &'static str| {
                let kind = kind.clone();
                let scope = scope.clone();
                async move {
                    scope
                        .run(name, |_| async move {
                            tokio::task::yield_now().await;
                            kind.declare("first", props(&format!("{name}-first"))).await?;
                            tokio::task::yield_now().await;
                            kind.declare("second", props(&format!("{name}-second"))).await?;
                            Ok::<_, StratumError>(())
                        })
                        .await
                }
            };

            let (a, b) = tokio::join!(declare_in("a"), declare_in("b"));
            a?;
            b?;
            Ok::<_, StratumError>(())
        }
    })
    .await
    .unwrap();

    for name in ["a", "b"] {
        for id in ["first", "second"] {
            let entry = store
                .get(&format!("app/dev/{name}/{id}"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(entry.value["props"]["name"], format!("{name}-{id}"));
        }
    }
    assert!(store.get("app/dev/first").await.unwrap().is_none());
    assert_eq!(
        cloud.object_names(),
        vec!["a-first", "a-second", "b-first", "b-second"]
    );
}

#[tokio::test]
async fn test_nested_resources_declared_by_handler() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let child_kind = bucket(&cloud);

    let parent = ResourceKind::new("test::Stack", move |ctx: Context, _id: String, props: Value| {
        let child_kind = child_kind.clone();
        async move {
            if ctx.phase() == LifecyclePhase::Delete {
                return ctx.destroy();
            }
            let count = props.get("replicas").and_then(Value::as_i64).unwrap_or(0);
            for i in 0..count {
                child_kind
                    .declare(format!("replica-{i}"), common::props(&format!("replica-{i}")))
                    .await?;
            }
            ctx.commit(Value::Null)
        }
    });

    let replicas = |n: i64| Value::object([("replicas", Value::from(n))]);
    pass(&store, &parent, &[("s", replicas(2))]).await.unwrap();
    assert_eq!(cloud.object_names(), vec!["replica-0", "replica-1"]);

    // Shrinking re-runs the handler, which no longer declares replica-1.
    pass(&store, &parent, &[("s", replicas(1))]).await.unwrap();
    assert_eq!(cloud.object_names(), vec!["replica-0"]);
    assert!(store.get("app/dev/s/replica-1").await.unwrap().is_none());

    // Unchanged: the handler does not run and replica-0 stays.
    pass(&store, &parent, &[("s", replicas(1))]).await.unwrap();
    assert_eq!(cloud.object_names(), vec!["replica-0"]);
    assert!(store.get("app/dev/s/replica-0").await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_declarations_of_same_id() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = bucket(&cloud);

    let app = app(&store);
    let scope = app.scope().clone();
    let (first, second) = tokio::join!(
        kind.apply(&scope, "a", props("alpha")),
        kind.apply(&scope, "a", props("alpha")),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(cloud.events(), vec!["create:app/dev/a"]);
    assert_eq!(scope.declared(), vec!["a"]);
}

#[tokio::test]
async fn test_dependencies_recorded() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = bucket(&cloud);

    let app = app(&store);
    app.run(|scope| {
        let kind = kind.clone();
        async move {
            let logs = kind.apply(&scope, "logs", props("logs")).await?;
            kind.apply(
                &scope,
                "site",
                Value::object([("name", Value::from("site")), ("logBucket", logs.reference())]),
            )
            .await?;
            Ok::<_, StratumError>(())
        }
    })
    .await
    .unwrap();

    let entry = store.get("app/dev/site").await.unwrap().unwrap();
    let record = ResourceRecord::from_json("app/dev/site", entry.value).unwrap();
    assert_eq!(record.depends_on, vec!["app/dev/logs"]);
}

#[tokio::test]
async fn test_read_phase_does_not_persist() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = bucket(&cloud);

    pass(&store, &kind, &[("a", props("alpha"))]).await.unwrap();
    let before = store.get("app/dev/a").await.unwrap().unwrap();
    cloud.clear_events();

    let app = App::builder("app")
        .store(store.clone())
        .phase(Phase::Read)
        .build()
        .unwrap();
    let resources = app
        .run(|scope| {
            let kind = kind.clone();
            async move {
                let a = kind.apply(&scope, "a", props("alpha")).await?;
                let b = kind.apply(&scope, "b", props("beta")).await?;
                Ok::<_, StratumError>(vec![a, b])
            }
        })
        .await
        .unwrap();

    assert_eq!(cloud.events(), vec!["read:app/dev/a", "read:app/dev/b"]);
    assert_eq!(resources[0].get("read"), Some(&Value::Bool(true)));
    assert_eq!(store.get("app/dev/a").await.unwrap().unwrap(), before);
    assert!(store.get("app/dev/b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_opaque_props_name_resource_and_path() {
    struct Handle;

    let cloud = FakeCloud::new();
    let kind = bucket(&cloud);
    let props = Value::object([(
        "handles",
        Value::array([Value::from(Opaque::new(Handle))]),
    )]);

    let err = pass(&memory_store(), &kind, &[("h", props)])
        .await
        .unwrap_err();
    match &err {
        StratumError::Serialization { resource, path, .. } => {
            assert_eq!(resource.as_deref(), Some("app/dev/h"));
            assert_eq!(path, "$.handles[0]");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(cloud.events().is_empty());
}

#[tokio::test]
async fn test_secrets_encrypted_at_rest() {
    let cloud = FakeCloud::new();
    let store = memory_store();
    let kind = bucket(&cloud);
    let props = Value::object([
        ("name", Value::from("db")),
        ("password", Value::from(Secret::new("s3cr3t"))),
    ]);

    let run = |password: Option<&'static str>| {
        let store = store.clone();
        let kind = kind.clone();
        let props = props.clone();
        async move {
            let mut builder = App::builder("app").store(store);
            if let Some(password) = password {
                builder = builder.password(password);
            }
            let app = builder.build()?;
            app.run(|scope| async move {
                kind.apply(&scope, "db", props).await?;
                Ok::<_, StratumError>(())
            })
            .await
        }
    };

    run(Some("hunter2")).await.unwrap();
    let stored = store.get("app/dev/db").await.unwrap().unwrap();
    assert!(!stored.value.to_string().contains("s3cr3t"));

    // Same passphrase, same plaintext: nothing to do.
    cloud.clear_events();
    run(Some("hunter2")).await.unwrap();
    assert!(cloud.events().is_empty());

    let err = run(None).await.unwrap_err();
    assert!(matches!(err, StratumError::Secret(_)));
}

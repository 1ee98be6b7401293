//! Declared effects reach the sink exactly when they must

use super::test_utils::{env_over, shared_store, table, temp_env, Applied, TableReconciler, TableSink};
use settle::config::SettleConfig;
use settle::effect::ProviderHandle;
use settle::{EngineError, Environment, FunctionSpec, MemoFn, RunReport, ScopeContext, ScopePath};
use std::collections::BTreeMap;

type Rows = Vec<(String, String)>;

fn writer(env: &Environment, rows: &ProviderHandle<TableReconciler>) -> MemoFn<Rows, usize> {
    let rows = rows.clone();
    env.define_sync(
        FunctionSpec::new("write_rows", "for (k, v) in rows { declare(k, v) }"),
        move |ctx: &ScopeContext, input: Rows| {
            for (key, value) in &input {
                ctx.declare(rows.exists(key, value.clone())?)?;
            }
            Ok(input.len())
        },
    )
    .unwrap()
}

async fn write(env: &Environment, f: &MemoFn<Rows, usize>, scope: &'static str, rows: &[(&str, &str)]) -> RunReport {
    let f = f.clone();
    let rows: Rows = rows
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    env.run(move |ctx| async move {
        ctx.mount(scope, &f, rows).result().await?;
        anyhow::Ok(())
    })
    .await
}

fn expected(rows: &[(&str, &str)]) -> BTreeMap<String, String> {
    rows.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_then_noop_then_upsert() {
    let env = temp_env();
    let sink = TableSink::new();
    let handle = table(&env, &sink);
    let f = writer(&env, &handle);

    let report = write(&env, &f, "docs", &[("a", "1"), ("b", "2")]).await;
    assert!(report.succeeded(), "{:?}", report.failures);
    assert_eq!(report.applied.get("table"), Some(&2));
    assert_eq!(sink.rows(), expected(&[("a", "1"), ("b", "2")]));
    assert!(sink.log().iter().all(|(_, kind)| *kind == Applied::Create));

    sink.clear_log();
    let report = write(&env, &f, "docs", &[("a", "1"), ("b", "2")]).await;
    assert!(report.succeeded());
    assert_eq!(report.total_applied(), 0);
    assert!(sink.batches().is_empty(), "idempotent run must not reach the sink");

    let report = write(&env, &f, "docs", &[("a", "1"), ("b", "3")]).await;
    assert!(report.succeeded());
    assert_eq!(sink.log(), vec![("b".to_string(), Applied::Upsert)]);
    assert_eq!(sink.rows(), expected(&[("a", "1"), ("b", "3")]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_declaration_is_deleted() {
    let env = temp_env();
    let sink = TableSink::new();
    let handle = table(&env, &sink);
    let f = writer(&env, &handle);

    write(&env, &f, "docs", &[("a", "1"), ("b", "2")]).await;
    sink.clear_log();
    let report = write(&env, &f, "docs", &[("a", "1")]).await;
    assert!(report.succeeded());
    assert_eq!(sink.log(), vec![("b".to_string(), Applied::Delete)]);
    assert_eq!(sink.rows(), expected(&[("a", "1")]));

    let tracked = env.records().tracked_effects(Some("table")).unwrap();
    assert_eq!(tracked.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_scopes_declaring_one_key_conflict() {
    let env = temp_env();
    let sink = TableSink::new();
    let handle = table(&env, &sink);
    let f = writer(&env, &handle);

    let g = f.clone();
    let report = env
        .run(move |ctx| async move {
            ctx.mount("left", &g, vec![("k".to_string(), "L".to_string())])
                .result()
                .await?;
            let _ = ctx
                .mount("right", &g, vec![("k".to_string(), "R".to_string())])
                .result()
                .await;
            anyhow::Ok(())
        })
        .await;

    let right = ScopePath::parse("/right").unwrap();
    assert!(matches!(
        report.failure_at(&right),
        Some(EngineError::ReconcileConflict { .. })
    ));
    assert_eq!(sink.rows(), expected(&[("k", "L")]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_key_moves_between_scopes_in_one_run() {
    let env = temp_env();
    let sink = TableSink::new();
    let handle = table(&env, &sink);
    let f = writer(&env, &handle);

    write(&env, &f, "old", &[("k", "1")]).await;
    sink.clear_log();

    let report = write(&env, &f, "new", &[("k", "2")]).await;
    assert!(report.succeeded(), "{:?}", report.failures);
    assert_eq!(sink.log(), vec![("k".to_string(), Applied::Upsert)]);
    assert_eq!(sink.rows(), expected(&[("k", "2")]));

    let tracked = env.records().tracked_effects(None).unwrap();
    assert_eq!(tracked[0].owner, ScopePath::parse("/new").unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batches_respect_max_batch_size() {
    let store = shared_store();
    let mut config = SettleConfig::default();
    config.runner.max_batch_size = 2;
    config.storage.temporary = true;
    let env = env_over(&store, config);
    let sink = TableSink::new();
    let handle = table(&env, &sink);
    let f = writer(&env, &handle);

    let rows: Vec<(&str, &str)> = vec![("a", "1"), ("b", "1"), ("c", "1"), ("d", "1"), ("e", "1")];
    let report = write(&env, &f, "bulk", &rows).await;
    assert!(report.succeeded());
    assert_eq!(sink.batches(), vec![2, 2, 1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_apply_keeps_scope_uncommitted() {
    let env = temp_env();
    let sink = TableSink::new();
    let handle = table(&env, &sink);
    let f = writer(&env, &handle);

    sink.fail_key("b");
    let report = write(&env, &f, "docs", &[("a", "1"), ("b", "2")]).await;
    let docs = ScopePath::parse("/docs").unwrap();
    assert!(matches!(
        report.failure_at(&docs),
        Some(EngineError::SinkApplyError { provider, .. }) if provider == "table"
    ));
    assert_eq!(sink.rows(), expected(&[("a", "1")]));
    let pending: Vec<_> = env
        .records()
        .tracked_effects(Some("table"))
        .unwrap()
        .into_iter()
        .filter(|e| e.pending)
        .collect();
    assert_eq!(pending.len(), 1);

    // The memo entry was not committed, so the scope runs again and the
    // uncertain row is upserted rather than created.
    sink.heal();
    sink.clear_log();
    let report = write(&env, &f, "docs", &[("a", "1"), ("b", "2")]).await;
    assert!(report.succeeded(), "{:?}", report.failures);
    assert_eq!(report.executed, 1);
    assert_eq!(sink.log(), vec![("b".to_string(), Applied::Upsert)]);
    assert!(env
        .records()
        .tracked_effects(None)
        .unwrap()
        .iter()
        .all(|e| !e.pending));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_declaring_unknown_provider_fails() {
    let env = temp_env();
    let f = env
        .define_sync(FunctionSpec::new("bad", "declare(nowhere)"), |ctx: &ScopeContext, _: ()| {
            ctx.declare(settle::Effect {
                key: settle::EffectKey::new("nowhere", "\"x\""),
                desired: settle::Desired::NonExistence,
            })?;
            Ok(())
        })
        .unwrap();

    let report = env
        .run(move |ctx| async move {
            let _ = ctx.mount("bad", &f, ()).result().await;
            anyhow::Ok(())
        })
        .await;
    let bad = ScopePath::parse("/bad").unwrap();
    assert!(matches!(
        report.failure_at(&bad),
        Some(EngineError::UnknownProvider(name)) if name == "nowhere"
    ));
}

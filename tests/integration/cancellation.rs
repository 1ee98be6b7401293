//! Cancelled and fail-fast runs commit nothing they should not

use super::test_utils::{env_over, shared_store, table, temp_env, TableSink};
use settle::config::SettleConfig;
use settle::store::Keyspace;
use settle::{EngineError, FunctionSpec, RunState, ScopeContext, ScopePath};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_run_commits_nothing() {
    let env = temp_env();
    let sink = TableSink::new();
    let rows = table(&env, &sink);

    let slow = env
        .define_async(
            FunctionSpec::new("slow_put", "declare; sleep"),
            move |ctx: ScopeContext, v: String| {
                let rows = rows.clone();
                async move {
                    ctx.declare(rows.exists(&"k".to_string(), v)?)?;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    anyhow::Ok(())
                }
            },
        )
        .unwrap();

    let handle = env.start(move |ctx| async move {
        ctx.mount("slow", &slow, "v".to_string()).result().await?;
        anyhow::Ok(())
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    assert!(sink.batches().is_empty());
    assert_eq!(env.records().count(Keyspace::MemoEntries).unwrap(), 0);
    assert_eq!(env.records().count(Keyspace::ScopeRecords).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scope_can_observe_cancellation() {
    let env = temp_env();
    let watcher = env
        .define_async(
            FunctionSpec::new("watcher", "await cancelled"),
            |ctx: ScopeContext, _: ()| async move {
                ctx.cancelled().await;
                anyhow::Ok(ctx.is_cancelled())
            },
        )
        .unwrap();

    let handle = env.start(move |ctx| async move {
        let _ = ctx.mount("w", &watcher, ()).result().await;
        anyhow::Ok(())
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fail_fast_cancels_siblings() {
    let store = shared_store();
    let mut config = SettleConfig::default();
    config.runner.fail_fast = true;
    let env = env_over(&store, config);

    let fails = env
        .define_sync(FunctionSpec::new("fails", "bail"), |_: &ScopeContext, _: ()| -> anyhow::Result<()> {
            anyhow::bail!("nope")
        })
        .unwrap();
    let sleeps = env
        .define_async(
            FunctionSpec::new("sleeps", "sleep 30s"),
            |_ctx: ScopeContext, _: ()| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                anyhow::Ok(())
            },
        )
        .unwrap();

    let run = env.run(move |ctx| async move {
        let slow = ctx.mount("slow", &sleeps, ());
        let _ = ctx.mount("bad", &fails, ()).result().await;
        let _ = slow.result().await;
        anyhow::Ok(())
    });
    let report = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap();

    assert_eq!(report.state, RunState::Failed);
    let bad = ScopePath::parse("/bad").unwrap();
    assert!(matches!(
        report.failure_at(&bad),
        Some(EngineError::FunctionFailed { .. })
    ));
    let slow = ScopePath::parse("/slow").unwrap();
    assert!(report.failure_at(&slow).is_none(), "cancellations are not failures");
}

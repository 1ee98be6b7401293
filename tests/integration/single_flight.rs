//! Concurrent identical invocations share one execution

use super::test_utils::{table, temp_env, TableSink};
use settle::{EngineError, FunctionSpec, ScopeContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_calls_execute_once() {
    let env = temp_env();
    let calls = Arc::new(AtomicUsize::new(0));
    let slow = {
        let calls = calls.clone();
        env.define_async(
            FunctionSpec::new("slow_square", "sleep; n * n"),
            move |_ctx: ScopeContext, n: u64| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    anyhow::Ok(n * n)
                }
            },
        )
        .unwrap()
    };

    let report = env
        .run(move |ctx| async move {
            let (a, b, c) = futures::join!(ctx.call(&slow, 7), ctx.call(&slow, 7), ctx.call(&slow, 7));
            assert_eq!((a?, b?, c?), (49, 49, 49));
            anyhow::Ok(())
        })
        .await;
    assert!(report.succeeded(), "{:?}", report.failures);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.executed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_waiters_share_a_failure() {
    let env = temp_env();
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = {
        let calls = calls.clone();
        env.define_async(
            FunctionSpec::new("always_fails", "sleep; bail"),
            move |_ctx: ScopeContext, _: u64| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Err::<u64, _>(anyhow::anyhow!("boom"))
                }
            },
        )
        .unwrap()
    };

    env.run(move |ctx| async move {
        let (a, b) = futures::join!(ctx.call(&failing, 1), ctx.call(&failing, 1));
        for result in [a, b] {
            assert!(matches!(
                result,
                Err(EngineError::FunctionFailed { message, .. }) if message.contains("boom")
            ));
        }
        anyhow::Ok(())
    })
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_distinct_scopes_do_not_share() {
    let env = temp_env();
    let calls = Arc::new(AtomicUsize::new(0));
    let count = {
        let calls = calls.clone();
        env.define_sync(FunctionSpec::new("count", "calls += 1"), move |_: &ScopeContext, n: u64| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(n)
        })
        .unwrap()
    };

    let report = env
        .run(move |ctx| async move {
            let a = ctx.mount("a", &count, 1);
            let b = ctx.mount("b", &count, 1);
            a.result().await?;
            b.result().await?;
            anyhow::Ok(())
        })
        .await;
    assert!(report.succeeded());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shared_declarations_survive_a_failing_leader() {
    let env = temp_env();
    let sink = TableSink::new();
    let rows = table(&env, &sink);
    let g_calls = Arc::new(AtomicUsize::new(0));

    let g = {
        let g_calls = g_calls.clone();
        env.define_async(FunctionSpec::new("put_k", "sleep; declare(k, v)"), move |ctx: ScopeContext, _: ()| {
            let (rows, g_calls) = (rows.clone(), g_calls.clone());
            async move {
                g_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                ctx.declare(rows.exists(&"k".to_string(), "v".to_string())?)?;
                anyhow::Ok(())
            }
        })
        .unwrap()
    };
    // Runs g first, then fails.
    let leader = {
        let g = g.clone();
        env.define_async(FunctionSpec::new("leader", "g(); bail"), move |ctx: ScopeContext, _: ()| {
            let g = g.clone();
            async move {
                ctx.call(&g, ()).await?;
                Err::<(), _>(anyhow::anyhow!("leader broke after g"))
            }
        })
        .unwrap()
    };
    // Joins g while it is running, then succeeds.
    let follower = {
        let g = g.clone();
        env.define_async(FunctionSpec::new("follower", "sleep; g()"), move |ctx: ScopeContext, _: ()| {
            let g = g.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.call(&g, ()).await?;
                anyhow::Ok(())
            }
        })
        .unwrap()
    };

    for _ in 0..2 {
        let (leader, follower) = (leader.clone(), follower.clone());
        let report = env
            .run(move |ctx| async move {
                let (first, second) = futures::join!(ctx.call(&leader, ()), ctx.call(&follower, ()));
                assert!(first.is_err());
                second?;
                anyhow::Ok(())
            })
            .await;
        assert!(report.succeeded(), "{:?}", report.failures);
    }

    assert_eq!(g_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.rows().get("k").map(String::as_str), Some("v"));
    assert_eq!(sink.batches(), vec![1], "second run reuses g without applying again");
}

//! Scopes that disappear take their effects with them

use super::test_utils::{table, temp_env, Applied, TableSink};
use settle::{FunctionSpec, ScopeContext, ScopePath};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread")]
async fn test_unmounted_scope_is_retracted() {
    let env = temp_env();
    let sink = TableSink::new();
    let rows = table(&env, &sink);

    let put = {
        let rows = rows.clone();
        env.define_sync(FunctionSpec::new("put", "declare(name, name)"), move |ctx: &ScopeContext, name: String| {
            ctx.declare(rows.exists(&name, name.clone())?)?;
            Ok(())
        })
        .unwrap()
    };

    let f = put.clone();
    let report = env
        .run(move |ctx| async move {
            let a = ctx.mount("a", &f, "a".to_string());
            let b = ctx.mount("b", &f, "b".to_string());
            a.result().await?;
            b.result().await?;
            anyhow::Ok(())
        })
        .await;
    assert!(report.succeeded());
    assert_eq!(sink.rows().len(), 2);

    sink.clear_log();
    let f = put.clone();
    let report = env
        .run(move |ctx| async move {
            ctx.mount("a", &f, "a".to_string()).result().await?;
            anyhow::Ok(())
        })
        .await;
    assert!(report.succeeded(), "{:?}", report.failures);
    let b = ScopePath::parse("/b").unwrap();
    assert_eq!(report.orphans_removed, vec![b.clone()]);
    assert_eq!(sink.log(), vec![("b".to_string(), Applied::Delete)]);
    assert!(env.records().scope_record(&b).unwrap().is_none());
    assert!(sink.rows().contains_key("a"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hit_parent_retains_nested_scopes() {
    let env = temp_env();
    let sink = TableSink::new();
    let rows = table(&env, &sink);

    let leaf = {
        let rows = rows.clone();
        env.define_sync(FunctionSpec::new("leaf", "declare(name, name)"), move |ctx: &ScopeContext, name: String| {
            ctx.declare(rows.exists(&name, name.clone())?)?;
            Ok(())
        })
        .unwrap()
    };
    let parent = {
        let leaf = leaf.clone();
        env.define_async(
            FunctionSpec::new("parent", "for n in names { mount(n, leaf, n) }"),
            move |ctx: ScopeContext, names: Vec<String>| {
                let leaf = leaf.clone();
                async move {
                    let handles: Vec<_> = names.iter().map(|n| ctx.mount(n, &leaf, n.clone())).collect();
                    for handle in handles {
                        handle.result().await?;
                    }
                    anyhow::Ok(())
                }
            },
        )
        .unwrap()
    };

    let names = vec!["x".to_string(), "y".to_string()];
    for expected_hits in [0, 1] {
        let p = parent.clone();
        let names = names.clone();
        let report = env
            .run(move |ctx| async move {
                ctx.mount("dir", &p, names).result().await?;
                anyhow::Ok(())
            })
            .await;
        assert!(report.succeeded(), "{:?}", report.failures);
        assert_eq!(report.cache_hits, expected_hits);
        assert!(report.orphans_removed.is_empty());
    }
    assert_eq!(sink.rows().len(), 2);
    assert!(env
        .records()
        .scope_record(&ScopePath::parse("/dir/x").unwrap())
        .unwrap()
        .is_some());

    // Dropping a child re-executes the parent, which orphans that child.
    let p = parent.clone();
    let report = env
        .run(move |ctx| async move {
            ctx.mount("dir", &p, vec!["x".to_string()]).result().await?;
            anyhow::Ok(())
        })
        .await;
    assert_eq!(report.orphans_removed, vec![ScopePath::parse("/dir/y").unwrap()]);
    assert_eq!(sink.rows().keys().cloned().collect::<Vec<_>>(), vec!["x".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_parent_does_not_orphan_children() {
    let env = temp_env();
    let sink = TableSink::new();
    let rows = table(&env, &sink);
    let broken = Arc::new(AtomicBool::new(false));

    let leaf = {
        let rows = rows.clone();
        env.define_sync(FunctionSpec::new("leaf", "declare(name, name)"), move |ctx: &ScopeContext, name: String| {
            ctx.declare(rows.exists(&name, name.clone())?)?;
            Ok(())
        })
        .unwrap()
    };
    let parent = {
        let leaf = leaf.clone();
        let broken = broken.clone();
        env.define_async(
            FunctionSpec::new("parent", "mount(child) unless broken"),
            move |ctx: ScopeContext, tag: u32| {
                let leaf = leaf.clone();
                let broken = broken.clone();
                async move {
                    if broken.load(Ordering::SeqCst) {
                        anyhow::bail!("parent broke");
                    }
                    ctx.mount("child", &leaf, "c".to_string()).result().await?;
                    anyhow::Ok(tag)
                }
            },
        )
        .unwrap()
    };

    let p = parent.clone();
    env.run(move |ctx| async move {
        ctx.mount("p", &p, 1u32).result().await?;
        anyhow::Ok(())
    })
    .await;
    assert_eq!(sink.rows().len(), 1);

    broken.store(true, Ordering::SeqCst);
    sink.clear_log();
    let p = parent.clone();
    let report = env
        .run(move |ctx| async move {
            let _ = ctx.mount("p", &p, 2u32).result().await;
            anyhow::Ok(())
        })
        .await;
    assert_eq!(report.failures.len(), 1);
    assert!(report.orphans_removed.is_empty());
    assert!(sink.log().is_empty());
    assert_eq!(sink.rows().len(), 1);
}

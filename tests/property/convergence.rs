//! External state converges to the last healthy run's declarations

use crate::test_utils::{table, temp_env, TableSink};
use proptest::prelude::*;
use proptest::test_runner::{Config, TestRunner};
use settle::{Desired, FunctionSpec, PrevState, Reconciler, ScopeContext, ValueAction, ValueReconciler};
use std::collections::BTreeMap;

const SCOPES: u8 = 3;

/// One run: desired rows (key -> value) and a key the sink rejects, if any.
fn step() -> impl Strategy<Value = (BTreeMap<u8, u8>, Option<u8>)> {
    (
        prop::collection::btree_map(0u8..8, 0u8..3, 0..6),
        prop::option::weighted(0.3, 0u8..8),
    )
}

fn rows_of(desired: &BTreeMap<u8, u8>) -> BTreeMap<String, String> {
    desired
        .iter()
        .map(|(k, v)| (format!("k{}", k), format!("v{}", v)))
        .collect()
}

/// Keys never move between scopes: key `k` always lives in scope `k % SCOPES`.
fn by_scope(desired: &BTreeMap<u8, u8>) -> BTreeMap<String, Vec<(String, String)>> {
    let mut scopes: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    for (k, v) in desired {
        scopes
            .entry(format!("s{}", k % SCOPES))
            .or_default()
            .push((format!("k{}", k), format!("v{}", v)));
    }
    scopes
}

#[test]
fn test_rows_converge_after_healthy_run() {
    let mut runner = TestRunner::new(Config {
        cases: 24,
        ..Config::default()
    });

    runner
        .run(&prop::collection::vec(step(), 1..6), |steps| {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let env = temp_env();
                let sink = TableSink::new();
                let handle = table(&env, &sink);
                let put = env
                    .define_sync(
                        FunctionSpec::new("put_rows", "for (k, v) in rows { declare(k, v) }"),
                        move |ctx: &ScopeContext, rows: Vec<(String, String)>| {
                            for (k, v) in &rows {
                                ctx.declare(handle.exists(k, v.clone())?)?;
                            }
                            Ok(())
                        },
                    )
                    .unwrap();

                let mut last = BTreeMap::new();
                for (desired, failing) in steps {
                    sink.heal();
                    if let Some(k) = failing {
                        sink.fail_key(&format!("k{}", k));
                    }
                    let scopes = by_scope(&desired);
                    let f = put.clone();
                    let report = env
                        .run(move |ctx| async move {
                            let handles: Vec<_> = scopes
                                .into_iter()
                                .map(|(scope, rows)| ctx.mount(&scope, &f, rows))
                                .collect();
                            for h in handles {
                                let _ = h.result().await;
                            }
                            anyhow::Ok(())
                        })
                        .await;
                    if report.failures.is_empty() {
                        assert_eq!(sink.rows(), rows_of(&desired));
                    }
                    last = desired;
                }

                // A final healthy repeat always converges.
                sink.heal();
                let scopes = by_scope(&last);
                let f = put.clone();
                let report = env
                    .run(move |ctx| async move {
                        for (scope, rows) in scopes {
                            ctx.mount(&scope, &f, rows).result().await?;
                        }
                        anyhow::Ok(())
                    })
                    .await;
                assert!(report.succeeded(), "{:?}", report.failures);
                assert_eq!(sink.rows(), rows_of(&last));
                assert!(env
                    .records()
                    .tracked_effects(None)
                    .unwrap()
                    .iter()
                    .all(|e| !e.pending));
            });
            Ok(())
        })
        .unwrap();
}

fn apply(resource: Option<u32>, action: Option<&ValueAction<u32>>) -> Option<u32> {
    match action {
        None => resource,
        Some(ValueAction::Create(v)) | Some(ValueAction::Upsert(v)) => Some(*v),
        Some(ValueAction::Delete) => None,
    }
}

fn desired_strategy() -> impl Strategy<Value = Desired<u32>> {
    prop_oneof![Just(Desired::NonExistence), (0u32..4).prop_map(Desired::Exists)]
}

/// One action reaches the desired state from every plausible prior state
#[test]
fn test_single_action_converges_under_ambiguity() {
    let mut runner = TestRunner::default();
    let reconciler: ValueReconciler<String, u32> = ValueReconciler::new();

    runner
        .run(
            &(
                prop::collection::vec(desired_strategy(), 1..4),
                any::<bool>(),
                desired_strategy(),
            ),
            |(priors, may_be_missing, desired)| {
                let prev = PrevState::ambiguous(priors.clone(), may_be_missing);
                let out = reconciler.reconcile(&"k".to_string(), &desired, &prev);
                prop_assert_eq!(&out.new_state, &desired);

                let mut starts: Vec<Option<u32>> = priors.iter().map(|p| p.value().copied()).collect();
                if may_be_missing {
                    starts.push(None);
                }
                for start in starts {
                    let end = apply(start, out.action.as_ref());
                    prop_assert_eq!(end, desired.value().copied());
                }
                if matches!(out.action, Some(ValueAction::Create(_))) {
                    prop_assert!(!may_be_missing);
                    prop_assert!(priors.iter().all(|p| p.is_non_existence()));
                }
                Ok(())
            },
        )
        .unwrap();
}

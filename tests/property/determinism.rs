//! Property-based tests for determinism guarantees

use proptest::prelude::*;
use settle::hashing::{compute_logic_fingerprint, compute_memo_key, structural_hash};
use settle::ScopePath;
use std::collections::BTreeMap;

/// Scope paths survive display and re-parse unchanged
#[test]
fn test_scope_path_roundtrip_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::collection::vec("[a-z0-9._-]{1,8}", 0..5), |segments| {
            let path = ScopePath::from_segments(segments.iter().map(String::as_str)).unwrap();
            let reparsed = ScopePath::parse(&path.to_string()).unwrap();
            prop_assert_eq!(&reparsed, &path);
            prop_assert_eq!(ScopePath::decode(&path.encode()).unwrap(), path);
            Ok(())
        })
        .unwrap();
}

/// Map insertion order never changes an input fingerprint
#[test]
fn test_structural_hash_ignores_insertion_order() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &prop::collection::vec(("[a-z]{1,4}", any::<i64>()), 0..8),
            |pairs| {
                let forward: BTreeMap<String, i64> = pairs.iter().cloned().collect();
                let mut json_forward = serde_json::Map::new();
                let mut json_reverse = serde_json::Map::new();
                for (k, v) in forward.iter() {
                    json_forward.insert(k.clone(), serde_json::json!(v));
                }
                for (k, v) in forward.iter().rev() {
                    json_reverse.insert(k.clone(), serde_json::json!(v));
                }
                let a = structural_hash(&serde_json::Value::Object(json_forward)).unwrap();
                let b = structural_hash(&serde_json::Value::Object(json_reverse)).unwrap();
                prop_assert_eq!(a, b);
                Ok(())
            },
        )
        .unwrap();
}

/// Memo keys separate scopes, functions, and logic versions
#[test]
fn test_memo_key_separation_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &("[a-z]{1,6}", "[a-z]{1,6}", any::<[u8; 32]>()),
            |(scope, function, input)| {
                let path = ScopePath::parse(&scope).unwrap();
                let other = path.child("x").unwrap();
                prop_assert_ne!(
                    compute_memo_key(&path, &function, &input),
                    compute_memo_key(&other, &function, &input)
                );
                prop_assert_ne!(
                    compute_logic_fingerprint(&function, Some(1)),
                    compute_logic_fingerprint(&function, Some(2))
                );
                Ok(())
            },
        )
        .unwrap();
}

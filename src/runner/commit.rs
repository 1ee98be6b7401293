//! Commit wave
//!
//! Runs once all mounted work has settled. Works out which persisted scopes
//! executed, were retained, or became orphans; synthesizes `NonExistence` for
//! effect keys nobody produces any more; reconciles and applies every effect,
//! one apply wave per provider; then commits memo entries and scope records
//! for the scopes whose effects all landed.

use crate::effect::provider::{BoxedAction, ErasedProvider};
use crate::effect::{Desired, EffectKey};
use crate::error::{EngineError, StorageError};
use crate::runner::context::FrameState;
use crate::runner::run::RunShared;
use crate::scope::{ScopeOutcome, ScopePath};
use crate::store::{Records, ScopeRecord, TrackedEffect};
use crate::types::now_millis;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub(crate) struct CommitSummary {
    pub applied: BTreeMap<String, usize>,
    pub orphans_removed: Vec<ScopePath>,
}

enum PlanKind {
    Executed(FrameState),
    Orphan,
}

struct ScopePlan {
    kind: PlanKind,
    prior: Option<ScopeRecord>,
}

/// One key to reconcile, and the scope answerable for it.
struct WorkItem {
    key: EffectKey,
    owner: ScopePath,
    desired: Desired<Value>,
    /// Declared this run, as opposed to synthesized on release.
    live: bool,
}

/// An action handed to a sink, with what is needed to settle its record.
struct InFlight {
    key: EffectKey,
    owner: ScopePath,
    new_state: Desired<Value>,
    intent_raw: Option<Vec<u8>>,
}

#[derive(Default)]
struct ProviderOutcome {
    applied: usize,
    failures: Vec<(ScopePath, EngineError)>,
}

pub(crate) async fn commit_wave(run: &RunShared) -> Result<CommitSummary, EngineError> {
    let records = &run.env.records;
    let prior: BTreeMap<ScopePath, ScopeRecord> = records
        .scope_records_under(&ScopePath::root())?
        .into_iter()
        .map(|r| (r.path.clone(), r))
        .collect();

    let plans = collect_plans(run, &prior);

    // Keys each executed or orphaned scope gives up, by key.
    let mut released: BTreeMap<EffectKey, ScopePath> = BTreeMap::new();
    for (path, plan) in &plans {
        let Some(record) = &plan.prior else { continue };
        let live = match &plan.kind {
            PlanKind::Executed(state) => state.live_keys(),
            PlanKind::Orphan => BTreeSet::new(),
        };
        for key in record.effect_keys.difference(&live) {
            released.insert(key.clone(), path.clone());
        }
    }

    let mut items: BTreeMap<EffectKey, WorkItem> = BTreeMap::new();
    for (path, plan) in &plans {
        if let PlanKind::Executed(state) = &plan.kind {
            for (key, desired) in &state.declared {
                items.insert(
                    key.clone(),
                    WorkItem {
                        key: key.clone(),
                        owner: path.clone(),
                        desired: desired.clone(),
                        live: true,
                    },
                );
            }
        }
    }
    for (key, path) in &released {
        // A live declaration elsewhere takes the key over instead.
        items.entry(key.clone()).or_insert_with(|| WorkItem {
            key: key.clone(),
            owner: path.clone(),
            desired: Desired::NonExistence,
            live: false,
        });
    }

    let mut failed: BTreeMap<ScopePath, EngineError> = BTreeMap::new();
    let mut by_provider: BTreeMap<String, (Arc<dyn ErasedProvider>, Vec<WorkItem>)> = BTreeMap::new();
    for item in items.into_values() {
        match check_ownership(records, &prior, &released, &item) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                failed.entry(item.owner.clone()).or_insert(err);
                continue;
            }
        }
        match run.env.providers.get(&item.key.provider) {
            Some(provider) => by_provider
                .entry(item.key.provider.clone())
                .or_insert_with(|| (provider, Vec::new()))
                .1
                .push(item),
            None => {
                let err = EngineError::UnknownProvider(item.key.provider.clone());
                failed.entry(item.owner.clone()).or_insert(err);
            }
        }
    }

    // A scope that cannot commit applies nothing.
    for (_, list) in by_provider.values_mut() {
        list.retain(|item| !failed.contains_key(&item.owner));
    }

    let max_batch = run.env.config.runner.max_batch_size.max(1);
    let mut waves: FuturesUnordered<_> = by_provider
        .into_iter()
        .filter(|(_, (_, list))| !list.is_empty())
        .map(|(name, (provider, list))| async move {
            let outcome = flush_provider(records, provider.as_ref(), list, max_batch).await;
            (name, outcome)
        })
        .collect();

    let mut summary = CommitSummary::default();
    let mut fatal: Option<EngineError> = None;
    while let Some((name, outcome)) = waves.next().await {
        match outcome {
            Ok(outcome) => {
                if outcome.applied > 0 {
                    summary.applied.insert(name, outcome.applied);
                }
                for (path, err) in outcome.failures {
                    failed.entry(path).or_insert(err);
                }
            }
            Err(err) => {
                fatal.get_or_insert(err);
            }
        }
    }
    if let Some(err) = fatal {
        return Err(err);
    }

    for (path, plan) in plans {
        let failure = failed.remove(&path);
        match (plan.kind, failure) {
            (PlanKind::Executed(state), None) => {
                if let Err(err) = commit_executed(records, &path, plan.prior.as_ref(), &state) {
                    fail_or_abort(run, records, &path, plan.prior.as_ref(), &state, err)?;
                }
            }
            (PlanKind::Executed(state), Some(err)) => {
                fail_or_abort(run, records, &path, plan.prior.as_ref(), &state, err)?;
            }
            (PlanKind::Orphan, None) => {
                if let Some(record) = &plan.prior {
                    for memo_key in &record.memo_keys {
                        records.remove_memo_entry(memo_key)?;
                    }
                }
                records.remove_scope_record(&path)?;
                debug!(path = %path, "Removed orphaned scope");
                summary.orphans_removed.push(path);
            }
            (PlanKind::Orphan, Some(err)) => {
                // Partly retracted: a later remount must execute again.
                if let Some(mut record) = plan.prior {
                    for memo_key in &record.memo_keys {
                        records.remove_memo_entry(memo_key)?;
                    }
                    record.memo_keys.clear();
                    records.put_scope_record(&record)?;
                }
                run.record_commit_failure(&path, err);
            }
        }
    }
    // Failures on keys whose owner is not a planned scope (retained owners).
    for (path, err) in failed {
        run.record_commit_failure(&path, err);
    }

    if run.env.config.storage.flush_on_commit {
        records.flush()?;
    }

    info!(
        run_id = %run.run_id,
        applied = summary.applied.values().sum::<usize>(),
        providers = summary.applied.len(),
        orphans_removed = summary.orphans_removed.len(),
        "Commit wave finished"
    );
    Ok(summary)
}

/// Executed scopes and orphans. Hit, failed, and cancelled scopes and the
/// subtrees they retain are left untouched.
fn collect_plans(run: &RunShared, prior: &BTreeMap<ScopePath, ScopeRecord>) -> BTreeMap<ScopePath, ScopePlan> {
    let mut plans = BTreeMap::new();

    let frames: Vec<(ScopePath, FrameState)> = run
        .frames
        .lock()
        .iter()
        .filter(|(path, _)| run.mounts.outcome(path) == Some(ScopeOutcome::Executed))
        .map(|(path, buffer)| (path.clone(), std::mem::take(&mut *buffer.lock())))
        .collect();
    for (path, state) in frames {
        let record = prior.get(&path).cloned();
        plans.insert(
            path,
            ScopePlan {
                kind: PlanKind::Executed(state),
                prior: record,
            },
        );
    }

    for (path, record) in prior {
        if run.mounts.is_orphan(path) {
            plans.insert(
                path.clone(),
                ScopePlan {
                    kind: PlanKind::Orphan,
                    prior: Some(record.clone()),
                },
            );
        }
    }
    plans
}

/// Whether `item` may be reconciled by its owner
///
/// A key tracked under another scope may only move if that scope releases
/// it. A release of a key that has already moved to another scope is
/// dropped (`Ok(false)`).
fn check_ownership(
    records: &Records,
    prior: &BTreeMap<ScopePath, ScopeRecord>,
    released: &BTreeMap<EffectKey, ScopePath>,
    item: &WorkItem,
) -> Result<bool, EngineError> {
    let Some(tracked) = records.tracked_effect(&item.key)? else {
        return Ok(true);
    };
    let owner = &tracked.value.owner;
    if *owner == item.owner || released.get(&item.key) == Some(owner) {
        return Ok(true);
    }
    if !item.live {
        debug!(key = %item.key, owner = %owner, "Released key already handed over");
        return Ok(false);
    }
    let still_claimed = prior
        .get(owner)
        .map_or(false, |r| r.effect_keys.contains(&item.key));
    if still_claimed {
        warn!(key = %item.key, owner = %owner, claimant = %item.owner, "Effect key owned by another scope");
        return Err(EngineError::ReconcileConflict {
            key: item.key.clone(),
            first: owner.clone(),
            second: item.owner.clone(),
        });
    }
    Ok(true)
}

/// Turn a storage error into a scope failure, or abort on anything but a lost race.
fn scoped(err: StorageError, owner: &ScopePath, failures: &mut Vec<(ScopePath, EngineError)>) -> Result<(), EngineError> {
    match err {
        StorageError::CasConflict { .. } => {
            failures.push((owner.clone(), EngineError::Storage(err)));
            Ok(())
        }
        other => Err(EngineError::Storage(other)),
    }
}

fn settled_record(key: &EffectKey, owner: &ScopePath, state: Desired<Value>) -> Option<TrackedEffect> {
    match state {
        Desired::NonExistence => None,
        state => Some(TrackedEffect::settled(key.clone(), owner.clone(), state)),
    }
}

async fn flush_provider(
    records: &Records,
    provider: &dyn ErasedProvider,
    items: Vec<WorkItem>,
    max_batch: usize,
) -> Result<ProviderOutcome, EngineError> {
    let mut outcome = ProviderOutcome::default();
    let mut queue: Vec<(InFlight, BoxedAction)> = Vec::new();

    for item in items {
        let current = records.tracked_effect(&item.key)?;
        let prev = TrackedEffect::prev_state(current.as_ref().map(|v| &v.value));
        let planned = match provider.reconcile(&item.key, &item.desired, prev) {
            Ok(planned) => planned,
            Err(err) => {
                outcome.failures.push((item.owner, err));
                continue;
            }
        };
        let expected = current.as_ref().map(|v| v.raw());

        match planned.action {
            None => {
                let settled = settled_record(&item.key, &item.owner, planned.new_state);
                let unchanged = match (&current, &settled) {
                    (None, None) => true,
                    (Some(cur), Some(new)) => {
                        !cur.value.pending
                            && cur.value.owner == new.owner
                            && cur.value.possible_states == new.possible_states
                    }
                    _ => false,
                };
                if !unchanged {
                    if let Err(err) = records.swap_tracked_effect(&item.key, expected, settled.as_ref()) {
                        scoped(err, &item.owner, &mut outcome.failures)?;
                    }
                }
            }
            Some(action) => {
                let intent = TrackedEffect::intent(
                    current.as_ref().map(|v| &v.value),
                    item.key.clone(),
                    item.owner.clone(),
                    planned.new_state.clone(),
                );
                match records.swap_tracked_effect(&item.key, expected, Some(&intent)) {
                    Ok(intent_raw) => queue.push((
                        InFlight {
                            key: item.key,
                            owner: item.owner,
                            new_state: planned.new_state,
                            intent_raw,
                        },
                        action,
                    )),
                    Err(err) => scoped(err, &item.owner, &mut outcome.failures)?,
                }
            }
        }
    }

    while !queue.is_empty() {
        let rest = queue.split_off(max_batch.min(queue.len()));
        let chunk = std::mem::replace(&mut queue, rest);
        let (in_flight, actions): (Vec<InFlight>, Vec<BoxedAction>) = chunk.into_iter().unzip();

        debug!(provider = %provider.name(), batch = actions.len(), "Applying batch");
        let result = provider.apply(actions).await;

        for (index, item) in in_flight.into_iter().enumerate() {
            if let Err(apply_err) = &result {
                if apply_err.affects(index) {
                    warn!(
                        provider = %provider.name(),
                        key = %item.key,
                        error = %apply_err,
                        "Apply failed, intent left pending"
                    );
                    outcome.failures.push((
                        item.owner,
                        EngineError::SinkApplyError {
                            provider: provider.name().to_string(),
                            key: item.key,
                            message: apply_err.message.clone(),
                        },
                    ));
                    continue;
                }
            }
            let settled = settled_record(&item.key, &item.owner, item.new_state);
            match records.swap_tracked_effect(&item.key, item.intent_raw.as_deref(), settled.as_ref()) {
                Ok(_) => outcome.applied += 1,
                Err(err) => scoped(err, &item.owner, &mut outcome.failures)?,
            }
        }
    }

    Ok(outcome)
}

fn commit_executed(
    records: &Records,
    path: &ScopePath,
    prior: Option<&ScopeRecord>,
    state: &FrameState,
) -> Result<(), StorageError> {
    for staged in state.staged.values() {
        records.swap_memo_entry(
            &staged.entry.memo_key,
            staged.expected.as_deref(),
            Some(&staged.entry),
        )?;
    }
    if let Some(prior) = prior {
        for stale in prior.memo_keys.difference(&state.memo_keys) {
            records.remove_memo_entry(stale)?;
        }
    }
    records.put_scope_record(&ScopeRecord {
        path: path.clone(),
        memo_keys: state.memo_keys.clone(),
        effect_keys: state.live_keys(),
        updated_at_ms: now_millis(),
    })
}

/// Keep ownership of every key the scope may have touched and drop its memo
/// entries: some of its effects may have landed, so none of its results can
/// be reused.
fn fail_or_abort(
    run: &RunShared,
    records: &Records,
    path: &ScopePath,
    prior: Option<&ScopeRecord>,
    state: &FrameState,
    err: impl Into<EngineError>,
) -> Result<(), EngineError> {
    let err = err.into();
    if err.is_fatal() {
        return Err(err);
    }
    let mut record = prior
        .cloned()
        .unwrap_or_else(|| ScopeRecord::new(path.clone()));
    for memo_key in record.memo_keys.iter().chain(state.memo_keys.iter()) {
        records.remove_memo_entry(memo_key)?;
    }
    record.memo_keys.clear();
    record.effect_keys.extend(state.live_keys());
    record.updated_at_ms = now_millis();
    records.put_scope_record(&record)?;
    run.record_commit_failure(path, err);
    Ok(())
}

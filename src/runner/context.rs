//! Scope context: what a function body sees while it runs
//!
//! A [`ScopeContext`] is bound to one scope path of one run. Through it a body
//! mounts child scopes, makes memoized calls, and declares effects. Effects and
//! memo bookkeeping accumulate in a buffer that is only merged into the
//! scope's frame when the invocation that produced them succeeds.

use crate::effect::{Desired, Effect, EffectKey};
use crate::error::EngineError;
use crate::hashing::compute_memo_key;
use crate::logic::FunctionSpec;
use crate::memo::{
    evaluate, identify, validators_of, InputIdentity, MemoDecision, MemoEntry, MemoInput, MissReason,
};
use crate::runner::cancel::CancelToken;
use crate::runner::run::RunShared;
use crate::scope::{ScopeOutcome, ScopePath};
use crate::store::Versioned;
use crate::types::{now_millis, LogicFingerprint, MemoKey};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// A memo entry waiting for its scope's effects to apply.
#[derive(Debug, Clone)]
pub(crate) struct StagedEntry {
    pub entry: MemoEntry,
    /// Raw bytes of the entry this one replaces.
    pub expected: Option<Vec<u8>>,
}

/// Everything one invocation (or a whole scope) declared and used.
#[derive(Debug, Clone, Default)]
pub(crate) struct FrameState {
    pub declared: BTreeMap<EffectKey, Desired<Value>>,
    pub retained: BTreeSet<EffectKey>,
    pub memo_keys: BTreeSet<MemoKey>,
    pub staged: BTreeMap<MemoKey, StagedEntry>,
}

impl FrameState {
    /// Declared and retained keys: what the scope owns after commit.
    pub fn live_keys(&self) -> BTreeSet<EffectKey> {
        self.declared
            .keys()
            .cloned()
            .chain(self.retained.iter().cloned())
            .collect()
    }

    fn absorb(&mut self, other: FrameState) {
        self.declared.extend(other.declared);
        self.retained.extend(other.retained);
        self.memo_keys.extend(other.memo_keys);
        self.staged.extend(other.staged);
    }
}

pub(crate) type FrameBuffer = Arc<Mutex<FrameState>>;

/// Outcome shared by every caller of one memo key
///
/// `produced` is what the invocation contributes to its scope. Each caller
/// that succeeds merges it into its own buffer, so the declarations survive
/// even if the caller that ran the body later fails.
#[derive(Debug, Clone)]
pub(crate) struct FlightValue {
    pub result: Value,
    pub produced: FrameState,
    pub hit: bool,
}

type AsyncBody<A, R> = dyn Fn(ScopeContext, A) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync;
type SyncBody<A, R> = dyn Fn(&ScopeContext, A) -> anyhow::Result<R> + Send + Sync;

enum Body<A, R> {
    Async(Box<AsyncBody<A, R>>),
    Sync(Arc<SyncBody<A, R>>),
}

struct FnInner<A, R> {
    spec: FunctionSpec,
    fingerprint: LogicFingerprint,
    body: Body<A, R>,
}

/// A registered function that can be mounted or called
pub struct MemoFn<A, R> {
    inner: Arc<FnInner<A, R>>,
}

impl<A, R> Clone for MemoFn<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, R> MemoFn<A, R>
where
    A: MemoInput + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new_async<F, Fut>(spec: FunctionSpec, fingerprint: LogicFingerprint, body: F) -> Self
    where
        F: Fn(ScopeContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let body: Box<AsyncBody<A, R>> = Box::new(
            move |ctx: ScopeContext, args: A| -> BoxFuture<'static, anyhow::Result<R>> {
                Box::pin(body(ctx, args))
            },
        );
        Self {
            inner: Arc::new(FnInner {
                spec,
                fingerprint,
                body: Body::Async(body),
            }),
        }
    }

    pub(crate) fn new_sync<F>(spec: FunctionSpec, fingerprint: LogicFingerprint, body: F) -> Self
    where
        F: Fn(&ScopeContext, A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FnInner {
                spec,
                fingerprint,
                body: Body::Sync(Arc::new(body)),
            }),
        }
    }
}

impl<A, R> MemoFn<A, R> {
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn spec(&self) -> &FunctionSpec {
        &self.inner.spec
    }

    pub fn fingerprint(&self) -> LogicFingerprint {
        self.inner.fingerprint
    }

    pub fn is_memo(&self) -> bool {
        self.inner.spec.memo
    }
}

enum HandleState<R> {
    Pending(oneshot::Receiver<Result<R, EngineError>>),
    Failed(EngineError),
}

/// Result of a mount, available once the mounted body finishes.
pub struct MountHandle<R> {
    path: ScopePath,
    state: HandleState<R>,
}

impl<R> MountHandle<R> {
    fn failed(path: ScopePath, err: EngineError) -> Self {
        Self {
            path,
            state: HandleState::Failed(err),
        }
    }

    pub fn path(&self) -> &ScopePath {
        &self.path
    }

    pub async fn result(self) -> Result<R, EngineError> {
        match self.state {
            HandleState::Failed(err) => Err(err),
            HandleState::Pending(rx) => rx
                .await
                .unwrap_or_else(|_| Err(EngineError::Cancelled(self.path))),
        }
    }

    /// Wait from a sync body running on the blocking pool.
    pub fn blocking_result(self) -> Result<R, EngineError> {
        match self.state {
            HandleState::Failed(err) => Err(err),
            HandleState::Pending(rx) => rx
                .blocking_recv()
                .unwrap_or_else(|_| Err(EngineError::Cancelled(self.path))),
        }
    }
}

/// Handle to the current scope of a running function body
#[derive(Clone)]
pub struct ScopeContext {
    run: Arc<RunShared>,
    path: ScopePath,
    buffer: FrameBuffer,
    cancel: CancelToken,
}

impl ScopeContext {
    pub(crate) fn root(run: Arc<RunShared>) -> Self {
        let path = ScopePath::root();
        let claimed = run.mounts.claim(&path);
        debug_assert!(claimed.is_ok(), "root claimed twice in one run");
        let buffer = FrameBuffer::default();
        run.frames.lock().insert(path.clone(), buffer.clone());
        let cancel = run.root_cancel.clone();
        Self {
            run,
            path,
            buffer,
            cancel,
        }
    }

    pub fn path(&self) -> &ScopePath {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when this scope's work is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Mount `f(args)` at the child scope `segment`
    ///
    /// The body starts immediately on its own task. Mounting a path already
    /// mounted in this run fails the new handle with `DuplicateMount`.
    pub fn mount<A, R>(&self, segment: &str, f: &MemoFn<A, R>, args: A) -> MountHandle<R>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        match self.path.child(segment) {
            Ok(path) => self.mount_at(path, f, args),
            Err(err) => MountHandle::failed(self.path.clone(), err),
        }
    }

    /// Mount at a multi-segment path relative to this scope, e.g. `"docs/a.md"`.
    pub fn mount_path<A, R>(&self, relative: &str, f: &MemoFn<A, R>, args: A) -> MountHandle<R>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        match ScopePath::parse(relative) {
            Ok(rel) if !rel.is_root() => self.mount_at(self.path.join(&rel), f, args),
            Ok(_) => MountHandle::failed(
                self.path.clone(),
                EngineError::InvalidPath("empty relative mount path".to_string()),
            ),
            Err(err) => MountHandle::failed(self.path.clone(), err),
        }
    }

    fn mount_at<A, R>(&self, path: ScopePath, f: &MemoFn<A, R>, args: A) -> MountHandle<R>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        if let Err(err) = self.run.mounts.claim(&path) {
            self.run.record_failure(&path, &err);
            return MountHandle::failed(path, err);
        }

        let child = ScopeContext {
            run: self.run.clone(),
            path: path.clone(),
            buffer: FrameBuffer::default(),
            cancel: self.cancel.child(),
        };
        self.run
            .frames
            .lock()
            .insert(path.clone(), child.buffer.clone());

        let (tx, rx) = oneshot::channel();
        let f = f.clone();
        self.run.tasks.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = child.cancel.cancelled() => Err(EngineError::Cancelled(child.path.clone())),
                result = child.invoke(&f, args) => result,
            };
            let result = match outcome {
                Ok((value, hit)) => {
                    let o = if hit {
                        ScopeOutcome::Hit
                    } else {
                        ScopeOutcome::Executed
                    };
                    child.run.mounts.set_outcome(&child.path, o);
                    Ok(value)
                }
                Err(err) => {
                    let o = if err.is_cancelled() {
                        ScopeOutcome::Cancelled
                    } else {
                        ScopeOutcome::Failed
                    };
                    child.run.mounts.set_outcome(&child.path, o);
                    // Children still running are abandoned with their parent.
                    child.cancel.cancel();
                    child.run.record_failure(&child.path, &err);
                    Err(err)
                }
            };
            let _ = tx.send(result);
        });

        MountHandle {
            path,
            state: HandleState::Pending(rx),
        }
    }

    /// Memoized call of `f(args)` within this scope.
    pub async fn call<A, R>(&self, f: &MemoFn<A, R>, args: A) -> Result<R, EngineError>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        self.invoke(f, args).await.map(|(value, _)| value)
    }

    /// [`call`](Self::call) from a sync body running on the blocking pool.
    pub fn call_blocking<A, R>(&self, f: &MemoFn<A, R>, args: A) -> Result<R, EngineError>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| EngineError::FunctionFailed {
            path: self.path.clone(),
            function: f.name().to_string(),
            message: format!("no runtime available for a blocking call: {e}"),
        })?;
        handle.block_on(self.call(f, args))
    }

    /// Declare the desired state of one external resource
    ///
    /// A key declared by another scope in this run is a `ReconcileConflict`;
    /// redeclaring within the same scope replaces the desired value.
    pub fn declare(&self, effect: Effect) -> Result<(), EngineError> {
        if !self.run.env.providers.contains(&effect.key.provider) {
            return Err(EngineError::UnknownProvider(effect.key.provider));
        }
        {
            let mut owners = self.run.owners.lock();
            match owners.get(&effect.key) {
                Some(first) if *first != self.path => {
                    return Err(EngineError::ReconcileConflict {
                        key: effect.key,
                        first: first.clone(),
                        second: self.path.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    owners.insert(effect.key.clone(), self.path.clone());
                }
            }
        }
        self.buffer.lock().declared.insert(effect.key, effect.desired);
        Ok(())
    }

    /// Convert a body's error, keeping engine errors it propagated as-is.
    pub(crate) fn body_error(&self, function: &str, err: anyhow::Error) -> EngineError {
        match err.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(err) => EngineError::FunctionFailed {
                path: self.path.clone(),
                function: function.to_string(),
                message: format!("{err:#}"),
            },
        }
    }

    /// Run `f(args)` with memoization. The flag reports a memo hit.
    async fn invoke<A, R>(&self, f: &MemoFn<A, R>, args: A) -> Result<(R, bool), EngineError>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled(self.path.clone()));
        }
        if !self.run.env.logic.is_registered(&f.inner.fingerprint) {
            return Err(EngineError::FingerprintNotRegistered(f.inner.fingerprint));
        }

        if !f.inner.spec.memo {
            let (value, state) = self.execute(f, args).await?;
            self.buffer.lock().absorb(state);
            return Ok((value, false));
        }

        let identity = identify(&args)
            .map_err(|e| EngineError::codec(format!("arguments of '{}'", f.name()), e))?;
        let memo_key = compute_memo_key(&self.path, f.name(), &identity.key);

        let flight = self
            .run
            .flights
            .run(memo_key, || self.resolve(f, memo_key, identity, args));
        let (outcome, _) = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled(self.path.clone())),
            out = flight => out,
        };
        let value = outcome?;
        self.buffer.lock().absorb(value.produced);

        let result = serde_json::from_value(value.result)
            .map_err(|e| EngineError::codec(format!("result of '{}'", f.name()), e))?;
        Ok((result, value.hit))
    }

    /// Leader side of a memoized invocation: decide, then reuse or execute.
    async fn resolve<A, R>(
        &self,
        f: &MemoFn<A, R>,
        memo_key: MemoKey,
        identity: InputIdentity,
        args: A,
    ) -> Result<FlightValue, EngineError>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let records = &self.run.env.records;
        let prior = records.memo_entry(&memo_key)?;

        let decision = {
            let validators = validators_of(&args);
            evaluate(
                prior.as_ref().map(|p| &p.value),
                &f.inner.fingerprint,
                &identity.fingerprint,
                &validators,
            )
            .map_err(|e| EngineError::StateValidatorError {
                path: self.path.clone(),
                message: format!("{e:#}"),
            })?
        };

        let (reason, states) = match decision {
            MemoDecision::Reuse {
                states,
                states_changed,
            } => {
                if let Some(prior) = prior.as_ref() {
                    return self.reuse(f.name(), memo_key, prior, states, states_changed);
                }
                (MissReason::NoEntry, states)
            }
            MemoDecision::Execute { reason, states } => (reason, states),
        };

        debug!(
            path = %self.path,
            function = %f.name(),
            memo_key = %memo_key.short(),
            reason = reason.as_str(),
            "Memo miss, executing"
        );

        let (value, mut state) = self.execute(f, args).await?;
        let result = serde_json::to_value(&value)
            .map_err(|e| EngineError::codec(format!("result of '{}'", f.name()), e))?;

        let entry = MemoEntry {
            memo_key,
            path: self.path.clone(),
            function: f.name().to_string(),
            logic_fingerprint: f.inner.fingerprint,
            input_fingerprint: identity.fingerprint,
            states,
            result: result.clone(),
            effect_keys: state.live_keys(),
            nested_memo_keys: state.memo_keys.clone(),
            committed_at_ms: now_millis(),
        };
        state.memo_keys.insert(memo_key);
        state.staged.insert(
            memo_key,
            StagedEntry {
                entry,
                expected: prior.map(|p| p.raw().to_vec()),
            },
        );

        Ok(FlightValue {
            result,
            produced: state,
            hit: false,
        })
    }

    fn reuse(
        &self,
        function: &str,
        memo_key: MemoKey,
        prior: &Versioned<MemoEntry>,
        states: Vec<Value>,
        states_changed: bool,
    ) -> Result<FlightValue, EngineError> {
        let entry = &prior.value;
        if states_changed {
            let mut updated = entry.clone();
            updated.states = states;
            self.run
                .env
                .records
                .swap_memo_entry(&memo_key, Some(prior.raw()), Some(&updated))?;
        }

        let mut produced = FrameState::default();
        produced.memo_keys.insert(memo_key);
        produced.memo_keys.extend(entry.nested_memo_keys.iter().copied());
        produced.retained.extend(entry.effect_keys.iter().cloned());
        self.run.cache_hits.fetch_add(1, Ordering::SeqCst);
        debug!(
            path = %self.path,
            function = %function,
            memo_key = %memo_key.short(),
            states_changed,
            "Memo hit"
        );

        Ok(FlightValue {
            result: entry.result.clone(),
            produced,
            hit: true,
        })
    }

    /// Run the body with a fresh buffer; the buffer is returned only on success.
    async fn execute<A, R>(&self, f: &MemoFn<A, R>, args: A) -> Result<(R, FrameState), EngineError>
    where
        A: MemoInput + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let buffer = FrameBuffer::default();
        let ctx = ScopeContext {
            run: self.run.clone(),
            path: self.path.clone(),
            buffer: buffer.clone(),
            cancel: self.cancel.clone(),
        };
        self.run.executed.fetch_add(1, Ordering::SeqCst);

        let outcome = match &f.inner.body {
            Body::Async(body) => body(ctx, args).await,
            Body::Sync(body) => {
                let body = body.clone();
                match tokio::task::spawn_blocking(move || body(&ctx, args)).await {
                    Ok(result) => result,
                    Err(join) => Err(anyhow::anyhow!("body panicked: {join}")),
                }
            }
        };

        let value = outcome.map_err(|e| self.body_error(f.name(), e))?;
        let state = std::mem::take(&mut *buffer.lock());
        Ok((value, state))
    }
}

//! Apply-side capability: executes one batch of reconciled actions

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

/// One action bound for a sink, with the resource key it targets.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkItem<K, A> {
    pub key: K,
    pub action: A,
}

/// Apply failure reported by a sink
///
/// `failed` lists the batch indices that did not apply; `None` means the whole
/// batch must be treated as failed.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApplyError {
    pub message: String,
    pub failed: Option<BTreeSet<usize>>,
}

impl ApplyError {
    pub fn all(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failed: None,
        }
    }

    pub fn partial(message: impl Into<String>, failed: impl IntoIterator<Item = usize>) -> Self {
        Self {
            message: message.into(),
            failed: Some(failed.into_iter().collect()),
        }
    }

    pub fn affects(&self, index: usize) -> bool {
        self.failed.as_ref().map_or(true, |f| f.contains(&index))
    }
}

/// Batched apply for one provider
///
/// Invoked once per reconciliation wave (per chunk of at most
/// `runner.max_batch_size` items) with every non-no-op action.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    type Key: Send + Sync + 'static;
    type Action: Send + Sync + 'static;

    async fn apply(&self, batch: Vec<SinkItem<Self::Key, Self::Action>>) -> Result<(), ApplyError>;
}

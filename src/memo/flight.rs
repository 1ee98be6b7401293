//! Single-flight table: concurrent invocations of one memo key share one execution

use crate::types::MemoKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Per-run rendezvous slots keyed by memo key
///
/// The first caller of a key runs the work; later callers await the same
/// slot and receive a clone of its outcome. If the running caller is dropped
/// before finishing, the next waiter takes over.
pub struct FlightTable<T> {
    slots: Mutex<HashMap<MemoKey, Arc<OnceCell<T>>>>,
}

impl<T> Default for FlightTable<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> FlightTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` once per key. The flag is true for the caller whose work ran.
    pub async fn run<F, Fut>(&self, key: MemoKey, work: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = self.slots.lock().entry(key).or_default().clone();
        let mut led = false;
        let value = cell
            .get_or_init(|| {
                led = true;
                work()
            })
            .await
            .clone();
        (value, led)
    }

    pub fn completed(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}

//! Rate-limited workqueue with the semantics node reconciliation depends on:
//! keys are deduplicated while queued, at most one reconciliation per key is
//! in flight, a key re-added mid-flight is redelivered once its worker
//! finishes, and failed keys come back with per-key exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Duration;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Clone)]
pub(crate) struct Workqueue(Arc<Shared>);

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys currently sitting in `queue`.
    queued: HashSet<String>,
    /// Keys handed to a worker and not yet marked done.
    active: HashSet<String>,
    /// Active keys that were re-added and need redelivery.
    dirty: HashSet<String>,
    /// Consecutive failures per key, cleared by `forget`.
    failures: HashMap<String, u32>,
    shutdown: bool,
}

impl Workqueue {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }))
    }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.0.state.lock().expect("workqueue poisoned");
        if state.shutdown {
            return;
        }
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.0.notify.notify_one();
        }
    }

    /// Waits for the next key and marks it active. Returns `None` once the
    /// queue has been shut down and drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            // Register interest before checking so a concurrent `add` cannot
            // slip between the check and the wait.
            let notified = self.0.notify.notified();
            {
                let mut state = self.0.state.lock().expect("workqueue poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a key finished; a key re-added while it was active is queued
    /// again immediately.
    pub fn done(&self, key: &str) {
        let mut state = self.0.state.lock().expect("workqueue poisoned");
        state.active.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.to_string()) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.0.notify.notify_one();
        }
    }

    /// Clears the failure history of a key after a successful sync.
    pub fn forget(&self, key: &str) {
        self.0
            .state
            .lock()
            .expect("workqueue poisoned")
            .failures
            .remove(key);
    }

    /// Re-enqueues a failed key after an exponentially growing delay.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.0.state.lock().expect("workqueue poisoned");
            if state.shutdown {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            BASE_DELAY
                .saturating_mul(2u32.saturating_pow(*failures - 1))
                .min(MAX_DELAY)
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Stops accepting keys; `next` drains what is queued, then returns
    /// `None` to every worker.
    pub fn shut_down(&self) {
        self.0.state.lock().expect("workqueue poisoned").shutdown = true;
        self.0.notify.notify_waiters();
    }
}

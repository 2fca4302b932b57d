//! Work queue of object keys
//!
//! A key is queued at most once. While a worker processes a key, further
//! adds only mark it dirty; [`WorkQueue::done`] puts a dirty key back so the
//! latest trigger is never lost and no key is processed concurrently.

use crate::crd::ObjectKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct QueueState {
    /// Keys ready to be handed out, in FIFO order
    items: VecDeque<ObjectKey>,
    /// Keys currently in `items`
    queued: HashSet<ObjectKey>,
    /// Keys handed out and not yet done
    processing: HashSet<ObjectKey>,
    /// Processing keys added again in the meantime
    dirty: HashSet<ObjectKey>,
    /// Earliest pending delayed add per key
    delayed: HashMap<ObjectKey, Instant>,
    shutdown: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Deduplicating queue shared by triggers and workers
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue a key now
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.items.push_back(key);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Enqueue a key once `delay` has elapsed. Only the earliest pending
    /// delayed add per key is kept.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            if matches!(state.delayed.get(&key), Some(existing) if *existing <= deadline) {
                return;
            }
            state.delayed.insert(key.clone(), deadline);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            let due = {
                let mut state = queue.inner.state.lock();
                if state.delayed.get(&key) == Some(&deadline) {
                    state.delayed.remove(&key);
                    true
                } else {
                    false
                }
            };
            if due {
                queue.add(key);
            }
        });
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.items.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.items.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark a key handed out by [`get`](Self::get) as finished
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);

        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.clone()) {
            state.items.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Keys ready to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys with a pending delayed add
    pub fn delayed_len(&self) -> usize {
        self.inner.state.lock().delayed.len()
    }
}

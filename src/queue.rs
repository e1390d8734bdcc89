use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};

use crate::metrics;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff: 5ms * 2^retries, capped at 1000s.
#[must_use]
pub fn backoff_for(retries: u32) -> Duration {
    let factor = 1u64 << retries.min(27);
    BASE_DELAY
        .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
        .min(MAX_DELAY)
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    // Keys waiting in the queue or marked for requeue while processing.
    dirty: HashSet<String>,
    // Keys currently held by a worker; such a key cannot be handed to a
    // second worker until the first calls done().
    processing: HashSet<String>,
    retries: HashMap<String, u32>,
    enqueued_at: HashMap<String, Instant>,
    shutting_down: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    // Wakes one worker per enqueued key.
    items: Notify,
    // Wakes the drain waiter once processing empties.
    drained: Notify,
    shutdown_tx: watch::Sender<bool>,
}

/// Rate-limited deduplicating FIFO of `namespace/name` service keys. A key
/// held by one worker cannot be dequeued by another; re-adds while a key is
/// held are honored when the worker finishes.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                items: Notify::new(),
                drained: Notify::new(),
                shutdown_tx,
            }),
        }
    }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            metrics::QUEUE_UPDATES.inc();
            if state.processing.contains(&key) {
                // Marked for requeue; done() re-enqueues it.
                return;
            }
            state.enqueued_at.insert(key.clone(), Instant::now());
            state.queue.push_back(key);
            metrics::QUEUE_LENGTH.set(state.queue.len() as i64);
        }
        self.inner.items.notify_one();
    }

    /// Enqueues after the key's current backoff and bumps its retry count.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            let retries = state.retries.entry(key.clone()).or_insert(0);
            let delay = backoff_for(*retries);
            *retries += 1;
            delay
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Blocks until a key is available. `None` means the queue has shut down
    /// and is empty; workers should exit.
    pub async fn get(&self) -> Option<String> {
        loop {
            let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
            let notified = self.inner.items.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if let Some(at) = state.enqueued_at.remove(&key) {
                        metrics::QUEUE_LATENCY.observe(at.elapsed().as_secs_f64());
                    }
                    metrics::QUEUE_LENGTH.set(state.queue.len() as i64);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            tokio::select! {
                () = notified => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Marks processing of a key complete, honoring any requeue mark.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.inner.state.lock().unwrap();
            state.processing.remove(key);
            let requeue = state.dirty.contains(key) && !state.shutting_down;
            if requeue {
                state.enqueued_at.insert(key.to_string(), Instant::now());
                state.queue.push_back(key.to_string());
                metrics::QUEUE_LENGTH.set(state.queue.len() as i64);
            }
            if state.shutting_down && state.processing.is_empty() {
                self.inner.drained.notify_one();
            }
            requeue
        };
        if requeued {
            self.inner.items.notify_one();
        }
    }

    /// Resets the key's backoff.
    pub fn forget(&self, key: &str) {
        self.inner.state.lock().unwrap().retries.remove(key);
    }

    #[must_use]
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner
            .state
            .lock()
            .unwrap()
            .retries
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new keys and waits until every key currently held by
    /// a worker has been marked done. Queued keys keep flowing to workers
    /// until the queue empties.
    pub async fn shut_down_with_drain(&self) {
        self.inner.state.lock().unwrap().shutting_down = true;
        let _ = self.inner.shutdown_tx.send(true);
        loop {
            let notified = self.inner.drained.notified();
            {
                let state = self.inner.state.lock().unwrap();
                if state.processing.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

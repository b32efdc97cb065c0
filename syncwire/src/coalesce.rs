//! Write-coalescing queue for REST-style field updates.
//!
//! Rapid edits to the same resource (typing in a project title, dragging a
//! timeline item) are collected for one debounce window and sent as a single
//! call with the payloads shallow-merged in call order:
//!
//! ```text
//!   t=0ms    enqueue(p1, {name: "A"})      ┐
//!   t=200ms  enqueue(p1, {name: "Ab"})     ├─► t=1000ms  update(p1, {name: "Abc", color: 3})
//!   t=400ms  enqueue(p1, {color: 3})       │
//!   t=600ms  enqueue(p1, {name: "Abc"})    ┘
//! ```
//!
//! One timer drains every pending id. Every caller's future resolves once its
//! batch has been sent, whether or not the update succeeded; failures are
//! logged here and not returned.
//!
//! If any payload for an id is a JSON array, the most recent array is sent
//! as-is. Callers should not mix array and object payloads for one id.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type UpdateFn = Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Coalescer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerConfig {
    /// Debounce window measured from the first enqueue of a batch.
    pub window: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
        }
    }
}

struct Pending {
    update_fn: UpdateFn,
    payloads: Vec<Value>,
    waiters: Vec<oneshot::Sender<()>>,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, Pending>,
    order: Vec<String>,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    config: CoalescerConfig,
    state: Mutex<State>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.pending.is_empty() {
            log::warn!(
                "write coalescer dropped with {} unflushed batches",
                state.pending.len()
            );
        }
    }
}

/// Debounced per-id update queue. Clones share the same queue.
///
/// Must be used from within a Tokio runtime. Batches are sent by the window
/// timer, which is a task on that runtime, or by [`flush`](Self::flush).
/// Call `flush` before shutting the runtime down: batches still pending when
/// the timer task is dropped are discarded with a warning.
#[derive(Clone)]
pub struct WriteCoalescer {
    shared: Arc<Shared>,
}

impl Default for WriteCoalescer {
    fn default() -> Self {
        Self::new(CoalescerConfig::default())
    }
}

impl WriteCoalescer {
    pub fn new(config: CoalescerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Queue `payload` for `id`.
    ///
    /// The payload is registered before this returns; the returned future
    /// only waits for the flush. The most recently supplied `update_fn` is
    /// the one called for the batch. An empty id or a `null` payload is
    /// ignored and resolves immediately.
    pub fn enqueue<F, Fut, E>(
        &self,
        update_fn: F,
        id: impl Into<String>,
        payload: Value,
    ) -> impl Future<Output = ()> + Send + 'static
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let id = id.into();
        let waiter = if id.is_empty() || payload.is_null() {
            None
        } else {
            let update_fn: UpdateFn = Arc::new(move |id: String, payload: Value| -> BoxFuture<'static, Result<(), String>> {
                let call = update_fn(id, payload);
                Box::pin(async move { call.await.map_err(|e| e.to_string()) })
            });
            let (tx, rx) = oneshot::channel();
            self.register(id, update_fn, payload, tx);
            self.schedule();
            Some(rx)
        };

        async move {
            if let Some(rx) = waiter {
                let _ = rx.await;
            }
        }
    }

    /// Number of ids waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Send every pending batch now instead of waiting for the timer.
    pub async fn flush(&self) {
        if let Some(timer) = self.lock().timer.take() {
            timer.abort();
        }
        self.drain().await;
    }

    fn register(&self, id: String, update_fn: UpdateFn, payload: Value, waiter: oneshot::Sender<()>) {
        let mut state = self.lock();
        if !state.pending.contains_key(&id) {
            state.order.push(id.clone());
        }
        match state.pending.entry(id) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                pending.update_fn = update_fn;
                pending.payloads.push(payload);
                pending.waiters.push(waiter);
            }
            Entry::Vacant(entry) => {
                entry.insert(Pending {
                    update_fn,
                    payloads: vec![payload],
                    waiters: vec![waiter],
                });
            }
        }
    }

    fn schedule(&self) {
        let mut state = self.lock();
        if state.timer.is_some() {
            return;
        }
        let window = self.shared.config.window;
        let queue = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            queue.drain().await;
        }));
    }

    async fn drain(&self) {
        let batches: Vec<(String, Pending)> = {
            let mut state = self.lock();
            state.timer = None;
            let order = std::mem::take(&mut state.order);
            order
                .into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        if batches.is_empty() {
            return;
        }
        log::debug!("flushing {} coalesced batches", batches.len());

        for (id, pending) in batches {
            let payload = merge_payloads(pending.payloads);
            if let Err(err) = (pending.update_fn)(id.clone(), payload).await {
                log::error!("coalesced update for '{id}' failed: {err}");
            }
            for waiter in pending.waiters {
                let _ = waiter.send(());
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shallow merge in call order; the latest array payload wins outright.
fn merge_payloads(payloads: Vec<Value>) -> Value {
    if let Some(array) = payloads.iter().rev().find(|p| p.is_array()) {
        return array.clone();
    }
    let mut merged = Map::new();
    for payload in payloads {
        if let Value::Object(fields) = payload {
            merged.extend(fields);
        }
    }
    Value::Object(merged)
}

//! # Readiness Bus
//!
//! The ReadinessBus is the meeting point between the host shell and the
//! modules it mounts. It combines three things:
//!
//! - **Publish/Subscribe**: named events dispatched synchronously to callbacks,
//!   in subscription order
//! - **Readiness Registry**: a per-module boolean that, once set, stays set
//!   until [`ReadinessBus::reset`]
//! - **Deferred Events**: events addressed to a module that is not ready yet,
//!   queued and delivered in arrival order the moment it becomes ready
//!
//! On top of the registry the bus offers waits on a *set* of modules, either as
//! a callback ([`ReadinessBus::when_all_ready`]) or as a future
//! ([`ReadinessBus::wait_all_ready`]). Both take a synchronous fast path when
//! every module is already ready, and both are woken directly by
//! [`ReadinessBus::announce_ready`] rather than by polling.
//!
//! ## Callback isolation
//!
//! A subscriber that returns an error or panics is logged and skipped. The
//! remaining subscribers still run and the emitter never sees the failure.
//!
//! ## Locking
//!
//! Readiness, the deferred queue and the wait registry share one mutex so
//! "check then enqueue" and "mark ready then drain" are atomic with respect to
//! each other. Callbacks are never invoked while a lock is held, which lets a
//! callback subscribe, emit or announce re-entrantly. A module stays marked as
//! delivering until its drained queue has been emitted, so nothing submitted
//! for it in the meantime can overtake the queued events.

use std::{
    any::Any,
    collections::{HashSet, VecDeque},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use super::wait_registry::{WaitId, WaitRegistry, Waker};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a subscriber callback. Errors are logged by the bus, never propagated.
pub type CallbackResult = Result<(), BoxError>;

type Callback = Arc<dyn Fn(&Value) -> CallbackResult + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: u64,
    callback: Callback,
}

type SubscriberTable = DashMap<String, Vec<Subscriber>>;

/// An event held back until its target module becomes ready.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub target: String,
    pub event: String,
    pub payload: Value,
}

#[derive(Default)]
struct ReadinessState {
    ready: HashSet<String>,
    pending: VecDeque<PendingEvent>,
    /// Ready modules whose queued events are still being delivered
    delivering: HashSet<String>,
    waits: WaitRegistry,
}

impl ReadinessState {
    fn take_pending(&mut self, name: &str) -> VecDeque<PendingEvent> {
        let (taken, remaining): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|pending| pending.target == name);
        self.pending = remaining;
        taken
    }

    fn missing(&self, names: &[String]) -> HashSet<String> {
        names
            .iter()
            .filter(|name| !self.ready.contains(name.as_str()))
            .cloned()
            .collect()
    }

    fn unready(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|name| !self.ready.contains(name.as_str()))
            .cloned()
            .collect()
    }
}

/// # ReadinessBus
///
/// Cloning is cheap and every clone shares the same subscribers, readiness
/// and queues.
#[derive(Clone)]
pub struct ReadinessBus {
    subscribers: Arc<SubscriberTable>,
    state: Arc<Mutex<ReadinessState>>,
    next_subscriber_id: Arc<AtomicU64>,
    /// Bound applied to [`ReadinessBus::when_all_ready`]
    wait_timeout: Duration,
}

impl Default for ReadinessBus {
    fn default() -> Self {
        Self::new(Duration::from_millis(30_000))
    }
}

impl ReadinessBus {
    /// Creates an empty bus. `wait_timeout` bounds callback-style waits.
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            state: Arc::new(Mutex::new(ReadinessState::default())),
            next_subscriber_id: Arc::new(AtomicU64::new(0)),
            wait_timeout,
        }
    }

    fn state(&self) -> MutexGuard<'_, ReadinessState> {
        // コールバックはロック外で呼ぶので、poisonしても状態自体は一貫している
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `callback` for `event`.
    ///
    /// Callbacks for the same event run in registration order. The returned
    /// [`Subscription`] removes exactly this registration.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shell_loader::event_bus::ReadinessBus;
    /// use serde_json::json;
    ///
    /// let bus = ReadinessBus::default();
    /// let subscription = bus.subscribe("nav:change", |data| {
    ///     println!("navigated to {}", data);
    ///     Ok(())
    /// });
    /// bus.emit("nav:change", &json!("/contacts"));
    /// subscription.unsubscribe();
    /// ```
    pub fn subscribe<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) -> CallbackResult + Send + Sync + 'static,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(event.to_string())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        trace!("Subscribed {} to {}", id, event);

        Subscription {
            event: event.to_string(),
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Synchronously invokes every callback currently subscribed to `event`.
    pub fn emit(&self, event: &str, data: &Value) {
        // Snapshot so callbacks may (un)subscribe while we iterate.
        let subscribers: Vec<Subscriber> = match self.subscribers.get(event) {
            Some(list) => list.clone(),
            None => {
                trace!("No subscribers for {}", event);
                return;
            }
        };

        debug!("Emitting {} to {} subscriber(s)", event, subscribers.len());
        for subscriber in subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(data))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Error in event handler for {}: {}", event, e),
                Err(panic) => error!(
                    "Event handler for {} panicked: {}",
                    event,
                    panic_message(panic.as_ref())
                ),
            }
        }
    }

    /// Marks `name` as ready, then delivers the events queued for it.
    ///
    /// Idempotent. Events queued for other modules keep their relative order.
    /// Waits whose last missing module was `name` are woken afterwards; a
    /// panicking wait callback is logged and does not affect the others.
    ///
    /// Until the queue for `name` is drained, [`ReadinessBus::emit_when_ready`]
    /// keeps queueing behind it, so events reach subscribers in the order they
    /// were submitted even when callers race with the announcement.
    pub fn announce_ready(&self, name: &str) {
        let (newly_ready, draining, mut delivered, woken) = {
            let mut state = self.state();
            let newly_ready = state.ready.insert(name.to_string());
            // Only one caller drains a module's queue at a time.
            let draining = state.delivering.insert(name.to_string());
            let delivered = if draining {
                state.take_pending(name)
            } else {
                VecDeque::new()
            };
            let woken = state.waits.mark_ready(name);
            (newly_ready, draining, delivered, woken)
        };

        if newly_ready {
            info!("Module {} is ready", name);
        } else {
            debug!("Module {} announced ready again", name);
        }

        if draining {
            loop {
                for pending in delivered {
                    self.emit(&pending.event, &pending.payload);
                }
                let mut state = self.state();
                delivered = state.take_pending(name);
                if delivered.is_empty() {
                    state.delivering.remove(name);
                    break;
                }
            }
        }

        for waker in woken {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || waker.wake())) {
                error!(
                    "Readiness callback woken by {} panicked: {}",
                    name,
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.state().ready.contains(name)
    }

    /// Emits immediately if `name` is ready, otherwise queues the event until
    /// [`ReadinessBus::announce_ready`] is called for `name`.
    ///
    /// While the announcement of `name` is still delivering earlier queued
    /// events, the event is queued behind them instead of being emitted.
    pub fn emit_when_ready(&self, name: &str, event: &str, data: Value) {
        {
            let mut state = self.state();
            if !state.ready.contains(name) || state.delivering.contains(name) {
                state.pending.push_back(PendingEvent {
                    target: name.to_string(),
                    event: event.to_string(),
                    payload: data,
                });
                debug!("Queued event {} for {}", event, name);
                return;
            }
        }
        self.emit(event, &data);
    }

    /// Calls `on_satisfied` once every module in `names` is ready.
    ///
    /// When they already are, `on_satisfied` runs synchronously before this
    /// returns. Otherwise it runs inside the `announce_ready` call that
    /// completes the set. If the bus wait timeout elapses first the wait is
    /// dropped, `on_satisfied` is never called, and the modules still missing
    /// are logged.
    ///
    /// The timeout is driven by the ambient tokio runtime; without one the
    /// wait is unbounded.
    pub fn when_all_ready<F>(&self, names: &[String], on_satisfied: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state();
        let missing = state.missing(names);
        if missing.is_empty() {
            drop(state);
            on_satisfied();
            return;
        }
        let id = state
            .waits
            .register(missing, Waker::Callback(Box::new(on_satisfied)));
        drop(state);

        debug!("Waiting for modules: {}", names.join(", "));
        self.spawn_wait_timer(id, names.to_vec());
    }

    fn spawn_wait_timer(&self, id: WaitId, names: Vec<String>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No tokio runtime; wait for {} has no timeout",
                names.join(", ")
            );
            return;
        };

        let state = Arc::downgrade(&self.state);
        let timeout = self.wait_timeout;
        let timer = handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let unready = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if !state.waits.cancel(id) {
                    return;
                }
                state.unready(&names)
            };
            error!("Timeout waiting for modules: {}", unready.join(", "));
        });

        if !self.state().waits.attach_timer(id, timer.abort_handle()) {
            timer.abort();
        }
    }

    /// Waits until every module in `names` is ready, for at most `timeout`.
    ///
    /// Returns immediately when they already are.
    ///
    /// # Errors
    ///
    /// * `BusError::WaitTimeout` - the timeout elapsed; carries the modules still unready
    /// * `BusError::WaitCancelled` - the bus was reset while waiting
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn wait_all_ready(&self, names: &[String], timeout: Duration) -> BusResult<()> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state();
            let missing = state.missing(names);
            if missing.is_empty() {
                return Ok(());
            }
            state.waits.register(missing, Waker::Channel(tx))
        };
        let guard = WaitGuard {
            state: Arc::downgrade(&self.state),
            id,
        };

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            _ = &mut sleep => {
                drop(guard);
                let unready = self.state().unready(names);
                if unready.is_empty() {
                    // Satisfied right at the deadline.
                    return Ok(());
                }
                warn!("Timeout waiting for modules: {}", unready.join(", "));
                Err(BusError::WaitTimeout { unready })
            }
            result = rx => {
                drop(guard);
                result.map_err(|_| BusError::WaitCancelled)
            }
        }
    }

    /// Clears subscribers, readiness, queued events and outstanding waits.
    ///
    /// Async waiters observe `BusError::WaitCancelled`; callback waiters are
    /// dropped without being called.
    pub fn reset(&self) {
        self.subscribers.clear();
        let (discarded, cancelled) = {
            let mut state = self.state();
            state.ready.clear();
            let discarded = std::mem::take(&mut state.pending).len();
            (discarded, state.waits.clear())
        };
        info!(
            "Readiness bus reset ({} queued event(s) discarded, {} wait(s) cancelled)",
            discarded,
            cancelled.len()
        );
        drop(cancelled);
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.state().waits.len()
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.get(event).map_or(0, |list| list.len())
    }

    /// Names announced ready so far, sorted.
    pub fn ready_modules(&self) -> Vec<String> {
        let mut ready: Vec<String> = self.state().ready.iter().cloned().collect();
        ready.sort();
        ready
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }
}

/// Removes an async wait from the registry if its future is dropped early.
struct WaitGuard {
    state: Weak<Mutex<ReadinessState>>,
    id: WaitId,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .waits
                .cancel(self.id);
        }
    }
}

/// Handle returned by [`ReadinessBus::subscribe`].
///
/// Dropping it keeps the callback registered; call [`Subscription::unsubscribe`]
/// to remove it.
#[derive(Debug)]
pub struct Subscription {
    event: String,
    id: u64,
    subscribers: Weak<SubscriberTable>,
}

impl Subscription {
    /// A subscription that is not attached to any bus.
    pub(crate) fn detached(event: &str) -> Self {
        Self {
            event: event.to_string(),
            id: u64::MAX,
            subscribers: Weak::new(),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Removes this registration. Returns false if it was already gone, e.g.
    /// after a reset.
    pub fn unsubscribe(self) -> bool {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return false;
        };
        let removed = match subscribers.get_mut(&self.event) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|subscriber| subscriber.id != self.id);
                list.len() != before
            }
            None => false,
        };
        subscribers.remove_if(&self.event, |_, list| list.is_empty());
        if removed {
            trace!("Unsubscribed {} from {}", self.id, self.event);
        }
        removed
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("Timeout waiting for modules: {}", unready.join(", "))]
    WaitTimeout { unready: Vec<String> },

    #[error("Wait cancelled by bus reset")]
    WaitCancelled,
}

pub type BusResult<T> = Result<T, BusError>;

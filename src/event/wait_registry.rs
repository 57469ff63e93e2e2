//! # Wait Registry
//!
//! Bookkeeping for callers waiting on a set of modules to become ready.
//!
//! Each wait records the names it is still missing. Waits are indexed by name,
//! so announcing a module only visits the waits that reference it, and a wait
//! is woken the moment its last missing name is announced. There is no polling.
//!
//! The registry itself is plain data; [`ReadinessBus`](super::event_bus::ReadinessBus)
//! keeps it under the same lock as the readiness map so that "check readiness,
//! then register" can never miss an announcement in between.

use std::collections::{HashMap, HashSet};

use tokio::{sync::oneshot, task::AbortHandle};

pub(crate) type WaitId = u64;

/// How a satisfied wait is notified.
pub(crate) enum Waker {
    /// Invoked synchronously by the announcing caller, after the bus lock is released.
    Callback(Box<dyn FnOnce() + Send>),
    /// Completes an async waiter.
    Channel(oneshot::Sender<()>),
}

impl Waker {
    pub(crate) fn wake(self) {
        match self {
            Waker::Callback(callback) => callback(),
            Waker::Channel(sender) => {
                // 受信側がすでにタイムアウトしている場合は無視
                let _ = sender.send(());
            }
        }
    }
}

struct PendingWait {
    missing: HashSet<String>,
    waker: Waker,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
pub(crate) struct WaitRegistry {
    waits: HashMap<WaitId, PendingWait>,
    by_name: HashMap<String, Vec<WaitId>>,
    next_id: WaitId,
}

impl WaitRegistry {
    /// Registers a wait for `missing`, which must be non-empty.
    pub(crate) fn register(&mut self, missing: HashSet<String>, waker: Waker) -> WaitId {
        let id = self.next_id;
        self.next_id += 1;
        for name in &missing {
            self.by_name.entry(name.clone()).or_default().push(id);
        }
        self.waits.insert(
            id,
            PendingWait {
                missing,
                waker,
                timer: None,
            },
        );
        id
    }

    /// Attaches the timeout task of a wait so that it can be aborted once the
    /// wait is satisfied. Returns false when the wait is already gone.
    pub(crate) fn attach_timer(&mut self, id: WaitId, timer: AbortHandle) -> bool {
        match self.waits.get_mut(&id) {
            Some(wait) => {
                wait.timer = Some(timer);
                true
            }
            None => false,
        }
    }

    /// Marks `name` as ready and returns the wakers of every wait it completed,
    /// in registration order.
    pub(crate) fn mark_ready(&mut self, name: &str) -> Vec<Waker> {
        let Some(ids) = self.by_name.remove(name) else {
            return Vec::new();
        };

        let mut woken = Vec::new();
        for id in ids {
            let satisfied = match self.waits.get_mut(&id) {
                Some(wait) => {
                    wait.missing.remove(name);
                    wait.missing.is_empty()
                }
                None => false,
            };
            if satisfied {
                if let Some(wait) = self.waits.remove(&id) {
                    if let Some(timer) = wait.timer {
                        timer.abort();
                    }
                    woken.push(wait.waker);
                }
            }
        }
        woken
    }

    /// Drops a wait without waking it. Returns false if it already completed.
    pub(crate) fn cancel(&mut self, id: WaitId) -> bool {
        let Some(wait) = self.waits.remove(&id) else {
            return false;
        };
        for name in &wait.missing {
            if let Some(ids) = self.by_name.get_mut(name) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.by_name.remove(name);
                }
            }
        }
        true
    }

    /// Removes every wait. The returned wakers are dropped by the caller, which
    /// closes async waiters' channels.
    pub(crate) fn clear(&mut self) -> Vec<Waker> {
        self.by_name.clear();
        self.waits
            .drain()
            .map(|(_, wait)| {
                if let Some(timer) = wait.timer {
                    timer.abort();
                }
                wait.waker
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.waits.len()
    }
}

//! Ordered, re-entrant delivery of state changes to listeners.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use crate::utils::defer::defer;

type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;
type Listeners<S> = Arc<Vec<(u64, Listener<S>)>>;

/// Fans state changes out to a set of listeners.
///
/// Owners [`push`](Self::push) changes while holding their own state lock, so the queue order
/// is the order in which transitions happened. Delivery happens in [`drain`](Self::drain), after
/// the owner released its lock. Only one thread drains at a time; a change pushed while another
/// thread drains (or from inside a listener) is delivered by that drainer once the changes before
/// it have been delivered.
///
/// Every change is delivered to the listeners registered at the time it was pushed. A listener
/// added later never sees earlier changes.
pub(crate) struct Broadcaster<S> {
    inner: Mutex<BroadcastInner<S>>,
}

struct BroadcastInner<S> {
    next_id: u64,
    listeners: Listeners<S>,
    queue: VecDeque<(S, Listeners<S>)>,
    draining: bool,
}

impl<S> Broadcaster<S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BroadcastInner {
                next_id: 0,
                listeners: Arc::new(Vec::new()),
                queue: VecDeque::new(),
                draining: false,
            }),
        }
    }

    pub fn subscribe(&self, listener: Listener<S>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        Arc::make_mut(&mut inner.listeners).push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let listeners = Arc::make_mut(&mut inner.listeners);
        let len = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != len
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().unwrap().listeners.len()
    }

    /// Enqueues a change for delivery.
    pub fn push(&self, change: S) {
        let mut inner = self.inner.lock().unwrap();
        if inner.listeners.is_empty() {
            return;
        }
        let listeners = Arc::clone(&inner.listeners);
        inner.queue.push_back((change, listeners));
    }

    /// Delivers queued changes, unless another drainer is already active.
    pub fn drain(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.draining {
                return;
            }
            inner.draining = true;
        }

        // an unwinding drainer must not leave the broadcaster stuck in the draining state
        let reset = defer(|| {
            if let Ok(mut inner) = self.inner.lock() {
                inner.draining = false;
            }
        });

        loop {
            let (change, listeners) = {
                let mut inner = self.inner.lock().unwrap();
                match inner.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        inner.draining = false;
                        break;
                    }
                }
            };
            for (id, listener) in listeners.iter() {
                if catch_unwind(AssertUnwindSafe(|| listener(&change))).is_err() {
                    tracing::error!(listener = id, "state listener panicked");
                }
            }
        }

        reset.cancel();
    }
}

/// A registration with a cache entry or an observer.
///
/// The listener stays registered until [`unsubscribe`](Self::unsubscribe) is called or the
/// subscription is dropped.
#[must_use = "dropping a subscription unsubscribes the listener"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<S: Send + 'static>(broadcaster: Weak<Broadcaster<S>>, id: u64) -> Self {
        Self {
            unsubscribe: Some(Box::new(move || {
                if let Some(broadcaster) = broadcaster.upgrade() {
                    broadcaster.unsubscribe(id);
                }
            })),
        }
    }

    /// Removes the listener.
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }

    /// Keeps the listener registered for as long as the subscribed-to object lives.
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

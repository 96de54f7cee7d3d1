use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Identifies one arming of a [`TimerSlot`].
///
/// Ids are unique for the whole process, so an id can never be confused with the id of a timer
/// armed later on in the same or in another slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A slot holding at most one armed one-shot timer.
///
/// Aborting the spawned task is best-effort: the task may already have woken up and be running
/// its callback. Callbacks must therefore confirm with [`TimerSlot::take_fired`], under the same
/// lock that guards the slot, before they apply any effect. Once [`TimerSlot::cancel`] returned,
/// that confirmation fails for every previously armed timer.
#[derive(Debug, Default)]
pub struct TimerSlot {
    armed: Option<(TimerId, JoinHandle<()>)>,
}

impl TimerSlot {
    /// Arms the slot to invoke `callback` at `deadline`, replacing (and cancelling) any timer
    /// that was armed before.
    pub fn arm<F>(&mut self, runtime: &Handle, deadline: Instant, callback: F) -> TimerId
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        self.cancel();

        let id = TimerId::next();
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            callback(id);
        });
        self.armed = Some((id, handle));
        id
    }

    /// Cancels the armed timer, returning whether there was one.
    pub fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether any timer is currently armed.
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Disarms the slot if `id` is the currently armed timer.
    ///
    /// Returns `false` if the timer was cancelled or replaced in the meantime, in which case the
    /// firing callback must not have any effect.
    pub fn take_fired(&mut self, id: TimerId) -> bool {
        match &self.armed {
            Some((armed, _)) if *armed == id => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

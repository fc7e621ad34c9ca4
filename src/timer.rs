//! Deadline timers.
//!
//! The manager keeps an ordered set of absolute millisecond deadlines on the
//! monotonic clock. Timers can be one-shot or recurring, cancelled, reset to
//! a new period or refreshed to `now + period`. A *conditional* timer fires
//! only while an associated weak reference can still be upgraded, which is
//! how the hook facade cancels I/O waits whose awaiter is gone.
//!
//! When an insertion produces a new earliest deadline the manager invokes a
//! wake-up hook, so a reactor blocked in `epoll_wait` re-computes its
//! timeout.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::OnceCell;

use crate::clock;

type TimerCallback = Arc<dyn Fn() + Send + Sync>;
type Waker = Box<dyn Fn() + Send + Sync>;

/// Detect the monotonic clock jumping backwards by more than an hour, which
/// happens on some virtualized hosts.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

struct TimerInner {
    /// Insertion order; breaks deadline ties so cancel and reset stay
    /// logarithmic.
    seq: u64,
    recurring: bool,
    period_ms: AtomicU64,
    deadline_ms: AtomicU64,
    /// Cleared on cancel and after a one-shot fires.
    callback: Mutex<Option<TimerCallback>>,
    manager: Weak<TimerCore>,
}

/// Handle to a scheduled timer.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

pub(crate) struct TimerCore {
    timers: RwLock<BTreeMap<(u64, u64), Arc<TimerInner>>>,
    /// A front-insert wake-up was issued and not yet consumed by
    /// `next_timer`; suppresses duplicate wake-ups.
    tickled: AtomicBool,
    previous_now: AtomicU64,
    next_seq: AtomicU64,
    waker: OnceCell<Waker>,
}

pub(crate) struct TimerManager {
    core: Arc<TimerCore>,
}

impl TimerManager {
    pub(crate) fn new() -> TimerManager {
        TimerManager {
            core: Arc::new(TimerCore {
                timers: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                previous_now: AtomicU64::new(0),
                next_seq: AtomicU64::new(0),
                waker: OnceCell::new(),
            }),
        }
    }

    /// Install the front-insert wake-up hook. May be set once.
    pub(crate) fn set_waker(&self, waker: Waker) {
        if self.core.waker.set(waker).is_err() {
            panic!("timer waker installed twice");
        }
    }

    /// Schedule `cb` to run in `ms` milliseconds, repeatedly if `recurring`.
    pub(crate) fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        let inner = Arc::new(TimerInner {
            seq: self.core.next_seq.fetch_add(1, Ordering::Relaxed),
            recurring,
            period_ms: AtomicU64::new(ms),
            deadline_ms: AtomicU64::new(clock::monotonic_ms() + ms),
            callback: Mutex::new(Some(Arc::new(cb))),
            manager: Arc::downgrade(&self.core),
        });
        TimerCore::insert(&self.core, inner.clone());
        Timer { inner }
    }

    /// Like [`add_timer`](Self::add_timer), but the callback is skipped once
    /// `cond` can no longer be upgraded.
    pub(crate) fn add_conditional_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline, [`clock::INFINITE`] when
    /// there is none. Consumes a pending front-insert wake-up.
    pub(crate) fn next_timer(&self) -> u64 {
        self.core.tickled.store(false, Ordering::SeqCst);
        let timers = self.core.timers.read().expect("timer lock poisoned");
        match timers.keys().next() {
            None => clock::INFINITE,
            Some(&(deadline, _)) => deadline.saturating_sub(clock::monotonic_ms()),
        }
    }

    pub(crate) fn has_timer(&self) -> bool {
        !self.core.timers.read().expect("timer lock poisoned").is_empty()
    }

    /// Drain every timer whose deadline passed, reinserting recurring ones
    /// at `now + period`, and return their callbacks in deadline order.
    ///
    /// If the clock is found to have jumped backwards by more than an hour,
    /// every current timer is treated as expired in one sweep.
    pub(crate) fn list_expired(&self) -> Vec<TimerCallback> {
        let now = clock::monotonic_ms();
        {
            let timers = self.core.timers.read().expect("timer lock poisoned");
            if timers.is_empty() {
                return Vec::new();
            }
        }
        let mut timers = self.core.timers.write().expect("timer lock poisoned");
        let previous = self.core.previous_now.swap(now, Ordering::SeqCst);
        let rollover = previous != 0 && now.saturating_add(ROLLOVER_WINDOW_MS) < previous;
        if !rollover {
            match timers.keys().next() {
                Some(&(deadline, _)) if deadline <= now => {}
                _ => return Vec::new(),
            }
        }

        let expired = if rollover {
            std::mem::take(&mut *timers)
        } else {
            // Keys greater than (now, u64::MAX) stay; everything else fires.
            let keep = timers.split_off(&(now + 1, 0));
            std::mem::replace(&mut *timers, keep)
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        for (_, timer) in expired {
            let callback = timer.callback.lock().expect("timer lock poisoned").clone();
            let callback = match callback {
                Some(cb) => cb,
                None => continue,
            };
            if timer.recurring {
                // Missed cycles coalesce: reinsert relative to now, not to
                // the previous deadline.
                let deadline = now + timer.period_ms.load(Ordering::SeqCst);
                timer.deadline_ms.store(deadline, Ordering::SeqCst);
                timers.insert((deadline, timer.seq), timer.clone());
            } else {
                *timer.callback.lock().expect("timer lock poisoned") = None;
            }
            callbacks.push(callback);
        }
        callbacks
    }
}

impl TimerCore {
    /// Insert under the write lock and fire the waker outside it when the
    /// new timer became the earliest.
    fn insert(core: &Arc<TimerCore>, timer: Arc<TimerInner>) {
        let key = (timer.deadline_ms.load(Ordering::SeqCst), timer.seq);
        let at_front = {
            let mut timers = core.timers.write().expect("timer lock poisoned");
            timers.insert(key, timer);
            timers.keys().next() == Some(&key)
        };
        if at_front && !core.tickled.swap(true, Ordering::SeqCst) {
            if let Some(waker) = core.waker.get() {
                waker();
            }
        }
    }
}

impl Timer {
    /// Remove the timer and clear its callback. Returns `false` when it
    /// already fired (one-shot) or was cancelled.
    pub fn cancel(&self) -> bool {
        let core = match self.inner.manager.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let mut timers = core.timers.write().expect("timer lock poisoned");
        if self.inner.callback.lock().expect("timer lock poisoned").take().is_none() {
            return false;
        }
        let key = (self.inner.deadline_ms.load(Ordering::SeqCst), self.inner.seq);
        timers.remove(&key);
        true
    }

    /// Push the deadline out to `now + period`, keeping the period.
    pub fn refresh(&self) -> bool {
        let core = match self.inner.manager.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let mut timers = core.timers.write().expect("timer lock poisoned");
        if self.inner.callback.lock().expect("timer lock poisoned").is_none() {
            return false;
        }
        let key = (self.inner.deadline_ms.load(Ordering::SeqCst), self.inner.seq);
        if timers.remove(&key).is_none() {
            return false;
        }
        let deadline = clock::monotonic_ms() + self.inner.period_ms.load(Ordering::SeqCst);
        self.inner.deadline_ms.store(deadline, Ordering::SeqCst);
        timers.insert((deadline, self.inner.seq), self.inner.clone());
        true
    }

    /// Change the period and reschedule, either relative to now or to the
    /// original start.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let core = match self.inner.manager.upgrade() {
            Some(core) => core,
            None => return false,
        };
        if ms == self.inner.period_ms.load(Ordering::SeqCst) && !from_now {
            return true;
        }
        {
            let mut timers = core.timers.write().expect("timer lock poisoned");
            if self.inner.callback.lock().expect("timer lock poisoned").is_none() {
                return false;
            }
            let old_key = (self.inner.deadline_ms.load(Ordering::SeqCst), self.inner.seq);
            if timers.remove(&old_key).is_none() {
                return false;
            }
            let start = if from_now {
                clock::monotonic_ms()
            } else {
                old_key.0.saturating_sub(self.inner.period_ms.load(Ordering::SeqCst))
            };
            self.inner.period_ms.store(ms, Ordering::SeqCst);
            self.inner.deadline_ms.store(start + ms, Ordering::SeqCst);
        }
        TimerCore::insert(&core, self.inner.clone());
        true
    }
}

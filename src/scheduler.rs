//! M:N cooperative scheduler.
//!
//! A fixed pool of OS worker threads drains one shared FIFO of runnable
//! entries, each entry being a [`Fiber`] or a plain callback, optionally
//! pinned to a specific worker. Workers switch into fibers cooperatively and
//! run a long-lived *idle fiber* when the queue is empty. With
//! `use_caller = true` the constructing thread itself becomes a worker: it
//! reserves a *root fiber* for the scheduling loop and joins the pool when
//! [`Scheduler::stop`] is called.
//!
//! The base idle fiber just yields until the scheduler is stopping; the
//! [I/O manager](crate::io) replaces it with an epoll loop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::OnceCell;

use crate::fiber::{self, Fiber, State};
use crate::io::Reactor;
use crate::thread::{self, Thread};

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Scheduler>> = RefCell::new(None);
}

/// Any worker may execute the entry.
pub const ANY_WORKER: libc::pid_t = -1;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// One runnable queue entry: a fiber or a callback, plus a worker affinity.
struct Task {
    fiber: Option<Arc<Fiber>>,
    callback: Option<Callback>,
    /// Kernel thread id of the only worker allowed to run this entry,
    /// [`ANY_WORKER`] for no restriction.
    thread: libc::pid_t,
}

struct Core {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<Thread>>,
    thread_count: usize,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    /// Kernel tid of the caller worker, `-1` when `use_caller` is off.
    root_thread: libc::pid_t,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    reactor: OnceCell<Arc<Reactor>>,
}

/// Cheaply cloneable handle to a scheduler.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<Core>,
}

/// Non-owning scheduler handle for callbacks that must not keep the
/// scheduler alive (timers, event slots).
#[derive(Clone)]
pub(crate) struct WeakScheduler(Weak<Core>);

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.0.upgrade().map(|core| Scheduler { core })
    }
}

impl Scheduler {
    /// Create a scheduler with `threads` workers.
    ///
    /// With `use_caller` the constructing thread is counted as one of the
    /// workers; it participates in draining the queue from inside
    /// [`stop`](Self::stop). The scheduler starts stopped; call
    /// [`start`](Self::start).
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads > 0);
        log::info!(
            target: "filament::scheduler",
            "scheduler {} threads: {} use_caller: {}",
            name,
            threads,
            use_caller,
        );
        let mut thread_count = threads;
        let mut root_thread = ANY_WORKER;
        if use_caller {
            Fiber::current();
            thread_count -= 1;
            assert!(
                Scheduler::current().is_none(),
                "a thread may host at most one use_caller scheduler",
            );
            root_thread = thread::current_id();
        }
        let sched = Scheduler {
            core: Arc::new(Core {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_count,
                active_count: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                root_thread,
                root_fiber: Mutex::new(None),
                reactor: OnceCell::new(),
            }),
        };
        if use_caller {
            set_current(Some(sched.clone()));
            if !name.is_empty() {
                thread::set_name(name);
            }
            // The root fiber must not own the scheduler that owns it.
            let weak = sched.downgrade();
            let root = Fiber::new_raw(
                Box::new(move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.run();
                    }
                }),
                0,
                true,
            );
            fiber::set_scheduler_main(Some(root.clone()));
            *sched.core.root_fiber.lock().expect("scheduler lock poisoned") = Some(root);
        }
        sched
    }

    /// The scheduler driving the calling thread, if any.
    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHEDULER.with(|s| s.borrow().clone())
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler(Arc::downgrade(&self.core))
    }

    pub(crate) fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub(crate) fn install_reactor(&self, reactor: Arc<Reactor>) {
        if self.core.reactor.set(reactor).is_err() {
            panic!("reactor installed twice");
        }
    }

    pub(crate) fn reactor(&self) -> Option<&Arc<Reactor>> {
        self.core.reactor.get()
    }

    /// Spawn the worker pool. No-op if already started.
    pub fn start(&self) {
        let mut threads = self.core.threads.lock().expect("scheduler lock poisoned");
        if !self.core.stopping.load(Ordering::SeqCst) {
            return;
        }
        self.core.stopping.store(false, Ordering::SeqCst);
        assert!(threads.is_empty());
        for i in 0..self.core.thread_count {
            let sched = self.clone();
            let name = format!("{}_{}", self.core.name, i);
            let thread = Thread::new(&name, move || sched.run())
                .unwrap_or_else(|e| panic!("failed to spawn scheduler worker: {}", e));
            threads.push(thread);
        }
    }

    /// Drain the queue and join the workers.
    ///
    /// On a `use_caller` scheduler this must run on the constructing thread;
    /// it re-enters the root fiber and participates in the draining until
    /// [`stopping`](Self::stopping) holds.
    pub fn stop(&self) {
        self.core.auto_stop.store(true, Ordering::SeqCst);
        let root = self
            .core
            .root_fiber
            .lock()
            .expect("scheduler lock poisoned")
            .clone();
        if let Some(root) = &root {
            if self.core.thread_count == 0
                && (root.state() == State::Term || root.state() == State::Init)
            {
                log::info!(target: "filament::scheduler", "scheduler {} stopped", self.core.name);
                self.core.stopping.store(true, Ordering::SeqCst);
                if self.stopping() {
                    return;
                }
            }
        }
        if self.core.root_thread != ANY_WORKER {
            assert!(
                Scheduler::current().map_or(false, |s| s.ptr_eq(self)),
                "a use_caller scheduler must be stopped from its constructor thread",
            );
        }
        self.core.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.core.thread_count {
            self.tickle();
        }
        if let Some(root) = root {
            if !self.stopping() {
                Fiber::call(&root);
            }
        }
        let threads = {
            let mut guard = self.core.threads.lock().expect("scheduler lock poisoned");
            std::mem::take(&mut *guard)
        };
        for mut thread in threads {
            thread.join();
        }
    }

    /// Submit a callback runnable on any worker.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.schedule_to(f, ANY_WORKER)
    }

    /// Submit a callback pinned to the worker with kernel tid `thread`.
    pub fn schedule_to<F: FnOnce() + Send + 'static>(&self, f: F, thread: libc::pid_t) {
        self.submit(Task {
            fiber: None,
            callback: Some(Box::new(f)),
            thread,
        })
    }

    pub(crate) fn schedule_boxed(&self, f: Callback) {
        self.submit(Task {
            fiber: None,
            callback: Some(f),
            thread: ANY_WORKER,
        })
    }

    /// Submit a fiber runnable on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_fiber_to(fiber, ANY_WORKER)
    }

    /// Submit a fiber pinned to the worker with kernel tid `thread`.
    pub fn schedule_fiber_to(&self, fiber: Arc<Fiber>, thread: libc::pid_t) {
        self.submit(Task {
            fiber: Some(fiber),
            callback: None,
            thread,
        })
    }

    fn submit(&self, task: Task) {
        let need_tickle = {
            let mut queue = self.core.queue.lock().expect("scheduler lock poisoned");
            let need_tickle = queue.is_empty();
            queue.push_back(task);
            need_tickle
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Wake idle workers so they recheck the queue (and, with a reactor, the
    /// epoll set).
    pub(crate) fn tickle(&self) {
        if let Some(reactor) = self.core.reactor.get() {
            if self.core.idle_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            reactor.notify();
        } else {
            log::trace!(target: "filament::scheduler", "tickle");
        }
    }

    /// True when the scheduler has fully drained: `stop` was requested, the
    /// queue is empty, no worker is active, and (with a reactor) no I/O
    /// events or timers are pending.
    pub fn stopping(&self) -> bool {
        if let Some(reactor) = self.core.reactor.get() {
            reactor.stopping(self)
        } else {
            self.base_stopping()
        }
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.core.auto_stop.load(Ordering::SeqCst)
            && self.core.stopping.load(Ordering::SeqCst)
            && self.core.queue.lock().expect("scheduler lock poisoned").is_empty()
            && self.core.active_count.load(Ordering::SeqCst) == 0
    }

    pub fn has_idle_threads(&self) -> bool {
        self.core.idle_count.load(Ordering::SeqCst) > 0
    }

    /// The worker loop. Runs on every pool thread, and on the caller thread
    /// inside the root fiber during `stop`.
    fn run(&self) {
        log::debug!(target: "filament::scheduler", "scheduler {} run", self.core.name);
        crate::hook::set_enabled(true);
        set_current(Some(self.clone()));
        let my_tid = thread::current_id();
        if my_tid != self.core.root_thread {
            // On a plain worker the scheduling loop runs on the thread's
            // native stack, so the thread root fiber is the swap target.
            fiber::set_scheduler_main(Some(Fiber::current()));
        }

        let idle_sched = self.clone();
        let idle_fiber = Fiber::new_raw(Box::new(move || idle_sched.idle()), 0, false);
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task: Option<Task> = None;
            let mut tickle_me = false;
            {
                let mut queue = self.core.queue.lock().expect("scheduler lock poisoned");
                let mut idx = 0;
                while idx < queue.len() {
                    let candidate = &queue[idx];
                    if candidate.thread != ANY_WORKER && candidate.thread != my_tid {
                        // Someone else's entry; make sure they wake up.
                        tickle_me = true;
                        idx += 1;
                        continue;
                    }
                    debug_assert!(candidate.fiber.is_some() || candidate.callback.is_some());
                    if let Some(f) = &candidate.fiber {
                        if f.state() == State::Exec {
                            idx += 1;
                            continue;
                        }
                    }
                    task = queue.remove(idx);
                    self.core.active_count.fetch_add(1, Ordering::SeqCst);
                    break;
                }
            }
            if tickle_me {
                self.tickle();
            }

            let task = match task {
                Some(task) => task,
                None => {
                    if idle_fiber.state() == State::Term {
                        log::debug!(
                            target: "filament::scheduler",
                            "scheduler {} idle fiber terminated",
                            self.core.name,
                        );
                        break;
                    }
                    self.core.idle_count.fetch_add(1, Ordering::SeqCst);
                    Fiber::resume(&idle_fiber);
                    self.core.idle_count.fetch_sub(1, Ordering::SeqCst);
                    let state = idle_fiber.state();
                    if state != State::Term && state != State::Except {
                        idle_fiber.set_state(State::Hold);
                    }
                    continue;
                }
            };

            if let Some(fiber) = task.fiber {
                let state = fiber.state();
                if state != State::Term && state != State::Except {
                    Fiber::resume(&fiber);
                    match fiber.state() {
                        State::Ready => self.schedule_fiber(fiber),
                        State::Term | State::Except => {}
                        // Held: ownership is external now, whoever holds the
                        // handle re-submits it. The fiber set Hold itself
                        // before suspending; storing it again here would race
                        // with a wake-up from another worker.
                        _ => {}
                    }
                }
                // Stays active until a Ready fiber is back in the queue, so
                // stopping() cannot observe a false drain.
                self.core.active_count.fetch_sub(1, Ordering::SeqCst);
            } else if let Some(callback) = task.callback {
                // Reuse one fiber for plain callbacks to amortize stack
                // allocation.
                let fiber = match cb_fiber.take() {
                    Some(fiber) => {
                        fiber.reset_raw(callback);
                        fiber
                    }
                    None => Fiber::new_raw(callback, 0, false),
                };
                Fiber::resume(&fiber);
                match fiber.state() {
                    State::Ready => self.schedule_fiber(fiber),
                    State::Term | State::Except => cb_fiber = Some(fiber),
                    _ => {}
                }
                self.core.active_count.fetch_sub(1, Ordering::SeqCst);
            } else {
                self.core.active_count.fetch_sub(1, Ordering::SeqCst);
            }
        }

        fiber::set_scheduler_main(None);
        if my_tid != self.core.root_thread {
            set_current(None);
        }
    }

    /// Entry of the per-worker idle fiber.
    fn idle(&self) {
        if let Some(reactor) = self.core.reactor.get().cloned() {
            reactor.idle(self);
        } else {
            log::debug!(target: "filament::scheduler", "scheduler {} idle", self.core.name);
            while !self.stopping() {
                Fiber::yield_to_hold();
            }
        }
    }
}

fn set_current(sched: Option<Scheduler>) {
    CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = sched);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn callbacks_run_on_workers() {
        let sched = Scheduler::new(2, false, "cb_pool");
        sched.start();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            sched.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn fibers_run_and_yield() {
        let sched = Scheduler::new(1, false, "yield_pool");
        sched.start();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        sched.schedule_fiber(Fiber::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_ready();
            c.fetch_add(1, Ordering::SeqCst);
        }));
        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ready_loop_does_not_starve_peers() {
        let sched = Scheduler::new(1, false, "fair_pool");
        sched.start();
        let spins = Arc::new(AtomicU32::new(0));
        let other_ran = Arc::new(AtomicBool::new(false));

        let spins2 = spins.clone();
        let other2 = other_ran.clone();
        sched.schedule_fiber(Fiber::new(move || {
            while !other2.load(Ordering::SeqCst) {
                spins2.fetch_add(1, Ordering::SeqCst);
                assert!(spins2.load(Ordering::SeqCst) < 10_000, "peer starved");
                Fiber::yield_to_ready();
            }
        }));
        let other3 = other_ran.clone();
        sched.schedule_fiber(Fiber::new(move || {
            other3.store(true, Ordering::SeqCst);
        }));
        sched.stop();
        assert!(other_ran.load(Ordering::SeqCst));
        assert!(spins.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn affinity_is_respected() {
        let sched = Scheduler::new(2, false, "pin_pool");
        sched.start();
        let tids = {
            let guard = sched.core.threads.lock().unwrap();
            (guard[0].id(), guard[1].id())
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..8 {
            let seen = seen.clone();
            sched.schedule_to(
                move || {
                    seen.lock().unwrap().push(thread::current_id());
                },
                tids.0,
            );
        }
        // Give the pinned worker a moment before stopping.
        std::thread::sleep(Duration::from_millis(50));
        sched.stop();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|tid| *tid == tids.0));
    }

    #[test]
    fn submissions_preserve_order_per_submitter() {
        let sched = Scheduler::new(1, false, "order_pool");
        sched.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            sched.schedule(move || order.lock().unwrap().push(i));
        }
        sched.stop();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }
}

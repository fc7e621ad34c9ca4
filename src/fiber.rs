//! Cooperative multitasking primitive.
//!
//! A [`Fiber`] is a stackful coroutine: it owns a stack, a saved machine
//! context and an entry closure, and it is resumed and suspended explicitly.
//! Fibers do not run by themselves; a [`Scheduler`](crate::scheduler)
//! dispatches them onto OS worker threads, and the
//! [hook facade](crate::hook) suspends them while the reactor waits for
//! readiness.
//!
//! Two distinguished fibers exist per thread:
//! - the *thread root* fiber, a context-only fiber standing for the OS
//!   thread's native stack;
//! - the *scheduler main* fiber, the one the worker loop executes on. On a
//!   plain worker both coincide; on a `use_caller` scheduler's constructor
//!   thread they differ, which is what lets that thread enter and leave the
//!   scheduler.

use std::cell::{RefCell, UnsafeCell};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::{self, ConfigVar};
use crate::thread;

mod context;
mod stack;

use context::Context;
use stack::Stack;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

static STACK_SIZE: Lazy<Arc<ConfigVar<u32>>> =
    Lazy::new(|| config::lookup::<u32>("fiber.stack_size", 1024 * 1024, "fiber stack size"));

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    /// The context-only fiber standing for this thread's native stack.
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    /// The fiber the scheduler's worker loop runs on, when one is attached.
    static SCHED_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Fiber state machine.
///
/// `Init -> Exec` on first resume; `Exec -> Hold | Ready` on a yield;
/// `Exec -> Term` when the entry returns; `Exec -> Except` when it panics.
/// `Term`/`Except` are terminal apart from [`Fiber::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Init = 0,
    Hold = 1,
    Exec = 2,
    Ready = 3,
    Term = 4,
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Hold,
            2 => State::Exec,
            3 => State::Ready,
            4 => State::Term,
            5 => State::Except,
            _ => unreachable!("invalid fiber state"),
        }
    }
}

/// A stackful, cooperatively scheduled user-space task.
pub struct Fiber {
    id: u64,
    /// Suspends back to the thread root context instead of the scheduler
    /// main context; set only on a `use_caller` scheduler's root fiber.
    use_caller: bool,
    state: AtomicU8,
    ctx: UnsafeCell<Context>,
    stack: Option<Stack>,
    entry: UnsafeCell<Option<Entry>>,
}

// Safety: a fiber is mutated (context, entry) only while it is being armed,
// resumed or suspended, and the scheduler guarantees it is Exec on at most
// one thread at a time. The queue hand-off provides the happens-before edge
// between the suspending and the resuming worker.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with the default stack size (`fiber.stack_size`).
    pub fn new(f: impl FnOnce() + Send + 'static) -> Arc<Fiber> {
        Self::new_raw(Box::new(f), 0, false)
    }

    /// Create a fiber with an explicit stack size in bytes.
    pub fn with_stack_size(stack_size: usize, f: impl FnOnce() + Send + 'static) -> Arc<Fiber> {
        Self::new_raw(Box::new(f), stack_size, false)
    }

    pub(crate) fn new_raw(entry: Entry, stack_size: usize, use_caller: bool) -> Arc<Fiber> {
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let size = if stack_size == 0 {
            STACK_SIZE.get() as usize
        } else {
            stack_size
        };
        let stack = Stack::new(size);
        let mut ctx = Context::new();
        unsafe { ctx.arm(stack.top(), fiber_entry) };
        log::debug!(target: "filament::fiber", "fiber {} created", id);
        Arc::new(Fiber {
            id,
            use_caller,
            state: AtomicU8::new(State::Init as u8),
            ctx: UnsafeCell::new(ctx),
            stack: Some(stack),
            entry: UnsafeCell::new(Some(entry)),
        })
    }

    /// Context-only fiber adopting the calling thread's native stack.
    fn new_root() -> Arc<Fiber> {
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id,
            use_caller: false,
            state: AtomicU8::new(State::Exec as u8),
            ctx: UnsafeCell::new(Context::new()),
            stack: None,
            entry: UnsafeCell::new(None),
        })
    }

    /// The fiber currently executing on this thread, bootstrapping the
    /// thread root fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(cur) = CURRENT.with(|c| c.borrow().clone()) {
            return cur;
        }
        let root = Fiber::new_root();
        THREAD_ROOT.with(|r| *r.borrow_mut() = Some(root.clone()));
        CURRENT.with(|c| *c.borrow_mut() = Some(root.clone()));
        root
    }

    /// Id of the current fiber, `0` when the thread runs no fiber yet.
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(0))
    }

    /// Number of live fibers in the process, root fibers included.
    pub fn count() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map(Stack::size).unwrap_or(0)
    }

    /// Rearm a finished fiber with a new entry, reusing its stack.
    ///
    /// Legal only in `Init`, `Term` or `Except`.
    pub fn reset(&self, f: impl FnOnce() + Send + 'static) {
        self.reset_raw(Box::new(f))
    }

    pub(crate) fn reset_raw(&self, entry: Entry) {
        let stack = self.stack.as_ref().expect("cannot reset a root fiber");
        let state = self.state();
        assert!(
            state == State::Init || state == State::Term || state == State::Except,
            "reset of fiber {} in state {:?}",
            self.id,
            state,
        );
        unsafe {
            *self.entry.get() = Some(entry);
            (*self.ctx.get()).arm(stack.top(), fiber_entry);
        }
        self.set_state(State::Init);
    }

    /// Swap the scheduler main context out for `this` fiber.
    ///
    /// Returns when the fiber suspends or terminates. Normally invoked by
    /// the worker loop; callable manually on a plain thread, where the
    /// thread root fiber doubles as the scheduler main one.
    pub fn resume(this: &Arc<Fiber>) {
        assert_ne!(this.state(), State::Exec, "resume of a running fiber");
        let main = scheduler_main();
        set_current(this.clone());
        this.set_state(State::Exec);
        unsafe { context::switch(main.ctx.get(), this.ctx.get()) };
    }

    /// Swap this fiber out for the scheduler main context.
    pub(crate) fn suspend(&self) {
        let main = scheduler_main();
        debug_assert_eq!(main.state(), State::Exec);
        set_current(main.clone());
        unsafe { context::switch(self.ctx.get(), main.ctx.get()) };
    }

    /// Enter a `use_caller` root fiber from the thread root context.
    pub(crate) fn call(this: &Arc<Fiber>) {
        let root = thread_root();
        debug_assert!(!Arc::ptr_eq(this, &root));
        set_current(this.clone());
        this.set_state(State::Exec);
        unsafe { context::switch(root.ctx.get(), this.ctx.get()) };
    }

    /// Leave a `use_caller` root fiber back to the thread root context.
    pub(crate) fn call_out(&self) {
        let root = thread_root();
        debug_assert_eq!(root.state(), State::Exec);
        set_current(root.clone());
        unsafe { context::switch(self.ctx.get(), root.ctx.get()) };
    }

    /// Suspend the current fiber in `Hold`: it will not run again until
    /// something re-submits it to a scheduler.
    pub fn yield_to_hold() {
        let cur = Fiber::current();
        cur.set_state(State::Hold);
        if cur.use_caller {
            cur.call_out();
        } else {
            cur.suspend();
        }
    }

    /// Suspend the current fiber in `Ready`: the scheduler re-queues it
    /// immediately.
    pub fn yield_to_ready() {
        let cur = Fiber::current();
        cur.set_state(State::Ready);
        if cur.use_caller {
            cur.call_out();
        } else {
            cur.suspend();
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            debug_assert!(
                state == State::Init || state == State::Term || state == State::Except,
                "fiber {} dropped in state {:?}",
                self.id,
                state,
            );
        }
        log::debug!(target: "filament::fiber", "fiber {} destroyed", self.id);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber));
}

fn thread_root() -> Arc<Fiber> {
    if let Some(root) = THREAD_ROOT.with(|r| r.borrow().clone()) {
        return root;
    }
    Fiber::current();
    THREAD_ROOT.with(|r| r.borrow().clone()).expect("thread root fiber")
}

/// The fiber every resumed fiber on this thread swaps with. Falls back to
/// the thread root fiber outside a scheduler worker.
pub(crate) fn scheduler_main() -> Arc<Fiber> {
    if let Some(main) = SCHED_MAIN.with(|m| m.borrow().clone()) {
        return main;
    }
    thread_root()
}

/// Attach (or detach) the scheduler main fiber of this thread.
pub(crate) fn set_scheduler_main(fiber: Option<Arc<Fiber>>) {
    SCHED_MAIN.with(|m| *m.borrow_mut() = fiber);
}

/// First frame of every fiber: run the entry, record the terminal state,
/// leave for good.
extern "C" fn fiber_entry() -> ! {
    let cur = Fiber::current();
    let entry = unsafe { (*cur.entry.get()).take() };
    match entry {
        Some(f) => match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => cur.set_state(State::Term),
            Err(payload) => {
                cur.set_state(State::Except);
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".into());
                log::error!(
                    target: "filament::fiber",
                    "fiber {} panicked: {}\n{}",
                    cur.id,
                    message,
                    thread::backtrace_string(),
                );
            }
        },
        None => cur.set_state(State::Term),
    }
    // Drop our strong reference before leaving; the resuming worker still
    // holds one on its stack.
    let use_caller = cur.use_caller;
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    unsafe {
        if use_caller {
            (*raw).call_out();
        } else {
            (*raw).suspend();
        }
    }
    unreachable!("a terminated fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_states() {
        let fiber = Fiber::with_stack_size(64 * 1024, || {
            Fiber::yield_to_hold();
        });
        assert_eq!(fiber.state(), State::Init);
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Hold);
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Term);
        // No one else retains the handle: the stack dies with this drop.
        assert_eq!(Arc::strong_count(&fiber), 1);
        drop(fiber);
    }

    #[test]
    fn entry_sees_itself_as_current() {
        let fiber = Fiber::with_stack_size(64 * 1024, || {
            assert_ne!(Fiber::current_id(), 0);
        });
        let id = fiber.id();
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Term);
        assert_ne!(Fiber::current().id(), id);
    }

    #[test]
    fn yield_to_ready_marks_ready() {
        let fiber = Fiber::with_stack_size(64 * 1024, || {
            Fiber::yield_to_ready();
        });
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Ready);
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn panic_turns_into_except() {
        let fiber = Fiber::with_stack_size(64 * 1024, || {
            panic!("boom");
        });
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Except);
    }

    #[test]
    fn reset_reuses_the_stack() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static RUNS: AtomicU32 = AtomicU32::new(0);
        let fiber = Fiber::with_stack_size(64 * 1024, || {
            RUNS.fetch_add(1, Ordering::SeqCst);
        });
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Term);
        fiber.reset(|| {
            RUNS.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), State::Init);
        Fiber::resume(&fiber);
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(RUNS.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn ids_are_unique_and_counted() {
        let a = Fiber::with_stack_size(64 * 1024, || {});
        let b = Fiber::with_stack_size(64 * 1024, || {});
        assert_ne!(a.id(), b.id());
        assert!(Fiber::count() >= 2);
        Fiber::resume(&a);
        Fiber::resume(&b);
    }
}

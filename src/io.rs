//! I/O manager: the scheduler fused with an epoll reactor and the timer
//! manager.
//!
//! [`IoManager`] extends a [`Scheduler`] with readiness dispatch: fibers (or
//! callbacks) are bound to `READ`/`WRITE` events on file descriptors, and the
//! per-worker idle fiber blocks in `epoll_wait` instead of spinning. Timer
//! deadlines bound the wait; a self-pipe unblocks it when work or a new
//! earliest timer arrives. Registration is edge-triggered, so a woken
//! consumer must drain until `EAGAIN`, which is exactly what the
//! [hook facade](crate::hook) does.
//!
//! Every fd has a context with one slot per direction. The armed event mask,
//! the epoll registration and the slots only change under the per-fd mutex.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::clock;
use crate::error::Result;
use crate::fiber::{Fiber, State};
use crate::scheduler::Scheduler;
use crate::timer::{Timer, TimerManager};

bitflags::bitflags! {
    /// Readiness event directions, values matching `EPOLLIN`/`EPOLLOUT`.
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

/// Cancellation token shared between a parked I/O wait and whoever may
/// cancel it. The first stored errno wins; `0` means not cancelled.
#[derive(Default)]
pub(crate) struct IoWait {
    cancelled: AtomicI32,
}

impl IoWait {
    pub(crate) fn store_cancelled(&self, errno: libc::c_int) -> bool {
        self.cancelled
            .compare_exchange(0, errno, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn cancelled(&self) -> libc::c_int {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// What to wake when the event fires.
pub(crate) enum Binding {
    /// Park the calling fiber; the token lets `cancel_event` pass an errno.
    CurrentFiber(Weak<IoWait>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

struct EventSlot {
    scheduler: Option<Scheduler>,
    fiber: Option<Arc<Fiber>>,
    callback: Option<Box<dyn FnOnce() + Send + 'static>>,
    token: Weak<IoWait>,
}

impl Default for EventSlot {
    fn default() -> Self {
        EventSlot {
            scheduler: None,
            fiber: None,
            callback: None,
            token: Weak::new(),
        }
    }
}

impl EventSlot {
    fn is_empty(&self) -> bool {
        self.fiber.is_none() && self.callback.is_none()
    }
}

struct FdState {
    /// Union of directions with a bound slot; mirrors what epoll last saw.
    events: Event,
    read: EventSlot,
    write: EventSlot,
}

impl Default for FdState {
    fn default() -> Self {
        FdState {
            events: Event::empty(),
            read: EventSlot::default(),
            write: EventSlot::default(),
        }
    }
}

impl FdState {
    fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            unreachable!("exactly one event direction expected")
        }
    }
}

struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

const INITIAL_CONTEXTS: usize = 64;
const MAX_EVENTS: usize = 64;
const MAX_TIMEOUT_MS: u64 = 500;

pub(crate) struct Reactor {
    epfd: RawFd,
    tickle_read: RawFd,
    tickle_write: RawFd,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    pending: AtomicUsize,
    pub(crate) timers: TimerManager,
}

impl Reactor {
    pub(crate) fn new() -> Arc<Reactor> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            panic!(
                "epoll_create1 failed: {}",
                std::io::Error::last_os_error()
            );
        }
        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            panic!("pipe failed: {}", std::io::Error::last_os_error());
        }
        let flags = unsafe { libc::fcntl(pipe_fds[0], libc::F_GETFL, 0) };
        if flags < 0
            || unsafe { libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
        {
            panic!(
                "failed to make the tickle pipe non-blocking: {}",
                std::io::Error::last_os_error()
            );
        }
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut event) } != 0 {
            panic!(
                "failed to register the tickle pipe: {}",
                std::io::Error::last_os_error()
            );
        }

        let reactor = Arc::new(Reactor {
            epfd,
            tickle_read: pipe_fds[0],
            tickle_write: pipe_fds[1],
            contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            timers: TimerManager::new(),
        });
        reactor.grow_contexts(INITIAL_CONTEXTS);
        reactor
    }

    /// Write one byte into the self-pipe to unblock `epoll_wait`.
    pub(crate) fn notify(&self) {
        let byte = b"T";
        unsafe { libc::write(self.tickle_write, byte.as_ptr() as *const libc::c_void, 1) };
    }

    pub(crate) fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn context_capacity(&self) -> usize {
        self.contexts.read().expect("fd context lock poisoned").len()
    }

    fn grow_contexts(&self, len: usize) {
        let mut contexts = self.contexts.write().expect("fd context lock poisoned");
        while contexts.len() < len {
            let fd = contexts.len() as RawFd;
            contexts.push(Arc::new(FdContext {
                fd,
                state: Mutex::new(FdState::default()),
            }));
        }
    }

    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        {
            let contexts = self.contexts.read().expect("fd context lock poisoned");
            if (fd as usize) < contexts.len() {
                return contexts[fd as usize].clone();
            }
        }
        let len = {
            let contexts = self.contexts.read().expect("fd context lock poisoned");
            contexts.len()
        };
        self.grow_contexts((fd as usize + 1).max(len * 3 / 2).max(INITIAL_CONTEXTS));
        let contexts = self.contexts.read().expect("fd context lock poisoned");
        contexts[fd as usize].clone()
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let contexts = self.contexts.read().expect("fd context lock poisoned");
        contexts.get(fd as usize).cloned()
    }

    fn epoll_update(&self, fd: RawFd, op: libc::c_int, events: Event) -> Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLET as u32 | events.bits(),
            u64: fd as u64,
        };
        let event_ptr: *mut libc::epoll_event = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, event_ptr) } != 0 {
            let err = std::io::Error::last_os_error();
            log::error!(
                target: "filament::io",
                "epoll_ctl({}, {}, {}, {:#x}) failed: {}",
                self.epfd,
                op,
                fd,
                events.bits(),
                err,
            );
            return Err(err.into());
        }
        Ok(())
    }

    /// Arm `event` on `fd` and bind the wake target.
    ///
    /// # Panics
    ///
    /// Panics if the direction is already armed; double registration is a
    /// programming error.
    pub(crate) fn add_event(
        &self,
        owner: &Scheduler,
        fd: RawFd,
        event: Event,
        binding: Binding,
    ) -> Result<()> {
        debug_assert_eq!(event.bits().count_ones(), 1);
        let ctx = self.context(fd);
        let mut state = ctx.state.lock().expect("fd context lock poisoned");
        if state.events.contains(event) {
            log::error!(
                target: "filament::io",
                "add duplicate event: fd={} event={:#x} armed={:#x}",
                fd,
                event.bits(),
                state.events.bits(),
            );
            panic!("event {:#x} already registered for fd {}", event.bits(), fd);
        }
        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.epoll_update(fd, op, state.events | event)?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        state.events |= event;
        let slot = state.slot_mut(event);
        debug_assert!(slot.is_empty());
        slot.scheduler = Some(Scheduler::current().unwrap_or_else(|| owner.clone()));
        match binding {
            Binding::Callback(cb) => {
                slot.callback = Some(cb);
            }
            Binding::CurrentFiber(token) => {
                let fiber = Fiber::current();
                assert_eq!(fiber.state(), State::Exec);
                slot.fiber = Some(fiber);
                slot.token = token;
            }
        }
        Ok(())
    }

    /// Disarm `event` on `fd` without waking the bound target.
    pub(crate) fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.state.lock().expect("fd context lock poisoned");
        if !state.events.contains(event) {
            return false;
        }
        let remaining = state.events - event;
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_update(fd, op, remaining).is_err() {
            return false;
        }
        state.events = remaining;
        *state.slot_mut(event) = EventSlot::default();
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarm `event` on `fd` and wake the bound target once, marking its
    /// wait token cancelled (`ECANCELED` unless an earlier code was stored).
    pub(crate) fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.state.lock().expect("fd context lock poisoned");
        if !state.events.contains(event) {
            return false;
        }
        let remaining = state.events - event;
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_update(fd, op, remaining).is_err() {
            return false;
        }
        if let Some(token) = state.slot_mut(event).token.upgrade() {
            token.store_cancelled(libc::ECANCELED);
        }
        self.trigger(&mut state, event);
        true
    }

    /// Disarm everything on `fd`, waking every bound target.
    pub(crate) fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.state.lock().expect("fd context lock poisoned");
        if state.events.is_empty() {
            return false;
        }
        if self.epoll_update(fd, libc::EPOLL_CTL_DEL, Event::empty()).is_err() {
            return false;
        }
        for event in [Event::READ, Event::WRITE] {
            if state.events.contains(event) {
                if let Some(token) = state.slot_mut(event).token.upgrade() {
                    token.store_cancelled(libc::ECANCELED);
                }
                self.trigger(&mut state, event);
            }
        }
        debug_assert!(state.events.is_empty());
        true
    }

    /// Submit the bound fiber/callback of `event` back to its owning
    /// scheduler and clear the slot. Caller holds the per-fd lock.
    fn trigger(&self, state: &mut FdState, event: Event) {
        debug_assert!(state.events.contains(event));
        state.events -= event;
        let slot = state.slot_mut(event);
        let scheduler = slot.scheduler.take();
        let callback = slot.callback.take();
        let fiber = slot.fiber.take();
        slot.token = Weak::new();
        if let Some(scheduler) = scheduler {
            if let Some(callback) = callback {
                scheduler.schedule_boxed(callback);
            } else if let Some(fiber) = fiber {
                scheduler.schedule_fiber(fiber);
            }
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// True when the I/O manager has fully drained: base scheduler stopping
    /// plus no pending events and no timers.
    pub(crate) fn stopping(&self, sched: &Scheduler) -> bool {
        let mut next = clock::INFINITE;
        self.stopping_with(sched, &mut next)
    }

    fn stopping_with(&self, sched: &Scheduler, next: &mut u64) -> bool {
        *next = self.timers.next_timer();
        *next == clock::INFINITE
            && self.pending.load(Ordering::SeqCst) == 0
            && sched.base_stopping()
    }

    /// The reactor's idle fiber body: wait for readiness or timer deadlines,
    /// dispatch, then yield back to the worker loop to run what was queued.
    pub(crate) fn idle(&self, sched: &Scheduler) {
        log::debug!(target: "filament::io", "scheduler {} enters the reactor idle loop", sched.name());
        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(MAX_EVENTS);
        loop {
            let mut next = clock::INFINITE;
            if self.stopping_with(sched, &mut next) {
                log::debug!(
                    target: "filament::io",
                    "scheduler {} reactor idle exits",
                    sched.name(),
                );
                break;
            }

            let timeout = next.min(MAX_TIMEOUT_MS) as libc::c_int;
            let count = loop {
                let rc = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout)
                };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    log::error!(target: "filament::io", "epoll_wait failed: {}", err);
                    break 0;
                }
                break rc as usize;
            };
            // Safety: epoll_wait initialized the first `count` entries.
            unsafe { events.set_len(count) };

            for callback in self.timers.list_expired() {
                sched.schedule_boxed(Box::new(move || callback()));
            }

            for event in events.iter() {
                let fd = event.u64 as RawFd;
                if fd == self.tickle_read {
                    // Edge-triggered: drain the pipe completely.
                    let mut buf = [0u8; 256];
                    loop {
                        let n = unsafe {
                            libc::read(
                                self.tickle_read,
                                buf.as_mut_ptr() as *mut libc::c_void,
                                buf.len(),
                            )
                        };
                        if n <= 0 {
                            break;
                        }
                    }
                    continue;
                }
                let ctx = match self.lookup(fd) {
                    Some(ctx) => ctx,
                    None => continue,
                };
                let mut state = ctx.state.lock().expect("fd context lock poisoned");
                let mut real = event.events;
                if real & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // An error wakes both directions so the waiters can
                    // observe it through the failing syscall.
                    real |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & state.events.bits();
                }
                let active = Event::from_bits_truncate(real) & state.events;
                if active.is_empty() {
                    continue;
                }
                let remaining = state.events - active;
                let op = if remaining.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if self.epoll_update(ctx.fd, op, remaining).is_err() {
                    continue;
                }
                if active.contains(Event::READ) {
                    self.trigger(&mut state, Event::READ);
                }
                if active.contains(Event::WRITE) {
                    self.trigger(&mut state, Event::WRITE);
                }
            }

            // Let the worker loop pick up whatever was just scheduled.
            Fiber::yield_to_hold();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_read);
            libc::close(self.tickle_write);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// IoManager
////////////////////////////////////////////////////////////////////////////////

/// A [`Scheduler`] whose idle fibers run an epoll reactor.
///
/// Dereferences to the underlying scheduler, so `schedule`, `stop` and
/// friends are available directly.
#[derive(Clone)]
pub struct IoManager {
    sched: Scheduler,
}

impl std::ops::Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl IoManager {
    /// Create the manager and start its workers immediately.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> IoManager {
        let sched = Scheduler::new(threads, use_caller, name);
        let reactor = Reactor::new();
        let weak = sched.downgrade();
        reactor.timers.set_waker(Box::new(move || {
            if let Some(sched) = weak.upgrade() {
                sched.tickle();
            }
        }));
        sched.install_reactor(reactor);
        sched.start();
        IoManager { sched }
    }

    /// The I/O manager driving the calling thread, if any.
    pub fn current() -> Option<IoManager> {
        Self::from_scheduler(Scheduler::current()?)
    }

    /// Recover the manager handle from a scheduler that carries a reactor.
    pub(crate) fn from_scheduler(sched: Scheduler) -> Option<IoManager> {
        sched.reactor()?;
        Some(IoManager { sched })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    fn reactor(&self) -> &Arc<Reactor> {
        self.sched.reactor().expect("io manager without a reactor")
    }

    /// Arm `event` on `fd`, capturing the *current fiber* as the wake
    /// target. The caller is expected to yield right after.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        self.reactor()
            .add_event(&self.sched, fd, event, Binding::CurrentFiber(Weak::new()))
    }

    pub(crate) fn add_event_with_token(
        &self,
        fd: RawFd,
        event: Event,
        token: &Arc<IoWait>,
    ) -> Result<()> {
        self.reactor().add_event(
            &self.sched,
            fd,
            event,
            Binding::CurrentFiber(Arc::downgrade(token)),
        )
    }

    /// Arm `event` on `fd` with an explicit callback as the wake target.
    pub fn add_event_callback(
        &self,
        fd: RawFd,
        event: Event,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.reactor()
            .add_event(&self.sched, fd, event, Binding::Callback(Box::new(cb)))
    }

    /// Disarm without waking. Returns whether the event was armed.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor().del_event(fd, event)
    }

    /// Disarm and wake the bound fiber/callback exactly once. A parked
    /// [`hook`](crate::hook) operation observes `ECANCELED`.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor().cancel_event(fd, event)
    }

    /// Disarm both directions, waking every bound target.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor().cancel_all(fd)
    }

    /// Schedule `cb` to run in `ms` milliseconds on this manager.
    pub fn add_timer(&self, ms: u64, cb: impl Fn() + Send + Sync + 'static, recurring: bool) -> Timer {
        self.reactor().timers.add_timer(ms, cb, recurring)
    }

    /// Like [`add_timer`](Self::add_timer); the callback is skipped once
    /// `cond` is dead.
    pub fn add_conditional_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.reactor().timers.add_conditional_timer(ms, cb, cond, recurring)
    }

    /// Milliseconds until the earliest timer deadline.
    pub fn next_timer(&self) -> u64 {
        self.reactor().timers.next_timer()
    }

    /// Does the manager hold any scheduled timer?
    pub fn has_timer(&self) -> bool {
        self.reactor().timers.has_timer()
    }

    /// Number of armed, not yet fired event registrations.
    pub fn pending_event_count(&self) -> usize {
        self.reactor().pending_event_count()
    }

    #[doc(hidden)]
    pub fn fd_context_capacity(&self) -> usize {
        self.reactor().context_capacity()
    }

    pub fn stop(&self) {
        self.sched.stop()
    }
}

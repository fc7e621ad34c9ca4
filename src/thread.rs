//! OS thread primitives used by the scheduler.
//!
//! [`Thread`] is a thin wrapper over a platform thread whose constructor
//! blocks until the spawned thread has published its kernel thread id and
//! adopted its name, so [`Thread::id`] is always valid on return. A counting
//! [`Semaphore`] implements the handshake and is exposed for general use.

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{Error, Result};

thread_local! {
    static THREAD_ID: Cell<libc::pid_t> = Cell::new(0);
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

/// Kernel thread id (`gettid`) of the calling thread.
pub fn current_id() -> libc::pid_t {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t });
        }
        id.get()
    })
}

/// Name of the calling thread as set through [`set_name`], `"UNKNOWN"`
/// otherwise. Usable even during thread teardown.
pub fn current_name() -> String {
    THREAD_NAME
        .try_with(|name| name.borrow().clone())
        .unwrap_or_else(|_| String::from("UNKNOWN"))
}

/// Rename the calling thread, both in the thread-local cache and in the
/// kernel (`pthread_setname_np`, truncated to 15 bytes).
pub fn set_name(name: &str) {
    THREAD_NAME.with(|cell| *cell.borrow_mut() = name.to_string());
    let truncated: String = name.chars().take(15).collect();
    if let Ok(cname) = CString::new(truncated) {
        unsafe { libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr()) };
    }
}

/// Format the current call stack for diagnostics.
pub fn backtrace_string() -> String {
    std::backtrace::Backtrace::force_capture().to_string()
}

////////////////////////////////////////////////////////////////////////////////
// Semaphore
////////////////////////////////////////////////////////////////////////////////

/// Counting semaphore over the Posix `sem_t`.
pub struct Semaphore {
    sem: std::cell::UnsafeCell<libc::sem_t>,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn new(count: u32) -> Result<Self> {
        let sem = std::cell::UnsafeCell::new(unsafe { std::mem::zeroed() });
        if unsafe { libc::sem_init(sem.get(), 0, count) } != 0 {
            return Err(Error::IO(std::io::Error::last_os_error()));
        }
        Ok(Semaphore { sem })
    }

    /// Decrement, blocking until the count is positive. Retries on `EINTR`.
    pub fn wait(&self) {
        loop {
            let rc = unsafe { libc::sem_wait(self.sem.get()) };
            if rc == 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                panic!("sem_wait failed: {}", err);
            }
        }
    }

    /// Increment, waking one waiter.
    pub fn post(&self) {
        if unsafe { libc::sem_post(self.sem.get()) } != 0 {
            panic!("sem_post failed: {}", std::io::Error::last_os_error());
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_destroy(self.sem.get()) };
    }
}

////////////////////////////////////////////////////////////////////////////////
// Thread
////////////////////////////////////////////////////////////////////////////////

/// A named OS thread.
///
/// Dropping the wrapper without [`Thread::join`] detaches the thread, like
/// `pthread_detach`.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    id: libc::pid_t,
    name: String,
}

impl Thread {
    pub fn new(name: &str, f: impl FnOnce() + Send + 'static) -> Result<Thread> {
        let name = if name.is_empty() { "UNKNOWN" } else { name }.to_string();
        let started = Arc::new(Semaphore::new(0)?);
        let id_slot = Arc::new(AtomicI32::new(0));

        let thread_name = name.clone();
        let thread_started = started.clone();
        let thread_id_slot = id_slot.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                set_name(&thread_name);
                thread_id_slot.store(current_id(), Ordering::Release);
                thread_started.post();
                f();
            })
            .map_err(Error::IO)?;

        // Wait for the child to publish its id and name so that id() is
        // meaningful as soon as the constructor returns.
        started.wait();
        Ok(Thread {
            handle: Some(handle),
            id: id_slot.load(Ordering::Acquire),
            name,
        })
    }

    pub fn id(&self) -> libc::pid_t {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!(
                    target: "filament::thread",
                    "thread {} terminated with a panic",
                    self.name,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn id_is_valid_after_construction() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let mut t = Thread::new("test_worker", move || {
            assert_eq!(current_name(), "test_worker");
            ran2.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(t.id() > 0);
        assert_ne!(t.id(), current_id());
        t.join();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn semaphore_orders_producer_consumer() {
        let sem = Arc::new(Semaphore::new(0).unwrap());
        let sem2 = sem.clone();
        let mut t = Thread::new("sem_poster", move || {
            sem2.post();
            sem2.post();
        })
        .unwrap();
        sem.wait();
        sem.wait();
        t.join();
    }
}

//! Process-wide file descriptor bookkeeping for the hook facade.
//!
//! Every fd that passes through the hooked syscall surface gets a lazily
//! created record: is it a socket, did the runtime force `O_NONBLOCK` on it,
//! did the *user* ask for non-blocking behavior, and what are its per
//! direction timeouts. The real descriptor of a socket is always kept
//! non-blocking; the user-visible flag is an illusion maintained by the
//! hooked `fcntl`/`ioctl`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// Timeout value meaning "wait forever".
pub const TIMEOUT_INFINITE: i64 = -1;

/// Per-fd record of the FD manager.
pub struct FdEntry {
    fd: RawFd,
    is_socket: bool,
    /// The runtime forced `O_NONBLOCK` when the record was created.
    sys_nonblock: AtomicBool,
    /// The last non-blocking value the user asked for.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
}

impl FdEntry {
    fn new(fd: RawFd) -> FdEntry {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0
            && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                sys_nonblock = true;
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
        }
        FdEntry {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(TIMEOUT_INFINITE),
            send_timeout_ms: AtomicI64::new(TIMEOUT_INFINITE),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub(crate) fn set_user_nonblock(&self, value: bool) {
        self.user_nonblock.store(value, Ordering::SeqCst);
    }

    /// Timeout in ms for the given direction (`SO_RCVTIMEO`/`SO_SNDTIMEO`),
    /// [`TIMEOUT_INFINITE`] when unset.
    pub fn timeout(&self, kind: libc::c_int) -> i64 {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.load(Ordering::SeqCst)
        } else {
            self.send_timeout_ms.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn set_timeout(&self, kind: libc::c_int, ms: i64) {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.store(ms, Ordering::SeqCst);
        } else {
            self.send_timeout_ms.store(ms, Ordering::SeqCst);
        }
    }
}

/// Grow-on-demand table of [`FdEntry`] records.
pub struct FdManager {
    entries: RwLock<Vec<Option<Arc<FdEntry>>>>,
}

const INITIAL_ENTRIES: usize = 64;

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            entries: RwLock::new(vec![None; INITIAL_ENTRIES]),
        }
    }

    /// Fetch the record for `fd`, creating it when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        {
            let entries = self.entries.read().expect("fd manager lock poisoned");
            match entries.get(fd as usize) {
                Some(Some(entry)) => return Some(entry.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }
        let mut entries = self.entries.write().expect("fd manager lock poisoned");
        if fd as usize >= entries.len() {
            let new_len = (fd as usize + 1)
                .max(entries.len() * 3 / 2)
                .max(INITIAL_ENTRIES);
            entries.resize(new_len, None);
        }
        if let Some(entry) = &entries[fd as usize] {
            return Some(entry.clone());
        }
        let entry = Arc::new(FdEntry::new(fd));
        entries[fd as usize] = Some(entry.clone());
        Some(entry)
    }

    /// Drop the record for `fd`, marking it closed for late lookups.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut entries = self.entries.write().expect("fd manager lock poisoned");
        if let Some(slot) = entries.get_mut(fd as usize) {
            if let Some(entry) = slot.take() {
                entry.mark_closed();
            }
        }
    }
}

static FD_MANAGER: Lazy<FdManager> = Lazy::new(FdManager::new);

/// The process-wide FD manager singleton.
pub fn fd_manager() -> &'static FdManager {
    &FD_MANAGER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_records_force_nonblock() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let entry = fd_manager().get(fd, true).unwrap();
        assert!(entry.is_socket());
        assert!(entry.sys_nonblock());
        assert!(!entry.user_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);
        fd_manager().del(fd);
        assert!(entry.is_closed());
        assert!(fd_manager().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn non_socket_is_left_alone() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let entry = fd_manager().get(fds[0], true).unwrap();
        assert!(!entry.is_socket());
        assert!(!entry.sys_nonblock());
        fd_manager().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn timeouts_default_to_infinite() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let entry = fd_manager().get(fd, true).unwrap();
        assert_eq!(entry.timeout(libc::SO_RCVTIMEO), TIMEOUT_INFINITE);
        entry.set_timeout(libc::SO_RCVTIMEO, 1500);
        assert_eq!(entry.timeout(libc::SO_RCVTIMEO), 1500);
        assert_eq!(entry.timeout(libc::SO_SNDTIMEO), TIMEOUT_INFINITE);
        fd_manager().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn table_grows_past_the_initial_capacity() {
        let want = INITIAL_ENTRIES as RawFd + 40;
        let entry = fd_manager().get(want, true).unwrap();
        assert_eq!(entry.fd(), want);
        fd_manager().del(want);
    }
}

//! The transparent-blocking syscall facade.
//!
//! Rust has no dynamic-linker symbol interposition to offer, so the facade
//! is explicit: this module exposes the POSIX socket/sleep surface with the
//! exact return-value and `errno` semantics of the underlying calls, and the
//! rest of the crate (and its users) call through it instead of libc.
//!
//! Hooking is gated per thread by [`set_enabled`]; scheduler workers enable
//! it on startup. With the hook disabled every entry point delegates
//! straight to the OS. With it enabled, a blocking-style operation on a
//! socket the user left in blocking mode is translated into: try the
//! non-blocking syscall, and on `EAGAIN` register a readiness event (plus a
//! conditional timeout timer when the fd has one), park the calling fiber,
//! and retry once the reactor wakes it. A timed-out wait fails with
//! `ETIMEDOUT`, an explicitly cancelled one with `ECANCELED`, an operation
//! on a closed fd with `EBADF`.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::{self, ConfigVar};
use crate::fd::{self, TIMEOUT_INFINITE};
use crate::fiber::Fiber;
use crate::io::{Event, IoManager, IoWait};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Is the facade active on the calling thread?
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|f| f.get())
}

/// Toggle the facade for the calling thread. Scheduler workers enable it
/// when they start.
pub fn set_enabled(flag: bool) {
    HOOK_ENABLED.with(|f| f.set(flag))
}

static CONNECT_TIMEOUT_MS: AtomicI64 = AtomicI64::new(5000);

static TCP_CONNECT_TIMEOUT: Lazy<Arc<ConfigVar<i64>>> = Lazy::new(|| {
    let var = config::lookup::<i64>("tcp.connect.timeout", 5000, "tcp connect timeout");
    CONNECT_TIMEOUT_MS.store(var.get(), Ordering::SeqCst);
    var.add_listener(|old, new| {
        log::info!(
            target: "filament::hook",
            "tcp connect timeout changed from {} to {}",
            old,
            new,
        );
        CONNECT_TIMEOUT_MS.store(*new, Ordering::SeqCst);
    });
    var
});

fn connect_timeout_ms() -> i64 {
    Lazy::force(&TCP_CONNECT_TIMEOUT);
    CONNECT_TIMEOUT_MS.load(Ordering::SeqCst)
}

fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

fn set_errno(code: libc::c_int) {
    unsafe { *libc::__errno_location() = code };
}

/// Common path of every hooked I/O entry point.
///
/// `syscall` performs the raw non-blocking call; `event` is the readiness
/// direction to wait on and `timeout_kind` selects which per-fd timeout
/// applies (`SO_RCVTIMEO`/`SO_SNDTIMEO`).
fn do_io<F>(
    fd: RawFd,
    name: &str,
    event: Event,
    timeout_kind: libc::c_int,
    mut syscall: F,
) -> isize
where
    F: FnMut() -> isize,
{
    if !is_enabled() {
        return syscall();
    }
    let entry = match fd::fd_manager().get(fd, false) {
        Some(entry) => entry,
        None => return syscall(),
    };
    if entry.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    // The user explicitly asked for non-blocking behavior (or this is not a
    // socket): keep the caller's contract untouched.
    if !entry.is_socket() || entry.user_nonblock() {
        return syscall();
    }

    let timeout = entry.timeout(timeout_kind);
    let token = Arc::new(IoWait::default());
    loop {
        let mut n = syscall();
        while n == -1 && errno() == libc::EINTR {
            n = syscall();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }
        log::debug!(target: "filament::hook", "{}(fd={}) would block", name, fd);
        let io = IoManager::current()
            .expect("hooked blocking call outside of an IoManager worker");

        let timer = if timeout != TIMEOUT_INFINITE {
            let weak_token = Arc::downgrade(&token);
            let weak_sched = io.scheduler().downgrade();
            Some(io.add_conditional_timer(
                timeout as u64,
                move || {
                    let token = match weak_token.upgrade() {
                        Some(token) => token,
                        None => return,
                    };
                    if !token.store_cancelled(libc::ETIMEDOUT) {
                        return;
                    }
                    if let Some(sched) = weak_sched.upgrade() {
                        if let Some(io) = IoManager::from_scheduler(sched) {
                            io.cancel_event(fd, event);
                        }
                    }
                },
                Arc::downgrade(&token),
                false,
            ))
        } else {
            None
        };

        if let Err(e) = io.add_event_with_token(fd, event, &token) {
            log::error!(
                target: "filament::hook",
                "{}: failed to register {:?} on fd {}: {}",
                name,
                event,
                fd,
                e,
            );
            if let Some(timer) = timer {
                timer.cancel();
            }
            return -1;
        }

        Fiber::yield_to_hold();
        if let Some(timer) = timer {
            timer.cancel();
        }
        let code = token.cancelled();
        if code != 0 {
            set_errno(code);
            return -1;
        }
        // Spurious or consumed readiness: retry the syscall.
    }
}

/// Park the current fiber for `ms` milliseconds on the current I/O manager.
fn sleep_ms(ms: u64) {
    let fiber = Fiber::current();
    let io = IoManager::current().expect("hooked sleep outside of an IoManager worker");
    let weak = io.scheduler().downgrade();
    io.add_timer(
        ms,
        move || {
            if let Some(sched) = weak.upgrade() {
                sched.schedule_fiber(fiber.clone());
            }
        },
        false,
    );
    Fiber::yield_to_hold();
}

pub fn sleep(seconds: libc::c_uint) -> libc::c_uint {
    if !is_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

pub fn usleep(usec: libc::useconds_t) -> libc::c_int {
    if !is_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    sleep_ms(usec as u64 / 1000);
    0
}

/// The hooked variant never reports a remainder: the fiber sleeps the whole
/// interval.
pub fn nanosleep(req: &libc::timespec) -> libc::c_int {
    if !is_enabled() {
        return unsafe { libc::nanosleep(req, std::ptr::null_mut()) };
    }
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_ms(ms);
    0
}

pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> libc::c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !is_enabled() || fd == -1 {
        return fd;
    }
    fd::fd_manager().get(fd, true);
    fd
}

/// `connect` with an explicit deadline in milliseconds (`-1` waits forever).
///
/// # Safety
///
/// `addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn connect_with_timeout(
    sockfd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: i64,
) -> libc::c_int {
    if !is_enabled() {
        return libc::connect(sockfd, addr, addrlen);
    }
    let entry = match fd::fd_manager().get(sockfd, false) {
        Some(entry) => entry,
        None => {
            set_errno(libc::EBADF);
            return -1;
        }
    };
    if entry.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return libc::connect(sockfd, addr, addrlen);
    }

    let n = libc::connect(sockfd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let io = IoManager::current()
        .expect("hooked connect outside of an IoManager worker");
    let token = Arc::new(IoWait::default());
    let timer = if timeout_ms != TIMEOUT_INFINITE {
        let weak_token = Arc::downgrade(&token);
        let weak_sched = io.scheduler().downgrade();
        Some(io.add_conditional_timer(
            timeout_ms as u64,
            move || {
                let token = match weak_token.upgrade() {
                    Some(token) => token,
                    None => return,
                };
                if !token.store_cancelled(libc::ETIMEDOUT) {
                    return;
                }
                if let Some(sched) = weak_sched.upgrade() {
                    if let Some(io) = IoManager::from_scheduler(sched) {
                        io.cancel_event(sockfd, Event::WRITE);
                    }
                }
            },
            Arc::downgrade(&token),
            false,
        ))
    } else {
        None
    };

    match io.add_event_with_token(sockfd, Event::WRITE, &token) {
        Ok(()) => {
            Fiber::yield_to_hold();
            if let Some(timer) = timer {
                timer.cancel();
            }
            let code = token.cancelled();
            if code != 0 {
                set_errno(code);
                return -1;
            }
        }
        Err(e) => {
            if let Some(timer) = timer {
                timer.cancel();
            }
            log::error!(
                target: "filament::hook",
                "connect: failed to register WRITE on fd {}: {}",
                sockfd,
                e,
            );
        }
    }

    let mut error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    if libc::getsockopt(
        sockfd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// Blocking-style `connect` bounded by the `tcp.connect.timeout` option.
///
/// # Safety
///
/// `addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn connect(
    sockfd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> libc::c_int {
    connect_with_timeout(sockfd, addr, addrlen, connect_timeout_ms())
}

/// # Safety
///
/// `addr`/`addrlen` follow the `accept(2)` contract and may be null.
pub unsafe fn accept(
    sockfd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> libc::c_int {
    let fd = do_io(sockfd, "accept", Event::READ, libc::SO_RCVTIMEO, || {
        unsafe { libc::accept(sockfd, addr, addrlen) as isize }
    }) as libc::c_int;
    if fd >= 0 && is_enabled() {
        fd::fd_manager().get(fd, true);
    }
    fd
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(fd, "read", Event::READ, libc::SO_RCVTIMEO, || unsafe {
        libc::read(fd, ptr, len)
    })
}

pub fn readv(fd: RawFd, bufs: &mut [std::io::IoSliceMut<'_>]) -> isize {
    // IoSliceMut is ABI-compatible with iovec.
    let ptr = bufs.as_mut_ptr() as *mut libc::iovec;
    let cnt = bufs.len() as libc::c_int;
    do_io(fd, "readv", Event::READ, libc::SO_RCVTIMEO, || unsafe {
        libc::readv(fd, ptr, cnt)
    })
}

pub fn recv(sockfd: RawFd, buf: &mut [u8], flags: libc::c_int) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(sockfd, "recv", Event::READ, libc::SO_RCVTIMEO, || unsafe {
        libc::recv(sockfd, ptr, len, flags)
    })
}

/// # Safety
///
/// `src_addr`/`addrlen` follow the `recvfrom(2)` contract and may be null.
pub unsafe fn recvfrom(
    sockfd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(sockfd, "recvfrom", Event::READ, libc::SO_RCVTIMEO, || {
        unsafe { libc::recvfrom(sockfd, ptr, len, flags, src_addr, addrlen) }
    })
}

/// # Safety
///
/// `msg` must point to a valid `msghdr`.
pub unsafe fn recvmsg(sockfd: RawFd, msg: *mut libc::msghdr, flags: libc::c_int) -> isize {
    do_io(sockfd, "recvmsg", Event::READ, libc::SO_RCVTIMEO, || {
        unsafe { libc::recvmsg(sockfd, msg, flags) }
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(fd, "write", Event::WRITE, libc::SO_SNDTIMEO, || unsafe {
        libc::write(fd, ptr, len)
    })
}

pub fn writev(fd: RawFd, bufs: &[std::io::IoSlice<'_>]) -> isize {
    // IoSlice is ABI-compatible with iovec.
    let ptr = bufs.as_ptr() as *const libc::iovec;
    let cnt = bufs.len() as libc::c_int;
    do_io(fd, "writev", Event::WRITE, libc::SO_SNDTIMEO, || unsafe {
        libc::writev(fd, ptr, cnt)
    })
}

pub fn send(sockfd: RawFd, buf: &[u8], flags: libc::c_int) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(sockfd, "send", Event::WRITE, libc::SO_SNDTIMEO, || unsafe {
        libc::send(sockfd, ptr, len, flags)
    })
}

/// # Safety
///
/// `dest_addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn sendto(
    sockfd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(sockfd, "sendto", Event::WRITE, libc::SO_SNDTIMEO, || {
        unsafe { libc::sendto(sockfd, ptr, len, flags, dest_addr, addrlen) }
    })
}

/// # Safety
///
/// `msg` must point to a valid `msghdr`.
pub unsafe fn sendmsg(sockfd: RawFd, msg: *const libc::msghdr, flags: libc::c_int) -> isize {
    do_io(sockfd, "sendmsg", Event::WRITE, libc::SO_SNDTIMEO, || {
        unsafe { libc::sendmsg(sockfd, msg, flags) }
    })
}

/// Cancel every pending wait on `fd`, drop its record, close it.
pub fn close(fd: RawFd) -> libc::c_int {
    if is_enabled() {
        if fd::fd_manager().get(fd, false).is_some() {
            if let Some(io) = IoManager::current() {
                io.cancel_all(fd);
            }
            fd::fd_manager().del(fd);
        }
    }
    unsafe { libc::close(fd) }
}

/// Hooked `fcntl` restricted to the integer-argument commands.
///
/// `F_SETFL` records the user's `O_NONBLOCK` wish but keeps the real
/// descriptor non-blocking; `F_GETFL` reports the flags the user expects to
/// see. Everything else passes through.
pub fn fcntl(fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> libc::c_int {
    match cmd {
        libc::F_SETFL => {
            let mut arg = arg;
            if let Some(entry) = fd::fd_manager().get(fd, false) {
                if !entry.is_closed() && entry.is_socket() {
                    entry.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    if entry.sys_nonblock() {
                        arg |= libc::O_NONBLOCK;
                    } else {
                        arg &= !libc::O_NONBLOCK;
                    }
                }
            }
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags == -1 {
                return flags;
            }
            if let Some(entry) = fd::fd_manager().get(fd, false) {
                if !entry.is_closed() && entry.is_socket() {
                    return if entry.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    };
                }
            }
            flags
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// Hooked `ioctl`: `FIONBIO` updates the user's non-blocking wish while the
/// real descriptor of a tracked socket stays non-blocking.
///
/// # Safety
///
/// `arg` must follow the `ioctl(2)` contract for `request`.
pub unsafe fn ioctl(fd: RawFd, request: libc::c_ulong, arg: *mut libc::c_void) -> libc::c_int {
    if request == libc::FIONBIO {
        let user_nonblock = *(arg as *const libc::c_int) != 0;
        if let Some(entry) = fd::fd_manager().get(fd, false) {
            if !entry.is_closed() && entry.is_socket() {
                entry.set_user_nonblock(user_nonblock);
                let mut forced: libc::c_int = if entry.sys_nonblock() {
                    1
                } else {
                    user_nonblock as libc::c_int
                };
                return libc::ioctl(fd, request, &mut forced as *mut libc::c_int);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// # Safety
///
/// Follows the `getsockopt(2)` contract.
pub unsafe fn getsockopt(
    sockfd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> libc::c_int {
    libc::getsockopt(sockfd, level, optname, optval, optlen)
}

/// Hooked `setsockopt`: `SO_RCVTIMEO`/`SO_SNDTIMEO` are recorded in the fd
/// record (and still applied to the descriptor).
///
/// # Safety
///
/// Follows the `setsockopt(2)` contract.
pub unsafe fn setsockopt(
    sockfd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> libc::c_int {
    if is_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(entry) = fd::fd_manager().get(sockfd, false) {
            let tv = &*(optval as *const libc::timeval);
            entry.set_timeout(optname, tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000);
        }
    }
    libc::setsockopt(sockfd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hooked_socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        fd::fd_manager().get(fds[0], true).unwrap();
        fd::fd_manager().get(fds[1], true).unwrap();
        (fds[0], fds[1])
    }

    #[test]
    fn fcntl_maintains_the_nonblock_illusion() {
        let (a, b) = hooked_socketpair();
        // The record creation forced the real flag on.
        assert!(unsafe { libc::fcntl(a, libc::F_GETFL, 0) } & libc::O_NONBLOCK != 0);
        // The user never asked for it, so they do not see it.
        assert_eq!(fcntl(a, libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);
        // Clearing it through the hook keeps the real flag set.
        let shown = fcntl(a, libc::F_GETFL, 0);
        assert_eq!(fcntl(a, libc::F_SETFL, shown & !libc::O_NONBLOCK), 0);
        assert!(unsafe { libc::fcntl(a, libc::F_GETFL, 0) } & libc::O_NONBLOCK != 0);
        // Setting it is visible back.
        assert_eq!(fcntl(a, libc::F_SETFL, shown | libc::O_NONBLOCK), 0);
        assert!(fcntl(a, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0);
        fd::fd_manager().del(a);
        fd::fd_manager().del(b);
        unsafe { libc::close(a) };
        unsafe { libc::close(b) };
    }

    #[test]
    fn setsockopt_records_timeouts() {
        let (a, b) = hooked_socketpair();
        set_enabled(true);
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        let rc = unsafe {
            setsockopt(
                a,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);
        set_enabled(false);
        let entry = fd::fd_manager().get(a, false).unwrap();
        assert_eq!(entry.timeout(libc::SO_RCVTIMEO), 1500);
        fd::fd_manager().del(a);
        fd::fd_manager().del(b);
        unsafe { libc::close(a) };
        unsafe { libc::close(b) };
    }

    #[test]
    fn disabled_hook_delegates() {
        assert!(!is_enabled());
        let (a, b) = hooked_socketpair();
        assert_eq!(write(a, b"ping"), 4);
        let mut buf = [0u8; 8];
        assert_eq!(read(b, &mut buf[..]), 4);
        assert_eq!(&buf[..4], b"ping");
        fd::fd_manager().del(a);
        fd::fd_manager().del(b);
        unsafe { libc::close(a) };
        unsafe { libc::close(b) };
    }

    #[test]
    fn user_nonblock_keeps_eagain_semantics() {
        let (a, b) = hooked_socketpair();
        // The user opts into non-blocking: the hook must not park even with
        // hooking enabled, so this is safe outside a scheduler.
        let entry = fd::fd_manager().get(a, false).unwrap();
        entry.set_user_nonblock(true);
        set_enabled(true);
        let mut buf = [0u8; 8];
        let n = read(a, &mut buf[..]);
        set_enabled(false);
        assert_eq!(n, -1);
        assert_eq!(errno(), libc::EAGAIN);
        fd::fd_manager().del(a);
        fd::fd_manager().del(b);
        unsafe { libc::close(a) };
        unsafe { libc::close(b) };
    }
}

//! Reactor and timer scenarios driven through the public API.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use filament::io::{Event, IoManager};
use filament::{hook, Fiber};

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

#[test]
fn sleeps_run_concurrently_on_one_caller_thread() {
    let io = IoManager::new(1, true, "sleep_io");
    let start = Instant::now();
    let events = Arc::new(Mutex::new(Vec::new()));

    let log = events.clone();
    io.schedule(move || {
        hook::sleep(2);
        log.lock().unwrap().push(("two", Instant::now()));
    });
    let log = events.clone();
    io.schedule(move || {
        hook::sleep(3);
        log.lock().unwrap().push(("three", Instant::now()));
    });

    io.stop();
    let total = start.elapsed();
    let events = events.lock().unwrap();
    let tags: Vec<&str> = events.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec!["two", "three"]);
    // Sleeps overlap: the total is ~3s, not ~5s.
    assert!(total >= Duration::from_millis(2900), "total {:?}", total);
    assert!(total < Duration::from_millis(4800), "total {:?}", total);
    let gap = events[1].1.duration_since(events[0].1);
    assert!(gap >= Duration::from_millis(700) && gap <= Duration::from_millis(1500));
}

#[test]
fn recurring_timer_keeps_its_cadence() {
    let io = IoManager::new(1, false, "cadence_io");
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let s = stamps.clone();
    let timer = io.add_timer(
        500,
        move || {
            s.lock().unwrap().push(Instant::now());
        },
        true,
    );
    std::thread::sleep(Duration::from_millis(2250));
    assert!(timer.cancel());
    io.stop();

    let stamps = stamps.lock().unwrap();
    assert!(
        stamps.len() == 4 || stamps.len() == 5,
        "fired {} times",
        stamps.len(),
    );
    for pair in stamps.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(400) && gap <= Duration::from_millis(650),
            "inter-arrival {:?}",
            gap,
        );
    }
}

#[test]
fn cancelled_timer_never_fires() {
    let io = IoManager::new(1, false, "cancel_timer_io");
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let timer = io.add_timer(
        50,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    assert!(timer.cancel());
    std::thread::sleep(Duration::from_millis(150));
    io.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn add_then_cancel_fires_the_callback_exactly_once() {
    let io = IoManager::new(1, false, "cancel_event_io");
    let (a, b) = socketpair();
    let fired = Arc::new(AtomicUsize::new(0));

    assert_eq!(io.pending_event_count(), 0);
    let f = fired.clone();
    io.add_event_callback(a, Event::READ, move || {
        f.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(io.pending_event_count(), 1);

    assert!(io.cancel_event(a, Event::READ));
    // Already disarmed: the second cancel is a no-op.
    assert!(!io.cancel_event(a, Event::READ));

    // Give the worker a moment to run the callback.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(io.pending_event_count(), 0);

    io.stop();
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn del_event_does_not_fire_the_callback() {
    let io = IoManager::new(1, false, "del_event_io");
    let (a, b) = socketpair();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    io.add_event_callback(a, Event::READ, move || {
        f.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert!(io.del_event(a, Event::READ));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(io.pending_event_count(), 0);
    io.stop();
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn readiness_wakes_the_bound_callback() {
    let io = IoManager::new(1, false, "ready_io");
    let (a, b) = socketpair();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    io.add_event_callback(a, Event::READ, move || {
        f.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(unsafe { libc::write(b, b"x".as_ptr() as *const libc::c_void, 1) }, 1);
    let deadline = Instant::now() + Duration::from_secs(2);
    while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(io.pending_event_count(), 0);
    io.stop();
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn fd_table_grows_to_two_hundred_sockets() {
    let io = IoManager::new(1, false, "grow_io");
    let registered = Arc::new(AtomicUsize::new(0));
    let mut fds = Vec::new();
    for _ in 0..100 {
        let (a, b) = socketpair();
        fds.push(a);
        fds.push(b);
    }
    assert!(fds.len() == 200);
    for &fd in &fds {
        let r = registered.clone();
        io.add_event_callback(fd, Event::READ, move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    let max_fd = *fds.iter().max().unwrap() as usize;
    assert!(io.fd_context_capacity() >= max_fd + 1);
    assert!(io.fd_context_capacity() >= 200);
    assert_eq!(io.pending_event_count(), 200);

    for &fd in &fds {
        assert!(io.cancel_all(fd));
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while registered.load(Ordering::SeqCst) < 200 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(registered.load(Ordering::SeqCst), 200);
    assert_eq!(io.pending_event_count(), 0);
    io.stop();
    for fd in fds {
        unsafe { libc::close(fd) };
    }
}

#[test]
fn fibers_park_on_events_and_resume_on_readiness() {
    let io = IoManager::new(2, false, "park_io");
    let (a, b) = socketpair();
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    io.schedule_fiber(Fiber::new(move || {
        // Bind the current fiber to READ readiness, then park.
        IoManager::current()
            .unwrap()
            .add_event(a, Event::READ)
            .unwrap();
        o.lock().unwrap().push("armed");
        Fiber::yield_to_hold();
        o.lock().unwrap().push("woken");
    }));

    // Wait until the fiber armed the event, then make the fd readable.
    let deadline = Instant::now() + Duration::from_secs(2);
    while io.pending_event_count() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(io.pending_event_count(), 1);
    assert_eq!(unsafe { libc::write(b, b"!".as_ptr() as *const libc::c_void, 1) }, 1);

    let deadline = Instant::now() + Duration::from_secs(2);
    while order.lock().unwrap().len() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*order.lock().unwrap(), vec!["armed", "woken"]);
    io.stop();
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

//! Fiber stacks.
//!
//! Every fiber owns an anonymous `mmap` region with one `PROT_NONE` guard
//! page below the usable area, so running off the end faults instead of
//! corrupting a neighbour. The stack's lifetime equals the fiber's.

use std::ptr;

pub(crate) struct Stack {
    base: *mut u8,
    mapped: usize,
    usable: usize,
}

unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl Stack {
    /// Map a stack with at least `size` usable bytes.
    ///
    /// Failure to map is fatal: the runtime's invariants assume stacks exist.
    pub(crate) fn new(size: usize) -> Stack {
        let page = page_size();
        let usable = (size.max(page) + page - 1) / page * page;
        let mapped = usable + page;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            log::error!(
                target: "filament::fiber",
                "failed to map a {} byte fiber stack: {}\n{}",
                mapped,
                err,
                crate::thread::backtrace_string(),
            );
            std::process::abort();
        }
        let base = base as *mut u8;
        // Guard page at the low end.
        if unsafe { libc::mprotect(base as *mut libc::c_void, page, libc::PROT_NONE) } != 0 {
            let err = std::io::Error::last_os_error();
            log::error!(
                target: "filament::fiber",
                "failed to protect the fiber stack guard page: {}",
                err,
            );
            std::process::abort();
        }
        Stack {
            base,
            mapped,
            usable,
        }
    }

    /// Upper end of the usable area; page aligned.
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.mapped) }
    }

    pub(crate) fn size(&self) -> usize {
        self.usable
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.mapped) };
    }
}

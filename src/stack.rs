use std::io;
use std::ptr;

/// Stacks smaller than this are bumped up to it when a caller passes a
/// `hint` of zero. A nonzero hint is honored as-is (and then rounded up
/// to a whole page) — only the "no opinion" case gets a default.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

fn page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps <= 0 {
        4096
    } else {
        ps as usize
    }
}

fn round_up_to_page(size: usize, page: usize) -> Option<usize> {
    Some(size.checked_add(page - 1)? & !(page - 1))
}

/// A `mmap`-backed coroutine stack with a `PROT_NONE` guard page below
/// the usable region.
///
/// The mapping is `[guard page][usable region]`. `top()` is the address
/// one past the end of the usable region, the value a fresh `Context`'s
/// stack pointer should start at (stacks grow down on every
/// architecture this crate supports).
pub struct Stack {
    base: *mut libc::c_void,
    mapped_len: usize,
    usable_len: usize,
}

impl Stack {
    /// Allocates a stack at least `hint` bytes (or [`DEFAULT_STACK_SIZE`]
    /// if `hint` is zero), rounded up to a whole number of pages, plus one
    /// guard page below it.
    pub fn new(hint: usize) -> io::Result<Stack> {
        let page = page_size();
        let requested = if hint == 0 { DEFAULT_STACK_SIZE } else { hint };
        let oom = || {
            log::error!("stack size hint {} cannot be rounded up without overflow", requested);
            io::Error::from_raw_os_error(libc::ENOMEM)
        };
        let usable_len = round_up_to_page(requested, page).ok_or_else(oom)?;
        let mapped_len = usable_len.checked_add(page).ok_or_else(oom)?;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            log::error!("stack allocation of {} bytes failed: {}", mapped_len, err);
            return Err(err);
        }

        let usable_base = unsafe { base.add(page) };
        let rc = unsafe { libc::mprotect(usable_base, usable_len, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(base, mapped_len);
            }
            log::error!("mprotect of {} usable bytes failed: {}", usable_len, err);
            return Err(err);
        }

        log::trace!(
            "allocated stack: guard page at {:p}, usable region {} bytes at {:p}",
            base,
            usable_len,
            usable_base
        );

        Ok(Stack {
            base,
            mapped_len,
            usable_len,
        })
    }

    /// The address one past the end of the usable region — the initial
    /// stack pointer value for a coroutine running on this stack.
    pub fn top(&self) -> usize {
        (self.base as usize) + self.mapped_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        log::trace!("releasing stack at {:p} ({} bytes)", self.base, self.mapped_len);
        let rc = unsafe { libc::munmap(self.base, self.mapped_len) };
        debug_assert_eq!(rc, 0, "munmap failed in Stack::drop");
    }
}

//! Per-architecture context switching primitives.
//!
//! Only the stack pointer is ever kept in Rust-visible state; everything
//! else a switch needs to restore lives on the target stack itself, at
//! the address the stack pointer points to. This is what lets `Context`
//! stay a single `usize` regardless of how many registers an
//! architecture's calling convention declares callee-saved.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        use x86_64 as imp;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        use aarch64 as imp;
    } else {
        compile_error!("corostack only supports x86_64 and aarch64 targets");
    }
}

/// A saved execution point: just the stack pointer. Everything else
/// lives on the stack `sp` points into.
#[repr(C)]
pub struct Context {
    pub(crate) sp: usize,
}

impl Context {
    /// A `Context` that has never been switched to. Only ever used as a
    /// placeholder for the "not yet started" and "currently active, no
    /// saved state" states — never switched *into*.
    pub fn empty() -> Context {
        Context { sp: 0 }
    }

    /// Builds the synthetic saved context for a coroutine that has never
    /// run. The first `switch` into it lands in an arch-specific
    /// trampoline, which recovers `footer_addr` and calls through
    /// `entry` (a `extern "C" fn(usize) -> !`, type-erased as a raw
    /// address here since `Context` itself is not generic over the
    /// coroutine's payload types).
    ///
    /// # Safety
    /// `stack_top` must be the top of a live, writable stack at least
    /// large enough for the bootstrap frame, and must not be in use by
    /// anyone else.
    pub unsafe fn bootstrap(stack_top: usize, footer_addr: usize, entry: usize) -> Context {
        unsafe { imp::bootstrap(stack_top, footer_addr, entry) }
    }

    /// Saves the current callee-saved register set and stack pointer
    /// into `*from`, restores them from `*to`, and returns `transfer` as
    /// seen by whoever gets switched back into `*from` next — regardless
    /// of whether that's this call returning normally, or a different
    /// thread of execution resuming `*from` later.
    ///
    /// # Safety
    /// `from` must point to a `Context` this coroutine (or the native
    /// thread) owns exclusively. `to` must point to a valid, previously
    /// saved or bootstrapped `Context` belonging to a stack that is not
    /// currently running anywhere else.
    pub unsafe fn switch(from: *mut Context, to: *const Context, transfer: usize) -> usize {
        unsafe { imp::switch(from, to, transfer) }
    }
}

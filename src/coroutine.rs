//! The coroutine manager: handles, the per-thread active chain, and the
//! `spawn` / `resume` / `await_` contracts built on top of `crate::arch`
//! and `crate::stack`.
//!
//! The "previous active" bookkeeping follows `nelsonxb/green.c`'s
//! `_green_thread_activate` / `_green_thread_deactivate`: a coroutine's
//! own saved-context slot doubles as its "am I on the chain" sentinel
//! (it points at itself when off-chain), while the actual address a
//! `switch` restores control to is a plain stack-resident `Context` —
//! either a local inside the matching `resume` call, or another
//! coroutine's own `ctx` field when nesting.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::ptr::{self, NonNull};

use crate::arch::Context;
use crate::stack::Stack;

thread_local! {
    /// The `Context` slot that should be restored when whatever is
    /// running right now on this OS thread suspends. `None` (null) means
    /// nothing on this thread is currently inside a coroutine.
    static CURRENT: Cell<*mut Context> = Cell::new(ptr::null_mut());
}

/// Returned by [`Coroutine::resume`] when the target is already on this
/// thread's active chain — either it's the coroutine currently running,
/// or an ancestor of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeFailed;

impl fmt::Display for ResumeFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot resume a coroutine that is already active on this thread")
    }
}

impl std::error::Error for ResumeFailed {}

/// Returned by [`Waiter::await_`] when called other than from the
/// coroutine currently running on this thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwaitFailed;

impl fmt::Display for AwaitFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot await outside of the coroutine currently running on this thread")
    }
}

impl std::error::Error for AwaitFailed {}

/// The result of a successful [`Coroutine::resume`].
#[derive(Debug)]
pub enum Resumed<A> {
    /// The coroutine called [`Waiter::await_`] with this payload.
    Awaited(A),
    /// The coroutine's entry function returned; its stack has already
    /// been released.
    Done,
}

impl<A> Resumed<A> {
    pub fn is_done(&self) -> bool {
        matches!(self, Resumed::Done)
    }

    pub fn awaited(self) -> Option<A> {
        match self {
            Resumed::Awaited(a) => Some(a),
            Resumed::Done => None,
        }
    }
}

/// Coroutine metadata, heap-allocated once at `spawn` and freed the
/// moment the entry function returns (observed by the caller of the
/// `resume` that got `Resumed::Done`) — or leaked if the owning
/// [`Coroutine`] is dropped first, see `Coroutine`'s `Drop` impl.
struct Footer<A, R> {
    /// Saved context of this coroutine's own last suspension point.
    /// While the coroutine is running, this slot is stale (it holds
    /// whatever was last saved here, not the live state) — `resume`
    /// never reads it, only writes into it via `switch`.
    ctx: Context,
    /// While suspended or never-started: points at `&self.ctx` itself
    /// (the "off chain" sentinel). While running: points at the
    /// `Context` the matching `resume`/nested-resume should switch
    /// back to when this coroutine next awaits or terminates.
    prev_active: Cell<*mut Context>,
    /// Keeps the `mmap` region (and its guard page) alive; dropped
    /// (and unmapped) along with the footer.
    #[allow(dead_code)]
    stack: Stack,
    /// Taken by `bootstrap_inner` on first entry. `None` afterward.
    entry: Option<Box<dyn FnOnce(&mut Waiter<A, R>) + 'static>>,
    /// Becomes `true` the first time `resume` actually switches into
    /// this coroutine — distinguishes "never started" (first resume's
    /// wakeup value is discarded, not delivered to anything) from
    /// "suspended at an await_ point".
    started: Cell<bool>,
}

/// A handle to a coroutine, owned by whoever called `spawn` (or
/// received the handle from them). The only operation available from
/// the outside is [`Coroutine::resume`].
pub struct Coroutine<A, R> {
    footer: Option<NonNull<Footer<A, R>>>,
}

/// The "inside" view of a running coroutine, handed to the entry
/// function by `bootstrap_inner`. Only [`Waiter::await_`] is available
/// from here. `Copy` because it is a bare, non-owning view of the
/// footer the owning [`Coroutine`] already manages; a stashed copy used
/// from outside the coroutine is caught and rejected at the call site.
pub struct Waiter<A, R> {
    footer: NonNull<Footer<A, R>>,
}

impl<A, R> Clone for Waiter<A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A, R> Copy for Waiter<A, R> {}

fn self_sentinel<A, R>(footer: NonNull<Footer<A, R>>) -> *mut Context {
    unsafe { &footer.as_ref().ctx as *const Context as *mut Context }
}

impl<A, R> Coroutine<A, R> {
    /// Allocates a stack of (at least) `hint` bytes and prepares `entry`
    /// to run on it. `entry` is not called until the first `resume`.
    pub fn spawn<F>(entry: F, hint: usize) -> io::Result<Coroutine<A, R>>
    where
        F: FnOnce(&mut Waiter<A, R>) + 'static,
    {
        let stack = Stack::new(hint)?;
        let stack_top = stack.top();

        let footer = Box::new(Footer {
            ctx: Context::empty(),
            prev_active: Cell::new(ptr::null_mut()),
            stack,
            entry: Some(Box::new(entry) as Box<dyn FnOnce(&mut Waiter<A, R>) + 'static>),
            started: Cell::new(false),
        });
        let footer_ptr = NonNull::from(Box::leak(footer));

        let sentinel = self_sentinel(footer_ptr);
        unsafe {
            footer_ptr.as_ref().prev_active.set(sentinel);
        }

        let entry_fn = bootstrap_inner::<A, R> as usize;
        let ctx = unsafe { Context::bootstrap(stack_top, footer_ptr.as_ptr() as usize, entry_fn) };
        unsafe {
            (*footer_ptr.as_ptr()).ctx = ctx;
        }

        log::trace!("spawned coroutine {:p}", footer_ptr.as_ptr());
        Ok(Coroutine { footer: Some(footer_ptr) })
    }

    /// Whether this coroutine's entry function has already returned
    /// (and its stack has already been released).
    pub fn is_terminated(&self) -> bool {
        self.footer.is_none()
    }

    /// Runs the coroutine until it either awaits or terminates.
    ///
    /// Fails with [`ResumeFailed`] if this coroutine is currently on the
    /// active chain on this thread — running, or an ancestor of the
    /// coroutine currently running (including a coroutine attempting to
    /// resume itself).
    pub fn resume(&mut self, wakeup: R) -> Result<Resumed<A>, ResumeFailed> {
        let footer_ptr = self.footer.ok_or(ResumeFailed)?;
        let footer = unsafe { footer_ptr.as_ref() };

        let sentinel = self_sentinel(footer_ptr);
        if footer.prev_active.get() != sentinel {
            return Err(ResumeFailed);
        }

        let mut from_ctx = Context::empty();
        footer.prev_active.set(&mut from_ctx as *mut Context);

        let prev_current = CURRENT.with(Cell::get);
        CURRENT.with(|c| c.set(&footer.ctx as *const Context as *mut Context));

        let never_started = !footer.started.replace(true);
        let transfer_in: usize = if never_started {
            // The entry function takes no wakeup argument; dropping it
            // here (rather than boxing it for bootstrap_inner to pick
            // up and discard) avoids leaking it.
            drop(wakeup);
            0
        } else {
            Box::into_raw(Box::new(wakeup)) as usize
        };

        log::trace!("resuming coroutine {:p}", footer_ptr.as_ptr());
        let transfer = unsafe { Context::switch(&mut from_ctx, &footer.ctx, transfer_in) };

        CURRENT.with(|c| c.set(prev_current));

        if transfer == 0 {
            log::trace!("coroutine {:p} terminated", footer_ptr.as_ptr());
            self.footer = None;
            unsafe {
                drop(Box::from_raw(footer_ptr.as_ptr()));
            }
            Ok(Resumed::Done)
        } else {
            let value = unsafe { *Box::from_raw(transfer as *mut A) };
            Ok(Resumed::Awaited(value))
        }
    }
}

impl<A, R> Drop for Coroutine<A, R> {
    fn drop(&mut self) {
        if let Some(footer) = self.footer.take() {
            // Never reached `Done`: its stack may still hold live locals
            // at the suspension point, with no way to run their
            // destructors short of resuming to completion. Leak rather
            // than unmap live state.
            log::trace!(
                "coroutine {:p} dropped before completion; leaking its stack",
                footer.as_ptr()
            );
            std::mem::forget(unsafe { Box::from_raw(footer.as_ptr()) });
        }
    }
}

impl<A, R> Waiter<A, R> {
    /// Suspends the running coroutine, delivering `value` to whatever
    /// `resume` call is waiting for it, and blocks until a later
    /// `resume` provides a wakeup value.
    ///
    /// Fails with [`AwaitFailed`] if this `Waiter` does not belong to
    /// the coroutine actually running on this thread right now — e.g.
    /// a copy of it was stashed somewhere and invoked after the
    /// coroutine it came from had already suspended or terminated.
    pub fn await_(&mut self, value: A) -> Result<R, AwaitFailed> {
        let footer = unsafe { self.footer.as_ref() };

        let is_current = CURRENT.with(Cell::get) == &footer.ctx as *const Context as *mut Context;
        if !is_current {
            return Err(AwaitFailed);
        }

        let to = footer.prev_active.get();
        footer.prev_active.set(self_sentinel(self.footer));

        let value_ptr = Box::into_raw(Box::new(value)) as usize;
        log::trace!("coroutine {:p} awaiting", self.footer.as_ptr());
        let transfer = unsafe { Context::switch(&footer.ctx as *const Context as *mut Context, to, value_ptr) };

        let wakeup = unsafe { *Box::from_raw(transfer as *mut R) };
        Ok(wakeup)
    }
}

/// Entered through the arch-specific trampoline on a coroutine's first
/// `resume`. Recovers the entry closure from the footer, runs it, and
/// falls through to `terminate` — the entry closure never returns
/// directly into the switcher.
unsafe extern "C" fn bootstrap_inner<A, R>(footer_addr: usize) -> ! {
    let footer: NonNull<Footer<A, R>> = unsafe { NonNull::new_unchecked(footer_addr as *mut Footer<A, R>) };

    let entry = unsafe { (*footer.as_ptr()).entry.take() }.expect("bootstrap_inner entered twice");
    let mut waiter = Waiter { footer };
    entry(&mut waiter);

    unsafe { terminate::<A, R>(footer) }
}

/// The epilogue: switches back to whoever resumed this coroutine last,
/// delivering the `end` sentinel (a transfer value of `0`). Never
/// returns — the coroutine's stack is not touched again; the caller of
/// `resume` releases it.
unsafe fn terminate<A, R>(footer: NonNull<Footer<A, R>>) -> ! {
    let f = unsafe { footer.as_ref() };
    let to = f.prev_active.get();
    log::trace!("coroutine {:p} terminating", footer.as_ptr());
    unsafe {
        Context::switch(&f.ctx as *const Context as *mut Context, to, 0);
    }
    unreachable!("switched back into a coroutine that already terminated")
}

//! `corostack`: a minimal stackful symmetric coroutine core.
//!
//! Three primitives: [`Coroutine::spawn`] allocates a coroutine and its
//! private stack; [`Coroutine::resume`] runs it until it either calls
//! [`Waiter::await_`] or returns; `await_` is the coroutine's own half
//! of that handshake. There is no scheduler, no I/O integration, and no
//! cross-thread support — see the crate's `DESIGN.md` for what's
//! deliberately left out and why.

mod arch;
mod coroutine;
mod stack;

pub use coroutine::{AwaitFailed, Coroutine, Resumed, ResumeFailed, Waiter};

//! Minimal single-threaded event loop with two cross-cutting primitives:
//! a cross-thread [`Waker`] that runs a callback on the loop thread, and a
//! stat-polling [`FsPoll`] watcher that reports file metadata changes.
//!
//! An [`EventLoop`] hosts handles and dispatches their callbacks from a
//! single thread. [`Waker::wake`] is the one entry point that may be
//! called from anywhere, including signal handlers that can tolerate a
//! `write` syscall; signals landing before the loop observes them
//! coalesce into a single callback invocation. [`FsPoll`] is the portable
//! fallback watcher: a drift-compensated sampling timer plus a
//! field-by-field comparison of successive `stat` snapshots, with
//! deduplicated error reporting.
//!
//! # Examples
//!
//! Rouse a loop from another thread:
//!
//! ```no_run
//! # fn main() -> std::io::Result<()> {
//! use std::thread;
//!
//! use eloop::{EventLoop, Waker};
//!
//! let mut event_loop = EventLoop::new()?;
//! let waker = Waker::new(&mut event_loop, |_| println!("woken"))?;
//!
//! let remote = waker.clone();
//! let handle = thread::spawn(move || remote.wake());
//!
//! event_loop.run_once(None)?;
//! # handle.join().unwrap();
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

mod async_wake;
mod convert;
mod event_loop;
mod fs;
mod fs_poll;
mod handle;
mod interest;
mod slab;
mod sys;
mod timer;
mod token;

pub use crate::async_wake::Waker;
pub use crate::event_loop::EventLoop;
pub use crate::fs::{FileStat, TimeSpec};
pub use crate::fs_poll::{FsPoll, FsPollEvent};
pub use crate::timer::Timer;

pub(crate) use crate::interest::Interest;
pub(crate) use crate::token::Token;

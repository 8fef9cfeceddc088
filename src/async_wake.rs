use std::io;
use std::process;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

#[cfg(feature = "log")]
use log::{error, trace};

use crate::event_loop::{EventLoop, Handle};
use crate::handle::Flags;
use crate::sys::WakeChannel;
use crate::Token;

// The handshake word. IDLE -> SENDING is taken by exactly one sender per
// batch; SENDING -> READY marks the end of its critical section; the loop
// thread alone moves READY -> IDLE when it consumes the signal.
const IDLE: u8 = 0;
const SENDING: u8 = 1;
const READY: u8 = 2;

#[derive(Debug)]
pub(crate) struct AsyncShared {
    pending: AtomicU8,
    chan: Arc<WakeChannel>,
}

pub(crate) struct AsyncEntry {
    pub(crate) flags: Flags,
    pub(crate) shared: Arc<AsyncShared>,
    pub(crate) cb: Option<Box<dyn FnMut(&mut EventLoop)>>,
}

/// Cross-thread signal that runs a callback on the loop thread.
///
/// `Waker` is the only part of the crate that may be used off the loop
/// thread. Any number of threads may call [`wake`]; all signals that land
/// before the loop observes them coalesce into a single callback
/// invocation. The callback is guaranteed to run at least once after each
/// `wake` that was not already subsumed by an unobserved one.
///
/// Clones share the registration: they signal the same callback, and the
/// callback stops for all of them once [`close`] has run.
///
/// [`wake`]: Waker::wake
/// [`close`]: Waker::close
///
/// # Examples
///
/// ```no_run
/// # fn main() -> std::io::Result<()> {
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::thread;
/// use std::time::Duration;
///
/// use eloop::{EventLoop, Waker};
///
/// let mut event_loop = EventLoop::new()?;
///
/// let hits = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&hits);
/// let waker = Waker::new(&mut event_loop, move |_| {
///     counter.fetch_add(1, Ordering::Relaxed);
/// })?;
///
/// let remote = waker.clone();
/// let handle = thread::spawn(move || remote.wake());
///
/// event_loop.run_once(Some(Duration::from_millis(100)))?;
/// assert_eq!(hits.load(Ordering::Relaxed), 1);
/// # handle.join().unwrap();
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Waker {
    shared: Arc<AsyncShared>,
    token: Token,
}

impl Waker {
    /// Register a new waker with `event_loop`.
    ///
    /// Lazily opens the loop's wake channel on first use; errors are the
    /// descriptor-creation failures of that channel.
    pub fn new<F>(event_loop: &mut EventLoop, cb: F) -> io::Result<Waker>
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        Waker::register(event_loop, Box::new(cb), false)
    }

    /// Same as [`new`](Waker::new) but for the loop's own plumbing: the
    /// handle does not keep [`run`](EventLoop::run) alive.
    pub(crate) fn new_internal<F>(event_loop: &mut EventLoop, cb: F) -> io::Result<Waker>
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        Waker::register(event_loop, Box::new(cb), true)
    }

    fn register(
        event_loop: &mut EventLoop,
        cb: Box<dyn FnMut(&mut EventLoop)>,
        internal: bool,
    ) -> io::Result<Waker> {
        let chan = event_loop.ensure_wake_channel()?;
        let shared = Arc::new(AsyncShared {
            pending: AtomicU8::new(IDLE),
            chan,
        });

        let mut flags = if internal {
            Flags::internal()
        } else {
            Flags::new()
        };
        flags.set_active();

        let token = event_loop.handles.insert(Handle::Async(AsyncEntry {
            flags,
            shared: Arc::clone(&shared),
            cb: Some(cb),
        }));
        event_loop.async_order.push_back(token);
        if !internal {
            event_loop.active_handles += 1;
        }
        #[cfg(feature = "log")]
        trace!("registered waker: token={:?}, internal={}", token, internal);
        Ok(Waker { shared, token })
    }

    /// Signal the loop. Callable from any thread; infallible.
    ///
    /// Repeated calls before the loop observes the signal produce the same
    /// observable effect as a single call.
    pub fn wake(&self) {
        // Cheap read first: a non-idle word means the current batch is
        // already signalled and this call coalesces into it.
        if self.shared.pending.load(Ordering::Relaxed) != IDLE {
            return;
        }

        // Tell the loop thread we're busy with the handle.
        if self
            .shared
            .pending
            .compare_exchange(IDLE, SENDING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        // Wake up the loop thread.
        self.shared.chan.wake();

        // Tell the loop thread we're done.
        if self
            .shared
            .pending
            .compare_exchange(SENDING, READY, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Nobody else may touch the word while it holds SENDING.
            #[cfg(feature = "log")]
            error!("waker handshake corrupted");
            process::abort();
        }
    }

    /// Remove the registration from the loop.
    ///
    /// Returns only after any sender inside [`wake`]'s critical section
    /// has finished publishing, so the callback can be torn down without
    /// racing them. Once `close` returns and the loop has run a turn, the
    /// callback is never invoked again, even if clones keep calling
    /// [`wake`](Waker::wake).
    pub fn close(&self, event_loop: &mut EventLoop) {
        let entry = match event_loop.handles.get_mut(self.token) {
            Some(Handle::Async(entry)) => entry,
            _ => return,
        };
        if !Arc::ptr_eq(&entry.shared, &self.shared) || entry.flags.is_closing() {
            return;
        }

        // Wait out an in-flight sender; consuming a signal it may have
        // posted is fine, the callback will never run again.
        spin(&self.shared);

        entry.flags.set_closing();
        let internal = entry.flags.is_internal();
        if entry.flags.is_active() {
            entry.flags.clear_active();
            if !internal {
                event_loop.active_handles -= 1;
            }
        }
        event_loop.pending_closes.push(self.token);
        #[cfg(feature = "log")]
        trace!("closing waker: token={:?}", self.token);
    }
}

/// Consume the handle's pending state. Loop thread only.
///
/// Returns `READY` when a posted signal was consumed and `IDLE` when the
/// handle was not pending. A sender caught inside its critical section is
/// spun out; its worst case is three instructions and one `write`.
fn spin(shared: &AsyncShared) -> u8 {
    loop {
        // 997 is not completely chosen at random. It's a prime number,
        // acyclical by nature, and should therefore hopefully dampen
        // sympathetic resonance with other schedulers' periods.
        for _ in 0..997 {
            match shared
                .pending
                .compare_exchange(READY, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return READY,
                Err(SENDING) => std::hint::spin_loop(),
                Err(state) => return state,
            }
        }

        // We may have preempted the sender while it's inside the critical
        // section; on the same CPU, spinning further only burns the rest
        // of our time slice.
        thread::yield_now();
    }
}

/// Readiness callback of the wake channel: drain the descriptor, then give
/// every registered handle one chance to run.
pub(crate) fn process(event_loop: &mut EventLoop) {
    event_loop.drain_wake_channel();

    // One pass over the list; each handle is re-queued at the tail before
    // it runs so a callback that re-signals itself cannot starve the rest.
    let handles = event_loop.async_order.len();
    for _ in 0..handles {
        let token = match event_loop.async_order.pop_front() {
            Some(token) => token,
            None => break,
        };
        event_loop.async_order.push_back(token);

        let shared = match event_loop.handles.get(token) {
            Some(Handle::Async(entry)) if !entry.flags.is_closing() => Arc::clone(&entry.shared),
            _ => continue,
        };
        if spin(&shared) != READY {
            continue;
        }

        let cb = match event_loop.handles.get_mut(token) {
            Some(Handle::Async(entry)) => entry.cb.take(),
            _ => None,
        };
        if let Some(mut cb) = cb {
            cb(event_loop);
            if let Some(Handle::Async(entry)) = event_loop.handles.get_mut(token) {
                if Arc::ptr_eq(&entry.shared, &shared) && entry.cb.is_none() {
                    entry.cb = Some(cb);
                }
            }
        }
    }
}

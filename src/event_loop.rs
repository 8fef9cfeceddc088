use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::io;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[cfg(feature = "log")]
use log::trace;

use crate::async_wake::{self, AsyncEntry};
use crate::fs::{StatDone, StatRequest, WorkQueue, WorkState};
use crate::fs_poll::{self, FsPollEntry, PollCtx};
use crate::slab::Slab;
use crate::sys;
use crate::timer::{self, TimerEntry, TimerTarget};
use crate::{Interest, Token, Waker};

// Token of the wake channel's readiness registration. Handle tokens are
// slab indices and stay well clear of it.
pub(crate) const WAKE: Token = Token(usize::MAX);

pub(crate) enum Handle {
    Async(AsyncEntry),
    Timer(TimerEntry),
    FsPoll(FsPollEntry),
}

/// A single-threaded callback loop hosting [`Waker`], [`Timer`] and
/// [`FsPoll`] handles.
///
/// All callbacks, lifecycle transitions and timer/stat completions run on
/// the thread calling [`run`] or [`run_once`]; the single cross-thread
/// entry point is [`Waker::wake`]. The loop is not reentrant: do not call
/// [`run`] or [`run_once`] from inside a callback.
///
/// [`run`]: EventLoop::run
/// [`run_once`]: EventLoop::run_once
/// [`Timer`]: crate::Timer
/// [`FsPoll`]: crate::FsPoll
pub struct EventLoop {
    selector: sys::Selector,
    events: sys::Events,
    // Created lazily by the first waker registration.
    wake: Option<Arc<sys::WakeChannel>>,
    work: Option<WorkState>,
    pub(crate) handles: Slab<Handle>,
    pub(crate) ctxs: Slab<PollCtx>,
    pub(crate) async_order: VecDeque<Token>,
    pub(crate) timer_heap: BinaryHeap<Reverse<(u64, u64, Token)>>,
    pub(crate) timer_ids: u64,
    pub(crate) pending_closes: Vec<Token>,
    pub(crate) active_handles: usize,
    pub(crate) active_reqs: usize,
    start: Instant,
}

impl EventLoop {
    /// Create a loop with no handles. The wake channel and the stat
    /// worker are opened lazily by the handles that need them.
    pub fn new() -> io::Result<EventLoop> {
        Ok(EventLoop {
            selector: sys::Selector::new()?,
            events: sys::Events::with_capacity(16),
            wake: None,
            work: None,
            handles: Slab::new(),
            ctxs: Slab::new(),
            async_order: VecDeque::new(),
            timer_heap: BinaryHeap::new(),
            timer_ids: 0,
            pending_closes: Vec::new(),
            active_handles: 0,
            active_reqs: 0,
            start: Instant::now(),
        })
    }

    /// Monotonic milliseconds since the loop was created.
    pub fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Whether any non-internal handle or outstanding request keeps the
    /// loop alive.
    pub fn alive(&self) -> bool {
        self.active_handles > 0 || self.active_reqs > 0 || !self.pending_closes.is_empty()
    }

    /// Run dispatch turns until nothing keeps the loop alive.
    pub fn run(&mut self) -> io::Result<()> {
        while self.alive() {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// One dispatch turn: run due timers, block in the selector for at
    /// most `timeout` (or until the next timer deadline, whichever is
    /// earlier; indefinitely when neither exists), dispatch readiness,
    /// then process deferred closes.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        timer::run_due(self);

        let poll_timeout = if !self.pending_closes.is_empty() {
            // Deferred closes must not wait on I/O.
            Some(Duration::ZERO)
        } else {
            let now = self.now();
            let until_timer = timer::next_deadline(self)
                .map(|deadline| Duration::from_millis(deadline.saturating_sub(now)));
            match (timeout, until_timer) {
                (Some(caller), Some(timer)) => Some(caller.min(timer)),
                (Some(caller), None) => Some(caller),
                (None, Some(timer)) => Some(timer),
                (None, None) => {
                    if !self.alive() {
                        return Ok(());
                    }
                    None
                }
            }
        };

        match self.selector.select(&mut self.events, poll_timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let events = mem::replace(&mut self.events, sys::Events::new());
        for event in &events {
            if sys::event::token(event) == WAKE && sys::event::is_readable(event) {
                async_wake::process(self);
            }
        }
        self.events = events;

        timer::run_due(self);
        self.process_closes();
        Ok(())
    }

    /// Reinitialise the loop in a child process after `fork(2)`.
    ///
    /// The inherited selector and wake descriptors are shared with the
    /// parent and are replaced wholesale; registered handles survive
    /// untouched and stat requests that were in flight are re-issued.
    /// Call it before running the loop in the child, and only while no
    /// loop callback is executing.
    pub fn fork(&mut self) -> io::Result<()> {
        self.selector = sys::Selector::new()?;
        self.events.clear();
        if let Some(chan) = &self.wake {
            chan.reopen()?;
            self.selector.register(chan.rfd(), WAKE, Interest::READABLE)?;
        }

        if let Some(state) = &mut self.work {
            // The worker thread does not exist in this process; its join
            // handle and channel must not be dropped normally.
            if let Some(queue) = state.queue.take() {
                mem::forget(queue);
            }
            // Results the parent's worker had already published are void.
            if let Ok(mut done) = state.done.try_lock() {
                done.clear();
            }
        }
        self.active_reqs = 0;
        fs_poll::resubmit_inflight(self)?;
        #[cfg(feature = "log")]
        trace!("loop reinitialised after fork");
        Ok(())
    }

    pub(crate) fn next_timer_id(&mut self) -> u64 {
        let id = self.timer_ids;
        self.timer_ids += 1;
        id
    }

    pub(crate) fn ensure_wake_channel(&mut self) -> io::Result<Arc<sys::WakeChannel>> {
        if let Some(chan) = &self.wake {
            return Ok(Arc::clone(chan));
        }
        let chan = Arc::new(sys::WakeChannel::open()?);
        self.selector.register(chan.rfd(), WAKE, Interest::READABLE)?;
        self.wake = Some(Arc::clone(&chan));
        Ok(chan)
    }

    pub(crate) fn drain_wake_channel(&self) {
        if let Some(chan) = &self.wake {
            chan.drain();
        }
    }

    /// Queue a context's stat request on the worker, spawning the worker
    /// (and its internal completion waker) on first use.
    pub(crate) fn submit_stat(&mut self, ctx: Token) -> io::Result<()> {
        self.ensure_work()?;
        let req = {
            let ctx_entry = self.ctxs.get_mut(ctx).expect("missing poll context");
            ctx_entry.stat_pending = true;
            StatRequest {
                ctx,
                path: ctx_entry.cpath.clone(),
            }
        };
        self.active_reqs += 1;
        self.work
            .as_ref()
            .unwrap()
            .queue
            .as_ref()
            .unwrap()
            .submit(req);
        Ok(())
    }

    fn ensure_work(&mut self) -> io::Result<()> {
        if self.work.is_none() {
            let done: Arc<Mutex<Vec<StatDone>>> = Arc::new(Mutex::new(Vec::new()));
            let results = Arc::clone(&done);
            let waker = Waker::new_internal(self, move |event_loop| {
                let batch: Vec<StatDone> = mem::take(&mut *results.lock().unwrap());
                for done in batch {
                    fs_poll::on_stat(event_loop, done.ctx, done.result);
                }
            })?;
            self.work = Some(WorkState {
                done,
                waker,
                queue: None,
            });
        }

        let state = self.work.as_mut().unwrap();
        if state.queue.is_none() {
            state.queue = Some(WorkQueue::spawn(
                state.waker.clone(),
                Arc::clone(&state.done),
            )?);
        }
        Ok(())
    }

    /// The close phase of a turn: release every handle whose close was
    /// requested. Context timers additionally tear their context down,
    /// which may complete a watcher close that was waiting on it.
    fn process_closes(&mut self) {
        while let Some(token) = self.pending_closes.pop() {
            match self.handles.get(token) {
                Some(Handle::Async(_)) => {
                    self.async_order.retain(|queued| *queued != token);
                    self.handles.remove(token);
                }
                Some(Handle::Timer(entry)) => {
                    let ctx = match &entry.target {
                        TimerTarget::PollCtx(ctx) => Some(*ctx),
                        TimerTarget::User(_) => None,
                    };
                    self.handles.remove(token);
                    if let Some(ctx) = ctx {
                        fs_poll::ctx_teardown(self, ctx);
                    }
                }
                Some(Handle::FsPoll(_)) => {
                    self.handles.remove(token);
                }
                None => {}
            }
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EventLoop")
            .field("handles", &self.handles.len())
            .field("active_handles", &self.active_handles)
            .field("active_reqs", &self.active_reqs)
            .finish()
    }
}

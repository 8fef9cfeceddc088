use std::cmp::Reverse;
use std::io;
use std::time::Duration;

use crate::convert;
use crate::event_loop::{EventLoop, Handle};
use crate::fs_poll;
use crate::handle::Flags;
use crate::Token;

pub(crate) struct TimerEntry {
    pub(crate) flags: Flags,
    pub(crate) deadline: u64,
    pub(crate) repeat: u64,
    // Bumped on every arm/disarm; heap entries carrying a stale id are
    // skipped when popped (lazy deletion).
    pub(crate) start_id: u64,
    pub(crate) target: TimerTarget,
}

pub(crate) enum TimerTarget {
    User(Option<Box<dyn FnMut(&mut EventLoop)>>),
    PollCtx(Token),
}

/// One-shot or repeating timer driven by the loop's monotonic clock.
///
/// The callback runs on the loop thread with the timer already disarmed;
/// a repeating timer is re-armed first, so calling
/// [`start`](Timer::start) from inside the callback always wins over the
/// pending repeat.
#[derive(Debug)]
pub struct Timer {
    token: Token,
}

impl Timer {
    /// Create an inactive timer on `event_loop`.
    pub fn new(event_loop: &mut EventLoop) -> Timer {
        let token = event_loop.handles.insert(Handle::Timer(TimerEntry {
            flags: Flags::new(),
            deadline: 0,
            repeat: 0,
            start_id: 0,
            target: TimerTarget::User(None),
        }));
        Timer { token }
    }

    /// Arm the timer to run `cb` after `timeout`, then every `repeat` if
    /// given. Re-arming an armed timer replaces its schedule and callback.
    pub fn start<F>(
        &self,
        event_loop: &mut EventLoop,
        timeout: Duration,
        repeat: Option<Duration>,
        cb: F,
    ) -> io::Result<()>
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        let deadline = event_loop.now() + convert::millis(timeout);
        let id = event_loop.next_timer_id();

        let entry = match event_loop.handles.get_mut(self.token) {
            Some(Handle::Timer(entry)) if !entry.flags.is_closing() => entry,
            _ => return Err(io::ErrorKind::InvalidInput.into()),
        };
        let was_active = entry.flags.is_active();
        entry.deadline = deadline;
        entry.repeat = repeat.map(convert::millis).unwrap_or(0);
        entry.start_id = id;
        entry.target = TimerTarget::User(Some(Box::new(cb)));
        entry.flags.set_active();

        if !was_active {
            event_loop.active_handles += 1;
        }
        event_loop.timer_heap.push(Reverse((deadline, id, self.token)));
        Ok(())
    }

    /// Disarm the timer. A stopped timer's callback is never invoked, even
    /// when its deadline already passed in the current turn.
    pub fn stop(&self, event_loop: &mut EventLoop) -> io::Result<()> {
        let id = event_loop.next_timer_id();
        let entry = match event_loop.handles.get_mut(self.token) {
            Some(Handle::Timer(entry)) if !entry.flags.is_closing() => entry,
            _ => return Err(io::ErrorKind::InvalidInput.into()),
        };
        if entry.flags.is_active() {
            entry.flags.clear_active();
            entry.start_id = id;
            event_loop.active_handles -= 1;
        }
        Ok(())
    }

    /// Stop the timer and release its slot in the loop's close phase.
    pub fn close(self, event_loop: &mut EventLoop) {
        let _ = self.stop(event_loop);
        if let Some(Handle::Timer(entry)) = event_loop.handles.get_mut(self.token) {
            if !entry.flags.is_closing() {
                entry.flags.set_closing();
                event_loop.pending_closes.push(self.token);
            }
        }
    }
}

/// Register the embedded timer of a poll context. Internal handles do not
/// count towards loop liveness.
pub(crate) fn init_internal(event_loop: &mut EventLoop, ctx: Token) -> Token {
    event_loop.handles.insert(Handle::Timer(TimerEntry {
        flags: Flags::internal(),
        deadline: 0,
        repeat: 0,
        start_id: 0,
        target: TimerTarget::PollCtx(ctx),
    }))
}

pub(crate) fn start_internal(event_loop: &mut EventLoop, token: Token, delay: u64) {
    let deadline = event_loop.now() + delay;
    let id = event_loop.next_timer_id();
    let entry = match event_loop.handles.get_mut(token) {
        Some(Handle::Timer(entry)) if !entry.flags.is_closing() => entry,
        // The context owns the timer for its whole lifetime; anything else
        // is loop-state corruption.
        _ => unreachable!("poll context timer disappeared"),
    };
    entry.deadline = deadline;
    entry.start_id = id;
    entry.flags.set_active();
    event_loop.timer_heap.push(Reverse((deadline, id, token)));
}

pub(crate) fn is_armed(event_loop: &EventLoop, token: Token) -> bool {
    matches!(
        event_loop.handles.get(token),
        Some(Handle::Timer(entry)) if entry.flags.is_active()
    )
}

/// Disarm and schedule removal; for poll-context timers the close phase
/// also runs the context teardown (the `timer_close_cb` of the design).
pub(crate) fn close_internal(event_loop: &mut EventLoop, token: Token) {
    let id = event_loop.next_timer_id();
    if let Some(Handle::Timer(entry)) = event_loop.handles.get_mut(token) {
        if entry.flags.is_closing() {
            return;
        }
        entry.flags.clear_active();
        entry.start_id = id;
        entry.flags.set_closing();
        event_loop.pending_closes.push(token);
    }
}

/// Run every armed timer whose deadline is due, oldest first.
pub(crate) fn run_due(event_loop: &mut EventLoop) {
    enum Fire {
        Cb(Box<dyn FnMut(&mut EventLoop)>),
        Ctx(Token),
    }

    let now = event_loop.now();
    loop {
        let (deadline, id, token) = match event_loop.timer_heap.peek() {
            Some(&Reverse(head)) => head,
            None => return,
        };
        if deadline > now {
            return;
        }
        event_loop.timer_heap.pop();
        let rearm_id = event_loop.next_timer_id();

        let fire = {
            let entry = match event_loop.handles.get_mut(token) {
                Some(Handle::Timer(entry)) => entry,
                _ => continue,
            };
            if entry.start_id != id || !entry.flags.is_active() || entry.flags.is_closing() {
                continue;
            }

            if entry.repeat > 0 {
                entry.deadline = now + entry.repeat;
                entry.start_id = rearm_id;
                let rearm = Reverse((entry.deadline, rearm_id, token));
                event_loop.timer_heap.push(rearm);
            } else {
                entry.flags.clear_active();
                if !entry.flags.is_internal() {
                    event_loop.active_handles -= 1;
                }
            }

            match &mut entry.target {
                TimerTarget::User(slot) => match slot.take() {
                    Some(cb) => Fire::Cb(cb),
                    None => continue,
                },
                TimerTarget::PollCtx(ctx) => Fire::Ctx(*ctx),
            }
        };

        match fire {
            Fire::Cb(mut cb) => {
                cb(event_loop);
                // The callback may have re-armed (fresh callback) or closed
                // the timer; only an untouched slot gets the old one back.
                if let Some(Handle::Timer(entry)) = event_loop.handles.get_mut(token) {
                    if let TimerTarget::User(slot) = &mut entry.target {
                        if slot.is_none() && !entry.flags.is_closing() {
                            *slot = Some(cb);
                        }
                    }
                }
            }
            Fire::Ctx(ctx) => fs_poll::on_timer(event_loop, ctx),
        }
    }
}

/// Earliest deadline of any armed timer, discarding stale heap entries on
/// the way.
pub(crate) fn next_deadline(event_loop: &mut EventLoop) -> Option<u64> {
    while let Some(&Reverse((deadline, id, token))) = event_loop.timer_heap.peek() {
        let armed = matches!(
            event_loop.handles.get(token),
            Some(Handle::Timer(entry))
                if entry.flags.is_active() && !entry.flags.is_closing() && entry.start_id == id
        );
        if armed {
            return Some(deadline);
        }
        event_loop.timer_heap.pop();
    }
    None
}

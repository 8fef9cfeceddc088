use std::cmp;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(feature = "log")]
use log::trace;

use crate::convert;
use crate::event_loop::{EventLoop, Handle};
use crate::fs::FileStat;
use crate::handle::Flags;
use crate::timer;
use crate::Token;

// `busy_polling` values. Negative values are the negated errno of the last
// reported stat failure.
const INITIAL: i32 = 0;
const STEADY: i32 = 1;

pub(crate) struct FsPollEntry {
    pub(crate) flags: Flags,
    // Current context; contexts from earlier start()..stop() periods keep
    // draining behind it on the `previous` chain.
    pub(crate) ctx: Option<Token>,
}

/// One start()..stop() period of a watcher.
///
/// At any moment either the embedded timer is armed or a stat request is
/// in flight, never both and never neither, until teardown closes the
/// timer and the close phase splices the context out of its handle's
/// chain.
pub(crate) struct PollCtx {
    pub(crate) parent: Token,
    pub(crate) interval: u64,
    pub(crate) start_time: u64,
    busy_polling: i32,
    statbuf: FileStat,
    pub(crate) timer: Token,
    pub(crate) stat_pending: bool,
    path: PathBuf,
    pub(crate) cpath: CString,
    cb: Option<Box<dyn FnMut(&mut EventLoop, FsPollEvent)>>,
    pub(crate) previous: Option<Token>,
}

/// What a watcher callback is invoked with.
#[derive(Debug)]
pub enum FsPollEvent {
    /// The sampled metadata differs from the previous sample.
    Change {
        previous: FileStat,
        current: FileStat,
    },
    /// The sample failed. Runs of consecutive identical error codes are
    /// delivered once; `previous` is the last good snapshot, zeroed when
    /// there has not been one yet.
    Error {
        error: io::Error,
        previous: FileStat,
    },
}

/// Watches a path for metadata changes by periodic `stat` comparison.
///
/// This is the portable fallback watcher: no kernel notification, just a
/// drift-compensated sampling timer and a field-by-field comparison of
/// successive snapshots. The first successful sample after
/// [`start`](FsPoll::start) never fires the callback; it only establishes
/// the baseline.
///
/// # Examples
///
/// ```no_run
/// # fn main() -> std::io::Result<()> {
/// use std::time::Duration;
///
/// use eloop::{EventLoop, FsPoll, FsPollEvent};
///
/// let mut event_loop = EventLoop::new()?;
/// let watcher = FsPoll::new(&mut event_loop);
/// watcher.start(
///     &mut event_loop,
///     "/etc/hosts",
///     Duration::from_millis(100),
///     |_, event| {
///         if let FsPollEvent::Change { previous, current } = event {
///             println!("size {} -> {}", previous.size, current.size);
///         }
///     },
/// )?;
/// event_loop.run()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FsPoll {
    token: Token,
}

impl FsPoll {
    /// Create an inactive watcher on `event_loop`.
    pub fn new(event_loop: &mut EventLoop) -> FsPoll {
        let token = event_loop.handles.insert(Handle::FsPoll(FsPollEntry {
            flags: Flags::new(),
            ctx: None,
        }));
        FsPoll { token }
    }

    /// Start watching `path`, sampling every `interval` (clamped to at
    /// least one millisecond).
    ///
    /// Succeeds as a no-op when the watcher is already active. Starting
    /// while contexts from an earlier stop are still draining is legal;
    /// the new context simply becomes current.
    pub fn start<P, F>(
        &self,
        event_loop: &mut EventLoop,
        path: P,
        interval: Duration,
        cb: F,
    ) -> io::Result<()>
    where
        P: AsRef<Path>,
        F: FnMut(&mut EventLoop, FsPollEvent) + 'static,
    {
        match event_loop.handles.get(self.token) {
            Some(Handle::FsPoll(entry)) if !entry.flags.is_closing() => {
                if entry.flags.is_active() {
                    return Ok(());
                }
            }
            _ => return Err(io::ErrorKind::InvalidInput.into()),
        }

        let path = path.as_ref().to_path_buf();
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let interval = cmp::max(convert::millis(interval), 1);
        let start_time = event_loop.now();

        let previous = match event_loop.handles.get(self.token) {
            Some(Handle::FsPoll(entry)) => entry.ctx,
            _ => unreachable!(),
        };
        let ctx_token = event_loop.ctxs.insert(PollCtx {
            parent: self.token,
            interval,
            start_time,
            busy_polling: INITIAL,
            statbuf: FileStat::default(),
            timer: Token(0),
            stat_pending: false,
            path,
            cpath,
            cb: Some(Box::new(cb)),
            previous,
        });
        let timer_token = timer::init_internal(event_loop, ctx_token);
        event_loop.ctxs.get_mut(ctx_token).unwrap().timer = timer_token;

        if let Err(err) = event_loop.submit_stat(ctx_token) {
            // Nothing observed the context yet; undo it wholesale.
            event_loop.handles.remove(timer_token);
            event_loop.ctxs.remove(ctx_token);
            return Err(err);
        }

        if let Some(Handle::FsPoll(entry)) = event_loop.handles.get_mut(self.token) {
            entry.ctx = Some(ctx_token);
            entry.flags.set_active();
        }
        event_loop.active_handles += 1;
        #[cfg(feature = "log")]
        trace!(
            "fs poll start: token={:?}, ctx={:?}, interval={}ms",
            self.token,
            ctx_token,
            interval
        );
        Ok(())
    }

    /// Stop watching. No callback runs after `stop` returns; a stat
    /// already in flight completes into the loop and self-cleans without
    /// reaching user code.
    pub fn stop(&self, event_loop: &mut EventLoop) -> io::Result<()> {
        let ctx_token = match event_loop.handles.get_mut(self.token) {
            Some(Handle::FsPoll(entry)) => {
                if !entry.flags.is_active() {
                    return Ok(());
                }
                entry.flags.clear_active();
                entry.ctx.expect("active watcher without context")
            }
            _ => return Err(io::ErrorKind::InvalidInput.into()),
        };
        event_loop.active_handles -= 1;

        // Close the timer if it's armed. If it isn't, a stat request is in
        // progress and its completion takes care of the cleanup.
        let timer_token = event_loop.ctxs.get(ctx_token).unwrap().timer;
        if timer::is_armed(event_loop, timer_token) {
            timer::close_internal(event_loop, timer_token);
        }
        #[cfg(feature = "log")]
        trace!("fs poll stop: token={:?}", self.token);
        Ok(())
    }

    /// Stop and release the watcher. The slot is reclaimed in the loop's
    /// close phase, deferred until the last draining context finished.
    pub fn close(self, event_loop: &mut EventLoop) {
        let _ = self.stop(event_loop);
        if let Some(Handle::FsPoll(entry)) = event_loop.handles.get_mut(self.token) {
            if entry.flags.is_closing() {
                return;
            }
            entry.flags.set_closing();
            if entry.ctx.is_none() {
                event_loop.pending_closes.push(self.token);
            }
        }
    }

    /// The path the active watcher samples.
    ///
    /// Fails with `InvalidInput` when the watcher is not active.
    pub fn path<'l>(&self, event_loop: &'l EventLoop) -> io::Result<&'l Path> {
        match event_loop.handles.get(self.token) {
            Some(Handle::FsPoll(entry)) if entry.flags.is_active() => {
                let ctx = entry.ctx.expect("active watcher without context");
                Ok(event_loop
                    .ctxs
                    .get(ctx)
                    .expect("missing poll context")
                    .path
                    .as_path())
            }
            _ => Err(io::ErrorKind::InvalidInput.into()),
        }
    }
}

/// Completion of a context's stat request, on the loop thread.
pub(crate) fn on_stat(event_loop: &mut EventLoop, ctx_token: Token, result: Result<FileStat, i32>) {
    event_loop.active_reqs = event_loop.active_reqs.saturating_sub(1);

    let parent = match event_loop.ctxs.get_mut(ctx_token) {
        Some(ctx) => {
            ctx.stat_pending = false;
            ctx.parent
        }
        None => return,
    };

    // Only the current context of an active handle reaches user code; a
    // context superseded by stop+start drains silently even though the
    // handle itself is active again.
    let dispatch = matches!(
        event_loop.handles.get(parent),
        Some(Handle::FsPoll(entry))
            if entry.flags.is_active() && !entry.flags.is_closing() && entry.ctx == Some(ctx_token)
    );

    if dispatch {
        let (event, cb) = {
            let ctx = event_loop.ctxs.get_mut(ctx_token).unwrap();
            match result {
                Err(code) if ctx.busy_polling != code => {
                    let previous = ctx.statbuf;
                    ctx.busy_polling = code;
                    let event = FsPollEvent::Error {
                        error: io::Error::from_raw_os_error(-code),
                        previous,
                    };
                    (Some(event), ctx.cb.take())
                }
                // A repeat of the error already reported; drop it.
                Err(_) => (None, None),
                Ok(current) => {
                    let fire = ctx.busy_polling != INITIAL
                        && (ctx.busy_polling < 0 || !statbuf_eq(&ctx.statbuf, &current));
                    let previous = ctx.statbuf;
                    ctx.statbuf = current;
                    ctx.busy_polling = STEADY;
                    if fire {
                        let event = FsPollEvent::Change { previous, current };
                        (Some(event), ctx.cb.take())
                    } else {
                        (None, None)
                    }
                }
            }
        };

        if let (Some(event), Some(mut cb)) = (event, cb) {
            cb(event_loop, event);
            if let Some(ctx) = event_loop.ctxs.get_mut(ctx_token) {
                if ctx.cb.is_none() {
                    ctx.cb = Some(cb);
                }
            }
        }
    }

    // Re-read everything: the callback may have stopped, closed or
    // restarted the handle. Only the current context of an active handle
    // re-arms; anything else goes to teardown through its timer close.
    let (timer_token, delay) = {
        let ctx = match event_loop.ctxs.get(ctx_token) {
            Some(ctx) => ctx,
            None => return,
        };
        let keep = matches!(
            event_loop.handles.get(parent),
            Some(Handle::FsPoll(entry))
                if entry.flags.is_active()
                    && !entry.flags.is_closing()
                    && entry.ctx == Some(ctx_token)
        );
        if keep {
            let delay = next_delay(event_loop.now(), ctx.start_time, ctx.interval);
            (ctx.timer, Some(delay))
        } else {
            (ctx.timer, None)
        }
    };
    match delay {
        Some(delay) => timer::start_internal(event_loop, timer_token, delay),
        None => timer::close_internal(event_loop, timer_token),
    }
}

/// The context's sampling timer fired: stamp the new period and issue the
/// next stat.
pub(crate) fn on_timer(event_loop: &mut EventLoop, ctx_token: Token) {
    let now = event_loop.now();
    match event_loop.ctxs.get_mut(ctx_token) {
        Some(ctx) => ctx.start_time = now,
        None => return,
    }
    if let Err(_err) = event_loop.submit_stat(ctx_token) {
        #[cfg(feature = "log")]
        log::error!("re-issuing watcher stat failed: {}", _err);
        std::process::abort();
    }
}

/// Close-phase counterpart of a context timer's close: splice the context
/// out of its handle's chain and, when it was the last one of a closing
/// handle, complete the handle close.
pub(crate) fn ctx_teardown(event_loop: &mut EventLoop, ctx_token: Token) {
    let (parent, previous) = match event_loop.ctxs.get(ctx_token) {
        Some(ctx) => (ctx.parent, ctx.previous),
        None => return,
    };

    let current = match event_loop.handles.get(parent) {
        Some(Handle::FsPoll(entry)) => entry.ctx,
        _ => None,
    };

    if current == Some(ctx_token) {
        let finish = match event_loop.handles.get_mut(parent) {
            Some(Handle::FsPoll(entry)) => {
                entry.ctx = previous;
                entry.ctx.is_none() && entry.flags.is_closing()
            }
            _ => false,
        };
        if finish {
            event_loop.handles.remove(parent);
        }
    } else {
        // Teardown completes in any order; splice out of the chain.
        let mut cursor = current;
        while let Some(link) = cursor {
            let next = event_loop.ctxs.get(link).expect("broken context chain").previous;
            if next == Some(ctx_token) {
                event_loop.ctxs.get_mut(link).unwrap().previous = previous;
                break;
            }
            cursor = next;
        }
    }

    event_loop.ctxs.remove(ctx_token);
}

/// Re-issue the stat of every context that had a request in flight when
/// the process forked; the parent's worker would have completed them, the
/// child's never will.
pub(crate) fn resubmit_inflight(event_loop: &mut EventLoop) -> io::Result<()> {
    let stuck: Vec<Token> = event_loop
        .ctxs
        .iter()
        .filter(|(_, ctx)| ctx.stat_pending)
        .map(|(token, _)| token)
        .collect();
    for token in stuck {
        event_loop.submit_stat(token)?;
    }
    Ok(())
}

/// Delay until the next sample so that firing times stay phase-locked to
/// `start_time` no matter how long the stat took.
fn next_delay(now: u64, start_time: u64, interval: u64) -> u64 {
    interval - ((now - start_time) % interval)
}

fn statbuf_eq(a: &FileStat, b: &FileStat) -> bool {
    a.ctime.nsec == b.ctime.nsec
        && a.mtime.nsec == b.mtime.nsec
        && a.birthtime.nsec == b.birthtime.nsec
        && a.ctime.sec == b.ctime.sec
        && a.mtime.sec == b.mtime.sec
        && a.birthtime.sec == b.birthtime.sec
        && a.size == b.size
        && a.mode == b.mode
        && a.uid == b.uid
        && a.gid == b.gid
        && a.ino == b.ino
        && a.dev == b.dev
        && a.flags == b.flags
        && a.gen == b.gen
}

#[cfg(test)]
mod tests {
    use super::{next_delay, statbuf_eq};
    use crate::fs::{FileStat, TimeSpec};

    fn sample() -> FileStat {
        FileStat {
            dev: 64768,
            mode: 0o100644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            ino: 523847,
            size: 1337,
            blksize: 4096,
            blocks: 8,
            flags: 0,
            gen: 0,
            atime: TimeSpec { sec: 100, nsec: 1 },
            mtime: TimeSpec { sec: 100, nsec: 2 },
            ctime: TimeSpec { sec: 100, nsec: 3 },
            birthtime: TimeSpec { sec: 90, nsec: 4 },
        }
    }

    #[test]
    fn identical_snapshots_are_equal() {
        assert!(statbuf_eq(&sample(), &sample()));
    }

    #[test]
    fn each_watched_field_is_compared() {
        let mutations: [fn(&mut FileStat); 9] = [
            |s| s.mtime.nsec += 1,
            |s| s.ctime.sec += 1,
            |s| s.birthtime.nsec += 1,
            |s| s.size += 1,
            |s| s.mode ^= 0o001,
            |s| s.uid += 1,
            |s| s.gid += 1,
            |s| s.ino += 1,
            |s| s.dev += 1,
        ];
        for mutate in mutations {
            let mut changed = sample();
            mutate(&mut changed);
            assert!(!statbuf_eq(&sample(), &changed));
        }
    }

    #[test]
    fn access_time_is_not_a_change() {
        let mut touched = sample();
        touched.atime = TimeSpec { sec: 999, nsec: 9 };
        assert!(statbuf_eq(&sample(), &touched));
    }

    #[test]
    fn delay_compensates_for_stat_latency() {
        // Period started at t=1, the stat took 7ms of a 10ms interval: the
        // next sample is due 3ms out, keeping t=11 on phase.
        assert_eq!(next_delay(8, 1, 10), 3);
        // No latency at all leaves a full interval.
        assert_eq!(next_delay(10, 10, 10), 10);
        // Latency beyond the interval still yields a positive delay below
        // one interval.
        assert_eq!(next_delay(25, 0, 10), 5);
    }
}

use std::ffi::CString;
use std::io;
use std::process;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

#[cfg(feature = "log")]
use log::{error, trace};

use crate::{sys, Token, Waker};

/// Seconds and nanoseconds of a file timestamp.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TimeSpec {
    /// Whole seconds.
    pub sec: i64,
    /// Nanoseconds past the second.
    pub nsec: i64,
}

/// A point-in-time snapshot of a file's metadata, as sampled by
/// [`FsPoll`](crate::FsPoll).
///
/// On platforms without a birth time `birthtime` mirrors `ctime`; `flags`
/// and `gen` are zero outside the BSDs. Change detection compares a fixed
/// subset of these fields; `atime` in particular is carried for callers
/// but never treated as a change.
#[derive(Copy, Clone, Debug, Default)]
pub struct FileStat {
    /// Device containing the file.
    pub dev: u64,
    /// File type and permission bits.
    pub mode: u32,
    /// Number of hard links.
    pub nlink: u64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Device id, for device special files.
    pub rdev: u64,
    /// Inode number.
    pub ino: u64,
    /// Size in bytes.
    pub size: u64,
    /// Preferred I/O block size.
    pub blksize: u64,
    /// Number of 512-byte blocks allocated.
    pub blocks: u64,
    /// BSD file flags; zero elsewhere.
    pub flags: u64,
    /// BSD file generation number; zero elsewhere.
    pub gen: u64,
    /// Last access time.
    pub atime: TimeSpec,
    /// Last modification time.
    pub mtime: TimeSpec,
    /// Last status change time.
    pub ctime: TimeSpec,
    /// Creation time; mirrors `ctime` where the platform has none.
    pub birthtime: TimeSpec,
}

impl FileStat {
    #[allow(clippy::unnecessary_cast)] // Field widths differ between platforms.
    pub(crate) fn from_sys(buf: &libc::stat) -> FileStat {
        let ctime = TimeSpec {
            sec: buf.st_ctime as i64,
            nsec: buf.st_ctime_nsec as i64,
        };
        FileStat {
            dev: buf.st_dev as u64,
            mode: buf.st_mode as u32,
            nlink: buf.st_nlink as u64,
            uid: buf.st_uid as u32,
            gid: buf.st_gid as u32,
            rdev: buf.st_rdev as u64,
            ino: buf.st_ino as u64,
            size: buf.st_size as u64,
            blksize: buf.st_blksize as u64,
            blocks: buf.st_blocks as u64,
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
            ))]
            flags: buf.st_flags as u64,
            #[cfg(not(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
            )))]
            flags: 0,
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
            ))]
            gen: buf.st_gen as u64,
            #[cfg(not(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
            )))]
            gen: 0,
            atime: TimeSpec {
                sec: buf.st_atime as i64,
                nsec: buf.st_atime_nsec as i64,
            },
            mtime: TimeSpec {
                sec: buf.st_mtime as i64,
                nsec: buf.st_mtime_nsec as i64,
            },
            ctime,
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
            ))]
            birthtime: TimeSpec {
                sec: buf.st_birthtime as i64,
                nsec: buf.st_birthtime_nsec as i64,
            },
            #[cfg(not(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
            )))]
            birthtime: ctime,
        }
    }
}

/// One queued metadata request; `ctx` names the poll context that issued
/// it.
pub(crate) struct StatRequest {
    pub(crate) ctx: Token,
    pub(crate) path: CString,
}

/// A finished request. Errors carry the negated `errno`, which is also the
/// value the issuing context stores for error deduplication.
pub(crate) struct StatDone {
    pub(crate) ctx: Token,
    pub(crate) result: Result<FileStat, i32>,
}

/// The loop's blocking-work executor: one worker thread draining stat
/// requests and rousing the loop through an internal waker when results
/// are ready.
///
/// The waker and completion vector outlive the worker itself so that the
/// post-fork hook can discard the (gone) thread and respawn it without
/// re-registering loop handles.
pub(crate) struct WorkState {
    pub(crate) done: Arc<Mutex<Vec<StatDone>>>,
    pub(crate) waker: Waker,
    pub(crate) queue: Option<WorkQueue>,
}

pub(crate) struct WorkQueue {
    tx: Option<mpsc::Sender<StatRequest>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl WorkQueue {
    pub(crate) fn spawn(
        waker: Waker,
        done: Arc<Mutex<Vec<StatDone>>>,
    ) -> io::Result<WorkQueue> {
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("eloop-worker".to_owned())
            .spawn(move || worker_main(rx, done, waker))?;
        #[cfg(feature = "log")]
        trace!("stat worker spawned");
        Ok(WorkQueue {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Hand a request to the worker. The channel only disconnects when the
    /// worker died, which breaks the loop's internal contract.
    pub(crate) fn submit(&self, req: StatRequest) {
        if self.tx.as_ref().expect("work queue without sender").send(req).is_err() {
            #[cfg(feature = "log")]
            error!("stat worker is gone");
            process::abort();
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // Disconnect the channel first so the worker's `recv` returns.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_main(
    rx: mpsc::Receiver<StatRequest>,
    done: Arc<Mutex<Vec<StatDone>>>,
    waker: Waker,
) {
    while let Ok(req) = rx.recv() {
        let result = match sys::stat(&req.path) {
            Ok(buf) => Ok(FileStat::from_sys(&buf)),
            Err(err) => Err(-err.raw_os_error().unwrap_or(libc::EIO)),
        };
        done.lock().unwrap().push(StatDone {
            ctx: req.ctx,
            result,
        });
        waker.wake();
    }
}

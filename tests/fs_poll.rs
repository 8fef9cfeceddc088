use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use eloop::{EventLoop, FsPoll, FsPollEvent};

mod util;

use util::{init, run_for, run_until, temp_path};

const INTERVAL: Duration = Duration::from_millis(10);
// Long enough for many sampling intervals, far below any test timeout.
const SETTLE: Duration = Duration::from_millis(100);
const PATIENCE: Duration = Duration::from_secs(2);

type Events = Rc<RefCell<Vec<FsPollEvent>>>;

fn recording_watcher(
    event_loop: &mut EventLoop,
    path: &Path,
    interval: Duration,
) -> (FsPoll, Events) {
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&events);
    let watcher = FsPoll::new(event_loop);
    watcher
        .start(event_loop, path, interval, move |_, event| {
            log.borrow_mut().push(event);
        })
        .expect("unable to start watcher");
    (watcher, events)
}

struct TempFile(std::path::PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

fn temp_file(name: &str, contents: &str) -> TempFile {
    let path = temp_path(name);
    fs::write(&path, contents).expect("unable to create temp file");
    TempFile(path)
}

#[test]
fn first_sample_is_silent() {
    init();

    let file = temp_file("first-sample", "contents");
    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (watcher, events) = recording_watcher(&mut event_loop, &file.0, INTERVAL);

    run_for(&mut event_loop, SETTLE);
    assert!(events.borrow().is_empty());

    watcher.stop(&mut event_loop).unwrap();
}

#[test]
fn change_fires_with_distinct_snapshots() {
    init();

    let file = temp_file("change", "a");
    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (watcher, events) = recording_watcher(&mut event_loop, &file.0, INTERVAL);

    run_for(&mut event_loop, SETTLE);

    fs::write(&file.0, "abcdef").unwrap();
    assert!(run_until(&mut event_loop, PATIENCE, || {
        !events.borrow().is_empty()
    }));

    {
        let events = events.borrow();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FsPollEvent::Change { previous, current } => {
                assert_eq!(previous.size, 1);
                assert_eq!(current.size, 6);
            }
            other => panic!("expected a change event, got {:?}", other),
        }
    }

    // Identical metadata on subsequent samples stays silent.
    run_for(&mut event_loop, SETTLE);
    assert_eq!(events.borrow().len(), 1);

    // Another mutation fires another event.
    fs::write(&file.0, "abcdefghi").unwrap();
    assert!(run_until(&mut event_loop, PATIENCE, || {
        events.borrow().len() == 2
    }));

    watcher.stop(&mut event_loop).unwrap();
}

#[test]
fn zero_interval_is_clamped() {
    init();

    let file = temp_file("zero-interval", "a");
    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (watcher, events) = recording_watcher(&mut event_loop, &file.0, Duration::ZERO);

    run_for(&mut event_loop, SETTLE);
    fs::write(&file.0, "ab").unwrap();
    assert!(run_until(&mut event_loop, PATIENCE, || {
        !events.borrow().is_empty()
    }));

    watcher.stop(&mut event_loop).unwrap();
}

#[test]
fn repeated_errors_are_reported_once() {
    init();

    let path = temp_path("missing");
    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (watcher, events) = recording_watcher(&mut event_loop, &path, INTERVAL);

    assert!(run_until(&mut event_loop, PATIENCE, || {
        !events.borrow().is_empty()
    }));
    {
        let events = events.borrow();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FsPollEvent::Error { error, .. } => {
                assert_eq!(error.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected an error event, got {:?}", other),
        }
    }

    // The path stays missing; the identical error is not repeated.
    run_for(&mut event_loop, SETTLE);
    assert_eq!(events.borrow().len(), 1);

    // Creating the file recovers with a change whose previous snapshot is
    // the zeroed placeholder.
    fs::write(&path, "now it exists").unwrap();
    assert!(run_until(&mut event_loop, PATIENCE, || {
        events.borrow().len() == 2
    }));
    {
        let events = events.borrow();
        match &events[1] {
            FsPollEvent::Change { previous, current } => {
                assert_eq!(previous.ino, 0);
                assert_eq!(previous.size, 0);
                assert!(current.size > 0);
            }
            other => panic!("expected a change event, got {:?}", other),
        }
    }

    watcher.stop(&mut event_loop).unwrap();
    let _ = fs::remove_file(&path);
}

#[test]
fn stop_silences_and_restart_samples_afresh() {
    init();

    let file = temp_file("stop-restart", "a");
    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (watcher, events) = recording_watcher(&mut event_loop, &file.0, INTERVAL);

    run_for(&mut event_loop, SETTLE);
    watcher.stop(&mut event_loop).unwrap();

    // Mutations while stopped are invisible.
    fs::write(&file.0, "ab").unwrap();
    run_for(&mut event_loop, SETTLE);
    assert!(events.borrow().is_empty());

    // Restarting re-applies the first-sample policy: the state as found on
    // restart is the new baseline, not a change.
    let restarted: Events = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&restarted);
    watcher
        .start(&mut event_loop, &file.0, INTERVAL, move |_, event| {
            log.borrow_mut().push(event);
        })
        .expect("unable to restart watcher");
    run_for(&mut event_loop, SETTLE);
    assert!(restarted.borrow().is_empty());

    fs::write(&file.0, "abcd").unwrap();
    assert!(run_until(&mut event_loop, PATIENCE, || {
        restarted.borrow().len() == 1
    }));

    watcher.stop(&mut event_loop).unwrap();
}

#[test]
fn restart_while_old_context_drains() {
    init();

    let file_a = temp_file("drain-a", "a");
    let file_b = temp_file("drain-b", "b");
    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (watcher, events_a) = recording_watcher(&mut event_loop, &file_a.0, INTERVAL);

    run_for(&mut event_loop, Duration::from_millis(30));
    watcher.stop(&mut event_loop).unwrap();

    // Start again before the stopped context had any chance to tear down;
    // the new context simply becomes current.
    let events_b: Events = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&events_b);
    watcher
        .start(&mut event_loop, &file_b.0, INTERVAL, move |_, event| {
            log.borrow_mut().push(event);
        })
        .expect("unable to restart watcher");
    assert_eq!(watcher.path(&event_loop).unwrap(), file_b.0.as_path());

    fs::write(&file_a.0, "aaaa").unwrap();
    run_for(&mut event_loop, SETTLE);
    assert!(events_a.borrow().is_empty());

    fs::write(&file_b.0, "bbbb").unwrap();
    assert!(run_until(&mut event_loop, PATIENCE, || {
        events_b.borrow().len() == 1
    }));

    watcher.stop(&mut event_loop).unwrap();
}

#[test]
fn path_reflects_the_active_context() {
    init();

    let file = temp_file("path", "a");
    let mut event_loop = EventLoop::new().expect("unable to create loop");

    let watcher = FsPoll::new(&mut event_loop);
    let err = watcher.path(&event_loop).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    watcher
        .start(&mut event_loop, &file.0, INTERVAL, |_, _| {})
        .unwrap();
    assert_eq!(watcher.path(&event_loop).unwrap(), file.0.as_path());

    // Starting an active watcher is a no-op and keeps the current path.
    let other = temp_path("path-other");
    watcher
        .start(&mut event_loop, &other, INTERVAL, |_, _| {})
        .unwrap();
    assert_eq!(watcher.path(&event_loop).unwrap(), file.0.as_path());

    watcher.stop(&mut event_loop).unwrap();
    let err = watcher.path(&event_loop).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
}

#[test]
fn close_releases_the_watcher() {
    init();

    let file = temp_file("close", "a");
    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (watcher, events) = recording_watcher(&mut event_loop, &file.0, INTERVAL);

    run_for(&mut event_loop, Duration::from_millis(30));
    watcher.close(&mut event_loop);

    // Draining the contexts is all that keeps the loop alive; run()
    // returns once the close completed.
    event_loop.run().expect("loop run failed");
    assert!(!event_loop.alive());

    fs::write(&file.0, "ab").unwrap();
    run_for(&mut event_loop, Duration::from_millis(50));
    assert!(events.borrow().is_empty());
}

// Not all functions are used by all tests.
#![allow(dead_code)]

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Once;
use std::time::{Duration, Instant};

use eloop::EventLoop;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

pub fn assert_sync<T: Sync>() {}
pub fn assert_send<T: Send>() {}

/// Drive the loop for roughly `duration`, however often it wakes early.
pub fn run_for(event_loop: &mut EventLoop, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        event_loop
            .run_once(Some(deadline - now))
            .expect("loop turn failed");
    }
}

/// Drive the loop until `done` returns true, giving up after `timeout`.
pub fn run_until(
    event_loop: &mut EventLoop,
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let turn = (deadline - now).min(Duration::from_millis(10));
        event_loop.run_once(Some(turn)).expect("loop turn failed");
    }
}

/// A path under the system temp directory that no other test (or test
/// run) collides with.
pub fn temp_path(name: &str) -> PathBuf {
    env::temp_dir().join(format!(
        "eloop-{}-{}-{:08x}",
        name,
        process::id(),
        rand::random::<u32>()
    ))
}

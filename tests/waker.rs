use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use eloop::{EventLoop, Waker};

mod util;

use util::{assert_send, assert_sync, init, run_for, run_until};

fn counting_waker(event_loop: &mut EventLoop) -> (Waker, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let waker = Waker::new(event_loop, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .expect("unable to create waker");
    (waker, hits)
}

#[test]
fn is_send_and_sync() {
    assert_send::<Waker>();
    assert_sync::<Waker>();
}

#[test]
fn wake_runs_callback() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (waker, hits) = counting_waker(&mut event_loop);

    waker.wake();
    assert!(run_until(&mut event_loop, Duration::from_secs(1), || {
        hits.load(Ordering::SeqCst) == 1
    }));

    waker.close(&mut event_loop);
}

#[test]
fn wakes_before_a_turn_coalesce() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (waker, hits) = counting_waker(&mut event_loop);

    for _ in 0..3 {
        waker.wake();
    }
    assert!(run_until(&mut event_loop, Duration::from_secs(1), || {
        hits.load(Ordering::SeqCst) >= 1
    }));
    // The batch collapses into exactly one invocation, and a quiet loop
    // does not produce any more.
    run_for(&mut event_loop, Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    waker.close(&mut event_loop);
}

#[test]
fn wake_after_observation_fires_again() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (waker, hits) = counting_waker(&mut event_loop);

    waker.wake();
    assert!(run_until(&mut event_loop, Duration::from_secs(1), || {
        hits.load(Ordering::SeqCst) == 1
    }));

    waker.wake();
    assert!(run_until(&mut event_loop, Duration::from_secs(1), || {
        hits.load(Ordering::SeqCst) == 2
    }));

    waker.close(&mut event_loop);
}

#[test]
fn wake_from_another_thread() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (waker, hits) = counting_waker(&mut event_loop);

    let remote = waker.clone();
    let handle = thread::spawn(move || remote.wake());

    assert!(run_until(&mut event_loop, Duration::from_secs(1), || {
        hits.load(Ordering::SeqCst) == 1
    }));
    handle.join().unwrap();

    waker.close(&mut event_loop);
}

#[test]
fn two_wakers_run_independently() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (waker1, hits1) = counting_waker(&mut event_loop);
    let (waker2, hits2) = counting_waker(&mut event_loop);

    waker2.wake();
    assert!(run_until(&mut event_loop, Duration::from_secs(1), || {
        hits2.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(hits1.load(Ordering::SeqCst), 0);

    waker1.wake();
    waker2.wake();
    assert!(run_until(&mut event_loop, Duration::from_secs(1), || {
        hits1.load(Ordering::SeqCst) == 1 && hits2.load(Ordering::SeqCst) == 2
    }));

    waker1.close(&mut event_loop);
    waker2.close(&mut event_loop);
}

#[test]
fn no_callback_after_close() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (waker, hits) = counting_waker(&mut event_loop);

    waker.wake();
    waker.close(&mut event_loop);
    run_for(&mut event_loop, Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // Clones waking a closed registration are a no-op.
    waker.wake();
    run_for(&mut event_loop, Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn close_races_with_wake() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (waker, hits) = counting_waker(&mut event_loop);

    let stop = Arc::new(AtomicBool::new(false));
    let halt = Arc::clone(&stop);
    let remote = waker.clone();
    let handle = thread::spawn(move || {
        while !halt.load(Ordering::SeqCst) {
            remote.wake();
        }
    });

    assert!(run_until(&mut event_loop, Duration::from_secs(1), || {
        hits.load(Ordering::SeqCst) >= 1
    }));

    // Close while the other thread keeps hammering; close spins out any
    // sender caught in its critical section.
    waker.close(&mut event_loop);
    run_for(&mut event_loop, Duration::from_millis(20));
    let after_close = hits.load(Ordering::SeqCst);

    run_for(&mut event_loop, Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), after_close);

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();
}

#[test]
fn concurrent_wakes_are_bounded() {
    init();

    const SENDS: usize = 100_000;

    let mut event_loop = EventLoop::new().expect("unable to create loop");
    let (waker, hits) = counting_waker(&mut event_loop);

    let remote1 = waker.clone();
    let remote2 = waker.clone();
    let sender1 = thread::spawn(move || {
        for _ in 0..SENDS {
            remote1.wake();
        }
    });
    let sender2 = thread::spawn(move || {
        for _ in 0..SENDS {
            remote2.wake();
        }
    });

    while !(sender1.is_finished() && sender2.is_finished()) {
        event_loop
            .run_once(Some(Duration::from_millis(1)))
            .expect("loop turn failed");
    }
    sender1.join().unwrap();
    sender2.join().unwrap();

    // Observe whatever the last wake left behind.
    event_loop
        .run_once(Some(Duration::from_millis(10)))
        .expect("loop turn failed");

    let total = hits.load(Ordering::SeqCst);
    assert!(total >= 1);
    assert!(total <= 2 * SENDS);

    waker.close(&mut event_loop);
}

#![cfg(target_os = "linux")]

use std::sync::{Arc, Condvar, Mutex, RwLock, mpsc};
use std::thread;
use std::time::Duration;

use blockcheck::{BlockDetector, CollectingReporter, SamplerConfig};
use common::{SETTLE, setup_tracing, spawn_named};

mod common;

#[inline(never)]
fn sleeping_forever() {
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

#[inline(never)]
fn receiving_forever(rx: mpsc::Receiver<()>) {
    let _ = rx.recv();
}

#[inline(never)]
fn selecting_forever(idle: flume::Receiver<u32>, full: flume::Sender<u32>) {
    flume::Selector::new()
        .recv(&idle, |_| ())
        .send(&full, 7, |_| ())
        .wait();
}

/// Relocks a mutex the thread already holds.
#[inline(never)]
fn locking_forever() {
    let mutex = Mutex::new(());
    let _first = mutex.lock();
    let _second = mutex.lock();
}

/// Upgrades a read lock to a write lock on the same thread.
#[inline(never)]
fn upgrading_forever() {
    let lock = RwLock::new(0u32);
    let _read = lock.read();
    let _write = lock.write();
}

#[inline(never)]
fn waiting_forever(pair: Arc<(Mutex<bool>, Condvar)>) {
    let (ready, cvar) = &*pair;
    let Ok(mut ready) = ready.lock() else {
        return;
    };
    while !*ready {
        ready = match cvar.wait(ready) {
            Ok(guard) => guard,
            Err(_) => return,
        };
    }
}

#[test]
fn reports_each_blocked_thread_once() -> anyhow::Result<()> {
    setup_tracing();

    spawn_named("sleeper", sleeping_forever)?;

    let (tx, rx) = mpsc::channel::<()>();
    spawn_named("receiver", move || receiving_forever(rx))?;

    let (_idle_tx, idle_rx) = flume::unbounded::<u32>();
    let (full_tx, _full_rx) = flume::bounded::<u32>(0);
    spawn_named("selector", move || selecting_forever(idle_rx, full_tx))?;

    spawn_named("locker", locking_forever)?;
    spawn_named("upgrader", upgrading_forever)?;

    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let waiter = Arc::clone(&pair);
    spawn_named("waiter", move || waiting_forever(waiter))?;

    thread::sleep(SETTLE);

    let detector = BlockDetector::threads(SamplerConfig::default())?;
    let reporter = CollectingReporter::new();
    let report = detector.detect(&reporter, Duration::from_secs(5), "blockcheck::sampler::");

    let messages = reporter.messages();
    assert_eq!(messages.len(), 6, "{messages:#?}");
    for name in [
        "sleeping_forever",
        "receiving_forever",
        "selecting_forever",
        "locking_forever",
        "upgrading_forever",
        "waiting_forever",
    ] {
        let hits = messages.iter().filter(|m| m.contains(name)).count();
        assert_eq!(hits, 1, "{name} in {messages:#?}");
    }
    assert!(messages.iter().all(|m| m.starts_with("Blocked thread: ")));

    let again = detector.observe(Duration::from_secs(1), "blockcheck::sampler::");
    assert_eq!(again, report);

    drop(tx);
    Ok(())
}

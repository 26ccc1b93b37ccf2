use std::cell::UnsafeCell;
use std::collections::BTreeSet;
use std::io;
use std::ptr;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use super::{Origin, RawThread, SamplerConfig};
use crate::error::Error;

/// Name fragment of the signal handler, used to strip its frames.
pub(super) const HANDLER_SYMBOL: &str = "on_sample_signal";

/// How long to wait for handlers still running after a timed-out round.
const DRAIN_WAIT: Duration = Duration::from_millis(100);

// ── lock-free signal-handler infrastructure ──────────────────────────────
//
// Protocol:
//  1. The collector allocates a `CaptureSession` with one `SlotEntry` per
//     target thread, publishes it through `CURRENT_SESSION`, then sends the
//     sampling signal to every target with tgkill.
//  2. Each target's handler finds its slot by kernel tid, walks its own
//     stack into the slot's pre-allocated buffer, publishes the frame count
//     with a Release store and decrements `remaining`.
//  3. The collector waits for `remaining == 0` or the reply timeout, clears
//     `CURRENT_SESSION`, waits for `IN_HANDLER` to drain, and only then
//     reclaims the session.
//
// The handler never allocates and never takes a lock.

/// One pre-allocated capture buffer per target thread.
struct SlotEntry {
    tid: libc::pid_t,
    /// Written exclusively by the target's signal handler before len is set.
    ips: UnsafeCell<Box<[usize]>>,
    /// 0 until the signal handler is done; stored with Release.
    len: AtomicUsize,
    /// Set by the first handler run, so a duplicate signal is ignored.
    answered: AtomicBool,
}

// SAFETY: each slot is written by exactly one thread; read only after the
// Release/Acquire pair on `len` establishes the happens-before.
unsafe impl Sync for SlotEntry {}

struct CaptureSession {
    slots: Box<[SlotEntry]>,
    remaining: AtomicUsize,
}

/// Pointer to the live `CaptureSession`, or null when no collection is active.
static CURRENT_SESSION: AtomicPtr<CaptureSession> = AtomicPtr::new(ptr::null_mut());

/// Number of handlers currently between loading and releasing the session.
static IN_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Serialises collection rounds so at most one session is ever published.
static COLLECT_LOCK: Mutex<()> = Mutex::new(());

/// Signals that already carry our handler.
static INSTALLED: Mutex<BTreeSet<libc::c_int>> = Mutex::new(BTreeSet::new());

fn gettid() -> libc::pid_t {
    // SAFETY: gettid has no preconditions and is async-signal-safe.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

extern "C" fn on_sample_signal(_: libc::c_int) {
    IN_HANDLER.fetch_add(1, Ordering::SeqCst);
    let ptr = CURRENT_SESSION.load(Ordering::SeqCst);
    if !ptr.is_null() {
        // SAFETY: the collector keeps the session alive until IN_HANDLER
        // drops back to zero after the pointer was cleared.
        let session: &CaptureSession = unsafe { &*ptr };
        let my_tid = gettid();
        if let Some(slot) = session.slots.iter().find(|s| s.tid == my_tid) {
            if !slot.answered.swap(true, Ordering::AcqRel) {
                // SAFETY: only this thread writes this slot, and the
                // collector reads it only after `len` is published.
                let buf: &mut [usize] = unsafe { &mut *slot.ips.get() };
                let mut count = 0usize;
                // SAFETY: COLLECT_LOCK guarantees one round at a time, and
                // each target walks only its own stack.
                unsafe {
                    backtrace::trace_unsynchronized(|frame| {
                        if count < buf.len() {
                            buf[count] = frame.ip() as usize;
                            count += 1;
                            true
                        } else {
                            false
                        }
                    });
                }
                slot.len.store(count, Ordering::Release);
                session.remaining.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
    IN_HANDLER.fetch_sub(1, Ordering::SeqCst);
}

fn handler_address() -> libc::sighandler_t {
    on_sample_signal as extern "C" fn(libc::c_int) as libc::sighandler_t
}

/// The previous disposition, if it was a handler other than ours.
fn displaced_handler(previous: libc::sighandler_t) -> Option<libc::sighandler_t> {
    (previous != libc::SIG_DFL && previous != libc::SIG_IGN && previous != handler_address())
        .then_some(previous)
}

pub(super) fn install_handler(signal: libc::c_int) -> Result<(), Error> {
    if signal <= 0 || signal == libc::SIGKILL || signal == libc::SIGSTOP {
        return Err(Error::InvalidSignal(signal));
    }
    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    if installed.contains(&signal) {
        return Ok(());
    }

    // SAFETY: both sigaction structs are fully initialised before use, and
    // the handler only touches atomics and pre-allocated buffers.
    let (rc, previous) = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        let mut previous: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler_address();
        // No SA_ONSTACK: std's alternate stacks are sized for the overflow
        // message only, too small for an unwinder.
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        let rc = libc::sigaction(signal, &action, &mut previous);
        (rc, previous)
    };
    if rc != 0 {
        return Err(Error::SignalInstall {
            signal,
            source: io::Error::last_os_error(),
        });
    }
    if let Some(displaced) = displaced_handler(previous.sa_sigaction) {
        tracing::warn!(
            signal,
            displaced = displaced as u64,
            "replaced an existing handler for the sampling signal"
        );
    }
    installed.insert(signal);
    Ok(())
}

fn list_threads() -> io::Result<Vec<libc::pid_t>> {
    let mut tids = Vec::new();
    for entry in std::fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

fn thread_name(tid: libc::pid_t) -> String {
    std::fs::read_to_string(format!("/proc/self/task/{tid}/comm"))
        .map(|name| name.trim().to_owned())
        .unwrap_or_default()
}

/// Samples every thread of the process. `own` is the calling thread's
/// stack, already walked by the caller.
pub(super) fn collect(config: &SamplerConfig, own: Vec<usize>) -> Vec<RawThread> {
    let own_tid = gettid();
    let own_thread = RawThread {
        tid: own_tid.into(),
        name: thread_name(own_tid),
        ips: Some(own),
        origin: Origin::Direct,
    };

    let targets: Vec<libc::pid_t> = match list_threads() {
        Ok(tids) => tids.into_iter().filter(|&tid| tid != own_tid).collect(),
        Err(err) => {
            tracing::warn!("could not list threads, sampling the caller only: {err}");
            return vec![own_thread];
        }
    };

    let mut threads = collect_others(config, &targets);
    threads.push(own_thread);
    threads.sort_by_key(|t| t.tid);
    threads
}

fn collect_others(config: &SamplerConfig, targets: &[libc::pid_t]) -> Vec<RawThread> {
    let _lock = COLLECT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    let slots: Vec<SlotEntry> = targets
        .iter()
        .map(|&tid| SlotEntry {
            tid,
            ips: UnsafeCell::new(vec![0; config.max_frames.max(1)].into_boxed_slice()),
            len: AtomicUsize::new(0),
            answered: AtomicBool::new(false),
        })
        .collect();
    let session_ptr = Box::into_raw(Box::new(CaptureSession {
        slots: slots.into_boxed_slice(),
        remaining: AtomicUsize::new(targets.len()),
    }));

    // Publish the session pointer before any signal is sent.
    CURRENT_SESSION.store(session_ptr, Ordering::SeqCst);

    // SAFETY: the session stays alive until it is reclaimed below.
    let session = unsafe { &*session_ptr };
    // SAFETY: getpid has no preconditions.
    let pid = unsafe { libc::getpid() };
    let mut exited = BTreeSet::new();
    for &tid in targets {
        // SAFETY: tgkill only delivers a signal; a stale tid fails with ESRCH.
        let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, config.signal) };
        if rc != 0 {
            tracing::trace!(tid, "thread gone before sampling: {}", io::Error::last_os_error());
            exited.insert(tid);
            session.remaining.fetch_sub(1, Ordering::SeqCst);
        }
    }

    let deadline = Instant::now() + config.reply_timeout();
    while session.remaining.load(Ordering::Acquire) > 0 {
        if Instant::now() >= deadline {
            tracing::debug!(
                missing = session.remaining.load(Ordering::SeqCst),
                "timed out waiting for sampling replies"
            );
            break;
        }
        thread::sleep(Duration::from_micros(50));
    }

    // Retract the session before reclaiming it, so a late signal sees null.
    CURRENT_SESSION.store(ptr::null_mut(), Ordering::SeqCst);
    let drain_deadline = Instant::now() + DRAIN_WAIT;
    while IN_HANDLER.load(Ordering::SeqCst) > 0 {
        if Instant::now() >= drain_deadline {
            tracing::warn!("sampling handler still running, leaking capture session");
            return read_slots(session, &exited);
        }
        thread::yield_now();
    }

    // SAFETY: the pointer was retracted and no handler holds it any more.
    let session = unsafe { Box::from_raw(session_ptr) };
    read_slots(&session, &exited)
}

fn read_slots(session: &CaptureSession, exited: &BTreeSet<libc::pid_t>) -> Vec<RawThread> {
    session
        .slots
        .iter()
        .filter(|slot| !exited.contains(&slot.tid))
        .map(|slot| {
            // Acquire pairs with the handler's Release store, making the
            // frames written before it visible here.
            let len = slot.len.load(Ordering::Acquire);
            let ips = (len > 0).then(|| {
                // SAFETY: the handler finished writing before publishing len.
                let buf = unsafe { &*slot.ips.get() };
                buf[..len.min(buf.len())].to_vec()
            });
            RawThread {
                tid: slot.tid.into(),
                name: thread_name(slot.tid),
                ips,
                origin: Origin::Signal,
            }
        })
        .collect()
}

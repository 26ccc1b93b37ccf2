//! # Whole-process stack sampling.
//!
//! [`StackSampler`] is the capability the detector needs: produce one
//! [`StackSnapshot`] holding the call stack of every live thread. Tests can
//! substitute a scripted implementation (see [`crate::test_utils`]).
//!
//! [`ThreadSampler`] is the production implementation. On Linux it lists
//! the threads in `/proc/self/task` and asks each of them, through a signal,
//! to record its own instruction pointers into a pre-allocated slot. The
//! addresses are resolved to symbols on the collecting thread afterwards,
//! and every thread is rendered as one block:
//!
//! ```text
//! thread 4242 "worker-3":
//! std::sys::pal::unix::futex::futex_wait
//!     at futex.rs:67
//! my_crate::pipeline::drain
//!     at pipeline.rs:88
//! ```
//!
//! Blocks are joined with a blank line into a dump bounded by
//! [`SamplerConfig::buffer_size`]. A dump that does not fit is cut and the
//! snapshot is flagged as truncated.

use std::ffi::c_void;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::snapshot::{DumpBuffer, StackSnapshot};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as platform;

#[cfg(not(target_os = "linux"))]
mod fallback;
#[cfg(not(target_os = "linux"))]
use fallback as platform;

/// Body marker for a thread none of whose frames could be symbolized.
pub const FOREIGN_CODE_MARKER: &str = "<foreign code>";

const UNKNOWN_SYMBOL: &str = "<unknown>";

/// Name fragment of the routine that walks the calling thread.
const WALKER_SYMBOL: &str = "walk_current_thread";

#[cfg(unix)]
const DEFAULT_SAMPLE_SIGNAL: i32 = libc::SIGUSR2;
#[cfg(not(unix))]
const DEFAULT_SAMPLE_SIGNAL: i32 = 0;

/// Captures the stacks of all live threads.
///
/// Capturing never fails. Missing data about a thread degrades into an empty
/// or partial block instead of an error.
pub trait StackSampler: Send + Sync {
    fn capture(&self) -> StackSnapshot;
}

impl<S: StackSampler + ?Sized> StackSampler for Arc<S> {
    fn capture(&self) -> StackSnapshot {
        (**self).capture()
    }
}

impl<S: StackSampler + ?Sized> StackSampler for &S {
    fn capture(&self) -> StackSnapshot {
        (**self).capture()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Upper bound on the rendered dump, in bytes.
    pub buffer_size: usize,
    /// Maximum call-stack depth recorded per thread.
    pub max_frames: usize,
    /// How long to wait for every thread to answer the sampling signal.
    pub reply_timeout_ms: u64,
    /// Signal used to interrupt threads for sampling.
    pub signal: i32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 2 << 20,
            max_frames: 128,
            reply_timeout_ms: 2_000,
            signal: DEFAULT_SAMPLE_SIGNAL,
        }
    }
}

impl SamplerConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Samples every OS thread of the current process.
#[derive(Debug, Clone)]
pub struct ThreadSampler {
    config: SamplerConfig,
}

impl ThreadSampler {
    /// Creates a sampler and installs the process-wide sampling signal
    /// handler. Installing the same signal twice is a no-op.
    pub fn new(config: SamplerConfig) -> Result<Self, Error> {
        platform::install_handler(config.signal)?;
        tracing::debug!(
            signal = config.signal,
            buffer_size = config.buffer_size,
            "stack sampler ready"
        );
        Ok(Self { config })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }
}

impl StackSampler for ThreadSampler {
    fn capture(&self) -> StackSnapshot {
        let threads = enumerate_threads(&self.config);
        let mut dump = DumpBuffer::new(self.config.buffer_size);
        for thread in &threads {
            dump.push_block(&thread.render());
        }
        let snapshot = dump.finish();
        if snapshot.is_truncated() {
            tracing::warn!(
                buffer_size = self.config.buffer_size,
                threads = threads.len(),
                "stack dump truncated, increase sampler.buffer_size"
            );
        }
        snapshot
    }
}

/// Stack of one thread as captured by the platform layer.
#[derive(Debug)]
pub(crate) struct RawThread {
    pub(crate) tid: i64,
    pub(crate) name: String,
    /// `None` when the thread did not answer in time.
    pub(crate) ips: Option<Vec<usize>>,
    pub(crate) origin: Origin,
}

/// Where a stack walk started, which decides the frames to strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Walked by the collecting thread itself.
    Direct,
    /// Walked from inside the sampling signal handler.
    Signal,
}

/// Walks the calling thread and every other live thread.
///
/// The calling thread's stack always contains this routine, so noise
/// filters can recognize the sampler's own call path by its name.
#[inline(never)]
fn enumerate_threads(config: &SamplerConfig) -> Vec<RawThread> {
    let own = walk_current_thread(config.max_frames);
    platform::collect(config, own)
}

#[inline(never)]
fn walk_current_thread(max_frames: usize) -> Vec<usize> {
    let mut ips = Vec::with_capacity(max_frames);
    backtrace::trace(|frame| {
        ips.push(frame.ip() as usize);
        ips.len() < max_frames
    });
    ips
}

/// All symbols resolved from a single instruction pointer (more than one when
/// calls were inlined).
#[derive(Clone, Debug)]
struct IpFrames {
    symbols: Vec<SymbolData>,
}

#[derive(Clone, Debug)]
struct SymbolData {
    name: Option<String>,
    filename: Option<String>,
    lineno: Option<u32>,
}

impl SymbolData {
    fn name_contains(&self, needle: &str) -> bool {
        self.name.as_deref().is_some_and(|n| n.contains(needle))
    }

    fn short_location(&self) -> String {
        match (&self.filename, self.lineno) {
            (Some(f), Some(l)) => {
                let short = std::path::Path::new(f)
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or(f.as_str());
                format!("{}:{}", short, l)
            }
            (Some(f), None) => f.clone(),
            _ => String::new(),
        }
    }
}

impl IpFrames {
    fn is_unresolved(&self) -> bool {
        self.symbols.iter().all(|s| s.name.is_none())
    }

    fn any_symbol(&self, needle: &str) -> bool {
        self.symbols.iter().any(|s| s.name_contains(needle))
    }

    fn any_symbol_starting(&self, prefix: &str) -> bool {
        self.symbols
            .iter()
            .any(|s| s.name.as_deref().is_some_and(|n| n.starts_with(prefix)))
    }
}

fn resolve_ip(ip: usize) -> IpFrames {
    let mut symbols = Vec::new();
    backtrace::resolve(ip as *mut c_void, |sym| {
        symbols.push(SymbolData {
            // `{:#}` drops the trailing `::h<hash>` of legacy mangling.
            name: sym.name().map(|n| format!("{:#}", n)),
            filename: sym
                .filename()
                .and_then(|p| p.to_str())
                .map(|s| s.to_owned()),
            lineno: sym.lineno(),
        });
    });
    if symbols.is_empty() {
        symbols.push(SymbolData {
            name: None,
            filename: None,
            lineno: None,
        });
    }
    IpFrames { symbols }
}

/// Resolves raw addresses and strips the frames of the capture machinery so
/// that the first remaining frame is where the thread actually was.
fn resolve_ips(ips: &[usize], origin: Origin) -> Vec<IpFrames> {
    let mut frames: Vec<IpFrames> = ips.iter().map(|&ip| resolve_ip(ip)).collect();
    match origin {
        Origin::Direct => {
            // The walker is the outermost capture frame; without symbols for
            // it, fall back to the leading run of backtrace crate frames.
            let skip = match frames.iter().rposition(|f| f.any_symbol(WALKER_SYMBOL)) {
                Some(pos) => pos + 1,
                None => frames
                    .iter()
                    .take_while(|f| f.any_symbol_starting("backtrace::"))
                    .count(),
            };
            frames.drain(..skip);
        }
        Origin::Signal => {
            if let Some(pos) = frames
                .iter()
                .rposition(|f| f.any_symbol(platform::HANDLER_SYMBOL))
            {
                frames.drain(..=pos);
                // The kernel's signal trampoline sits between the handler
                // and the interrupted frame.
                if frames.first().is_some_and(|f| {
                    f.is_unresolved() || f.any_symbol("__restore_rt") || f.any_symbol("sigreturn")
                }) {
                    frames.remove(0);
                }
            }
        }
    }
    frames
}

impl RawThread {
    /// Renders the thread as a dump block: header line, then one line per
    /// symbol, innermost first.
    fn render(&self) -> String {
        let mut out = format!("thread {} \"{}\":\n", self.tid, self.name);
        let Some(ips) = &self.ips else {
            return out;
        };
        let frames = resolve_ips(ips, self.origin);
        if !frames.is_empty() && frames.iter().all(IpFrames::is_unresolved) {
            out.push_str(FOREIGN_CODE_MARKER);
            return out;
        }

        let mut first = true;
        for frame in &frames {
            for sym in &frame.symbols {
                if !first {
                    out.push('\n');
                }
                first = false;
                out.push_str(sym.name.as_deref().unwrap_or(UNKNOWN_SYMBOL));
                let loc = sym.short_location();
                if !loc.is_empty() {
                    let _ = write!(out, "\n    at {}", loc);
                }
            }
        }
        out
    }
}

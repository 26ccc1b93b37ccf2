//! Finds threads that are stuck.
//!
//! A thread is considered blocked when its entire call stack is textually
//! identical at the start and at the end of an observation window. The
//! typical use is at the end of a test, to catch threads the test leaked
//! in a waiting state:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let finish = blockcheck::check(&blockcheck::LogReporter, Duration::from_secs(5), "")
//!     .expect("install sampler");
//!
//! // ... test body ...
//!
//! finish();
//! ```
//!
//! Runtime machinery that parks on purpose (test harness, Tokio workers and
//! blocking pool, signal handling threads) is dropped by [`NoiseFilter`]
//! before the comparison.

pub mod config;
pub mod detector;
pub mod error;
pub mod filter;
pub mod reporter;
pub mod sampler;
pub mod snapshot;
pub mod test_utils;
#[cfg(unix)]
pub mod trigger;

use std::time::Duration;

pub use config::Settings;
pub use detector::{BlockDetector, BlockReport};
pub use error::Error;
pub use filter::{FilterConfig, FilteredSet, NoiseFilter, Suppression, ThreadStack};
pub use reporter::{CollectingReporter, ErrorReporter, LogReporter};
pub use sampler::{SamplerConfig, StackSampler, ThreadSampler};
pub use snapshot::StackSnapshot;

/// Arms a detection over every thread of the process with default
/// settings. Call the returned closure to observe for `interval` and
/// report each blocked thread to `reporter`.
pub fn check<R>(
    reporter: &R,
    interval: Duration,
    ignore_prefix: impl Into<String>,
) -> Result<impl FnOnce(), Error>
where
    R: ErrorReporter + ?Sized,
{
    Ok(BlockDetector::threads(SamplerConfig::default())?.check(reporter, interval, ignore_prefix))
}

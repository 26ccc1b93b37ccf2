//! # Blocked-thread detection.
//!
//! [`BlockDetector`] samples every thread, waits for a fixed interval,
//! samples again and reports the threads whose stacks did not change at all.
//! A thread whose stack text is byte-identical across the whole interval
//! made no observable progress and is considered blocked.
//!
//! Slow threads whose stacks move between samples are never reported. The
//! flip side is that a thread that happens to sit still for exactly the
//! interval is indistinguishable from one blocked forever, so the interval
//! should comfortably exceed the longest legitimate pause of the code under
//! test.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use blockcheck::{BlockDetector, CollectingReporter};
//!
//! let reporter = CollectingReporter::new();
//! let detector = BlockDetector::threads(Default::default()).unwrap();
//! let finish = detector.check(&reporter, Duration::from_secs(5), "");
//!
//! // ... run the code under test ...
//!
//! finish();
//! assert!(!reporter.failed(), "{:#?}", reporter.messages());
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Settings;
use crate::error::Error;
use crate::filter::{FilteredSet, NoiseFilter, ThreadStack};
use crate::reporter::ErrorReporter;
use crate::sampler::{SamplerConfig, StackSampler, ThreadSampler};
use crate::snapshot::StackSnapshot;

/// Threads found unchanged in both samples, ordered by body then header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockReport {
    blocked: Vec<ThreadStack>,
}

impl BlockReport {
    pub fn blocked(&self) -> &[ThreadStack] {
        &self.blocked
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadStack> {
        self.blocked.iter()
    }

    /// Number of blocked threads.
    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

impl From<FilteredSet> for BlockReport {
    fn from(set: FilteredSet) -> Self {
        Self {
            blocked: set.into_iter().collect(),
        }
    }
}

impl IntoIterator for BlockReport {
    type Item = ThreadStack;
    type IntoIter = std::vec::IntoIter<ThreadStack>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocked.into_iter()
    }
}

pub struct BlockDetector<S> {
    sampler: Arc<S>,
    filter: Arc<NoiseFilter>,
}

impl<S> Clone for BlockDetector<S> {
    fn clone(&self) -> Self {
        Self {
            sampler: Arc::clone(&self.sampler),
            filter: Arc::clone(&self.filter),
        }
    }
}

impl BlockDetector<ThreadSampler> {
    /// A detector over every thread of this process, with the default
    /// noise filter.
    pub fn threads(config: SamplerConfig) -> Result<Self, Error> {
        Ok(Self::new(ThreadSampler::new(config)?))
    }

    /// A detector built from loaded [`Settings`].
    pub fn from_settings(settings: &Settings) -> Result<Self, Error> {
        let filter = NoiseFilter::from_config(&settings.filter)?;
        Ok(Self::threads(settings.sampler.clone())?.with_filter(filter))
    }
}

impl<S: StackSampler> BlockDetector<S> {
    pub fn new(sampler: S) -> Self {
        Self {
            sampler: Arc::new(sampler),
            filter: Arc::new(NoiseFilter::default()),
        }
    }

    pub fn with_filter(mut self, filter: NoiseFilter) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn filter(&self) -> &NoiseFilter {
        &self.filter
    }

    fn sample(&self, ignore_prefix: &str) -> FilteredSet {
        filter_sample(&self.filter, self.sampler.capture(), ignore_prefix)
    }

    /// Samples, sleeps for `interval`, samples again and returns what did
    /// not change. The calling thread is blocked for the whole interval.
    pub fn observe(&self, interval: Duration, ignore_prefix: &str) -> BlockReport {
        let before = self.sample(ignore_prefix);
        observation_pause(interval);
        let after = self.sample(ignore_prefix);
        compare(&before, &after)
    }

    /// Runs [`observe`](Self::observe) and reports every blocked thread
    /// through `reporter`, one call per thread with its header and body.
    pub fn detect<R>(&self, reporter: &R, interval: Duration, ignore_prefix: &str) -> BlockReport
    where
        R: ErrorReporter + ?Sized,
    {
        let report = self.observe(interval, ignore_prefix);
        report_blocked(reporter, &report);
        report
    }

    /// Defers [`detect`](Self::detect) to a later point, typically the end
    /// of a test. Nothing is sampled until the returned closure is called.
    pub fn check<'r, R>(
        self,
        reporter: &'r R,
        interval: Duration,
        ignore_prefix: impl Into<String>,
    ) -> impl FnOnce()
    where
        R: ErrorReporter + ?Sized,
    {
        let ignore_prefix = ignore_prefix.into();
        move || {
            self.detect(reporter, interval, &ignore_prefix);
        }
    }
}

impl<S: StackSampler + 'static> BlockDetector<S> {
    async fn sample_async(&self, ignore_prefix: &str) -> FilteredSet {
        let sampler = Arc::clone(&self.sampler);
        let snapshot = tokio::task::spawn_blocking(move || sampler.capture())
            .await
            .unwrap_or_else(|err| {
                tracing::warn!("stack capture task failed: {err}");
                StackSnapshot::default()
            });
        filter_sample(&self.filter, snapshot, ignore_prefix)
    }

    /// Like [`observe`](Self::observe), but only the calling task waits.
    /// Captures run on the blocking pool.
    pub async fn observe_async(&self, interval: Duration, ignore_prefix: &str) -> BlockReport {
        let before = self.sample_async(ignore_prefix).await;
        tokio::time::sleep(interval).await;
        let after = self.sample_async(ignore_prefix).await;
        compare(&before, &after)
    }

    pub async fn detect_async<R>(
        &self,
        reporter: &R,
        interval: Duration,
        ignore_prefix: &str,
    ) -> BlockReport
    where
        R: ErrorReporter + ?Sized,
    {
        let report = self.observe_async(interval, ignore_prefix).await;
        report_blocked(reporter, &report);
        report
    }
}

/// Named so that detectors waiting on other threads are recognized as noise.
#[inline(never)]
fn observation_pause(interval: Duration) {
    thread::sleep(interval);
}

fn filter_sample(
    filter: &NoiseFilter,
    snapshot: StackSnapshot,
    ignore_prefix: &str,
) -> FilteredSet {
    let set = filter.filter(&snapshot, ignore_prefix);
    tracing::debug!(
        blocks = snapshot.len(),
        interesting = set.len(),
        truncated = snapshot.is_truncated(),
        "stack sample filtered"
    );
    set
}

fn compare(before: &FilteredSet, after: &FilteredSet) -> BlockReport {
    let report = BlockReport::from(before.intersection(after));
    tracing::debug!(
        before = before.len(),
        after = after.len(),
        unchanged = report.len(),
        "compared stack samples"
    );
    if !report.is_empty() {
        tracing::info!(blocked = report.len(), "found blocked threads");
    }
    report
}

fn report_blocked<R: ErrorReporter + ?Sized>(reporter: &R, report: &BlockReport) {
    for stack in report.iter() {
        reporter.report_error(format_args!("Blocked thread: {}", stack));
    }
}

//! On-demand detection in a running service.
//!
//! Outside of tests the detector is most useful behind a trigger: an
//! operator sends a signal to a service that looks hung and the blocked
//! threads end up in the logs.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use blockcheck::{LogReporter, Settings, trigger};
//!
//! # async fn run() -> Result<(), blockcheck::Error> {
//! let settings = Settings::load(None)?;
//! let _trigger = trigger::spawn_from_settings(&settings, Arc::new(LogReporter))?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::detector::BlockDetector;
use crate::error::Error;
use crate::reporter::ErrorReporter;
use crate::sampler::StackSampler;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Signal that starts a detection. Must differ from the sampling signal.
    pub signal: i32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            signal: libc::SIGHUP,
        }
    }
}

/// Spawns a task that runs a detection every time `config.signal` is
/// delivered to the process. Must be called from within a Tokio runtime.
///
/// Deliveries arriving while a detection runs are coalesced into one
/// follow-up detection.
pub fn spawn_on_signal<S, R>(
    detector: BlockDetector<S>,
    reporter: Arc<R>,
    config: &TriggerConfig,
    interval: Duration,
    ignore_prefix: impl Into<String>,
) -> Result<JoinHandle<()>, Error>
where
    S: StackSampler + 'static,
    R: ErrorReporter + Send + Sync + 'static,
{
    let signo = config.signal;
    let mut deliveries = signal(SignalKind::from_raw(signo))
        .map_err(|source| Error::SignalInstall { signal: signo, source })?;
    let ignore_prefix = ignore_prefix.into();

    Ok(tokio::spawn(async move {
        while deliveries.recv().await.is_some() {
            tracing::info!(signal = signo, ?interval, "blocked-thread check requested");
            let report = detector
                .detect_async(&*reporter, interval, &ignore_prefix)
                .await;
            tracing::info!(blocked = report.len(), "blocked-thread check finished");
        }
    }))
}

/// [`spawn_on_signal`] over every thread of the process, configured from
/// `settings`.
pub fn spawn_from_settings<R>(settings: &Settings, reporter: Arc<R>) -> Result<JoinHandle<()>, Error>
where
    R: ErrorReporter + Send + Sync + 'static,
{
    if settings.trigger.signal == settings.sampler.signal {
        return Err(Error::InvalidSignal(settings.trigger.signal));
    }
    let detector = BlockDetector::from_settings(settings)?;
    spawn_on_signal(
        detector,
        reporter,
        &settings.trigger,
        settings.detector.interval(),
        settings.detector.ignore_prefix.clone(),
    )
}

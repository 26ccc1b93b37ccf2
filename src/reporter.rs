use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;

/// Receives one failure per blocked thread.
///
/// The detector never looks at what the reporter does with a message; it
/// only formats and hands it over.
pub trait ErrorReporter {
    fn report_error(&self, args: fmt::Arguments<'_>);
}

impl<F> ErrorReporter for F
where
    F: Fn(fmt::Arguments<'_>),
{
    fn report_error(&self, args: fmt::Arguments<'_>) {
        self(args);
    }
}

/// Reports failures through `tracing` at error level.
///
/// Meant for long-running services that expose detection through a signal
/// or an internal endpoint instead of a test.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report_error(&self, args: fmt::Arguments<'_>) {
        tracing::error!(target: "blockcheck", "{}", args);
    }
}

/// Records every failure message, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    messages: Mutex<Vec<String>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once at least one failure was reported.
    pub fn failed(&self) -> bool {
        !self.lock().is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ErrorReporter for CollectingReporter {
    fn report_error(&self, args: fmt::Arguments<'_>) {
        self.lock().push(args.to_string());
    }
}

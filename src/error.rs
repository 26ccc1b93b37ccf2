use std::io;

/// Errors raised while setting up a sampler, filter or trigger.
///
/// Capturing and detecting never fail; only construction does.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to install handler for signal {signal}: {source}")]
    SignalInstall {
        signal: i32,
        #[source]
        source: io::Error,
    },

    #[error("signal {0} cannot be used for stack sampling")]
    InvalidSignal(i32),

    #[error("invalid suppression pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

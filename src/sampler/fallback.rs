use std::sync::Once;

use super::{Origin, RawThread, SamplerConfig};
use crate::error::Error;

pub(super) const HANDLER_SYMBOL: &str = "on_sample_signal";

static WARN_ONCE: Once = Once::new();

pub(super) fn install_handler(_signal: i32) -> Result<(), Error> {
    Ok(())
}

/// Without a way to enumerate threads only the caller is sampled.
pub(super) fn collect(_config: &SamplerConfig, own: Vec<usize>) -> Vec<RawThread> {
    WARN_ONCE.call_once(|| {
        tracing::warn!("whole-process sampling is only supported on Linux, sampling the caller only");
    });
    vec![RawThread {
        tid: 0,
        name: std::thread::current().name().unwrap_or_default().to_owned(),
        ips: Some(own),
        origin: Origin::Direct,
    }]
}

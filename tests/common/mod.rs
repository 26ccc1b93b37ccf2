#![allow(dead_code)]

use std::thread;
use std::time::Duration;

/// Time given to freshly spawned threads to reach their blocking call.
pub const SETTLE: Duration = Duration::from_millis(500);

pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blockcheck=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Spawns a detached, named thread running `f`.
pub fn spawn_named<F>(name: &str, f: F) -> anyhow::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_owned()).spawn(f)?;
    Ok(())
}

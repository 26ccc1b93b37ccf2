use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigBuilder, Environment, File, FileFormat, builder::DefaultState};
use serde::Deserialize;

use crate::error::Error;
use crate::filter::FilterConfig;
use crate::sampler::SamplerConfig;
#[cfg(unix)]
use crate::trigger::TriggerConfig;

/// Prefix of environment overrides, e.g. `BLOCKCHECK_DETECTOR__INTERVAL_MS`.
pub const ENV_PREFIX: &str = "BLOCKCHECK";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub interval_ms: u64,
    pub ignore_prefix: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            ignore_prefix: String::new(),
        }
    }
}

impl DetectorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Everything the crate can be configured with.
///
/// Sources, lowest priority first: built-in defaults, an optional TOML
/// file, then `BLOCKCHECK_*` environment variables with `__` separating
/// nested keys. List values in the environment are comma separated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub detector: DetectorConfig,
    pub sampler: SamplerConfig,
    pub filter: FilterConfig,
    #[cfg(unix)]
    pub trigger: TriggerConfig,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        build(builder.add_source(env_source()))
    }

    /// Parses settings from TOML text only, ignoring the environment.
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        build(Config::builder().add_source(File::from_str(text, FileFormat::Toml)))
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("filter.contains")
        .with_list_parse_key("filter.prefix")
        .with_list_parse_key("filter.pattern")
}

fn build(builder: ConfigBuilder<DefaultState>) -> Result<Settings, Error> {
    let settings = builder.build()?.try_deserialize()?;
    tracing::debug!(?settings, "loaded settings");
    Ok(settings)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_sources_give_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.detector.interval(), Duration::from_secs(5));
        assert_eq!(settings.sampler.buffer_size, 2 << 20);
        assert!(settings.filter.include_defaults);
    }

    #[test]
    fn toml_overrides_nested_sections() {
        let settings = Settings::from_toml(
            r#"
            [detector]
            interval_ms = 250
            ignore_prefix = "svc::watchdog"

            [sampler]
            buffer_size = 65536

            [filter]
            contains = ["metrics::exporter"]
            pattern = ["^pool-\\d+"]
            "#,
        )
        .unwrap();
        assert_eq!(settings.detector.interval(), Duration::from_millis(250));
        assert_eq!(settings.detector.ignore_prefix, "svc::watchdog");
        assert_eq!(settings.sampler.buffer_size, 65536);
        assert_eq!(settings.sampler.max_frames, 128);
        assert_eq!(settings.filter.contains, ["metrics::exporter"]);
        assert_eq!(settings.filter.pattern, ["^pool-\\d+"]);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[detector]\ninterval_ms = 42").unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.detector.interval_ms, 42);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/blockcheck.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn wrong_types_are_rejected() {
        let err = Settings::from_toml("[detector]\ninterval_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}

use crate::error::{PipelineError, PipelineErrorExt};
use crate::transform::Compression;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

const ENV_PREFIX: &str = "STRATUM";

/// Tunables for upload and download operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Plaintext bytes per data chunk.
    pub chunk_size: usize,
    /// Compression applied to data chunks before encryption.
    pub compression: Compression,
    /// How long the filler waits on the input channel before re-checking the deadline.
    pub take_timeout_ms: u64,
    /// Deadline for a whole operation. `0` disables it.
    pub operation_timeout_ms: u64,
    /// Send attempts per chunk, including the first.
    pub max_send_attempts: u32,
    /// Chunk fetches a download keeps in flight.
    pub max_parallel_fetches: usize,
    /// Crypto executor worker threads.
    pub crypto_workers: usize,
    /// Pending transfers the input channel accepts before a producer waits.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
            compression: Compression::Lz4,
            take_timeout_ms: 100,
            operation_timeout_ms: 5 * 60 * 1000,
            max_send_attempts: 3,
            max_parallel_fetches: 4,
            crypto_workers: 2,
            channel_capacity: 16,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub const fn take_timeout(&self) -> Duration {
        Duration::from_millis(self.take_timeout_ms)
    }

    #[must_use]
    pub const fn operation_timeout(&self) -> Option<Duration> {
        if self.operation_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.operation_timeout_ms))
        }
    }

    /// Checks every value is usable.
    ///
    /// # Errors
    /// Returns [`PipelineError::InvalidConfiguration`] naming the first offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let checks: [(&'static str, bool); 6] = [
            ("chunk_size", self.chunk_size > 0 && u32::try_from(self.chunk_size).is_ok()),
            ("take_timeout_ms", self.take_timeout_ms > 0),
            ("max_send_attempts", self.max_send_attempts >= 1),
            ("max_parallel_fetches", self.max_parallel_fetches >= 1),
            ("crypto_workers", self.crypto_workers >= 1),
            ("channel_capacity", self.channel_capacity >= 1),
        ];

        match checks.iter().find(|(_, ok)| !ok) {
            Some((field, _)) => Err(PipelineError::InvalidConfiguration {
                message: format!("{field} is out of range").into(),
                context: None,
            }),
            None => Ok(()),
        }
    }
}

/// Loads a [`PipelineConfig`] from an optional file overlaid by environment variables.
///
/// Layers, lowest priority first:
/// 1. Field defaults.
/// 2. **File**: `path` (format from its extension, e.g. `pipeline.toml`). Required when given.
/// 3. **Environment**: variables prefixed with `STRATUM__`, e.g. `STRATUM__CHUNK_SIZE=65536`.
///
/// The result is validated before it is returned.
///
/// # Errors
/// * [`PipelineError::Config`] if the file is missing or a value cannot be deserialized.
/// * [`PipelineError::InvalidConfiguration`] if a value is out of range.
///
/// # Example
/// ```rust
/// use stratum_pipeline::load_config;
///
/// let config = load_config(None::<&str>).unwrap_or_default();
/// assert!(config.chunk_size > 0);
/// ```
pub fn load_config(path: Option<impl AsRef<Path>>) -> Result<PipelineConfig, PipelineError> {
    load_config_with_env(path, None)
}

pub(crate) fn load_config_with_env(
    path: Option<impl AsRef<Path>>,
    env: Option<HashMap<String, String>>,
) -> Result<PipelineConfig, PipelineError> {
    let mut builder = Config::builder();
    if let Some(path) = &path {
        let path = path.as_ref();
        info!("Loading pipeline config from {}", path.display());
        builder = builder.add_source(File::from(path).required(true));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(env),
    );

    let config = builder
        .build()
        .context("Failed to build pipeline config")?
        .try_deserialize::<PipelineConfig>()
        .context("Failed to deserialize pipeline config")?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect())
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.compression, Compression::Lz4);
        assert_eq!(config.operation_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_no_sources_yields_defaults() {
        let config = load_config_with_env(None::<&str>, env(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_file_then_env_overlay() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "chunk_size = 1024\ncompression = \"none\"\nmax_send_attempts = 5").unwrap();

        let config = load_config_with_env(
            Some(file.path()),
            env(&[("STRATUM__CHUNK_SIZE", "2048"), ("STRATUM__OPERATION_TIMEOUT_MS", "0")]),
        )
        .unwrap();

        assert_eq!(config.chunk_size, 2048);
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.max_send_attempts, 5);
        assert_eq!(config.operation_timeout(), None);
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = load_config_with_env(Some("/nonexistent/stratum.toml"), env(&[])).unwrap_err();
        assert_eq!(err.kind(), "Config");
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let err = load_config_with_env(None::<&str>, env(&[("STRATUM__CRYPTO_WORKERS", "0")]))
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidConfiguration");
        assert!(err.to_string().contains("crypto_workers"));

        let config = PipelineConfig { chunk_size: 0, ..PipelineConfig::default() };
        assert!(config.validate().is_err());
    }
}

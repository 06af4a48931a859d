//! Console configuration, loaded from TOML or JSON.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::{LoopSettings, RetryPolicy, WorkerKind};

pub const CONFIG_PATH_ENV: &str = "SCANQ_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "SCANQ_CONFIG_JSON";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read console config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid console config {origin}: {reason}")]
    Parse { origin: String, reason: String },

    #[error("invalid console config: {0}")]
    Invalid(String),
}

/// Where a loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Upper bound for one collaborator call. 0 disables the limit.
    pub timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Directory holding the six stage directories.
    pub data_root: PathBuf,
    /// Sleep between polls of an empty input stage.
    pub poll_interval_ms: u64,
    pub acquisition: WorkerConfig,
    pub reconstruction: WorkerConfig,
    pub backoff: BackoffConfig,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("scanq-data"),
            poll_interval_ms: 100,
            acquisition: WorkerConfig::default(),
            reconstruction: WorkerConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ConsoleConfig {
    /// Load the configuration using environment variables.
    /// Evaluation order:
    /// 1) `$SCANQ_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$SCANQ_CONFIG_JSON` (inline JSON),
    /// 3) `scanq.toml` / `scanq.json` in the working directory,
    /// 4) defaults.
    pub fn load_from_env() -> Result<(Self, ConfigSource), ConfigError> {
        Self::load_from_sources(
            env::var(CONFIG_PATH_ENV).ok(),
            env::var(CONFIG_JSON_ENV).ok(),
        )
    }

    fn load_from_sources(
        path: Option<String>,
        inline: Option<String>,
    ) -> Result<(Self, ConfigSource), ConfigError> {
        if let Some(path_str) = path
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = inline
            && !raw.trim().is_empty()
        {
            let config = Self::parse_json(&raw, CONFIG_JSON_ENV)?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let origin = path.display().to_string();

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents, &origin)?,
            Some("toml") => toml::from_str(&contents).map_err(|err| ConfigError::Parse {
                origin,
                reason: err.to_string(),
            })?,
            _ => Self::parse_from_str(&contents, &origin)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Try TOML first, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| ConfigError::Parse {
                origin: origin.to_string(),
                reason: format!("toml error: {toml_err}; json error: {json_err}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    fn parse_json(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|err| ConfigError::Parse {
            origin: origin.to_string(),
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &["scanq.toml", "scanq.json", "config/scanq.toml"];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(Path::to_path_buf)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !self.backoff.multiplier.is_finite() || self.backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff.multiplier must be at least 1.0, got {}",
                self.backoff.multiplier
            )));
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(ConfigError::Invalid(
                "backoff.max_delay_ms must not be below backoff.base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self, kind: WorkerKind) -> Option<Duration> {
        let secs = match kind {
            WorkerKind::Acquisition => self.acquisition.timeout_secs,
            WorkerKind::Reconstruction => self.reconstruction.timeout_secs,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.backoff.base_delay_ms),
            multiplier: self.backoff.multiplier,
            max_delay: Duration::from_millis(self.backoff.max_delay_ms),
        }
    }

    pub fn loop_settings(&self, kind: WorkerKind) -> LoopSettings {
        LoopSettings {
            poll_interval: self.poll_interval(),
            timeout: self.timeout(kind),
            backoff: self.retry_policy(),
        }
    }
}

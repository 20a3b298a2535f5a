use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use stagecoach_api::{ApiSettings, DEFAULT_USER_AGENT};
use stagecoach_installer::DEFAULT_PROBE_LIMIT;

const MIN_PROBE_LIMIT: u64 = 512;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub api: ApiConfig,
    pub progress: ProgressConfig,
    pub install: InstallConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub server: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            server: stagecoach_core::DEFAULT_SERVER.to_string(),
            timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProgressConfig {
    /// Minimum time between two progress notifications.
    pub interval_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { interval_ms: 250 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct InstallConfig {
    /// How many leading bytes the format prober may read.
    pub probe_limit_bytes: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            probe_limit_bytes: DEFAULT_PROBE_LIMIT,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, or returns defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid engine config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.server.trim().is_empty() {
            return Err(anyhow!("api.server must not be empty"));
        }
        if self.api.timeout_secs == 0 {
            return Err(anyhow!("api.timeout_secs must be greater than zero"));
        }
        if self.progress.interval_ms == 0 {
            return Err(anyhow!("progress.interval_ms must be greater than zero"));
        }
        if self.install.probe_limit_bytes < MIN_PROBE_LIMIT {
            return Err(anyhow!(
                "install.probe_limit_bytes must be at least {MIN_PROBE_LIMIT}"
            ));
        }
        Ok(())
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            server: self.api.server.trim().to_string(),
            timeout: Duration::from_secs(self.api.timeout_secs),
            user_agent: self.api.user_agent.clone(),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress.interval_ms)
    }
}

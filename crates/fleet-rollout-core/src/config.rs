//! Engine tick configuration (§6 AMBIENT). Not part of the store/dispatch contract;
//! provided so the demo binary has somewhere to load defaults from. Grounded on
//! `service::daemon::ServiceConfig::load`/`save`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Tick and default-policy configuration shared by both reconcilers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// How often each organization's reconciler tasks run (design default: 30s).
    #[serde(with = "duration_secs")]
    pub tick_interval: Duration,
    /// Used when a fleet's rollout policy names no `updateTimeout` (design default:
    /// 24h).
    #[serde(with = "duration_secs")]
    pub default_update_timeout: Duration,
    /// Used when neither a batch nor a fleet's rollout policy names a success
    /// threshold.
    pub default_success_threshold: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            default_update_timeout: Duration::from_secs(24 * 60 * 60),
            default_success_threshold: crate::batch_selection::DEFAULT_SUCCESS_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path`, creating it with defaults on first run.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .context("failed to read engine config file")?;
            let config: Self = serde_json::from_str(&content).context("failed to parse engine config file")?;
            debug!(path = %path.display(), "loaded engine config");
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path).await?;
            info!(path = %path.display(), "created default engine config");
            Ok(config)
        }
    }

    /// Save configuration to `path`, creating parent directories as needed.
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create engine config directory")?;
        }
        let content = serde_json::to_string_pretty(self).context("failed to serialize engine config")?;
        tokio::fs::write(path, content)
            .await
            .context("failed to write engine config file")?;
        debug!(path = %path.display(), "saved engine config");
        Ok(())
    }

    /// Default config file location, matching the teacher's per-platform
    /// config-directory convention.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let config_dir = if cfg!(windows) {
            std::env::var("LOCALAPPDATA").context("LOCALAPPDATA environment variable not set")?
        } else {
            format!(
                "{}/.config",
                std::env::var("HOME").context("HOME environment variable not set")?
            )
        };
        Ok(PathBuf::from(config_dir).join("fleet-rollout").join("engine.json"))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_design_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(30));
        assert_eq!(config.default_update_timeout, Duration::from_secs(86_400));
        assert_eq!(config.default_success_threshold, 90);
    }

    #[test]
    fn round_trips_through_json() -> anyhow::Result<()> {
        let config = EngineConfig::default();
        let encoded = serde_json::to_string(&config)?;
        let decoded: EngineConfig = serde_json::from_str(&encoded)?;
        assert_eq!(decoded.tick_interval, config.tick_interval);
        Ok(())
    }
}

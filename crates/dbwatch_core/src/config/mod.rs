//! TOML configuration. Every field defaults, so a missing file or an empty
//! one yields a fully working setup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::jobs::JobConfig;
use crate::monitor::Thresholds;
use crate::remediation::RemediationRule;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_seconds: u64,
    pub auto_remediate: bool,
    pub escalation_timeout_seconds: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
            auto_remediate: true,
            escalation_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChaosConfig {
    pub cooldown_seconds: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WatchConfig {
    pub monitor: MonitorConfig,
    pub thresholds: Thresholds,
    pub chaos: ChaosConfig,
    /// Empty means: use the built-in default rule set.
    pub rules: Vec<RemediationRule>,
    pub jobs: Vec<JobConfig>,
}

impl WatchConfig {
    /// Load from a TOML file. A missing file is not an error; a present
    /// but unparseable one is a configuration defect and fails fast.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(AppError::new(
                    "CONFIG_READ_FAILED",
                    format!("Failed to read config file {}", path.display()),
                )
                .with_details(e.to_string()))
            }
        };
        toml::from_str(&text).map_err(|e| {
            AppError::new(
                "CONFIG_INVALID",
                format!("Failed to parse config file {}", path.display()),
            )
            .with_details(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: WatchConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.monitor.poll_interval_seconds, 10);
        assert!(cfg.monitor.auto_remediate);
        assert_eq!(cfg.monitor.escalation_timeout_seconds, 300);
        assert_eq!(cfg.chaos.cooldown_seconds, 30);
        assert!(cfg.rules.is_empty());
        assert!(cfg.jobs.is_empty());
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let cfg: WatchConfig = toml::from_str(
            r#"
            [monitor]
            poll_interval_seconds = 5

            [thresholds]
            cpu_percent_critical = 95.0

            [[jobs]]
            name = "cleanup"
            every = "5m"
            sql = "DELETE FROM sessions WHERE status = 'dead'"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.monitor.poll_interval_seconds, 5);
        assert!(cfg.monitor.auto_remediate);
        assert_eq!(cfg.thresholds.cpu_percent_critical, 95.0);
        assert_eq!(cfg.thresholds.cpu_percent_warning, 70.0);
        assert_eq!(cfg.jobs.len(), 1);
        assert!(cfg.jobs[0].enabled);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WatchConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, WatchConfig::default());
    }

    #[test]
    fn malformed_file_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "monitor = \"not a table\"").unwrap();
        let err = WatchConfig::load(&path).unwrap_err();
        assert_eq!(err.code, "CONFIG_INVALID");
    }
}

use serde::{Deserialize, Serialize};
use std::fs;

use crate::error::{QuotaSentryError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectorConfig {
    pub margin_seconds: Option<i64>,
    pub cooldown_seconds: Option<i64>,
    pub poll_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WakeupConfig {
    pub default_prompt: Option<String>,
    pub default_max_output_tokens: Option<u32>,
    pub history_cap: Option<usize>,
    pub detector: Option<DetectorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub accounts_path: Option<String>,
    pub daemon_token: Option<String>,
    pub wakeup: Option<WakeupConfig>,
}

impl Config {
    pub fn convention_defaults(db_path: &str) -> Self {
        Self {
            db_path: Some(db_path.to_string()),
            accounts_path: None,
            daemon_token: None,
            wakeup: Some(WakeupConfig {
                default_prompt: Some("ping".to_string()),
                default_max_output_tokens: None,
                history_cap: Some(crate::history::DEFAULT_HISTORY_CAP),
                detector: None,
            }),
        }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            QuotaSentryError::Config(format!("failed to read config file {path}: {e}"))
        })?;
        serde_json::from_str(&raw).map_err(|e| QuotaSentryError::Config(e.to_string()))
    }

    pub fn effective_db_path(&self) -> String {
        self.db_path
            .clone()
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(crate::runtime_paths::default_db_path)
    }

    pub fn effective_prompt(&self) -> String {
        self.wakeup
            .as_ref()
            .and_then(|wakeup| wakeup.default_prompt.clone())
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or_else(|| "ping".to_string())
    }

    pub fn effective_max_output_tokens(&self) -> Option<u32> {
        self.wakeup
            .as_ref()
            .and_then(|wakeup| wakeup.default_max_output_tokens)
    }

    pub fn effective_history_cap(&self) -> usize {
        self.wakeup
            .as_ref()
            .and_then(|wakeup| wakeup.history_cap)
            .filter(|cap| *cap > 0)
            .unwrap_or(crate::history::DEFAULT_HISTORY_CAP)
    }

    pub fn effective_margin_seconds(&self) -> i64 {
        self.detector()
            .and_then(|detector| detector.margin_seconds)
            .filter(|seconds| *seconds >= 0)
            .unwrap_or(crate::reset::DEFAULT_MARGIN_SECONDS)
    }

    pub fn effective_cooldown_seconds(&self) -> i64 {
        self.detector()
            .and_then(|detector| detector.cooldown_seconds)
            .filter(|seconds| *seconds >= 0)
            .unwrap_or(crate::reset::DEFAULT_COOLDOWN_SECONDS)
    }

    pub fn effective_poll_seconds(&self) -> u64 {
        self.detector()
            .and_then(|detector| detector.poll_seconds)
            .filter(|seconds| *seconds > 0)
            .unwrap_or(60)
    }

    fn detector(&self) -> Option<&DetectorConfig> {
        self.wakeup.as_ref().and_then(|wakeup| wakeup.detector.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convention_defaults_cover_wakeup_settings() {
        let config = Config::convention_defaults(":memory:");
        assert_eq!(config.effective_db_path(), ":memory:");
        assert_eq!(config.effective_prompt(), "ping");
        assert_eq!(config.effective_history_cap(), 200);
        assert_eq!(config.effective_margin_seconds(), 120);
        assert_eq!(config.effective_cooldown_seconds(), 600);
        assert_eq!(config.effective_poll_seconds(), 60);
    }

    #[test]
    fn detector_overrides_take_effect() {
        let raw = serde_json::json!({
            "wakeup": {
                "history_cap": 50,
                "detector": {"margin_seconds": 30, "cooldown_seconds": 120, "poll_seconds": 15}
            }
        });
        let config: Config = serde_json::from_value(raw).unwrap();
        assert_eq!(config.effective_history_cap(), 50);
        assert_eq!(config.effective_margin_seconds(), 30);
        assert_eq!(config.effective_cooldown_seconds(), 120);
        assert_eq!(config.effective_poll_seconds(), 15);
    }
}

//! Configuration file support for trellis
//!
//! Reads from .trellis/config.toml

use crate::formula::AtRiskPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Progress/status policy settings
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Streak recovery settings
    #[serde(default)]
    pub streak: StreakConfig,

    /// Zombie goal detection settings
    #[serde(default)]
    pub zombies: ZombieConfig,
}

/// Thresholds behind the at_risk status (user-visible, so documented here:
/// below 50% progress with under 25% of the period left flags a node)
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProgressConfig {
    /// Progress ratio a node must stay above late in its period
    /// Default: 0.5
    #[serde(default = "default_behind_ratio")]
    pub at_risk_behind: f64,

    /// Fraction of the period under which the behind check applies
    /// Default: 0.25
    #[serde(default = "default_remaining_ratio")]
    pub at_risk_remaining: f64,
}

/// Streak recovery tuning
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreakConfig {
    /// Completions required across the vision on the recovery day
    /// Default: 3
    #[serde(default = "default_recovery_min_actions")]
    pub recovery_min_actions: i64,
}

/// Zombie goal detection tuning
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ZombieConfig {
    /// Days without recalculation before a goal is flagged
    /// Default: 14
    #[serde(default = "default_stale_days")]
    pub stale_days: i64,

    /// Cap on flagged goals per listing
    /// Default: 20
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_behind_ratio() -> f64 {
    0.5
}

fn default_remaining_ratio() -> f64 {
    0.25
}

fn default_recovery_min_actions() -> i64 {
    3
}

fn default_stale_days() -> i64 {
    14
}

fn default_page_size() -> usize {
    20
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            at_risk_behind: default_behind_ratio(),
            at_risk_remaining: default_remaining_ratio(),
        }
    }
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            recovery_min_actions: default_recovery_min_actions(),
        }
    }
}

impl Default for ZombieConfig {
    fn default() -> Self {
        Self {
            stale_days: default_stale_days(),
            page_size: default_page_size(),
        }
    }
}

impl Config {
    /// Load config from .trellis/config.toml
    /// Returns default config if file doesn't exist
    pub fn load() -> Self {
        if let Some(path) = Self::find_config_path() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                if let Ok(config) = toml::from_str(&contents) {
                    return config;
                }
            }
        }
        Self::default()
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(".trellis").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    /// The at-risk policy these settings describe
    pub fn at_risk_policy(&self) -> AtRiskPolicy {
        AtRiskPolicy {
            behind_ratio: self.progress.at_risk_behind,
            remaining_ratio: self.progress.at_risk_remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.progress.at_risk_behind, 0.5);
        assert_eq!(config.progress.at_risk_remaining, 0.25);
        assert_eq!(config.streak.recovery_min_actions, 3);
        assert_eq!(config.zombies.stale_days, 14);
        assert_eq!(config.zombies.page_size, 20);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[progress]
at_risk_behind = 0.6

[zombies]
stale_days = 30
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.progress.at_risk_behind, 0.6);
        // Unset fields keep their defaults
        assert_eq!(config.progress.at_risk_remaining, 0.25);
        assert_eq!(config.zombies.stale_days, 30);
        assert_eq!(config.streak.recovery_min_actions, 3);
    }
}

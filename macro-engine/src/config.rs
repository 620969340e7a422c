use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Longest duration, in seconds, any action or limit may carry
pub const MAX_SECONDS: f64 = u64::MAX as f64;

/// Seconds to a [`Duration`]. Negative and NaN give zero; anything too large
/// to represent saturates.
pub fn duration_from_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// Configuration for the macro engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of simultaneously active runs
    pub max_concurrent_macros: usize,

    /// Wall-clock cap for a single run, in seconds
    pub max_action_duration_secs: f64,

    /// Pause after every input action, in milliseconds
    pub action_delay_ms: u64,

    /// Maximum depth of a `HotkeyTrigger` chain
    pub max_trigger_depth: u32,

    /// Combo that halts every run. Never bindable to a macro.
    pub emergency_stop_hotkey: String,

    /// Combos that can never be bound to a macro
    pub reserved_hotkeys: Vec<String>,

    /// Whether captured hotkeys start macros at all
    pub global_hotkeys_enabled: bool,

    /// Persist the macro store after every create/update/delete
    pub auto_save: bool,

    /// Where the macro document lives
    pub macros_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_macros: 5,
            max_action_duration_secs: 300.0,
            action_delay_ms: 10,
            max_trigger_depth: 4,
            emergency_stop_hotkey: "ctrl+alt+escape".to_string(),
            reserved_hotkeys: vec![
                "ctrl+alt+delete".to_string(),
                "ctrl+shift+escape".to_string(),
                "alt+tab".to_string(),
                "alt+f4".to_string(),
                "meta+l".to_string(),
                "ctrl+escape".to_string(),
            ],
            global_hotkeys_enabled: true,
            auto_save: false,
            macros_path: None,
        }
    }
}

impl EngineConfig {
    pub fn max_action_duration(&self) -> Duration {
        duration_from_secs(self.max_action_duration_secs)
    }

    pub fn action_delay(&self) -> Duration {
        Duration::from_millis(self.action_delay_ms)
    }

    /// Load a configuration file. Missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Loading engine configuration from {:?}", path.as_ref());
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_macros, 5);
        assert_eq!(config.action_delay(), Duration::from_millis(10));
        assert_eq!(config.max_action_duration(), Duration::from_secs(300));
        assert!(config.global_hotkeys_enabled);
        assert!(!config.auto_save);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_concurrent_macros": 2}"#).unwrap();
        assert_eq!(config.max_concurrent_macros, 2);
        assert_eq!(config.max_trigger_depth, 4);
        assert_eq!(config.emergency_stop_hotkey, "ctrl+alt+escape");
    }

    #[test]
    fn test_huge_max_action_duration_saturates() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_action_duration_secs": 1e30}"#).unwrap();
        assert_eq!(config.max_action_duration(), Duration::MAX);
        assert_eq!(duration_from_secs(-1.0), Duration::ZERO);
        assert_eq!(duration_from_secs(f64::NAN), Duration::ZERO);
        assert_eq!(duration_from_secs(1.5), Duration::from_millis(1500));
    }
}

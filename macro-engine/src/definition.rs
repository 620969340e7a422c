use crate::action::Action;
use crate::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

pub const DEFAULT_CATEGORY: &str = "General";

/// Current version of the persisted macro document
pub const DOCUMENT_VERSION: u32 = 1;

/// How many times the whole action list runs, and the pause in between.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RepeatPolicy {
    pub count: u32,
    /// Seconds
    #[serde(default)]
    pub delay: f64,
}

impl Default for RepeatPolicy {
    fn default() -> Self {
        Self { count: 1, delay: 0.0 }
    }
}

/// Cumulative counters for one macro
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MacroStats {
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub cancelled_count: u64,
    /// Cumulative mean over every terminated run
    pub average_duration_seconds: f64,
    pub last_run: Option<DateTime<Utc>>,
}

/// A named, persisted sequence of actions with an optional hotkey.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MacroDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub hotkey: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Reject a second simultaneous run of this macro
    #[serde(default)]
    pub single_instance: bool,
    #[serde(default)]
    pub repeat: RepeatPolicy,
    pub actions: Vec<Action>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: MacroStats,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

fn default_true() -> bool {
    true
}

impl MacroDefinition {
    /// Create a new, enabled macro with a fresh id and no hotkey
    pub fn new(name: impl Into<String>, actions: Vec<Action>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            hotkey: None,
            category: default_category(),
            enabled: true,
            single_instance: false,
            repeat: RepeatPolicy::default(),
            actions,
            created_at: now,
            modified_at: now,
            stats: MacroStats::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_hotkey(mut self, hotkey: impl Into<String>) -> Self {
        self.hotkey = Some(hotkey.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_repeat(mut self, count: u32, delay: f64) -> Self {
        self.repeat = RepeatPolicy { count, delay };
        self
    }

    pub fn single_instance(mut self) -> Self {
        self.single_instance = true;
        self
    }

    /// Hotkey with surrounding whitespace removed; blank counts as none
    pub fn hotkey_spec(&self) -> Option<&str> {
        self.hotkey.as_deref().map(str::trim).filter(|h| !h.is_empty())
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

/// The persisted form of a macro library
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MacroDocument {
    pub version: u32,
    pub macros: Vec<MacroDefinition>,
}

impl MacroDocument {
    pub fn new(macros: Vec<MacroDefinition>) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            macros,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let document: MacroDocument = serde_json::from_str(json)?;
        if document.version > DOCUMENT_VERSION {
            return Err(EngineError::UnsupportedVersion(document.version));
        }
        Ok(document)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        info!("Saving {} macros to {:?}", self.macros.len(), path.as_ref());
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Loading macros from {:?}", path.as_ref());
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

//! Keyboard and mouse macro automation
//!
//! Macros are named sequences of [`Action`]s (key presses, pointer motion,
//! delays, loops, conditions, variable assignments) bound to global hotkeys.
//! A [`MacroSystem`] owns the store of definitions, the global variables, the
//! serialized input queue and the concurrency manager that runs each admitted
//! macro as its own tokio task.

pub mod action;
pub mod config;
pub mod definition;
pub mod engine;
pub mod errors;
pub mod expression;
pub mod hotkey;
pub mod input;
pub mod manager;
pub mod stats;
pub mod store;
pub mod system;
pub mod validation;
pub mod variables;

pub use action::{Action, CoordinateMode, Easing, MouseButton, Point};
pub use config::{duration_from_secs, EngineConfig, MAX_SECONDS};
pub use definition::{MacroDefinition, MacroDocument, MacroStats, RepeatPolicy};
pub use engine::{ExecutionContext, ExecutionEvent, MacroEngine, RunId, RunReport, RunState};
pub use errors::{
    ConcurrencyLimitError, EngineError, ExecutionError, InjectionError, InterpolationWarning, Result, TimeoutError,
    ValidationError,
};
pub use hotkey::{canonical_key, is_modifier_key, Hotkey, HotkeyDispatcher, HotkeyOutcome};
pub use input::{InputCommand, InputDispatcher, InputInjector, LoggingInjector, RecordingInjector};
pub use manager::{ConcurrencyManager, LaunchRequest, LaunchSource, MacroLauncher, RunHandle, RunInfo};
pub use stats::{StatisticsCollector, StatsEntry};
pub use store::MacroStore;
pub use system::MacroSystem;
pub use validation::{validate, validate_structure};
pub use variables::{Scope, Value, VariableStore, Variables};

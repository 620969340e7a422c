use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A macro definition that must not reach the engine.
///
/// Raised on create/update/load only. `location` strings look like
/// `actions[3].then[0]` so an editor can point at the offending step.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Macro has no actions")]
    EmptyActions,

    #[error("Unbalanced loop markers at {location}: {detail}")]
    UnbalancedLoop { location: String, detail: String },

    #[error("Hotkey '{0}' is reserved")]
    ReservedHotkey(String),

    #[error("Hotkey '{hotkey}' is already bound to macro '{existing_macro}'")]
    DuplicateHotkey {
        hotkey: String,
        existing_macro: String,
    },

    #[error("Malformed hotkey '{hotkey}': {detail}")]
    MalformedHotkey { hotkey: String, detail: String },

    #[error("Malformed interpolation at {location}: {detail}")]
    MalformedInterpolation { location: String, detail: String },

    #[error("Malformed expression at {location}: {detail}")]
    MalformedExpression { location: String, detail: String },

    #[error("Condition at {location} does not evaluate to a boolean")]
    NonBooleanCondition { location: String },

    #[error("Invalid parameter at {location}: {detail}")]
    InvalidParameter { location: String, detail: String },
}

/// Failure reported by the injection collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InjectionError {
    #[error("Input device error: {0}")]
    Device(String),

    #[error("Unsupported input operation: {0}")]
    Unsupported(String),

    #[error("Input queue is closed")]
    QueueClosed,
}

/// A single action failed while a run was interpreting it. Aborts that run only.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Macro '{macro_id}' failed at {location}: {reason}")]
pub struct ExecutionError {
    pub macro_id: String,
    pub location: String,
    pub reason: String,
}

impl ExecutionError {
    pub fn new(macro_id: &str, location: &str, reason: impl Into<String>) -> Self {
        Self {
            macro_id: macro_id.to_string(),
            location: location.to_string(),
            reason: reason.into(),
        }
    }
}

/// A run exceeded `max_action_duration`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Macro '{macro_id}' timed out after {elapsed:?} (limit {limit:?})")]
pub struct TimeoutError {
    pub macro_id: String,
    pub elapsed: Duration,
    pub limit: Duration,
}

/// Admission refused. No run was created.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConcurrencyLimitError {
    #[error("Concurrency limit reached: {active} of {limit} macros already running")]
    GlobalLimit { active: usize, limit: usize },

    #[error("Macro '{macro_id}' is single-instance and already running as run {running}")]
    SingleInstance { macro_id: String, running: u64 },

    #[error("Trigger chain depth {depth} exceeds the maximum of {max}")]
    TriggerDepth { depth: u32, max: u32 },

    #[error("Trigger from run {parent_run} predates an emergency stop")]
    StoppedParent { parent_run: u64 },
}

/// An unresolved `{{name}}` placeholder. Non-fatal: the literal text is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpolationWarning {
    pub placeholder: String,
}

impl fmt::Display for InterpolationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unresolved variable placeholder {{{{{}}}}}", self.placeholder)
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    ConcurrencyLimit(#[from] ConcurrencyLimitError),

    #[error("Macro not found: {0}")]
    MacroNotFound(String),

    #[error("Macro already exists: {0}")]
    DuplicateMacro(String),

    #[error("Macro '{0}' is disabled")]
    MacroDisabled(String),

    #[error("Run not found: {0}")]
    RunNotFound(u64),

    #[error("Variable '{0}' is read-only")]
    ReadOnlyVariable(String),

    #[error("Runtime unavailable: {0}")]
    Runtime(String),

    #[error("Unsupported document version {0}")]
    UnsupportedVersion(u32),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

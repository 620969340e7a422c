//! Variable scopes and `{{name}}` interpolation.
//!
//! Two scopes exist. The global scope is process-wide and shared by every run,
//! so it lives behind a single mutex in [`VariableStore`]. The execution-local
//! scope ([`LocalScope`]) is owned by one run and needs no locking; it shadows
//! global names and also answers the read-only built-ins.

use crate::action::Point;
use crate::errors::{EngineError, InterpolationWarning};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;
use tracing::warn;

/// Prefix that addresses the global scope explicitly, e.g. `global.counter`.
pub const GLOBAL_PREFIX: &str = "global.";

/// Read-only variables recomputed on every access.
pub const BUILTIN_NAMES: &[&str] = &[
    "loop_counter",
    "action_index",
    "repeat_index",
    "elapsed_ms",
    "timestamp",
    "mouse_x",
    "mouse_y",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    /// Types rendered template text: `true`/`false`, finite numbers, otherwise text.
    pub fn infer(text: &str) -> Value {
        let trimmed = text.trim();
        match trimmed {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() && !trimmed.is_empty() => Value::Number(n),
            _ => Value::Text(text.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            Value::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Local,
}

/// Splits `global.name` into `(Scope::Global, "name")`.
pub fn split_scope(name: &str) -> (Scope, &str) {
    match name.strip_prefix(GLOBAL_PREFIX) {
        Some(rest) => (Scope::Global, rest),
        None => (Scope::Local, name),
    }
}

/// The process-wide global scope.
#[derive(Debug, Default)]
pub struct VariableStore {
    globals: Mutex<HashMap<String, Value>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.globals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.lock().insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.lock().remove(name)
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.lock().clone()
    }

    /// Runs `f` while holding the global lock, for read-modify-write updates.
    pub fn with_globals<R>(&self, f: impl FnOnce(&mut HashMap<String, Value>) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }
}

/// Inputs for the built-in variables. The engine keeps these current; values
/// are derived at read time.
#[derive(Debug, Clone)]
pub struct Builtins {
    pub loop_counter: Option<u32>,
    pub action_index: usize,
    pub repeat_index: u32,
    pub started: Instant,
    pub mouse: Option<Point>,
}

impl Default for Builtins {
    fn default() -> Self {
        Self {
            loop_counter: None,
            action_index: 0,
            repeat_index: 0,
            started: Instant::now(),
            mouse: None,
        }
    }
}

impl Builtins {
    fn get(&self, name: &str) -> Option<Value> {
        match name {
            "loop_counter" => self.loop_counter.map(|c| Value::Number(f64::from(c))),
            "action_index" => Some(Value::Number(self.action_index as f64)),
            "repeat_index" => Some(Value::Number(f64::from(self.repeat_index))),
            "elapsed_ms" => Some(Value::Number(self.started.elapsed().as_millis() as f64)),
            "timestamp" => Some(Value::Text(chrono::Local::now().to_rfc3339())),
            "mouse_x" => self.mouse.map(|p| Value::Number(f64::from(p.x))),
            "mouse_y" => self.mouse.map(|p| Value::Number(f64::from(p.y))),
            _ => None,
        }
    }
}

/// Execution-local scope, owned by exactly one run.
#[derive(Debug, Clone, Default)]
pub struct LocalScope {
    values: HashMap<String, Value>,
    pub(crate) builtins: Builtins,
}

impl LocalScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: HashMap<String, Value>) -> Self {
        Self {
            values,
            builtins: Builtins::default(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values
            .get(name)
            .cloned()
            .or_else(|| self.builtins.get(name))
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<(), EngineError> {
        let name = name.into();
        if BUILTIN_NAMES.contains(&name.as_str()) {
            return Err(EngineError::ReadOnlyVariable(name));
        }
        self.values.insert(name, value.into());
        Ok(())
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn into_values(self) -> HashMap<String, Value> {
        self.values
    }
}

/// Resolves a name against an already-locked global map: explicit
/// `global.` names go straight to globals, others try local first.
pub(crate) fn lookup(local: &LocalScope, globals: &HashMap<String, Value>, name: &str) -> Option<Value> {
    match split_scope(name) {
        (Scope::Global, rest) => globals.get(rest).cloned(),
        (Scope::Local, name) => local.get(name).or_else(|| globals.get(name).cloned()),
    }
}

/// A view over both scopes for one run.
pub struct Variables<'a> {
    globals: &'a VariableStore,
    local: &'a mut LocalScope,
}

impl<'a> Variables<'a> {
    pub fn new(globals: &'a VariableStore, local: &'a mut LocalScope) -> Self {
        Self { globals, local }
    }

    pub fn get(&self, scope: Scope, name: &str) -> Option<Value> {
        match scope {
            Scope::Global => self.globals.get(name),
            Scope::Local => self.local.get(name),
        }
    }

    pub fn set(&mut self, scope: Scope, name: &str, value: impl Into<Value>) -> Result<(), EngineError> {
        match scope {
            Scope::Global => {
                self.globals.set(name, value);
                Ok(())
            }
            Scope::Local => self.local.set(name, value),
        }
    }

    /// Local names shadow global ones; `global.` forces the global scope.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        match split_scope(name) {
            (Scope::Global, rest) => self.globals.get(rest),
            (Scope::Local, name) => self.local.get(name).or_else(|| self.globals.get(name)),
        }
    }

    /// Substitutes placeholders; unresolved ones stay verbatim and are logged.
    pub fn interpolate(&self, text: &str) -> String {
        let (rendered, warnings) = self.render(text);
        for warning in &warnings {
            warn!(placeholder = %warning.placeholder, "{}", warning);
        }
        rendered
    }

    /// Like [`interpolate`](Self::interpolate) but hands the warnings back
    /// instead of logging them.
    pub fn render(&self, text: &str) -> (String, Vec<InterpolationWarning>) {
        render_template(text, |name| self.resolve(name))
    }
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("placeholder regex is valid"))
}

fn name_regex() -> &'static Regex {
    static NAME: OnceLock<Regex> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("name regex is valid"))
}

pub fn is_valid_name(name: &str) -> bool {
    name_regex().is_match(name)
}

/// Checks placeholder syntax without resolving anything.
pub fn check_template(text: &str) -> Result<(), String> {
    for caps in placeholder_regex().captures_iter(text) {
        let inner = caps[1].trim();
        if inner.is_empty() {
            return Err("empty placeholder '{{}}'".to_string());
        }
        if !is_valid_name(inner) {
            return Err(format!("invalid variable name '{inner}' in placeholder"));
        }
    }
    let stripped = placeholder_regex().replace_all(text, "");
    if stripped.contains("{{") {
        return Err("unclosed placeholder '{{'".to_string());
    }
    if stripped.contains("}}") {
        return Err("unopened placeholder '}}'".to_string());
    }
    Ok(())
}

/// Renders `{{name}}` placeholders with `resolve`. Unresolved names are left
/// as the literal placeholder text and reported.
pub fn render_template(
    text: &str,
    resolve: impl Fn(&str) -> Option<Value>,
) -> (String, Vec<InterpolationWarning>) {
    let mut warnings = Vec::new();
    let rendered = placeholder_regex().replace_all(text, |caps: &regex::Captures| {
        let name = caps[1].trim();
        match resolve(name) {
            Some(value) => value.to_string(),
            None => {
                warnings.push(InterpolationWarning {
                    placeholder: name.to_string(),
                });
                caps[0].to_string()
            }
        }
    });
    (rendered.into_owned(), warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_local_value() {
        let globals = VariableStore::new();
        let mut local = LocalScope::new();
        let mut vars = Variables::new(&globals, &mut local);
        vars.set(Scope::Local, "x", Value::infer("5")).unwrap();
        assert_eq!(vars.interpolate("{{x}}"), "5");
    }

    #[test]
    fn test_interpolate_missing_keeps_placeholder() {
        let globals = VariableStore::new();
        let mut local = LocalScope::new();
        let vars = Variables::new(&globals, &mut local);
        let (text, warnings) = vars.render("hp={{missing}}");
        assert_eq!(text, "hp={{missing}}");
        assert_eq!(warnings, vec![InterpolationWarning { placeholder: "missing".into() }]);
    }

    #[test]
    fn test_local_shadows_global() {
        let globals = VariableStore::new();
        globals.set("name", "global");
        let mut local = LocalScope::new();
        local.set("name", "local").unwrap();
        let vars = Variables::new(&globals, &mut local);
        assert_eq!(vars.interpolate("{{name}}"), "local");
        assert_eq!(vars.interpolate("{{global.name}}"), "global");
    }

    #[test]
    fn test_builtins_are_read_only() {
        let mut local = LocalScope::new();
        assert!(matches!(
            local.set("loop_counter", 3.0),
            Err(EngineError::ReadOnlyVariable(_))
        ));
        assert!(local.get("loop_counter").is_none());
        local.builtins.loop_counter = Some(2);
        assert_eq!(local.get("loop_counter"), Some(Value::Number(2.0)));
        assert!(local.get("timestamp").is_some());
    }

    #[test]
    fn test_check_template() {
        assert!(check_template("plain text").is_ok());
        assert!(check_template("{{a}} and {{ global.b }}").is_ok());
        assert!(check_template("{{a").is_err());
        assert!(check_template("a}}").is_err());
        assert!(check_template("{{}}").is_err());
        assert!(check_template("{{not valid}}").is_err());
    }

    #[test]
    fn test_value_infer_and_display() {
        assert_eq!(Value::infer("5"), Value::Number(5.0));
        assert_eq!(Value::infer("true"), Value::Bool(true));
        assert_eq!(Value::infer("hello"), Value::Text("hello".into()));
        assert_eq!(Value::infer("inf"), Value::Text("inf".into()));
        assert_eq!(Value::Number(5.0).to_string(), "5");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
    }
}

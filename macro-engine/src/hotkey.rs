//! Hotkey specs and the hotkey → macro binding table.

use crate::config::EngineConfig;
use crate::engine::RunId;
use crate::errors::{EngineError, ValidationError};
use crate::manager::{LaunchRequest, LaunchSource, MacroLauncher};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, instrument, warn};

/// Maps the common aliases onto one spelling.
pub fn canonical_key(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    let canonical = match lower.as_str() {
        "control" | "ctl" | "lctrl" | "rctrl" => "ctrl",
        "lshift" | "rshift" => "shift",
        "option" | "opt" | "lalt" | "ralt" | "altgr" => "alt",
        "win" | "windows" | "cmd" | "command" | "super" | "lmeta" | "rmeta" => "meta",
        "esc" => "escape",
        "del" => "delete",
        "return" => "enter",
        "spacebar" => "space",
        other => other,
    };
    canonical.to_string()
}

/// Whether `key` names a modifier (after alias folding).
pub fn is_modifier_key(key: &str) -> bool {
    matches!(canonical_key(key).as_str(), "ctrl" | "alt" | "shift" | "meta")
}

/// A normalized key combination such as `ctrl+alt+t`.
///
/// Modifiers are order-insensitive on input and printed as
/// `ctrl+alt+shift+meta+<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hotkey {
    ctrl: bool,
    alt: bool,
    shift: bool,
    meta: bool,
    key: String,
}

impl Hotkey {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn modifiers(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.ctrl {
            out.push("ctrl");
        }
        if self.alt {
            out.push("alt");
        }
        if self.shift {
            out.push("shift");
        }
        if self.meta {
            out.push("meta");
        }
        out
    }
}

impl FromStr for Hotkey {
    type Err = ValidationError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let malformed = |detail: &str| ValidationError::MalformedHotkey {
            hotkey: spec.to_string(),
            detail: detail.to_string(),
        };

        let mut hotkey = Hotkey {
            ctrl: false,
            alt: false,
            shift: false,
            meta: false,
            key: String::new(),
        };

        let parts: Vec<&str> = spec.split('+').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(malformed("empty key name"));
        }

        for part in parts {
            let key = canonical_key(part);
            let flag = match key.as_str() {
                "ctrl" => Some(&mut hotkey.ctrl),
                "alt" => Some(&mut hotkey.alt),
                "shift" => Some(&mut hotkey.shift),
                "meta" => Some(&mut hotkey.meta),
                _ => None,
            };
            match flag {
                Some(flag) => {
                    if *flag {
                        return Err(malformed("modifier repeated"));
                    }
                    *flag = true;
                }
                None => {
                    if !hotkey.key.is_empty() {
                        return Err(malformed("more than one non-modifier key"));
                    }
                    hotkey.key = key;
                }
            }
        }

        if hotkey.key.is_empty() {
            return Err(malformed("no non-modifier key"));
        }
        Ok(hotkey)
    }
}

impl fmt::Display for Hotkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for modifier in self.modifiers() {
            write!(f, "{modifier}+")?;
        }
        f.write_str(&self.key)
    }
}

/// What a captured hotkey event led to
#[derive(Debug, Clone, PartialEq)]
pub enum HotkeyOutcome {
    /// Not bound, or not parseable
    Ignored,
    /// Global hotkeys are switched off
    Disabled,
    Started { macro_id: String, run_id: RunId },
    EmergencyStop,
    /// Bound, but the launcher refused to start a run
    Refused { macro_id: String, reason: String },
}

#[derive(Debug, Default)]
struct Bindings {
    by_hotkey: HashMap<Hotkey, String>,
    by_macro: HashMap<String, Hotkey>,
}

/// One-to-one hotkey ↔ macro table, routing capture callbacks to the launcher.
pub struct HotkeyDispatcher {
    bindings: RwLock<Bindings>,
    reserved: HashSet<Hotkey>,
    emergency_stop: Hotkey,
    launcher: Arc<dyn MacroLauncher>,
    enabled: AtomicBool,
}

impl HotkeyDispatcher {
    pub fn new(config: &EngineConfig, launcher: Arc<dyn MacroLauncher>) -> Result<Self, ValidationError> {
        let emergency_stop: Hotkey = config.emergency_stop_hotkey.parse()?;
        let mut reserved = config
            .reserved_hotkeys
            .iter()
            .map(|h| h.parse::<Hotkey>())
            .collect::<Result<HashSet<_>, _>>()?;
        reserved.insert(emergency_stop.clone());

        Ok(Self {
            bindings: RwLock::new(Bindings::default()),
            reserved,
            emergency_stop,
            launcher,
            enabled: AtomicBool::new(config.global_hotkeys_enabled),
        })
    }

    pub fn emergency_stop_hotkey(&self) -> &Hotkey {
        &self.emergency_stop
    }

    pub fn is_reserved(&self, hotkey: &Hotkey) -> bool {
        self.reserved.contains(hotkey)
    }

    pub fn set_enabled(&self, enabled: bool) {
        info!(enabled, "Global hotkeys toggled");
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn check_locked(&self, bindings: &Bindings, spec: &str, macro_id: &str) -> Result<Hotkey, ValidationError> {
        let hotkey: Hotkey = spec.parse()?;
        if self.is_reserved(&hotkey) {
            return Err(ValidationError::ReservedHotkey(hotkey.to_string()));
        }
        match bindings.by_hotkey.get(&hotkey) {
            Some(owner) if owner != macro_id => Err(ValidationError::DuplicateHotkey {
                hotkey: hotkey.to_string(),
                existing_macro: owner.clone(),
            }),
            _ => Ok(hotkey),
        }
    }

    /// Validates a binding without applying it.
    pub fn check(&self, spec: &str, macro_id: &str) -> Result<Hotkey, ValidationError> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        self.check_locked(&bindings, spec, macro_id)
    }

    /// Binds `spec` to `macro_id`, replacing any previous binding of that macro.
    /// On error the table is left untouched.
    #[instrument(skip(self))]
    pub fn register(&self, spec: &str, macro_id: &str) -> Result<Hotkey, ValidationError> {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        let hotkey = self.check_locked(&bindings, spec, macro_id)?;

        if let Some(previous) = bindings.by_macro.insert(macro_id.to_string(), hotkey.clone()) {
            if previous != hotkey {
                bindings.by_hotkey.remove(&previous);
                debug!(%previous, "Replaced previous binding");
            }
        }
        bindings.by_hotkey.insert(hotkey.clone(), macro_id.to_string());

        info!(%hotkey, macro_id, "Hotkey registered");
        Ok(hotkey)
    }

    pub fn unregister(&self, macro_id: &str) -> Option<Hotkey> {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        let hotkey = bindings.by_macro.remove(macro_id)?;
        bindings.by_hotkey.remove(&hotkey);
        info!(%hotkey, macro_id, "Hotkey unregistered");
        Some(hotkey)
    }

    pub fn lookup(&self, spec: &str) -> Option<String> {
        let hotkey: Hotkey = spec.parse().ok()?;
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        bindings.by_hotkey.get(&hotkey).cloned()
    }

    pub fn binding_for(&self, macro_id: &str) -> Option<Hotkey> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        bindings.by_macro.get(macro_id).cloned()
    }

    /// All bindings, sorted by hotkey
    pub fn bindings(&self) -> Vec<(Hotkey, String)> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = bindings
            .by_hotkey
            .iter()
            .map(|(h, m)| (h.clone(), m.clone()))
            .collect();
        all.sort();
        all
    }

    /// Entry point for the capture collaborator.
    pub fn on_hotkey_event(&self, spec: &str) -> HotkeyOutcome {
        let Ok(hotkey) = spec.parse::<Hotkey>() else {
            debug!(spec, "Ignoring unparseable hotkey event");
            return HotkeyOutcome::Ignored;
        };

        if hotkey == self.emergency_stop {
            warn!(%hotkey, "Emergency stop hotkey pressed");
            self.launcher.emergency_stop();
            return HotkeyOutcome::EmergencyStop;
        }

        if !self.is_enabled() {
            return HotkeyOutcome::Disabled;
        }

        let macro_id = {
            let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
            match bindings.by_hotkey.get(&hotkey) {
                Some(id) => id.clone(),
                None => {
                    debug!(%hotkey, "No macro bound to hotkey");
                    return HotkeyOutcome::Ignored;
                }
            }
        };

        let request = LaunchRequest::new(&macro_id).source(LaunchSource::Hotkey(hotkey.to_string()));
        match self.launcher.launch(request) {
            Ok(run_id) => HotkeyOutcome::Started { macro_id, run_id },
            Err(e) => {
                match &e {
                    EngineError::ConcurrencyLimit(_) | EngineError::MacroDisabled(_) => {
                        info!(%hotkey, macro_id = %macro_id, "Hotkey refused: {}", e)
                    }
                    _ => warn!(%hotkey, macro_id = %macro_id, "Hotkey launch failed: {}", e),
                }
                HotkeyOutcome::Refused {
                    macro_id,
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConcurrencyLimitError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLauncher {
        launched: Mutex<Vec<String>>,
        stops: Mutex<u32>,
        refuse: bool,
    }

    impl MacroLauncher for FakeLauncher {
        fn launch(&self, request: LaunchRequest) -> crate::errors::Result<RunId> {
            if self.refuse {
                return Err(ConcurrencyLimitError::GlobalLimit { active: 1, limit: 1 }.into());
            }
            let mut launched = self.launched.lock().unwrap();
            launched.push(request.macro_id);
            Ok(launched.len() as RunId)
        }

        fn emergency_stop(&self) {
            *self.stops.lock().unwrap() += 1;
        }
    }

    fn dispatcher(launcher: Arc<FakeLauncher>) -> HotkeyDispatcher {
        HotkeyDispatcher::new(&EngineConfig::default(), launcher).unwrap()
    }

    #[test]
    fn test_hotkey_normalization() {
        let a: Hotkey = "Shift+Control+T".parse().unwrap();
        let b: Hotkey = "ctrl + shift + t".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "ctrl+shift+t");
        assert_eq!("win+esc".parse::<Hotkey>().unwrap().to_string(), "meta+escape");
    }

    #[test]
    fn test_malformed_hotkeys() {
        for spec in ["", "ctrl+", "ctrl+shift", "a+b", "ctrl+ctrl+a"] {
            assert!(
                matches!(spec.parse::<Hotkey>(), Err(ValidationError::MalformedHotkey { .. })),
                "{spec} should be rejected"
            );
        }
    }

    #[test]
    fn test_reserved_hotkey_rejected_and_table_unchanged() {
        let d = dispatcher(Arc::new(FakeLauncher::default()));
        d.register("f5", "a").unwrap();
        let before = d.bindings();

        let err = d.register("ctrl+alt+escape", "b").unwrap_err();
        assert!(matches!(err, ValidationError::ReservedHotkey(_)));
        let err = d.register("alt+F4", "b").unwrap_err();
        assert!(matches!(err, ValidationError::ReservedHotkey(_)));

        assert_eq!(d.bindings(), before);
    }

    #[test]
    fn test_duplicate_hotkey_rejected() {
        let d = dispatcher(Arc::new(FakeLauncher::default()));
        d.register("ctrl+1", "a").unwrap();
        let err = d.register("Ctrl+1", "b").unwrap_err();
        assert_eq!(
            err,
            ValidationError::DuplicateHotkey {
                hotkey: "ctrl+1".into(),
                existing_macro: "a".into()
            }
        );
        // Re-registering the owner is fine
        d.register("ctrl+1", "a").unwrap();
    }

    #[test]
    fn test_rebinding_replaces_old_hotkey() {
        let d = dispatcher(Arc::new(FakeLauncher::default()));
        d.register("f1", "a").unwrap();
        d.register("f2", "a").unwrap();
        assert_eq!(d.lookup("f1"), None);
        assert_eq!(d.lookup("f2").as_deref(), Some("a"));
        assert_eq!(d.bindings().len(), 1);
    }

    #[test]
    fn test_events_route_to_launcher() {
        let launcher = Arc::new(FakeLauncher::default());
        let d = dispatcher(launcher.clone());
        d.register("f3", "a").unwrap();

        assert_eq!(
            d.on_hotkey_event("F3"),
            HotkeyOutcome::Started { macro_id: "a".into(), run_id: 1 }
        );
        assert_eq!(d.on_hotkey_event("f9"), HotkeyOutcome::Ignored);
        assert_eq!(d.on_hotkey_event("not+a+hotkey"), HotkeyOutcome::Ignored);
        assert_eq!(d.on_hotkey_event("ctrl+alt+esc"), HotkeyOutcome::EmergencyStop);
        assert_eq!(*launcher.stops.lock().unwrap(), 1);
        assert_eq!(launcher.launched.lock().unwrap().as_slice(), ["a".to_string()]);
    }

    #[test]
    fn test_disabled_hotkeys_still_allow_emergency_stop() {
        let launcher = Arc::new(FakeLauncher::default());
        let d = dispatcher(launcher.clone());
        d.register("f3", "a").unwrap();
        d.set_enabled(false);
        assert_eq!(d.on_hotkey_event("f3"), HotkeyOutcome::Disabled);
        assert_eq!(d.on_hotkey_event("ctrl+alt+escape"), HotkeyOutcome::EmergencyStop);
    }

    #[test]
    fn test_refused_launch_is_reported() {
        let launcher = Arc::new(FakeLauncher {
            refuse: true,
            ..Default::default()
        });
        let d = dispatcher(launcher);
        d.register("f3", "a").unwrap();
        assert!(matches!(d.on_hotkey_event("f3"), HotkeyOutcome::Refused { .. }));
    }
}

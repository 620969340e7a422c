//! Sole owner of every macro definition.
//!
//! Definitions are stored behind `Arc` so a run can hold an immutable
//! snapshot while the store replaces the entry underneath it.

use crate::definition::MacroDefinition;
use crate::errors::{EngineError, Result};
use crate::hotkey::HotkeyDispatcher;
use crate::validation::validate;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, instrument};

#[derive(Debug, Default)]
pub struct MacroStore {
    macros: RwLock<HashMap<String, Arc<MacroDefinition>>>,
}

impl MacroStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<MacroDefinition>>> {
        self.macros.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<MacroDefinition>>> {
        self.macros.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds (or unbinds) the macro's hotkey to match its definition.
    fn sync_binding(definition: &MacroDefinition, hotkeys: &HotkeyDispatcher) -> Result<()> {
        match definition.hotkey_spec() {
            Some(spec) if definition.enabled => {
                hotkeys.register(spec, &definition.id)?;
            }
            _ => {
                hotkeys.unregister(&definition.id);
            }
        }
        Ok(())
    }

    /// Validates and inserts a new macro. Returns its id.
    #[instrument(skip_all, fields(macro_id = %definition.id, name = %definition.name))]
    pub fn create(&self, definition: MacroDefinition, hotkeys: &HotkeyDispatcher) -> Result<String> {
        let mut macros = self.write();
        if macros.contains_key(&definition.id) {
            return Err(EngineError::DuplicateMacro(definition.id));
        }
        validate(&definition, hotkeys)?;
        Self::sync_binding(&definition, hotkeys)?;

        let id = definition.id.clone();
        macros.insert(id.clone(), Arc::new(definition));
        info!("Macro created");
        Ok(id)
    }

    /// Replaces an existing macro. Creation time and statistics are kept from
    /// the stored version; `modified_at` is bumped.
    #[instrument(skip_all, fields(macro_id = %definition.id))]
    pub fn update(&self, mut definition: MacroDefinition, hotkeys: &HotkeyDispatcher) -> Result<Arc<MacroDefinition>> {
        let mut macros = self.write();
        let existing = macros
            .get(&definition.id)
            .ok_or_else(|| EngineError::MacroNotFound(definition.id.clone()))?;
        validate(&definition, hotkeys)?;

        definition.created_at = existing.created_at;
        definition.stats = existing.stats.clone();
        definition.touch();
        Self::sync_binding(&definition, hotkeys)?;

        let updated = Arc::new(definition);
        macros.insert(updated.id.clone(), updated.clone());
        info!("Macro updated");
        Ok(updated)
    }

    /// Removes a macro and its hotkey binding.
    pub fn delete(&self, macro_id: &str, hotkeys: &HotkeyDispatcher) -> Result<Arc<MacroDefinition>> {
        let removed = self
            .write()
            .remove(macro_id)
            .ok_or_else(|| EngineError::MacroNotFound(macro_id.to_string()))?;
        hotkeys.unregister(macro_id);
        info!(macro_id, "Macro deleted");
        Ok(removed)
    }

    /// Copies a macro under a new id, without its hotkey or statistics.
    pub fn clone_macro(&self, macro_id: &str) -> Result<Arc<MacroDefinition>> {
        let mut macros = self.write();
        let source = macros
            .get(macro_id)
            .ok_or_else(|| EngineError::MacroNotFound(macro_id.to_string()))?;

        let mut copy = MacroDefinition::new(format!("{} (Copy)", source.name), source.actions.clone());
        copy.description = source.description.clone();
        copy.category = source.category.clone();
        copy.enabled = source.enabled;
        copy.single_instance = source.single_instance;
        copy.repeat = source.repeat;

        let copy = Arc::new(copy);
        macros.insert(copy.id.clone(), copy.clone());
        info!(source = macro_id, macro_id = %copy.id, "Macro cloned");
        Ok(copy)
    }

    /// The snapshot a run borrows
    pub fn snapshot(&self, macro_id: &str) -> Option<Arc<MacroDefinition>> {
        self.read().get(macro_id).cloned()
    }

    pub fn get(&self, macro_id: &str) -> Option<MacroDefinition> {
        self.snapshot(macro_id).map(|m| (*m).clone())
    }

    pub fn contains(&self, macro_id: &str) -> bool {
        self.read().contains_key(macro_id)
    }

    /// All macros, sorted by category then name
    pub fn list(&self) -> Vec<Arc<MacroDefinition>> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.category.cmp(&b.category).then_with(|| a.name.cmp(&b.name)));
        all
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

use crate::config::EngineConfig;
use crate::definition::{MacroDefinition, MacroDocument};
use crate::engine::MacroEngine;
use crate::errors::{EngineError, Result, ValidationError};
use crate::hotkey::{HotkeyDispatcher, HotkeyOutcome};
use crate::input::{InputDispatcher, InputInjector};
use crate::manager::{ConcurrencyManager, LaunchRequest, RunHandle};
use crate::stats::StatisticsCollector;
use crate::store::MacroStore;
use crate::validation::validate_structure;
use crate::variables::VariableStore;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Process-wide macro state, built once at startup and torn down with
/// [`shutdown`](Self::shutdown).
pub struct MacroSystem {
    config: EngineConfig,
    store: Arc<MacroStore>,
    globals: Arc<VariableStore>,
    input: Arc<InputDispatcher>,
    stats: StatisticsCollector,
    manager: ConcurrencyManager,
    hotkeys: Arc<HotkeyDispatcher>,
}

impl MacroSystem {
    /// Wires every component together. Must run inside a tokio runtime.
    pub fn new(config: EngineConfig, injector: Box<dyn InputInjector>) -> Result<Self> {
        let globals = Arc::new(VariableStore::new());
        let input = Arc::new(InputDispatcher::new(injector));
        let engine = Arc::new(MacroEngine::new(config.clone(), input.clone(), globals.clone()));
        let store = Arc::new(MacroStore::new());
        let stats = StatisticsCollector::new()?;
        let manager = ConcurrencyManager::new(engine, store.clone(), stats.clone())?;
        let hotkeys = Arc::new(HotkeyDispatcher::new(&config, Arc::new(manager.clone()))?);

        info!(
            max_concurrent = config.max_concurrent_macros,
            emergency_stop = %hotkeys.emergency_stop_hotkey(),
            "Macro system ready"
        );
        Ok(Self {
            config,
            store,
            globals,
            input,
            stats,
            manager,
            hotkeys,
        })
    }

    /// Like [`new`](Self::new), then loads `macros_path` if it exists.
    pub fn load(config: EngineConfig, injector: Box<dyn InputInjector>) -> Result<Self> {
        let path = config.macros_path.clone();
        let system = Self::new(config, injector)?;
        if let Some(path) = path.filter(|p| p.exists()) {
            system.import_file(&path)?;
        }
        Ok(system)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MacroStore> {
        &self.store
    }

    pub fn globals(&self) -> &Arc<VariableStore> {
        &self.globals
    }

    pub fn stats(&self) -> &StatisticsCollector {
        &self.stats
    }

    pub fn manager(&self) -> &ConcurrencyManager {
        &self.manager
    }

    pub fn hotkeys(&self) -> &Arc<HotkeyDispatcher> {
        &self.hotkeys
    }

    fn auto_save(&self) {
        if !self.config.auto_save {
            return;
        }
        if let Some(path) = &self.config.macros_path {
            if let Err(e) = self.save(path) {
                error!("Auto-save to {:?} failed: {}", path, e);
            }
        }
    }

    pub fn create_macro(&self, definition: MacroDefinition) -> Result<String> {
        let id = self.store.create(definition, &self.hotkeys)?;
        self.stats.seed(id.clone(), Default::default());
        self.auto_save();
        Ok(id)
    }

    /// Replaces a macro. Disabling a macro cancels its active runs; runs of
    /// an edited macro finish on the snapshot they started with.
    pub fn update_macro(&self, definition: MacroDefinition) -> Result<()> {
        let updated = self.store.update(definition, &self.hotkeys)?;
        if !updated.enabled {
            self.manager.cancel_macro(&updated.id);
        }
        self.auto_save();
        Ok(())
    }

    pub fn set_enabled(&self, macro_id: &str, enabled: bool) -> Result<()> {
        let mut definition = self
            .store
            .get(macro_id)
            .ok_or_else(|| EngineError::MacroNotFound(macro_id.to_string()))?;
        definition.enabled = enabled;
        self.update_macro(definition)
    }

    /// Deletes a macro, cancelling its runs and dropping its statistics.
    pub fn delete_macro(&self, macro_id: &str) -> Result<MacroDefinition> {
        let removed = self.store.delete(macro_id, &self.hotkeys)?;
        self.manager.cancel_macro(macro_id);
        self.stats.remove(macro_id);
        self.auto_save();
        Ok((*removed).clone())
    }

    pub fn clone_macro(&self, macro_id: &str) -> Result<MacroDefinition> {
        let copy = self.store.clone_macro(macro_id)?;
        self.stats.seed(copy.id.clone(), Default::default());
        self.auto_save();
        Ok((*copy).clone())
    }

    pub fn get_macro(&self, macro_id: &str) -> Option<MacroDefinition> {
        self.store.get(macro_id)
    }

    pub fn list_macros(&self) -> Vec<Arc<MacroDefinition>> {
        self.store.list()
    }

    pub fn start(&self, macro_id: &str) -> Result<RunHandle> {
        self.manager.start(LaunchRequest::new(macro_id))
    }

    pub fn start_with(&self, request: LaunchRequest) -> Result<RunHandle> {
        self.manager.start(request)
    }

    /// Entry point for the hotkey capture collaborator.
    pub fn on_hotkey_event(&self, hotkey: &str) -> HotkeyOutcome {
        self.hotkeys.on_hotkey_event(hotkey)
    }

    /// The host's stop button. Returns without waiting.
    pub fn trigger_emergency_stop(&self) {
        self.manager.trigger_emergency_stop();
    }

    pub async fn emergency_stop(&self) {
        self.manager.emergency_stop().await;
    }

    /// Current macros with their latest statistics merged in.
    pub fn document(&self) -> MacroDocument {
        let macros = self
            .store
            .list()
            .iter()
            .map(|m| {
                let mut definition = (**m).clone();
                if let Some(stats) = self.stats.get(&definition.id) {
                    definition.stats = stats;
                }
                definition
            })
            .collect();
        MacroDocument::new(macros)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.document().save_to_file(path)
    }

    /// Adds every valid macro of `document`. Invalid or duplicate entries are
    /// skipped with a warning. Returns how many were loaded.
    #[instrument(skip_all, fields(count = document.macros.len()))]
    pub fn import(&self, document: MacroDocument) -> usize {
        let mut loaded = 0;
        for definition in document.macros {
            let id = definition.id.clone();
            let stats = definition.stats.clone();
            match self.store.create(definition, &self.hotkeys) {
                Ok(_) => {
                    self.stats.seed(id, stats);
                    loaded += 1;
                }
                Err(e) => warn!(macro_id = %id, "Skipping macro: {}", e),
            }
        }
        info!(loaded, "Macros imported");
        loaded
    }

    pub fn import_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let document = MacroDocument::load_from_file(path)?;
        Ok(self.import(document))
    }

    /// Structural problems of every macro in `document`, without touching the store.
    pub fn check_document(document: &MacroDocument) -> Vec<(String, ValidationError)> {
        document
            .macros
            .iter()
            .filter_map(|m| validate_structure(m).err().map(|e| (m.id.clone(), e)))
            .collect()
    }

    /// Stops every run, waits for the registry to drain, flushes statistics,
    /// saves when auto-save is on, then stops the input worker.
    pub async fn shutdown(&self) {
        info!("Shutting down macro system");
        if self.manager.active_count() > 0 {
            self.manager.emergency_stop().await;
        }
        self.stats.flush().await;
        self.auto_save();
        self.input.shutdown();
    }
}

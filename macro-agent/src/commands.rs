//! Subcommand implementations. Every command builds its own [`MacroSystem`]
//! around the dry-run injector, so nothing here touches the real input devices.

use anyhow::{Context, Result};
use macro_engine::{
    EngineConfig, LaunchRequest, LoggingInjector, MacroDefinition, MacroDocument, MacroSystem, RunReport, StatsEntry,
    Value,
};
use macro_recorder::{draft, load_events, Precision, RecorderConfig};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{info, warn};

/// A macro that would be refused when loading the library
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Problem {
    pub macro_id: String,
    pub name: String,
    pub message: String,
}

/// One line of `list`
#[derive(Debug, Clone, Serialize)]
pub struct MacroSummary {
    pub id: String,
    pub name: String,
    pub category: String,
    pub hotkey: Option<String>,
    pub enabled: bool,
    pub actions: usize,
}

impl From<&MacroDefinition> for MacroSummary {
    fn from(definition: &MacroDefinition) -> Self {
        Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            category: definition.category.clone(),
            hotkey: definition.hotkey.clone(),
            enabled: definition.enabled,
            actions: definition.actions.len(),
        }
    }
}

/// Commands never write the library behind the caller's back.
fn dry_run_system(config: &EngineConfig) -> Result<MacroSystem> {
    let config = EngineConfig {
        auto_save: false,
        ..config.clone()
    };
    Ok(MacroSystem::new(config, Box::new(LoggingInjector::new()))?)
}

fn load_document(path: &Path) -> Result<MacroDocument> {
    MacroDocument::load_from_file(path).with_context(|| format!("Failed to load macro library {:?}", path))
}

/// Checks every macro of the library the way loading would, hotkey
/// conflicts between macros included.
pub async fn validate(path: &Path, config: &EngineConfig) -> Result<Vec<Problem>> {
    let document = load_document(path)?;
    let system = dry_run_system(config)?;
    let mut problems = Vec::new();
    for definition in document.macros {
        let macro_id = definition.id.clone();
        let name = definition.name.clone();
        if let Err(e) = system.create_macro(definition) {
            warn!(macro_id = %macro_id, "Invalid macro: {}", e);
            problems.push(Problem {
                macro_id,
                name,
                message: e.to_string(),
            });
        }
    }
    system.shutdown().await;
    Ok(problems)
}

/// Macros of the library, sorted by category then name.
pub fn list(path: &Path) -> Result<Vec<MacroSummary>> {
    let document = load_document(path)?;
    let mut summaries: Vec<MacroSummary> = document.macros.iter().map(MacroSummary::from).collect();
    summaries.sort_by(|a, b| a.category.cmp(&b.category).then_with(|| a.name.cmp(&b.name)));
    Ok(summaries)
}

/// Runs one macro against the dry-run injector and waits for it.
/// With `save`, the updated statistics are written back to the library.
pub async fn run(
    path: &Path,
    macro_id: &str,
    variables: Vec<(String, Value)>,
    config: &EngineConfig,
    save: bool,
) -> Result<RunReport> {
    let system = dry_run_system(config)?;
    let loaded = system.import_file(path)?;
    info!(loaded, "Library loaded");

    let variables: HashMap<String, Value> = variables.into_iter().collect();
    let handle = system.start_with(LaunchRequest::new(macro_id).with_variables(variables))?;
    let report = handle.wait().await?;

    system.shutdown().await;
    if save {
        system.save(path)?;
        info!("Statistics saved to {:?}", path);
    }
    Ok(report)
}

/// Statistics persisted in the library, keyed by macro id.
pub async fn stats(path: &Path, config: &EngineConfig) -> Result<BTreeMap<String, StatsEntry>> {
    let system = dry_run_system(config)?;
    system.import_file(path)?;
    let export = system.stats().export();
    system.shutdown().await;
    Ok(export)
}

/// Turns a saved capture into a draft macro, optionally appending it to a library.
pub fn convert(
    events_path: &Path,
    name: &str,
    precision: Precision,
    into: Option<&Path>,
) -> Result<MacroDefinition> {
    let events = load_events(events_path).with_context(|| format!("Failed to read events {:?}", events_path))?;
    let config = RecorderConfig {
        precision,
        ..RecorderConfig::default()
    };
    let definition = draft(name, &events, &config)?;

    if let Some(library) = into {
        let mut document = if library.exists() {
            load_document(library)?
        } else {
            MacroDocument::new(Vec::new())
        };
        document.macros.push(definition.clone());
        document.save_to_file(library)?;
        info!(macro_id = %definition.id, "Draft appended to {:?}", library);
    }
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use macro_engine::{Action, RunState};
    use macro_recorder::{CapturedEvent, CapturedEventKind, MacroRecorder};

    fn config() -> EngineConfig {
        EngineConfig {
            action_delay_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn write_library(dir: &Path, macros: Vec<MacroDefinition>) -> std::path::PathBuf {
        let path = dir.join("macros.json");
        MacroDocument::new(macros).save_to_file(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn test_validate_reports_conflicts() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_library(
            dir.path(),
            vec![
                MacroDefinition::new("first", vec![Action::key_press("a")]).with_hotkey("f1"),
                MacroDefinition::new("second", vec![Action::key_press("b")]).with_hotkey("F1"),
                MacroDefinition::new("broken", vec![Action::LoopEnd]).with_id("broken"),
            ],
        );

        let problems = validate(&path, &config()).await.unwrap();
        assert_eq!(problems.len(), 2);
        assert_eq!(problems[0].name, "second");
        assert_eq!(problems[1].macro_id, "broken");
    }

    #[tokio::test]
    async fn test_run_with_variables_and_save_stats() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_library(
            dir.path(),
            vec![MacroDefinition::new(
                "greet",
                vec![
                    Action::TypeText {
                        text: "hello {{who}}".into(),
                    },
                    Action::set("done", "=count + 1"),
                ],
            )
            .with_id("greet")],
        );

        let variables = vec![
            ("who".to_string(), Value::Text("world".into())),
            ("count".to_string(), Value::Number(1.0)),
        ];
        let report = run(&path, "greet", variables, &config(), true).await.unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert!(report.warnings.is_empty());
        assert_eq!(report.variables.get("done"), Some(&Value::Number(2.0)));

        let saved = stats(&path, &config()).await.unwrap();
        assert_eq!(saved["greet"].run_count, 1);
        assert_eq!(saved["greet"].success_count, 1);
    }

    #[tokio::test]
    async fn test_run_unknown_macro_fails() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_library(dir.path(), vec![]);
        assert!(run(&path, "missing", Vec::new(), &config(), false).await.is_err());
    }

    #[test]
    fn test_list_and_convert_into_library() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write_library(
            dir.path(),
            vec![MacroDefinition::new("zeta", vec![Action::key_press("z")]).with_category("Work")],
        );

        let recorder = MacroRecorder::new("capture", RecorderConfig::default());
        recorder.start().unwrap();
        recorder
            .capture(CapturedEvent::new(0, CapturedEventKind::key_down("a")))
            .unwrap();
        recorder
            .capture(CapturedEvent::new(20, CapturedEventKind::key_up("a")))
            .unwrap();
        let events_path = dir.path().join("events.json");
        recorder.save_events(&events_path).unwrap();

        let definition = convert(&events_path, "alpha", Precision::High, Some(&path)).unwrap();
        assert_eq!(definition.actions, vec![Action::key_press("a")]);

        let names: Vec<_> = list(&path).unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}

use macro_engine::*;
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .with_target(true)
        .with_test_writer()
        .try_init();
}

fn test_config() -> EngineConfig {
    EngineConfig {
        action_delay_ms: 0,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_press_delay_loop_scenario_end_to_end() {
    init_tracing();
    let injector = RecordingInjector::new();
    let system = MacroSystem::new(test_config(), Box::new(injector.clone())).unwrap();
    let id = system
        .create_macro(MacroDefinition::new(
            "walk and jump",
            vec![
                Action::key_press("w"),
                Action::delay(0.5),
                Action::loop_start(3),
                Action::key_press("space"),
                Action::LoopEnd,
            ],
        ))
        .unwrap();

    let started = Instant::now();
    let report = system.start(&id).unwrap().wait().await.unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(injector.pressed_keys(), vec!["w", "space", "space", "space"]);
    // Delay, LoopStart and LoopEnd count as interpreted actions too
    assert_eq!(report.actions_executed, 2 + 1 + 3 * 2);
    system.shutdown().await;
}

#[tokio::test]
async fn test_emergency_stop_hotkey_cancels_runs_in_delay() {
    init_tracing();
    let system = MacroSystem::new(test_config(), Box::new(RecordingInjector::new())).unwrap();
    let id = system
        .create_macro(MacroDefinition::new("long wait", vec![Action::delay(10.0)]).with_hotkey("f8"))
        .unwrap();

    let mut events = system.manager().event_stream();
    assert!(matches!(system.on_hotkey_event("f8"), HotkeyOutcome::Started { .. }));
    let handle = system.start(&id).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert_eq!(system.on_hotkey_event("ctrl+alt+escape"), HotkeyOutcome::EmergencyStop);
    let report = handle.wait().await.unwrap();
    assert_eq!(report.state, RunState::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));

    system.manager().wait_idle().await;
    assert!(system.manager().active_runs().is_empty());

    let mut finished = 0;
    while finished < 2 {
        if let Some(ExecutionEvent::Finished(report)) = events.next().await {
            assert_eq!(report.state, RunState::Cancelled);
            finished += 1;
        }
    }
}

#[tokio::test]
async fn test_concurrency_limit_with_two_slots() {
    init_tracing();
    let config = EngineConfig {
        max_concurrent_macros: 2,
        ..test_config()
    };
    let system = MacroSystem::new(config, Box::new(RecordingInjector::new())).unwrap();
    let id = system
        .create_macro(MacroDefinition::new("short wait", vec![Action::delay(0.2)]))
        .unwrap();

    let first = system.start(&id).unwrap();
    let _second = system.start(&id).unwrap();
    assert!(matches!(
        system.start(&id),
        Err(EngineError::ConcurrencyLimit(ConcurrencyLimitError::GlobalLimit { .. }))
    ));

    first.wait().await.unwrap();
    let third = system.start(&id).unwrap();
    assert_eq!(third.wait().await.unwrap().state, RunState::Completed);
}

#[tokio::test]
async fn test_global_variables_shared_between_macros() {
    init_tracing();
    let injector = RecordingInjector::new();
    let system = MacroSystem::new(test_config(), Box::new(injector.clone())).unwrap();
    let writer = system
        .create_macro(MacroDefinition::new("writer", vec![Action::set("global.target", "dragon")]))
        .unwrap();
    let reader = system
        .create_macro(MacroDefinition::new(
            "reader",
            vec![Action::TypeText {
                text: "attack {{target}}".into(),
            }],
        ))
        .unwrap();

    system.start(&writer).unwrap().wait().await.unwrap();
    let report = system.start(&reader).unwrap().wait().await.unwrap();
    assert!(report.warnings.is_empty());
    assert_eq!(injector.typed_text(), "attack dragon");
    assert_eq!(system.globals().get("target"), Some(Value::Text("dragon".into())));
}

#[tokio::test]
async fn test_statistics_export_document() {
    init_tracing();
    let system = MacroSystem::new(test_config(), Box::new(RecordingInjector::failing_on("x"))).unwrap();
    let good = system
        .create_macro(MacroDefinition::new("good", vec![Action::key_press("a")]).with_id("good"))
        .unwrap();
    let bad = system
        .create_macro(MacroDefinition::new("bad", vec![Action::key_press("x")]).with_id("bad"))
        .unwrap();

    system.start(&good).unwrap().wait().await.unwrap();
    system.start(&good).unwrap().wait().await.unwrap();
    let failed = system.start(&bad).unwrap().wait().await.unwrap();
    assert_eq!(failed.state, RunState::Failed);
    system.stats().flush().await;

    let json: serde_json::Value = serde_json::from_str(&system.stats().to_json().unwrap()).unwrap();
    assert_eq!(json["good"]["run_count"], 2);
    assert_eq!(json["good"]["success_count"], 2);
    assert_eq!(json["bad"]["failure_count"], 1);
    assert!(json["good"]["average_duration_seconds"].is_number());
}

#[tokio::test]
async fn test_document_round_trip_through_files() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("library.json");
    let system = MacroSystem::new(test_config(), Box::new(RecordingInjector::new())).unwrap();
    system
        .create_macro(
            MacroDefinition::new(
                "nested",
                vec![
                    Action::loop_start(2),
                    Action::Condition {
                        expr: "loop_counter == 0".into(),
                        then_branch: vec![Action::key_press("a")],
                        else_branch: vec![Action::loop_start(2), Action::key_press("b"), Action::LoopEnd],
                    },
                    Action::LoopEnd,
                ],
            )
            .with_hotkey("ctrl+shift+n"),
        )
        .unwrap();
    system.save(&path).unwrap();

    let original = system.document();
    let loaded = MacroDocument::load_from_file(&path).unwrap();
    assert_eq!(loaded, original);
}

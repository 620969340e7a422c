//! Admission control and the registry of active runs.

use crate::definition::MacroDefinition;
use crate::engine::{run_control, ExecutionContext, ExecutionEvent, MacroEngine, RunControl, RunId, RunReport, RunSignals};
use crate::errors::{ConcurrencyLimitError, EngineError, Result};
use crate::stats::StatisticsCollector;
use crate::store::MacroStore;
use crate::variables::Value;
use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

/// Something that can start macros by id and halt everything.
///
/// Implemented by [`ConcurrencyManager`]; the hotkey dispatcher and the
/// engine's `HotkeyTrigger` only see this trait.
pub trait MacroLauncher: Send + Sync {
    fn launch(&self, request: LaunchRequest) -> Result<RunId>;

    fn emergency_stop(&self);
}

/// Who asked for a run
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchSource {
    Manual,
    Hotkey(String),
    /// `stop_epoch` is the emergency-stop epoch the parent run was admitted under
    Trigger {
        parent_run: RunId,
        depth: u32,
        stop_epoch: u64,
    },
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub macro_id: String,
    /// Initial execution-local variables
    pub variables: HashMap<String, Value>,
    pub source: LaunchSource,
}

impl LaunchRequest {
    pub fn new(macro_id: impl Into<String>) -> Self {
        Self {
            macro_id: macro_id.into(),
            variables: HashMap::new(),
            source: LaunchSource::Manual,
        }
    }

    pub fn source(mut self, source: LaunchSource) -> Self {
        self.source = source;
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }

    /// Trigger-chain depth; 0 unless started by another macro
    pub fn depth(&self) -> u32 {
        match self.source {
            LaunchSource::Trigger { depth, .. } => depth,
            _ => 0,
        }
    }
}

/// Snapshot of one active run
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: RunId,
    pub macro_id: String,
    pub started_at: DateTime<Utc>,
    pub paused: bool,
    pub source: LaunchSource,
}

struct ActiveRun {
    macro_id: String,
    started_at: DateTime<Utc>,
    source: LaunchSource,
    signals: RunSignals,
}

/// Completion side of an admitted run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    macro_id: String,
    report: oneshot::Receiver<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn macro_id(&self) -> &str {
        &self.macro_id
    }

    /// Resolves once the run is terminal and has left the registry.
    pub async fn wait(self) -> Result<RunReport> {
        self.report
            .await
            .map_err(|_| EngineError::Runtime(format!("run {} ended without a report", self.run_id)))
    }
}

struct ManagerInner {
    engine: Arc<MacroEngine>,
    store: Arc<MacroStore>,
    stats: StatisticsCollector,
    runs: Mutex<HashMap<RunId, ActiveRun>>,
    next_run_id: AtomicU64,
    stop_epoch: watch::Sender<u64>,
    active: watch::Sender<usize>,
    runtime: Handle,
}

/// Bounded set of active runs, one tokio task each.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct ConcurrencyManager {
    inner: Arc<ManagerInner>,
}

impl ConcurrencyManager {
    /// Must be called from within a tokio runtime; runs are spawned onto it.
    pub fn new(engine: Arc<MacroEngine>, store: Arc<MacroStore>, stats: StatisticsCollector) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| EngineError::Runtime(e.to_string()))?;
        let (stop_epoch, _) = watch::channel(0);
        let (active, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                engine,
                store,
                stats,
                runs: Mutex::new(HashMap::new()),
                next_run_id: AtomicU64::new(1),
                stop_epoch,
                active,
                runtime,
            }),
        })
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, ActiveRun>> {
        self.inner.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, definition: &MacroDefinition, request: &LaunchRequest) -> Result<(RunId, RunControl)> {
        let config = self.inner.engine.config();
        let depth = request.depth();
        if depth > config.max_trigger_depth {
            return Err(ConcurrencyLimitError::TriggerDepth {
                depth,
                max: config.max_trigger_depth,
            }
            .into());
        }

        let mut runs = self.runs();
        if definition.single_instance {
            if let Some((&running, _)) = runs.iter().find(|(_, r)| r.macro_id == definition.id) {
                return Err(ConcurrencyLimitError::SingleInstance {
                    macro_id: definition.id.clone(),
                    running,
                }
                .into());
            }
        }
        if runs.len() >= config.max_concurrent_macros {
            return Err(ConcurrencyLimitError::GlobalLimit {
                active: runs.len(),
                limit: config.max_concurrent_macros,
            }
            .into());
        }

        let (signals, control) = run_control(self.inner.stop_epoch.subscribe());
        if let LaunchSource::Trigger {
            parent_run, stop_epoch, ..
        } = request.source
        {
            // Issued by a run the stop has already cancelled
            if stop_epoch != control.admitted_epoch() {
                return Err(ConcurrencyLimitError::StoppedParent { parent_run }.into());
            }
        }

        let run_id = self.inner.next_run_id.fetch_add(1, Ordering::SeqCst);
        runs.insert(
            run_id,
            ActiveRun {
                macro_id: definition.id.clone(),
                started_at: Utc::now(),
                source: request.source.clone(),
                signals,
            },
        );
        self.inner.active.send_replace(runs.len());
        Ok((run_id, control))
    }

    /// Admits and schedules a run. Never queues: refusal is immediate.
    #[instrument(skip(self, request), fields(macro_id = %request.macro_id))]
    pub fn start(&self, request: LaunchRequest) -> Result<RunHandle> {
        let definition = self
            .inner
            .store
            .snapshot(&request.macro_id)
            .ok_or_else(|| EngineError::MacroNotFound(request.macro_id.clone()))?;
        if !definition.enabled {
            return Err(EngineError::MacroDisabled(definition.id.clone()));
        }

        let (run_id, control) = self.admit(&definition, &request)?;
        info!(run_id, source = ?request.source, "Run admitted");

        let depth = request.depth();
        let launcher: Arc<dyn MacroLauncher> = Arc::new(self.clone());
        let context = ExecutionContext::new(run_id, definition)
            .with_variables(request.variables)
            .with_launcher(launcher, depth);

        let engine = self.inner.engine.clone();
        let report = self.spawn_run(run_id, &request.macro_id, async move { engine.run(context, control).await });

        Ok(RunHandle {
            run_id,
            macro_id: request.macro_id,
            report,
        })
    }

    /// Drives an admitted run on its own task. The run leaves the registry
    /// even when that task panics.
    fn spawn_run<F>(&self, run_id: RunId, macro_id: &str, run: F) -> oneshot::Receiver<RunReport>
    where
        F: Future<Output = RunReport> + Send + 'static,
    {
        let (report_tx, report_rx) = oneshot::channel();
        let manager = self.clone();
        let macro_id = macro_id.to_string();
        let started_at = Utc::now();
        let task = self.inner.runtime.spawn(run);
        self.inner.runtime.spawn(async move {
            let report = match task.await {
                Ok(report) => report,
                Err(e) => {
                    error!(run_id, macro_id = %macro_id, "Run task aborted: {}", e);
                    let report = RunReport::aborted(run_id, macro_id, started_at, format!("run task aborted: {e}"));
                    manager.inner.engine.emit(ExecutionEvent::Finished(report.clone()));
                    report
                }
            };
            manager.finish(&report);
            let _ = report_tx.send(report);
        });
        report_rx
    }

    fn finish(&self, report: &RunReport) {
        let remaining = {
            let mut runs = self.runs();
            runs.remove(&report.run_id);
            runs.len()
        };
        self.inner.active.send_replace(remaining);
        self.inner.stats.record(report);
        debug!(run_id = report.run_id, remaining, "Run left the registry");
    }

    pub fn cancel(&self, run_id: RunId) -> Result<()> {
        let runs = self.runs();
        let run = runs.get(&run_id).ok_or(EngineError::RunNotFound(run_id))?;
        info!(run_id, macro_id = %run.macro_id, "Cancelling run");
        run.signals.cancel();
        Ok(())
    }

    /// Cancels every run of one macro. Returns how many were signalled.
    pub fn cancel_macro(&self, macro_id: &str) -> usize {
        let runs = self.runs();
        let mut count = 0;
        for run in runs.values().filter(|r| r.macro_id == macro_id) {
            run.signals.cancel();
            count += 1;
        }
        if count > 0 {
            info!(macro_id, count, "Cancelled runs of macro");
        }
        count
    }

    pub fn pause(&self, run_id: RunId) -> Result<()> {
        let runs = self.runs();
        let run = runs.get(&run_id).ok_or(EngineError::RunNotFound(run_id))?;
        run.signals.pause();
        Ok(())
    }

    pub fn resume(&self, run_id: RunId) -> Result<()> {
        let runs = self.runs();
        let run = runs.get(&run_id).ok_or(EngineError::RunNotFound(run_id))?;
        run.signals.resume();
        Ok(())
    }

    /// Signals every active run to stop at its next check point. Returns at once.
    pub fn trigger_emergency_stop(&self) {
        let active = self.active_count();
        warn!(active, "Emergency stop");
        self.inner.stop_epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Stops every active run and waits until the registry is empty.
    pub async fn emergency_stop(&self) {
        self.trigger_emergency_stop();
        self.wait_idle().await;
        info!("Emergency stop complete, no active runs");
    }

    /// Resolves when no run is active.
    pub async fn wait_idle(&self) {
        let mut active = self.inner.active.subscribe();
        let _ = active.wait_for(|count| *count == 0).await;
    }

    pub fn active_count(&self) -> usize {
        self.runs().len()
    }

    pub fn is_running(&self, macro_id: &str) -> bool {
        self.runs().values().any(|r| r.macro_id == macro_id)
    }

    /// Active runs, oldest first
    pub fn active_runs(&self) -> Vec<RunInfo> {
        let mut all: Vec<RunInfo> = self
            .runs()
            .iter()
            .map(|(&run_id, run)| RunInfo {
                run_id,
                macro_id: run.macro_id.clone(),
                started_at: run.started_at,
                paused: run.signals.is_paused(),
                source: run.source.clone(),
            })
            .collect();
        all.sort_by_key(|r| r.run_id);
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.engine.subscribe()
    }

    /// Live execution events. Events missed by a slow consumer are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = ExecutionEvent> + Send + Unpin {
        let mut rx = self.subscribe();
        Box::pin(stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Execution event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl MacroLauncher for ConcurrencyManager {
    fn launch(&self, request: LaunchRequest) -> Result<RunId> {
        self.start(request).map(|handle| handle.run_id())
    }

    fn emergency_stop(&self) {
        self.trigger_emergency_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::config::EngineConfig;
    use crate::engine::RunState;
    use crate::hotkey::HotkeyDispatcher;
    use crate::input::{InputDispatcher, RecordingInjector};
    use crate::variables::VariableStore;
    use futures::StreamExt;
    use std::time::Duration;

    struct Fixture {
        manager: ConcurrencyManager,
        store: Arc<MacroStore>,
        hotkeys: HotkeyDispatcher,
        stats: StatisticsCollector,
        injector: RecordingInjector,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let injector = RecordingInjector::new();
        let input = Arc::new(InputDispatcher::new(Box::new(injector.clone())));
        let engine = Arc::new(MacroEngine::new(config.clone(), input, Arc::new(VariableStore::new())));
        let store = Arc::new(MacroStore::new());
        let stats = StatisticsCollector::new().unwrap();
        let manager = ConcurrencyManager::new(engine, store.clone(), stats.clone()).unwrap();
        let hotkeys = HotkeyDispatcher::new(&config, Arc::new(manager.clone())).unwrap();
        Fixture {
            manager,
            store,
            hotkeys,
            stats,
            injector,
        }
    }

    fn config(max: usize) -> EngineConfig {
        EngineConfig {
            max_concurrent_macros: max,
            action_delay_ms: 0,
            ..EngineConfig::default()
        }
    }

    impl Fixture {
        fn add(&self, definition: MacroDefinition) -> String {
            self.store.create(definition, &self.hotkeys).unwrap()
        }
    }

    #[tokio::test]
    async fn test_global_limit_refuses_then_recovers() {
        let f = fixture(config(2));
        let slow = f.add(MacroDefinition::new("slow", vec![Action::delay(0.3)]).with_id("slow"));

        let first = f.manager.start(LaunchRequest::new(&slow)).unwrap();
        let _second = f.manager.start(LaunchRequest::new(&slow)).unwrap();
        let third = f.manager.start(LaunchRequest::new(&slow));
        assert!(matches!(
            third,
            Err(EngineError::ConcurrencyLimit(ConcurrencyLimitError::GlobalLimit { active: 2, limit: 2 }))
        ));
        assert_eq!(f.manager.active_count(), 2);

        let report = first.wait().await.unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert!(f.manager.start(LaunchRequest::new(&slow)).is_ok());
    }

    #[tokio::test]
    async fn test_single_instance_rejects_second_run() {
        let f = fixture(config(5));
        let id = f.add(
            MacroDefinition::new("once", vec![Action::delay(0.3)])
                .with_id("once")
                .single_instance(),
        );
        let first = f.manager.start(LaunchRequest::new(&id)).unwrap();
        match f.manager.start(LaunchRequest::new(&id)) {
            Err(EngineError::ConcurrencyLimit(ConcurrencyLimitError::SingleInstance { macro_id, running })) => {
                assert_eq!(macro_id, "once");
                assert_eq!(running, first.run_id());
            }
            other => panic!("expected single-instance refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_macros() {
        let f = fixture(config(5));
        assert!(matches!(
            f.manager.start(LaunchRequest::new("nope")),
            Err(EngineError::MacroNotFound(_))
        ));

        let mut disabled = MacroDefinition::new("off", vec![Action::key_press("a")]).with_id("off");
        disabled.enabled = false;
        f.add(disabled);
        assert!(matches!(
            f.manager.start(LaunchRequest::new("off")),
            Err(EngineError::MacroDisabled(_))
        ));
    }

    #[tokio::test]
    async fn test_emergency_stop_cancels_delay_and_clears_registry() {
        let f = fixture(config(5));
        let id = f.add(MacroDefinition::new("wait", vec![Action::delay(10.0)]));
        let a = f.manager.start(LaunchRequest::new(&id)).unwrap();
        let b = f.manager.start(LaunchRequest::new(&id)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        f.manager.emergency_stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(f.manager.active_count(), 0);
        assert_eq!(a.wait().await.unwrap().state, RunState::Cancelled);
        assert_eq!(b.wait().await.unwrap().state, RunState::Cancelled);

        // Runs admitted after the stop are unaffected by it
        let quick = f.add(MacroDefinition::new("quick", vec![Action::key_press("k")]));
        let report = f.manager.start(LaunchRequest::new(&quick)).unwrap().wait().await.unwrap();
        assert_eq!(report.state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_single_run() {
        let f = fixture(config(5));
        let id = f.add(MacroDefinition::new("wait", vec![Action::delay(10.0)]));
        let a = f.manager.start(LaunchRequest::new(&id)).unwrap();
        let b = f.manager.start(LaunchRequest::new(&id)).unwrap();

        f.manager.cancel(a.run_id()).unwrap();
        assert_eq!(a.wait().await.unwrap().state, RunState::Cancelled);
        assert_eq!(f.manager.active_count(), 1);

        assert!(matches!(f.manager.cancel(999), Err(EngineError::RunNotFound(999))));
        assert_eq!(f.manager.cancel_macro(&id), 1);
        assert_eq!(b.wait().await.unwrap().state, RunState::Cancelled);
    }

    #[tokio::test]
    async fn test_trigger_launches_nested_run_with_depth_cap() {
        let f = fixture(EngineConfig {
            max_trigger_depth: 2,
            ..config(10)
        });
        // Triggers itself; the chain must stop at the depth cap
        f.add(
            MacroDefinition::new(
                "echo",
                vec![
                    Action::key_press("e"),
                    Action::HotkeyTrigger {
                        macro_id: "echo".into(),
                    },
                ],
            )
            .with_id("echo"),
        );

        let report = f.manager.start(LaunchRequest::new("echo")).unwrap().wait().await.unwrap();
        assert!(report.is_success());
        f.manager.wait_idle().await;
        assert_eq!(f.injector.pressed_keys(), vec!["e", "e", "e"]);
    }

    async fn exploding_run() -> RunReport {
        panic!("run task exploded")
    }

    #[tokio::test]
    async fn test_panicked_run_leaves_registry() {
        let f = fixture(config(1));
        let id = f.add(MacroDefinition::new("boom", vec![Action::key_press("a")]).with_id("boom"));
        let definition = f.store.snapshot(&id).unwrap();
        let request = LaunchRequest::new(&id);

        let (run_id, _control) = f.manager.admit(&definition, &request).unwrap();
        assert_eq!(f.manager.active_count(), 1);
        let report = f.manager.spawn_run(run_id, &id, exploding_run()).await.unwrap();

        assert_eq!(report.state, RunState::Failed);
        assert!(report.error.unwrap().contains("aborted"));
        assert_eq!(f.manager.active_count(), 0);
        tokio::time::timeout(Duration::from_secs(1), f.manager.wait_idle())
            .await
            .expect("registry should be idle");

        let again = f.manager.start(LaunchRequest::new(&id)).unwrap().wait().await.unwrap();
        assert!(again.is_success());

        f.stats.flush().await;
        let stats = f.stats.get(&id).unwrap();
        assert_eq!(stats.run_count, 2);
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test]
    async fn test_trigger_from_before_emergency_stop_is_refused() {
        let f = fixture(config(5));
        let id = f.add(MacroDefinition::new("child", vec![Action::key_press("c")]).with_id("child"));
        let trigger = |stop_epoch| {
            LaunchRequest::new(&id).source(LaunchSource::Trigger {
                parent_run: 42,
                depth: 1,
                stop_epoch,
            })
        };

        let before = *f.manager.inner.stop_epoch.borrow();
        f.manager.trigger_emergency_stop();
        let after = *f.manager.inner.stop_epoch.borrow();

        assert!(matches!(
            f.manager.start(trigger(before)),
            Err(EngineError::ConcurrencyLimit(ConcurrencyLimitError::StoppedParent { parent_run: 42 }))
        ));
        assert_eq!(f.manager.active_count(), 0);

        let report = f.manager.start(trigger(after)).unwrap().wait().await.unwrap();
        assert!(report.is_success());
        assert_eq!(f.injector.pressed_keys(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_initial_variables_and_events() {
        let f = fixture(config(5));
        let id = f.add(MacroDefinition::new("greet", vec![Action::TypeText { text: "hi {{who}}".into() }]));
        let mut events = f.manager.event_stream();

        let report = f
            .manager
            .start(LaunchRequest::new(&id).variable("who", "bob"))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(f.injector.typed_text(), "hi bob");

        assert!(matches!(events.next().await, Some(ExecutionEvent::Started { .. })));
        assert!(matches!(
            events.next().await,
            Some(ExecutionEvent::ActionExecuted { index: 0, total: 1, .. })
        ));
        assert!(matches!(events.next().await, Some(ExecutionEvent::Finished(_))));

        f.stats.flush().await;
        assert_eq!(f.stats.get(&id).unwrap().success_count, 1);
    }
}

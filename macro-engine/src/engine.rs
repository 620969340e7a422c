//! The interpreter that runs one macro snapshot to a terminal state.

use crate::action::{Action, CoordinateMode, Easing, MouseButton, Point};
use crate::config::{duration_from_secs, EngineConfig, MAX_SECONDS};
use crate::definition::MacroDefinition;
use crate::errors::{ExecutionError, InterpolationWarning, TimeoutError};
use crate::expression;
use crate::input::{InputCommand, InputDispatcher};
use crate::manager::{LaunchRequest, LaunchSource, MacroLauncher};
use crate::variables::{lookup, render_template, split_scope, Builtins, LocalScope, Scope, Value, VariableStore};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub type RunId = u64;

/// Lifecycle of one run. The last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Pending | RunState::Running)
    }
}

/// Outcome of a terminated run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub macro_id: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub actions_executed: u64,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    /// Execution-local variables at termination
    pub variables: HashMap<String, Value>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Report for a run whose task died before producing one.
    pub fn aborted(run_id: RunId, macro_id: impl Into<String>, started_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        let duration = (Utc::now() - started_at).to_std().unwrap_or_default();
        Self {
            run_id,
            macro_id: macro_id.into(),
            state: RunState::Failed,
            started_at,
            duration,
            actions_executed: 0,
            error: Some(reason.into()),
            warnings: Vec::new(),
            variables: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Started {
        run_id: RunId,
        macro_id: String,
    },
    ActionExecuted {
        run_id: RunId,
        index: usize,
        total: usize,
        description: String,
    },
    Finished(RunReport),
}

/// Per-run flags written by the owner of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Signal {
    cancelled: bool,
    paused: bool,
}

/// Write side of a run's control channel.
#[derive(Debug)]
pub struct RunSignals {
    sender: watch::Sender<Signal>,
}

impl RunSignals {
    pub fn cancel(&self) {
        self.sender.send_modify(|s| s.cancelled = true);
    }

    pub fn pause(&self) {
        self.sender.send_modify(|s| s.paused = true);
    }

    pub fn resume(&self) {
        self.sender.send_modify(|s| s.paused = false);
    }

    pub fn is_paused(&self) -> bool {
        self.sender.borrow().paused
    }
}

/// Read side, owned by the running interpreter.
///
/// A run is cancelled when its own flag is set or when the process-wide stop
/// epoch moves past the value it was admitted under.
#[derive(Debug)]
pub struct RunControl {
    signal: watch::Receiver<Signal>,
    epoch: watch::Receiver<u64>,
    admitted_epoch: u64,
    signal_open: bool,
    epoch_open: bool,
}

/// Creates the control pair for one run, bound to the current stop epoch.
pub fn run_control(epoch: watch::Receiver<u64>) -> (RunSignals, RunControl) {
    let (sender, signal) = watch::channel(Signal::default());
    let admitted_epoch = *epoch.borrow();
    (
        RunSignals { sender },
        RunControl {
            signal,
            epoch,
            admitted_epoch,
            signal_open: true,
            epoch_open: true,
        },
    )
}

impl RunControl {
    pub fn is_cancelled(&self) -> bool {
        self.signal.borrow().cancelled || *self.epoch.borrow() != self.admitted_epoch
    }

    pub fn is_paused(&self) -> bool {
        self.signal.borrow().paused
    }

    /// Stop epoch the run was admitted under
    pub fn admitted_epoch(&self) -> u64 {
        self.admitted_epoch
    }

    /// Waits for any change to either channel. Never resolves once both are closed.
    async fn next_change(&mut self) {
        let (signal_closed, epoch_closed) = tokio::select! {
            r = self.signal.changed(), if self.signal_open => (r.is_err(), false),
            r = self.epoch.changed(), if self.epoch_open => (false, r.is_err()),
            else => (false, false),
        };
        if signal_closed {
            self.signal_open = false;
        }
        if epoch_closed {
            self.epoch_open = false;
        }
        if !self.signal_open && !self.epoch_open {
            std::future::pending::<()>().await;
        }
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&mut self) {
        while !self.is_cancelled() {
            self.next_change().await;
        }
    }
}

/// Everything a run needs besides the engine itself.
pub struct ExecutionContext {
    pub run_id: RunId,
    pub definition: Arc<MacroDefinition>,
    /// Initial execution-local variables
    pub variables: HashMap<String, Value>,
    /// Position in a `HotkeyTrigger` chain; 0 for a directly started run
    pub depth: u32,
    pub launcher: Option<Arc<dyn MacroLauncher>>,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, definition: Arc<MacroDefinition>) -> Self {
        Self {
            run_id,
            definition,
            variables: HashMap::new(),
            depth: 0,
            launcher: None,
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn MacroLauncher>, depth: u32) -> Self {
        self.launcher = Some(launcher);
        self.depth = depth;
        self
    }
}

/// Shared by every run: configuration, the injection queue and the globals.
pub struct MacroEngine {
    config: EngineConfig,
    input: Arc<InputDispatcher>,
    globals: Arc<VariableStore>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl MacroEngine {
    pub fn new(config: EngineConfig, input: Arc<InputDispatcher>, globals: Arc<VariableStore>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            input,
            globals,
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn globals(&self) -> &Arc<VariableStore> {
        &self.globals
    }

    pub fn input(&self) -> &Arc<InputDispatcher> {
        &self.input
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ExecutionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Runs the snapshot in `context` until it terminates.
    #[instrument(skip_all, fields(run_id = context.run_id, macro_id = %context.definition.id))]
    pub async fn run(&self, context: ExecutionContext, control: RunControl) -> RunReport {
        let started_at = Utc::now();
        let start = Instant::now();
        info!(name = %context.definition.name, depth = context.depth, "Starting macro run");
        self.emit(ExecutionEvent::Started {
            run_id: context.run_id,
            macro_id: context.definition.id.clone(),
        });

        let mut interpreter = Interpreter::new(self, &context, control, start);
        let outcome = interpreter.run().await;
        let duration = start.elapsed();

        let (state, error) = match outcome {
            Ok(()) => (RunState::Completed, None),
            Err(Interrupt::Cancelled) => (RunState::Cancelled, None),
            Err(Interrupt::TimedOut) => {
                let timeout = TimeoutError {
                    macro_id: context.definition.id.clone(),
                    elapsed: duration,
                    limit: self.config.max_action_duration(),
                };
                (RunState::TimedOut, Some(timeout.to_string()))
            }
            Err(Interrupt::Failed(e)) => (RunState::Failed, Some(e.to_string())),
        };

        let report = RunReport {
            run_id: context.run_id,
            macro_id: context.definition.id.clone(),
            state,
            started_at,
            duration,
            actions_executed: interpreter.executed,
            error,
            warnings: interpreter.warnings.iter().map(ToString::to_string).collect(),
            variables: interpreter.local.into_values(),
        };

        let duration_ms = duration.as_millis();
        match report.state {
            RunState::Completed => info!(duration_ms, actions = report.actions_executed, "Macro run completed"),
            RunState::Cancelled => info!(duration_ms, "Macro run cancelled"),
            RunState::TimedOut => warn!(duration_ms, "{}", report.error.as_deref().unwrap_or("timed out")),
            _ => error!(duration_ms, "{}", report.error.as_deref().unwrap_or("failed")),
        }

        self.emit(ExecutionEvent::Finished(report.clone()));
        report
    }
}

/// Why interpretation stopped early
#[derive(Debug)]
enum Interrupt {
    Cancelled,
    TimedOut,
    Failed(ExecutionError),
}

#[derive(Debug, Clone, Copy)]
struct LoopFrame {
    /// Index of the `LoopStart`
    start: usize,
    count: u32,
    remaining: u32,
}

/// One action sequence being interpreted: the top-level list or a condition branch.
struct Frame<'a> {
    actions: &'a [Action],
    pc: usize,
    loops: Vec<LoopFrame>,
    prefix: String,
}

impl<'a> Frame<'a> {
    fn new(actions: &'a [Action], prefix: String) -> Self {
        Self {
            actions,
            pc: 0,
            loops: Vec::new(),
            prefix,
        }
    }
}

/// Index of the `LoopEnd` closing the `LoopStart` at `start`.
fn matching_loop_end(actions: &[Action], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (index, action) in actions.iter().enumerate().skip(start) {
        match action {
            Action::LoopStart { .. } => depth += 1,
            Action::LoopEnd => {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

/// Uniform offset in `[-jitter, jitter]` seconds, jitter capped at [`MAX_SECONDS`].
fn jitter_offset(jitter: f64) -> f64 {
    let jitter = jitter.min(MAX_SECONDS);
    if jitter.is_nan() || jitter <= 0.0 {
        return 0.0;
    }
    rand::thread_rng().gen_range(-jitter..=jitter)
}

fn lerp(from: i32, to: i32, t: f64) -> i32 {
    let (from, to) = (f64::from(from), f64::from(to));
    // Float to int casts saturate
    (from + (to - from) * t).round() as i32
}

struct Interpreter<'a> {
    engine: &'a MacroEngine,
    definition: &'a MacroDefinition,
    run_id: RunId,
    depth: u32,
    launcher: Option<&'a Arc<dyn MacroLauncher>>,
    control: RunControl,
    local: LocalScope,
    started: Instant,
    deadline: Instant,
    frames: Vec<Frame<'a>>,
    executed: u64,
    warnings: Vec<InterpolationWarning>,
}

impl<'a> Interpreter<'a> {
    fn new(engine: &'a MacroEngine, context: &'a ExecutionContext, control: RunControl, started: Instant) -> Self {
        let limit = engine.config.max_action_duration();
        let deadline = started
            .checked_add(limit)
            .unwrap_or_else(|| started + Duration::from_secs(60 * 60 * 24 * 365));
        let mut local = LocalScope::with_values(context.variables.clone());
        local.builtins.started = started.into_std();

        Self {
            engine,
            definition: &context.definition,
            run_id: context.run_id,
            depth: context.depth,
            launcher: context.launcher.as_ref(),
            control,
            local,
            started,
            deadline,
            frames: Vec::new(),
            executed: 0,
            warnings: Vec::new(),
        }
    }

    fn fail(&self, location: &str, reason: impl Into<String>) -> Interrupt {
        Interrupt::Failed(ExecutionError::new(&self.definition.id, location, reason))
    }

    async fn run(&mut self) -> Result<(), Interrupt> {
        self.checkpoint().await?;
        let repeat = self.definition.repeat;

        for repeat_index in 0..repeat.count.max(1) {
            if repeat_index > 0 {
                debug!(repeat_index, "Starting next repetition");
                if repeat.delay > 0.0 {
                    self.sleep(duration_from_secs(repeat.delay)).await?;
                }
                self.checkpoint().await?;
            }
            self.local.builtins = Builtins {
                repeat_index,
                started: self.started.into_std(),
                mouse: Some(self.engine.input.cursor()),
                ..Builtins::default()
            };
            self.run_sequence().await?;
        }
        Ok(())
    }

    /// Interprets the action list once, following loops and condition branches.
    async fn run_sequence(&mut self) -> Result<(), Interrupt> {
        let definition: &'a MacroDefinition = self.definition;
        self.frames.clear();
        self.frames.push(Frame::new(&definition.actions, "actions".to_string()));

        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Ok(());
            };
            if frame.pc >= frame.actions.len() {
                self.frames.pop();
                self.refresh_loop_counter();
                continue;
            }

            let actions: &'a [Action] = frame.actions;
            let pc = frame.pc;
            let location = format!("{}[{}]", frame.prefix, pc);
            frame.pc = pc + 1;

            let action = &actions[pc];
            self.local.builtins.action_index = pc;
            debug!(%location, %action, "Executing action");

            self.execute(action, pc, &location).await?;
            self.executed += 1;
            self.engine.emit(ExecutionEvent::ActionExecuted {
                run_id: self.run_id,
                index: pc,
                total: actions.len(),
                description: action.to_string(),
            });

            if action.is_input() {
                self.local.builtins.mouse = Some(self.engine.input.cursor());
                let pause = self.engine.config.action_delay();
                if !pause.is_zero() {
                    self.sleep(pause).await?;
                }
            }
            self.checkpoint().await?;
        }
    }

    async fn execute(&mut self, action: &'a Action, index: usize, location: &str) -> Result<(), Interrupt> {
        match action {
            Action::KeyPress { key } => {
                self.inject(vec![InputCommand::KeyDown(key.clone()), InputCommand::KeyUp(key.clone())], location)
                    .await
            }
            Action::KeyHold { key, duration } => {
                self.inject(vec![InputCommand::KeyDown(key.clone())], location).await?;
                let held = self.sleep(duration_from_secs(*duration)).await;
                let released = self.inject(vec![InputCommand::KeyUp(key.clone())], location).await;
                held.and(released)
            }
            Action::KeyRelease { key } => self.inject(vec![InputCommand::KeyUp(key.clone())], location).await,
            Action::TypeText { text } => {
                let rendered = self.render(text);
                self.inject(vec![InputCommand::TypeText(rendered)], location).await
            }
            Action::KeyCombo { keys } => {
                let mut batch: Vec<InputCommand> = keys.iter().map(|k| InputCommand::KeyDown(k.clone())).collect();
                batch.extend(keys.iter().rev().map(|k| InputCommand::KeyUp(k.clone())));
                self.inject(batch, location).await
            }
            Action::MouseClick {
                button,
                x,
                y,
                mode,
                clicks,
            } => {
                let at = self.target(*x, *y, *mode);
                self.inject(
                    vec![InputCommand::Click {
                        button: *button,
                        at,
                        clicks: (*clicks).max(1),
                    }],
                    location,
                )
                .await
            }
            Action::MouseMove {
                x,
                y,
                duration,
                easing,
                mode,
            } => {
                let from = self.engine.input.cursor();
                let to = self.target(*x, *y, *mode);
                self.glide(from, to, *duration, *easing, location).await
            }
            Action::MouseScroll { dx, dy } => {
                self.inject(vec![InputCommand::Scroll { dx: *dx, dy: *dy }], location).await
            }
            Action::MouseDrag {
                from,
                to,
                duration,
                button,
            } => self.drag(*from, *to, *duration, *button, location).await,
            Action::Delay { seconds, jitter } => {
                let offset = match jitter {
                    Some(j) if *j > 0.0 => jitter_offset(*j),
                    _ => 0.0,
                };
                let seconds = (seconds + offset).max(0.0);
                debug!(seconds, "Delay");
                self.sleep(duration_from_secs(seconds)).await
            }
            Action::LoopStart { count } => {
                if *count == 0 {
                    let actions = self.current_frame().actions;
                    let end = matching_loop_end(actions, index)
                        .ok_or_else(|| self.fail(location, "loop_start has no matching loop_end"))?;
                    self.current_frame().pc = end + 1;
                } else {
                    self.current_frame().loops.push(LoopFrame {
                        start: index,
                        count: *count,
                        remaining: *count,
                    });
                }
                self.refresh_loop_counter();
                Ok(())
            }
            Action::LoopEnd => {
                if self.current_frame().loops.is_empty() {
                    return Err(self.fail(location, "loop_end without an active loop"));
                }
                let frame = self.current_frame();
                if let Some(top) = frame.loops.last_mut() {
                    top.remaining -= 1;
                    if top.remaining > 0 {
                        frame.pc = top.start + 1;
                    } else {
                        frame.loops.pop();
                    }
                }
                self.refresh_loop_counter();
                Ok(())
            }
            Action::Condition {
                expr,
                then_branch,
                else_branch,
            } => {
                let taken = match self.evaluate(expr, location)? {
                    Value::Bool(b) => b,
                    other => {
                        return Err(self.fail(
                            location,
                            format!("condition '{expr}' evaluated to {} '{other}', not a bool", other.type_name()),
                        ))
                    }
                };
                debug!(%expr, taken, "Condition evaluated");
                let (branch, name) = if taken {
                    (then_branch, "then")
                } else {
                    (else_branch, "else")
                };
                if !branch.is_empty() {
                    self.frames.push(Frame::new(branch, format!("{location}.{name}")));
                }
                Ok(())
            }
            Action::VariableSet { name, expr } => self.assign(name, expr, location),
            Action::HotkeyTrigger { macro_id } => {
                self.trigger(macro_id);
                Ok(())
            }
        }
    }

    fn current_frame(&mut self) -> &mut Frame<'a> {
        // run_sequence only executes while a frame exists
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// `loop_counter` follows the innermost active loop across nested branches.
    fn refresh_loop_counter(&mut self) {
        self.local.builtins.loop_counter = self
            .frames
            .iter()
            .rev()
            .find_map(|f| f.loops.last())
            .map(|l| l.count - l.remaining);
    }

    fn target(&self, x: i32, y: i32, mode: CoordinateMode) -> Point {
        match mode {
            CoordinateMode::Absolute => Point::new(x, y),
            CoordinateMode::Relative => {
                let cursor = self.engine.input.cursor();
                Point::new(cursor.x.saturating_add(x), cursor.y.saturating_add(y))
            }
        }
    }

    async fn inject(&self, commands: Vec<InputCommand>, location: &str) -> Result<(), Interrupt> {
        self.engine
            .input
            .execute(commands)
            .await
            .map_err(|e| self.fail(location, format!("injection failed: {e}")))
    }

    async fn glide(&mut self, from: Point, to: Point, duration: f64, easing: Easing, location: &str) -> Result<(), Interrupt> {
        if duration <= 0.0 || from == to {
            return self.inject(vec![InputCommand::MoveTo(to)], location).await;
        }
        let steps = ((duration * 100.0) as usize).max(10);
        let pause = duration_from_secs(duration / steps as f64);
        for step in 1..=steps {
            let t = easing.apply(step as f64 / steps as f64);
            let point = Point::new(lerp(from.x, to.x, t), lerp(from.y, to.y, t));
            self.inject(vec![InputCommand::MoveTo(point)], location).await?;
            if step < steps {
                self.sleep(pause).await?;
            }
        }
        Ok(())
    }

    async fn drag(&mut self, from: Point, to: Point, duration: f64, button: MouseButton, location: &str) -> Result<(), Interrupt> {
        self.inject(vec![InputCommand::MoveTo(from), InputCommand::ButtonDown(button)], location)
            .await?;
        let moved = self.glide(from, to, duration, Easing::Linear, location).await;
        let released = self.inject(vec![InputCommand::ButtonUp(button)], location).await;
        moved.and(released)
    }

    fn render(&mut self, text: &str) -> String {
        let local = &self.local;
        let (rendered, warnings) = self
            .engine
            .globals
            .with_globals(|globals| render_template(text, |name| lookup(local, globals, name)));
        self.record_warnings(warnings);
        rendered
    }

    fn record_warnings(&mut self, warnings: Vec<InterpolationWarning>) {
        for warning in warnings {
            warn!(run_id = self.run_id, placeholder = %warning.placeholder, "{}", warning);
            self.warnings.push(warning);
        }
    }

    fn evaluate(&self, source: &str, location: &str) -> Result<Value, Interrupt> {
        let parsed = expression::parse(source).map_err(|e| self.fail(location, e.to_string()))?;
        let local = &self.local;
        self.engine
            .globals
            .with_globals(|globals| parsed.eval(&|name| lookup(local, globals, name)))
            .map_err(|e| self.fail(location, format!("cannot evaluate '{source}': {e}")))
    }

    /// Evaluation and the write happen under one global lock, so
    /// `global.n = global.n + 1` is atomic across runs.
    fn assign(&mut self, name: &str, expr: &str, location: &str) -> Result<(), Interrupt> {
        let (scope, bare) = split_scope(name);
        let local = &mut self.local;
        let mut warnings = Vec::new();

        let outcome: Result<Value, String> = self.engine.globals.with_globals(|globals| -> Result<Value, String> {
            let value = match expr.strip_prefix('=') {
                Some(source) => {
                    let parsed = expression::parse(source).map_err(|e| e.to_string())?;
                    let view: &HashMap<String, Value> = globals;
                    let reader: &LocalScope = local;
                    parsed
                        .eval(&|n| lookup(reader, view, n))
                        .map_err(|e| format!("cannot evaluate '{source}': {e}"))?
                }
                None => {
                    let (text, unresolved) = render_template(expr, |n| lookup(local, globals, n));
                    warnings = unresolved;
                    Value::infer(&text)
                }
            };
            match scope {
                Scope::Global => {
                    globals.insert(bare.to_string(), value.clone());
                }
                Scope::Local => local.set(bare, value.clone()).map_err(|e| e.to_string())?,
            }
            Ok(value)
        });

        self.record_warnings(warnings);
        let value = outcome.map_err(|reason| self.fail(location, reason))?;
        debug!(name, %value, "Variable set");
        Ok(())
    }

    /// Fire-and-forget. A refused launch is logged and the run continues.
    fn trigger(&self, macro_id: &str) {
        let Some(launcher) = self.launcher else {
            warn!(target_macro = macro_id, "No launcher attached, trigger ignored");
            return;
        };
        let request = LaunchRequest::new(macro_id).source(LaunchSource::Trigger {
            parent_run: self.run_id,
            depth: self.depth + 1,
            stop_epoch: self.control.admitted_epoch(),
        });
        match launcher.launch(request) {
            Ok(run_id) => info!(target_macro = macro_id, child_run = run_id, "Triggered macro"),
            Err(e) => warn!(target_macro = macro_id, "Trigger refused: {}", e),
        }
    }

    /// Sleeps without blocking other runs; cut short by cancellation and by
    /// the run deadline.
    async fn sleep(&mut self, duration: Duration) -> Result<(), Interrupt> {
        let wake = Instant::now().checked_add(duration).unwrap_or(self.deadline);
        let overruns = wake > self.deadline;
        let until = wake.min(self.deadline);

        let cancelled = tokio::select! {
            _ = tokio::time::sleep_until(until) => false,
            _ = self.control.cancelled() => true,
        };
        if cancelled {
            return Err(Interrupt::Cancelled);
        }
        if overruns {
            return Err(Interrupt::TimedOut);
        }
        Ok(())
    }

    fn check_caps(&self) -> Result<(), Interrupt> {
        if self.control.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        if Instant::now() > self.deadline {
            return Err(Interrupt::TimedOut);
        }
        Ok(())
    }

    /// Runs between actions: cancellation, the time cap, then pause.
    async fn checkpoint(&mut self) -> Result<(), Interrupt> {
        self.check_caps()?;
        if !self.control.is_paused() {
            return Ok(());
        }

        info!(run_id = self.run_id, "Run paused");
        let deadline = self.deadline;
        while self.control.is_paused() {
            let timed_out = tokio::select! {
                _ = self.control.next_change() => false,
                _ = tokio::time::sleep_until(deadline) => true,
            };
            if timed_out {
                return Err(Interrupt::TimedOut);
            }
            if self.control.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
        }
        info!(run_id = self.run_id, "Run resumed");
        self.check_caps()
    }
}

//! Input injection: the device seam and the single serialized funnel that
//! every run submits to.
//!
//! Runs never touch an [`InputInjector`] directly. They hand batches of
//! [`InputCommand`]s to the [`InputDispatcher`], whose worker thread executes
//! them one batch at a time, so commands from concurrent runs never
//! interleave inside a batch (a key combo is one batch).

use crate::action::{MouseButton, Point};
use crate::errors::InjectionError;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// The device that synthesizes keyboard and mouse events.
pub trait InputInjector: Send + 'static {
    fn key_down(&mut self, key: &str) -> Result<(), InjectionError>;

    fn key_up(&mut self, key: &str) -> Result<(), InjectionError>;

    /// Types literal text
    fn type_text(&mut self, text: &str) -> Result<(), InjectionError>;

    /// Moves the pointer to absolute screen coordinates
    fn move_to(&mut self, point: Point) -> Result<(), InjectionError>;

    fn button_down(&mut self, button: MouseButton) -> Result<(), InjectionError>;

    fn button_up(&mut self, button: MouseButton) -> Result<(), InjectionError>;

    fn scroll(&mut self, dx: i32, dy: i32) -> Result<(), InjectionError>;

    /// Current pointer position, when the device can report it
    fn cursor_position(&mut self) -> Option<Point> {
        None
    }

    /// Clicks `clicks` times at `at`. The default moves first, then presses.
    fn click(&mut self, button: MouseButton, at: Point, clicks: u32) -> Result<(), InjectionError> {
        self.move_to(at)?;
        for _ in 0..clicks {
            self.button_down(button)?;
            self.button_up(button)?;
        }
        Ok(())
    }
}

/// One primitive device operation
#[derive(Debug, Clone, PartialEq)]
pub enum InputCommand {
    KeyDown(String),
    KeyUp(String),
    TypeText(String),
    MoveTo(Point),
    ButtonDown(MouseButton),
    ButtonUp(MouseButton),
    Click { button: MouseButton, at: Point, clicks: u32 },
    Scroll { dx: i32, dy: i32 },
}

impl InputCommand {
    fn apply(&self, injector: &mut dyn InputInjector) -> Result<(), InjectionError> {
        match self {
            InputCommand::KeyDown(key) => injector.key_down(key),
            InputCommand::KeyUp(key) => injector.key_up(key),
            InputCommand::TypeText(text) => injector.type_text(text),
            InputCommand::MoveTo(point) => injector.move_to(*point),
            InputCommand::ButtonDown(button) => injector.button_down(*button),
            InputCommand::ButtonUp(button) => injector.button_up(*button),
            InputCommand::Click { button, at, clicks } => injector.click(*button, *at, *clicks),
            InputCommand::Scroll { dx, dy } => injector.scroll(*dx, *dy),
        }
    }

    /// Pointer position after this command, if it moves the pointer
    fn cursor_after(&self) -> Option<Point> {
        match self {
            InputCommand::MoveTo(point) => Some(*point),
            InputCommand::Click { at, .. } => Some(*at),
            _ => None,
        }
    }
}

enum Request {
    Batch {
        commands: Vec<InputCommand>,
        reply: oneshot::Sender<Result<(), InjectionError>>,
    },
    Shutdown,
}

/// Serialized queue in front of the injector.
pub struct InputDispatcher {
    sender: mpsc::UnboundedSender<Request>,
    cursor: Arc<Mutex<Point>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InputDispatcher {
    /// Starts the worker thread that owns `injector`.
    pub fn new(mut injector: Box<dyn InputInjector>) -> Self {
        let start = injector.cursor_position().unwrap_or_default();
        let cursor = Arc::new(Mutex::new(start));
        let (sender, receiver) = mpsc::unbounded_channel();

        let worker_cursor = cursor.clone();
        let worker = std::thread::Builder::new()
            .name("macro-input".to_string())
            .spawn(move || run_worker(injector, receiver, worker_cursor));

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to spawn input worker: {}", e);
                None
            }
        };

        Self {
            sender,
            cursor,
            worker: Mutex::new(worker),
        }
    }

    /// Last known pointer position
    pub fn cursor(&self) -> Point {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Executes `commands` as one uninterrupted batch.
    ///
    /// Keys and buttons the batch pressed are released again if a later
    /// command in it fails.
    pub async fn execute(&self, commands: Vec<InputCommand>) -> Result<(), InjectionError> {
        if commands.is_empty() {
            return Ok(());
        }
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Request::Batch { commands, reply })
            .map_err(|_| InjectionError::QueueClosed)?;
        response.await.map_err(|_| InjectionError::QueueClosed)?
    }

    pub async fn send(&self, command: InputCommand) -> Result<(), InjectionError> {
        self.execute(vec![command]).await
    }

    /// Stops the worker after the batches already queued.
    pub fn shutdown(&self) {
        let _ = self.sender.send(Request::Shutdown);
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Input worker panicked");
            }
        }
    }
}

impl Drop for InputDispatcher {
    fn drop(&mut self) {
        let _ = self.sender.send(Request::Shutdown);
    }
}

fn run_worker(
    mut injector: Box<dyn InputInjector>,
    mut receiver: mpsc::UnboundedReceiver<Request>,
    cursor: Arc<Mutex<Point>>,
) {
    debug!("Input worker started");
    while let Some(request) = receiver.blocking_recv() {
        match request {
            Request::Batch { commands, reply } => {
                let result = run_batch(injector.as_mut(), &commands, &cursor);
                let _ = reply.send(result);
            }
            Request::Shutdown => break,
        }
    }
    debug!("Input worker stopped");
}

fn run_batch(
    injector: &mut dyn InputInjector,
    commands: &[InputCommand],
    cursor: &Mutex<Point>,
) -> Result<(), InjectionError> {
    let mut held: Vec<&InputCommand> = Vec::new();

    for command in commands {
        if let Err(e) = command.apply(injector) {
            warn!(?command, "Injection failed: {}", e);
            release_held(injector, &held);
            return Err(e);
        }
        match command {
            InputCommand::KeyDown(_) | InputCommand::ButtonDown(_) => held.push(command),
            InputCommand::KeyUp(key) => held.retain(|c| !matches!(c, InputCommand::KeyDown(k) if k == key)),
            InputCommand::ButtonUp(button) => {
                held.retain(|c| !matches!(c, InputCommand::ButtonDown(b) if b == button))
            }
            _ => {}
        }
        if let Some(point) = command.cursor_after() {
            *cursor.lock().unwrap_or_else(PoisonError::into_inner) = point;
        }
    }
    Ok(())
}

fn release_held(injector: &mut dyn InputInjector, held: &[&InputCommand]) {
    for command in held.iter().rev() {
        let result = match command {
            InputCommand::KeyDown(key) => injector.key_up(key),
            InputCommand::ButtonDown(button) => injector.button_up(*button),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(?command, "Failed to release after injection error: {}", e);
        }
    }
}

/// Records every command instead of touching a device. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingInjector {
    log: Arc<Mutex<Vec<InputCommand>>>,
    fail_on_key: Option<String>,
}

impl RecordingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `key_down(key)` fail with a device error.
    pub fn failing_on(key: impl Into<String>) -> Self {
        Self {
            fail_on_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<InputCommand> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Keys pressed, in order
    pub fn pressed_keys(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                InputCommand::KeyDown(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    pub fn typed_text(&self) -> String {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                InputCommand::TypeText(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn push(&self, command: InputCommand) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).push(command);
    }
}

impl InputInjector for RecordingInjector {
    fn key_down(&mut self, key: &str) -> Result<(), InjectionError> {
        if self.fail_on_key.as_deref() == Some(key) {
            return Err(InjectionError::Device(format!("cannot press '{key}'")));
        }
        self.push(InputCommand::KeyDown(key.to_string()));
        Ok(())
    }

    fn key_up(&mut self, key: &str) -> Result<(), InjectionError> {
        self.push(InputCommand::KeyUp(key.to_string()));
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> Result<(), InjectionError> {
        self.push(InputCommand::TypeText(text.to_string()));
        Ok(())
    }

    fn move_to(&mut self, point: Point) -> Result<(), InjectionError> {
        self.push(InputCommand::MoveTo(point));
        Ok(())
    }

    fn button_down(&mut self, button: MouseButton) -> Result<(), InjectionError> {
        self.push(InputCommand::ButtonDown(button));
        Ok(())
    }

    fn button_up(&mut self, button: MouseButton) -> Result<(), InjectionError> {
        self.push(InputCommand::ButtonUp(button));
        Ok(())
    }

    fn scroll(&mut self, dx: i32, dy: i32) -> Result<(), InjectionError> {
        self.push(InputCommand::Scroll { dx, dy });
        Ok(())
    }

    fn click(&mut self, button: MouseButton, at: Point, clicks: u32) -> Result<(), InjectionError> {
        self.push(InputCommand::Click { button, at, clicks });
        Ok(())
    }
}

/// Dry-run device: logs each command at info level and succeeds.
#[derive(Debug, Default)]
pub struct LoggingInjector {
    position: Point,
}

impl LoggingInjector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InputInjector for LoggingInjector {
    fn key_down(&mut self, key: &str) -> Result<(), InjectionError> {
        info!(key, "key down");
        Ok(())
    }

    fn key_up(&mut self, key: &str) -> Result<(), InjectionError> {
        info!(key, "key up");
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> Result<(), InjectionError> {
        info!(text, "type text");
        Ok(())
    }

    fn move_to(&mut self, point: Point) -> Result<(), InjectionError> {
        debug!(x = point.x, y = point.y, "move");
        self.position = point;
        Ok(())
    }

    fn button_down(&mut self, button: MouseButton) -> Result<(), InjectionError> {
        info!(?button, x = self.position.x, y = self.position.y, "button down");
        Ok(())
    }

    fn button_up(&mut self, button: MouseButton) -> Result<(), InjectionError> {
        info!(?button, x = self.position.x, y = self.position.y, "button up");
        Ok(())
    }

    fn scroll(&mut self, dx: i32, dy: i32) -> Result<(), InjectionError> {
        info!(dx, dy, "scroll");
        Ok(())
    }

    fn cursor_position(&mut self) -> Option<Point> {
        Some(self.position)
    }
}

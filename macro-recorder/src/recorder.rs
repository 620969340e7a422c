use crate::convert::{convert, Precision};
use crate::{CapturedEvent, CapturedEventKind, RecorderError, Result};
use chrono::Local;
use macro_engine::{validate_structure, MacroDefinition};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::{debug, info, instrument, warn};

/// Category given to every recorded draft
pub const RECORDED_CATEGORY: &str = "Recorded";

/// Configuration for the macro recorder
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Whether to record keyboard events
    pub record_keyboard: bool,

    /// Whether to record mouse buttons and the wheel
    pub record_mouse: bool,

    /// Whether to keep pointer motion between clicks
    pub record_mouse_moves: bool,

    /// Minimum time between two recorded moves (milliseconds)
    pub mouse_move_throttle_ms: u64,

    /// Pointer travel (pixels) above which a press/release is a drag
    pub min_drag_distance: f64,

    /// Key presses held at least this long become holds (milliseconds)
    pub hold_threshold_ms: u64,

    pub precision: Precision,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            record_keyboard: true,
            record_mouse: true,
            record_mouse_moves: false,
            mouse_move_throttle_ms: 50,
            min_drag_distance: 5.0,
            hold_threshold_ms: 250,
            precision: Precision::Medium,
        }
    }
}

struct Session {
    started: Instant,
    events: Vec<CapturedEvent>,
}

/// One recording session at a time. The capture layer feeds events in with
/// [`capture`](Self::capture); [`stop`](Self::stop) turns them into a draft.
pub struct MacroRecorder {
    /// Name given to the draft
    pub name: String,
    config: RecorderConfig,
    session: Mutex<Option<Session>>,
    event_tx: broadcast::Sender<CapturedEvent>,
}

impl MacroRecorder {
    pub fn new(name: impl Into<String>, config: RecorderConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            name: name.into(),
            config,
            session: Mutex::new(None),
            event_tx,
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.session().is_some()
    }

    /// Starts a fresh session. Fails if one is already running.
    pub fn start(&self) -> Result<()> {
        let mut session = self.session();
        if session.is_some() {
            return Err(RecorderError::AlreadyRecording);
        }
        *session = Some(Session {
            started: Instant::now(),
            events: Vec::new(),
        });
        info!(name = %self.name, "Starting macro recording");
        Ok(())
    }

    /// Buffer an event stamped by the caller.
    pub fn capture(&self, event: CapturedEvent) -> Result<()> {
        let mut session = self.session();
        let session = session.as_mut().ok_or(RecorderError::NotRecording)?;
        session.events.push(event.clone());
        // No subscribers is fine
        let _ = self.event_tx.send(event);
        Ok(())
    }

    /// Buffer an event stamped with the time elapsed since [`start`](Self::start).
    pub fn capture_now(&self, kind: CapturedEventKind) -> Result<CapturedEvent> {
        let timestamp_ms = {
            let session = self.session();
            let session = session.as_ref().ok_or(RecorderError::NotRecording)?;
            session.started.elapsed().as_millis() as u64
        };
        let event = CapturedEvent::new(timestamp_ms, kind);
        self.capture(event.clone())?;
        Ok(event)
    }

    /// Events buffered so far in the current session
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.session().as_ref().map(|s| s.events.clone()).unwrap_or_default()
    }

    /// Get a stream of events as they are captured. A slow consumer skips
    /// the events it missed and keeps receiving.
    pub fn event_stream(&self) -> impl Stream<Item = CapturedEvent> + Send + Unpin {
        let mut rx = self.event_tx.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Capture stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// End the session and convert it into a validated draft macro with no hotkey.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn stop(&self) -> Result<MacroDefinition> {
        let session = self.session().take().ok_or(RecorderError::NotRecording)?;
        info!(events = session.events.len(), "Stopping macro recording");
        draft(&self.name, &session.events, &self.config)
    }

    /// Save the current session's raw events as JSON
    pub fn save_events<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        info!("Saving captured events to {:?}", path.as_ref());
        let json = serde_json::to_string_pretty(&self.events())?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

/// Read events written by [`MacroRecorder::save_events`].
pub fn load_events<P: AsRef<Path>>(path: P) -> Result<Vec<CapturedEvent>> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Convert `events` and wrap them in a draft macro that passes structural validation.
pub fn draft(name: &str, events: &[CapturedEvent], config: &RecorderConfig) -> Result<MacroDefinition> {
    let actions = convert(events, config);
    if actions.is_empty() {
        return Err(RecorderError::NothingRecorded);
    }
    let mut definition = MacroDefinition::new(name, actions).with_category(RECORDED_CATEGORY);
    definition.description = format!("Recorded {}", Local::now().format("%Y-%m-%d %H:%M"));
    validate_structure(&definition)?;
    debug!(
        macro_id = %definition.id,
        actions = definition.actions.len(),
        "Recorded draft ready"
    );
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use macro_engine::Action;

    #[test]
    fn test_session_lifecycle() {
        let recorder = MacroRecorder::new("draft", RecorderConfig::default());
        assert!(!recorder.is_recording());
        assert!(matches!(
            recorder.capture_now(CapturedEventKind::key_down("a")),
            Err(RecorderError::NotRecording)
        ));

        recorder.start().unwrap();
        assert!(matches!(recorder.start(), Err(RecorderError::AlreadyRecording)));
        recorder.capture(CapturedEvent::new(0, CapturedEventKind::key_down("a"))).unwrap();
        recorder.capture(CapturedEvent::new(30, CapturedEventKind::key_up("a"))).unwrap();
        assert_eq!(recorder.events().len(), 2);

        let definition = recorder.stop().unwrap();
        assert!(!recorder.is_recording());
        assert_eq!(definition.name, "draft");
        assert_eq!(definition.category, RECORDED_CATEGORY);
        assert_eq!(definition.hotkey, None);
        assert_eq!(definition.actions, vec![Action::key_press("a")]);
        assert!(matches!(recorder.stop(), Err(RecorderError::NotRecording)));
    }

    #[test]
    fn test_empty_session_is_rejected() {
        let recorder = MacroRecorder::new("nothing", RecorderConfig::default());
        recorder.start().unwrap();
        recorder.capture(CapturedEvent::new(0, CapturedEventKind::key_down("a"))).unwrap();
        assert!(matches!(recorder.stop(), Err(RecorderError::NothingRecorded)));
    }

    #[tokio::test]
    async fn test_event_stream_survives_lag() {
        use tokio_stream::StreamExt;

        let recorder = MacroRecorder::new("burst", RecorderConfig::default());
        let mut stream = recorder.event_stream();
        recorder.start().unwrap();
        for i in 0..150u64 {
            recorder.capture(CapturedEvent::new(i, CapturedEventKind::key_down("a"))).unwrap();
        }

        // The oldest events were overwritten before the first poll
        let first = stream.next().await.unwrap();
        assert!(first.timestamp_ms > 0);

        recorder.capture(CapturedEvent::new(500, CapturedEventKind::key_up("a"))).unwrap();
        let mut last = first;
        while last.timestamp_ms != 500 {
            last = stream.next().await.unwrap();
        }
        assert_eq!(last.kind, CapturedEventKind::KeyUp { key: "a".into() });
    }

    #[test]
    fn test_capture_now_is_monotonic() {
        let recorder = MacroRecorder::new("clock", RecorderConfig::default());
        recorder.start().unwrap();
        let first = recorder.capture_now(CapturedEventKind::key_down("z")).unwrap();
        let second = recorder.capture_now(CapturedEventKind::key_up("z")).unwrap();
        assert!(second.timestamp_ms >= first.timestamp_ms);
        assert_eq!(first.kind, CapturedEventKind::KeyDown { key: "z".into() });
    }
}

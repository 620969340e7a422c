//! Per-macro run statistics.
//!
//! Reads go straight to a concurrent map and never wait on a run. Writes are
//! queued on a channel and applied in order by a background task, so a run's
//! termination never waits on bookkeeping either.

use crate::definition::MacroStats;
use crate::engine::{RunReport, RunState};
use crate::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

enum StatsMessage {
    Record {
        macro_id: String,
        state: RunState,
        duration: Duration,
        finished_at: DateTime<Utc>,
    },
    Remove(String),
    Flush(oneshot::Sender<()>),
}

/// One row of the statistics export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEntry {
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub cancelled_count: u64,
    pub average_duration_seconds: f64,
}

impl From<&MacroStats> for StatsEntry {
    fn from(stats: &MacroStats) -> Self {
        Self {
            run_count: stats.run_count,
            success_count: stats.success_count,
            failure_count: stats.failure_count,
            cancelled_count: stats.cancelled_count,
            average_duration_seconds: stats.average_duration_seconds,
        }
    }
}

/// Applies one terminated run. Timeouts count as failures; cancellations
/// count as runs but neither success nor failure. The mean is cumulative
/// over every terminated run.
fn apply(stats: &mut MacroStats, state: RunState, duration: Duration, finished_at: DateTime<Utc>) {
    stats.run_count += 1;
    match state {
        RunState::Completed => stats.success_count += 1,
        RunState::Failed | RunState::TimedOut => stats.failure_count += 1,
        RunState::Cancelled => stats.cancelled_count += 1,
        RunState::Pending | RunState::Running => {}
    }
    let n = stats.run_count as f64;
    stats.average_duration_seconds += (duration.as_secs_f64() - stats.average_duration_seconds) / n;
    stats.last_run = Some(finished_at);
}

#[derive(Clone)]
pub struct StatisticsCollector {
    table: Arc<DashMap<String, MacroStats>>,
    sender: mpsc::UnboundedSender<StatsMessage>,
}

impl StatisticsCollector {
    /// Spawns the writer task on the current tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| EngineError::Runtime(e.to_string()))?;
        let table = Arc::new(DashMap::new());
        let (sender, receiver) = mpsc::unbounded_channel();
        runtime.spawn(write_stats(table.clone(), receiver));
        Ok(Self { table, sender })
    }

    /// Loads persisted counters, replacing whatever is held for `macro_id`.
    pub fn seed(&self, macro_id: impl Into<String>, stats: MacroStats) {
        self.table.insert(macro_id.into(), stats);
    }

    /// Queues a terminated run. Returns immediately.
    pub fn record(&self, report: &RunReport) {
        let message = StatsMessage::Record {
            macro_id: report.macro_id.clone(),
            state: report.state,
            duration: report.duration,
            finished_at: report.started_at + chrono::Duration::from_std(report.duration).unwrap_or_else(|_| chrono::Duration::zero()),
        };
        if self.sender.send(message).is_err() {
            debug!(macro_id = %report.macro_id, "Statistics writer gone, run not recorded");
        }
    }

    /// Queues removal, ordered after every record already queued.
    pub fn remove(&self, macro_id: &str) {
        let _ = self.sender.send(StatsMessage::Remove(macro_id.to_string()));
    }

    /// Waits until every write queued so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(StatsMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn get(&self, macro_id: &str) -> Option<MacroStats> {
        self.table.get(macro_id).map(|entry| entry.value().clone())
    }

    /// Document mapping macro id to its counters, ordered by id.
    pub fn export(&self) -> BTreeMap<String, StatsEntry> {
        self.table
            .iter()
            .map(|entry| (entry.key().clone(), StatsEntry::from(entry.value())))
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }
}

async fn write_stats(table: Arc<DashMap<String, MacroStats>>, mut receiver: mpsc::UnboundedReceiver<StatsMessage>) {
    while let Some(message) = receiver.recv().await {
        match message {
            StatsMessage::Record {
                macro_id,
                state,
                duration,
                finished_at,
            } => {
                let mut entry = table.entry(macro_id).or_default();
                apply(entry.value_mut(), state, duration, finished_at);
            }
            StatsMessage::Remove(macro_id) => {
                table.remove(&macro_id);
            }
            StatsMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

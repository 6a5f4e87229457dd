//! Progress reporting.
//!
//! The engine pushes [`ProgressEvent`]s into a [`ProgressReporter`] it does not
//! own. The CLI prints them; a GUI or HTTP layer can forward them anywhere.

use crate::manifest::path_repr;
use crate::model::{Outcome, RunState, RunStatistics};
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::path::PathBuf;

/// The entry processed most recently when an event was emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    #[serde(with = "path_repr")]
    pub source: PathBuf,
    #[serde(with = "path_repr::option")]
    pub destination: Option<PathBuf>,
    pub outcome: Outcome,
}

/// Snapshot sent at every state transition and every batch boundary.
///
/// Serializes to one JSON object, suitable for forwarding as-is.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub state: RunState,
    /// Cumulative counters at the time of the event
    pub statistics: RunStatistics,
    pub last_entry: Option<EntrySummary>,
    pub timestamp: DateTime<Utc>,
}

/// Sink for progress events.
///
/// Called synchronously from the run's thread, so implementations should
/// return quickly.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Forwards events over a channel so another thread can poll them.
pub struct ChannelReporter {
    sender: Sender<ProgressEvent>,
}

impl ChannelReporter {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        ChannelReporter { sender }
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, event: &ProgressEvent) {
        // A dropped receiver only means nobody is watching any more.
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_channel_reporter_forwards_events() {
        let (tx, rx) = unbounded();
        let reporter = ChannelReporter::new(tx);

        reporter.report(&ProgressEvent {
            state: RunState::Scanning,
            statistics: RunStatistics::default(),
            last_entry: None,
            timestamp: Utc::now(),
        });

        let event = rx.try_recv().expect("event should be queued");
        assert_eq!(event.state, RunState::Scanning);
    }

    #[test]
    fn test_event_serializes_to_json() {
        let event = ProgressEvent {
            state: RunState::Copying,
            statistics: RunStatistics {
                files_copied: 3,
                ..RunStatistics::default()
            },
            last_entry: Some(EntrySummary {
                source: PathBuf::from("/exports/a.txt"),
                destination: None,
                outcome: Outcome::Failed,
            }),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["statistics"]["files_copied"], 3);
        assert_eq!(json["last_entry"]["source"], "/exports/a.txt");
        assert_eq!(json["last_entry"]["outcome"], "failed");
        assert!(json["last_entry"]["destination"].is_null());
    }

    #[test]
    fn test_channel_reporter_ignores_closed_receiver() {
        let (tx, rx) = unbounded();
        drop(rx);
        let reporter = ChannelReporter::new(tx);
        reporter.report(&ProgressEvent {
            state: RunState::Completed,
            statistics: RunStatistics::default(),
            last_entry: None,
            timestamp: Utc::now(),
        });
    }
}

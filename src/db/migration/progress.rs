use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use super::sink::NotificationSink;

/// Progress of the version transition currently being applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUpgrade {
    pub to_version: u32,
    pub total_steps: u32,
    pub current_step: u32,
}

/// Snapshot pushed to the notification sink after every progress change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStatus {
    pub start_version: u32,
    pub target_version: u32,
    pub current: CurrentUpgrade,
}

/// Messages sent to notification sinks during an upgrade run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeMessage {
    DbUpgradeStatus(UpgradeStatus),
}

#[derive(Debug)]
struct ProgressState {
    start_version: u32,
    target_version: u32,
    current_version: u32,
    round_total_steps: u32,
    round_current_step: u32,
}

/// Per-run progress reporter handed to every migration unit.
///
/// A round is one version transition, a step is one unit of work inside it.
/// Delivery to the sink is best-effort: a failed send is logged and dropped.
pub struct UpgradeProgress {
    state: ProgressState,
    sink: Arc<dyn NotificationSink>,
}

impl UpgradeProgress {
    pub fn new(sink: Arc<dyn NotificationSink>, start_version: u32, target_version: u32) -> Self {
        Self {
            state: ProgressState {
                start_version,
                target_version,
                current_version: start_version,
                round_total_steps: 0,
                round_current_step: 0,
            },
            sink,
        }
    }

    /// Starts the round that upgrades the database to `version`.
    pub fn new_round(&mut self, version: u32) {
        self.state.current_version = version;
        self.state.round_total_steps = 0;
        self.state.round_current_step = 0;
        self.notify();
    }

    /// Sets the step count of the current round. Reported with the next notification.
    pub fn set_total_steps(&mut self, steps: u32) {
        self.state.round_total_steps = steps;
    }

    pub fn new_step(&mut self) {
        self.state.round_current_step += 1;
        self.notify();
    }

    pub fn snapshot(&self) -> UpgradeStatus {
        UpgradeStatus {
            start_version: self.state.start_version,
            target_version: self.state.target_version,
            current: CurrentUpgrade {
                to_version: self.state.current_version,
                total_steps: self.state.round_total_steps,
                current_step: self.state.round_current_step,
            },
        }
    }

    fn notify(&self) {
        let message = UpgradeMessage::DbUpgradeStatus(self.snapshot());
        if let Err(e) = self.sink.send(message) {
            warn!("Dropping database upgrade progress notification: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migration::sink::BroadcastSink;
    use crate::error::HoardError;
    use pretty_assertions::assert_eq;

    struct FailingSink;

    impl NotificationSink for FailingSink {
        fn send(&self, _message: UpgradeMessage) -> Result<(), HoardError> {
            Err(HoardError::Error("transport is down".to_string()))
        }
    }

    fn status(to_version: u32, total_steps: u32, current_step: u32) -> UpgradeMessage {
        UpgradeMessage::DbUpgradeStatus(UpgradeStatus {
            start_version: 5,
            target_version: 7,
            current: CurrentUpgrade {
                to_version,
                total_steps,
                current_step,
            },
        })
    }

    #[test]
    fn test_round_and_steps_notify() {
        let sink = Arc::new(BroadcastSink::new());
        let mut progress = UpgradeProgress::new(sink.clone(), 5, 7);

        progress.new_round(6);
        progress.set_total_steps(2);
        progress.new_step();
        progress.new_step();
        progress.new_round(7);

        assert_eq!(
            sink.history(),
            vec![status(6, 0, 0), status(6, 2, 1), status(6, 2, 2), status(7, 0, 0)]
        );
    }

    #[test]
    fn test_new_round_resets_counters() {
        let sink = Arc::new(BroadcastSink::new());
        let mut progress = UpgradeProgress::new(sink, 5, 7);
        progress.new_round(6);
        progress.set_total_steps(3);
        progress.new_step();

        progress.new_round(7);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.current.to_version, 7);
        assert_eq!(snapshot.current.total_steps, 0);
        assert_eq!(snapshot.current.current_step, 0);
    }

    #[test]
    fn test_initial_snapshot_points_at_start() {
        let progress = UpgradeProgress::new(Arc::new(BroadcastSink::new()), 5, 7);
        assert_eq!(progress.snapshot().current.to_version, 5);
    }

    #[test]
    fn test_sink_failure_is_swallowed() {
        let mut progress = UpgradeProgress::new(Arc::new(FailingSink), 5, 7);
        progress.new_round(6);
        progress.set_total_steps(1);
        progress.new_step();
        assert_eq!(progress.snapshot().current.current_step, 1);
    }

    #[test]
    fn test_message_wire_format() {
        let json = serde_json::to_value(status(6, 2, 1)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "DB_UPGRADE_STATUS",
                "data": {
                    "start_version": 5,
                    "target_version": 7,
                    "current": {"to_version": 6, "total_steps": 2, "current_step": 1}
                }
            })
        );
    }
}

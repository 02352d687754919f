use std::io::{self, Write};
use std::sync::Mutex;

use tokio::sync::broadcast;

use super::progress::UpgradeMessage;
use crate::error::HoardError;

/// Receiver of upgrade progress messages.
///
/// Sends are fire-and-forget from the upgrade's point of view: an error is
/// logged by the caller and never aborts the run.
pub trait NotificationSink: Send + Sync {
    fn send(&self, message: UpgradeMessage) -> Result<(), HoardError>;
}

/// Sink that keeps a replayable history and broadcasts live messages.
///
/// A transport (websocket, SSE) subscribes to get everything sent so far plus
/// a receiver for what follows.
pub struct BroadcastSink {
    tx: broadcast::Sender<UpgradeMessage>,
    history: Mutex<Vec<UpgradeMessage>>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel::<UpgradeMessage>(256);
        Self {
            tx,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Returns past messages and a receiver for future ones.
    pub fn subscribe(&self) -> (Vec<UpgradeMessage>, broadcast::Receiver<UpgradeMessage>) {
        // Subscribe before reading history so nothing sent in between is lost
        // (at worst a message shows up twice).
        let rx = self.tx.subscribe();
        (self.history(), rx)
    }

    pub fn history(&self) -> Vec<UpgradeMessage> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for BroadcastSink {
    fn send(&self, message: UpgradeMessage) -> Result<(), HoardError> {
        self.history
            .lock()
            .map_err(|_| HoardError::Error("Upgrade history lock poisoned".to_string()))?
            .push(message.clone());
        // No live receivers is fine, the history still has the message.
        let _ = self.tx.send(message);
        Ok(())
    }
}

/// Sink that prints one line per message, used by the command line.
pub struct ConsoleSink;

impl ConsoleSink {
    fn format(message: &UpgradeMessage) -> String {
        match message {
            UpgradeMessage::DbUpgradeStatus(status) => {
                let current = &status.current;
                if current.total_steps == 0 {
                    format!(
                        "Upgrading database to v{} (target v{})",
                        current.to_version, status.target_version
                    )
                } else {
                    format!(
                        "  v{}: step {}/{}",
                        current.to_version, current.current_step, current.total_steps
                    )
                }
            }
        }
    }

    /// Writes one formatted line. A closed or failing writer is an error, never a panic.
    pub fn write_line<W: Write>(out: &mut W, message: &UpgradeMessage) -> Result<(), HoardError> {
        writeln!(out, "{}", Self::format(message))?;
        out.flush()?;
        Ok(())
    }
}

impl NotificationSink for ConsoleSink {
    fn send(&self, message: UpgradeMessage) -> Result<(), HoardError> {
        Self::write_line(&mut io::stdout().lock(), &message)
    }
}

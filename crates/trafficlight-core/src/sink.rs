//! Output sinks: where a signal unit's lamp levels end up.
//!
//! The core never touches hardware. Every [`SignalUnit`] owns one
//! [`OutputSink`] and calls it synchronously, while holding the unit's
//! lock, whenever the active phase changes. Writes therefore have to be
//! fast and must tolerate the same state being written twice.
//!
//! [`SignalUnit`]: crate::unit::SignalUnit

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::info;
use trafficlight_types::OutputState;

/// A failed write to an output device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The device rejected or failed the write.
    #[error("write to {device} failed: {message}")]
    Write {
        /// Label of the device that failed.
        device: String,
        /// Description of the failure.
        message: String,
    },
}

/// Capability to show an output state on a device.
pub trait OutputSink: Send + Sync {
    /// Show `state` on the device.
    ///
    /// Called with the owning unit's lock held: must not block.
    fn write_state(&self, state: &OutputState) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// TracingSink
// ---------------------------------------------------------------------------

/// Console "lamps": every write is logged as a structured event.
#[derive(Debug, Clone)]
pub struct TracingSink {
    device: String,
}

impl TracingSink {
    /// Create a sink that logs under the given device label.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl OutputSink for TracingSink {
    fn write_state(&self, state: &OutputState) -> Result<(), SinkError> {
        info!(device = %self.device, lamps = %state, "lamps");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// In-memory sink that remembers every state written to it.
///
/// Failures can be injected with [`fail_next`](Self::fail_next); a failed
/// write is counted but not added to the history.
#[derive(Debug, Default)]
pub struct RecordingSink {
    device: String,
    inner: Mutex<RecordingInner>,
}

#[derive(Debug, Default)]
struct RecordingInner {
    history: Vec<OutputState>,
    attempts: u64,
    pending_failures: u32,
}

impl RecordingSink {
    /// Create an empty recording sink.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            inner: Mutex::new(RecordingInner::default()),
        }
    }

    /// Make the next `count` writes fail.
    pub fn fail_next(&self, count: u32) {
        self.lock().pending_failures = count;
    }

    /// The most recently written state.
    pub fn last(&self) -> Option<OutputState> {
        self.lock().history.last().cloned()
    }

    /// Every successfully written state, oldest first.
    pub fn history(&self) -> Vec<OutputState> {
        self.lock().history.clone()
    }

    /// Number of write attempts, failed ones included.
    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }

    fn lock(&self) -> MutexGuard<'_, RecordingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OutputSink for RecordingSink {
    fn write_state(&self, state: &OutputState) -> Result<(), SinkError> {
        let mut inner = self.lock();
        inner.attempts = inner.attempts.saturating_add(1);
        if inner.pending_failures > 0 {
            inner.pending_failures = inner.pending_failures.saturating_sub(1);
            return Err(SinkError::Write {
                device: self.device.clone(),
                message: "injected failure".to_owned(),
            });
        }
        inner.history.push(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use trafficlight_types::Lamp;

    use super::*;

    #[test]
    fn recording_sink_keeps_history() {
        let sink = RecordingSink::new("test");
        let red = OutputState::lit(&[Lamp::Red]);
        let green = OutputState::lit(&[Lamp::Green]);
        assert!(sink.write_state(&red).is_ok());
        assert!(sink.write_state(&green).is_ok());
        assert_eq!(sink.history(), vec![red, green.clone()]);
        assert_eq!(sink.last(), Some(green));
        assert_eq!(sink.attempts(), 2);
    }

    #[test]
    fn injected_failures_are_counted_not_recorded() {
        let sink = RecordingSink::new("flaky");
        sink.fail_next(1);
        let red = OutputState::lit(&[Lamp::Red]);
        let err = sink.write_state(&red);
        assert_eq!(
            err,
            Err(SinkError::Write {
                device: "flaky".to_owned(),
                message: "injected failure".to_owned(),
            })
        );
        assert!(sink.last().is_none());
        assert!(sink.write_state(&red).is_ok());
        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.history().len(), 1);
    }

    #[test]
    fn tracing_sink_never_fails() {
        let sink = TracingSink::new("North");
        assert!(sink.write_state(&OutputState::dark()).is_ok());
    }
}

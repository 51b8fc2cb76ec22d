//! Diagnostics reported by workers and the conductor.
//!
//! Per-unit failures never stop a worker or escalate to the conductor's
//! lifecycle. They are logged where they happen and published on a
//! bounded [`broadcast`] channel so the application can decide what to
//! do about them. Nobody listening is fine: the log line remains.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of the diagnostics channel. Slow subscribers lag, they never
/// block a worker.
pub const DIAGNOSTICS_CAPACITY: usize = 256;

/// A notable, non-fatal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A sink write failed. `tick` is `None` for writes caused by a
    /// program change rather than a tick.
    SinkFailure {
        /// Name of the unit.
        unit: String,
        /// Tick generation being consumed, if any.
        tick: Option<u64>,
        /// The error message.
        message: String,
    },
    /// A unit could not process a tick or program change for a reason
    /// other than its sink.
    UnitFault {
        /// Name of the unit.
        unit: String,
        /// Tick generation being consumed, if any.
        tick: Option<u64>,
        /// The error message.
        message: String,
    },
    /// A worker woke up more than one tick behind and is catching up.
    TickOverrun {
        /// Name of the unit.
        unit: String,
        /// Latest tick generation observed.
        tick: u64,
        /// Ticks still owed before `tick`.
        behind: u64,
    },
    /// A worker task panicked.
    WorkerPanicked {
        /// Label of the task.
        unit: String,
        /// Panic or join error text.
        message: String,
    },
    /// Tasks failed to exit within the join grace period.
    ShutdownTimeout {
        /// Labels of the tasks still running.
        units: Vec<String>,
        /// The grace period that elapsed.
        grace_ms: u64,
    },
}

impl Diagnostic {
    /// Short name of the variant, matching its serialized `kind` tag.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SinkFailure { .. } => "sink_failure",
            Self::UnitFault { .. } => "unit_fault",
            Self::TickOverrun { .. } => "tick_overrun",
            Self::WorkerPanicked { .. } => "worker_panicked",
            Self::ShutdownTimeout { .. } => "shutdown_timeout",
        }
    }

    fn log(&self) {
        match self {
            Self::SinkFailure {
                unit,
                tick,
                message,
            } => warn!(unit = %unit, tick = ?tick, error = %message, "sink write failed"),
            Self::UnitFault {
                unit,
                tick,
                message,
            } => warn!(unit = %unit, tick = ?tick, error = %message, "unit fault"),
            Self::TickOverrun { unit, tick, behind } => {
                debug!(unit = %unit, tick, behind, "worker catching up on missed ticks");
            }
            Self::WorkerPanicked { unit, message } => {
                warn!(unit = %unit, error = %message, "worker task panicked");
            }
            Self::ShutdownTimeout { units, grace_ms } => {
                warn!(units = ?units, grace_ms, "tasks still running after join grace period");
            }
        }
    }
}

/// Cloneable publishing handle held by the conductor and every worker.
#[derive(Debug, Clone)]
pub(crate) struct DiagnosticsSender {
    tx: broadcast::Sender<Diagnostic>,
}

impl DiagnosticsSender {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DIAGNOSTICS_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.tx.subscribe()
    }

    /// Log and publish. Never blocks, never fails.
    pub(crate) fn report(&self, diagnostic: Diagnostic) {
        diagnostic.log();
        let _ = self.tx.send(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_reports() {
        let sender = DiagnosticsSender::new();
        let mut rx = sender.subscribe();
        sender.report(Diagnostic::TickOverrun {
            unit: "North".to_owned(),
            tick: 5,
            behind: 2,
        });
        let received = rx.recv().await;
        assert_eq!(
            received.ok(),
            Some(Diagnostic::TickOverrun {
                unit: "North".to_owned(),
                tick: 5,
                behind: 2,
            })
        );
    }

    #[test]
    fn report_without_subscribers_is_fine() {
        let sender = DiagnosticsSender::new();
        sender.report(Diagnostic::ShutdownTimeout {
            units: vec!["East".to_owned()],
            grace_ms: 100,
        });
    }

    #[test]
    fn serializes_with_kind_tag() {
        let diagnostic = Diagnostic::SinkFailure {
            unit: "East".to_owned(),
            tick: Some(3),
            message: "boom".to_owned(),
        };
        let json = serde_json::to_value(&diagnostic).ok();
        assert_eq!(
            json.as_ref().and_then(|v| v.get("kind")).and_then(|k| k.as_str()),
            Some(diagnostic.kind())
        );
    }
}

//! Signal worker: the task that feeds ticks to one signal unit.
//!
//! A worker waits on the conductor's tick broadcast. For every tick
//! generation it sees it calls [`SignalUnit::consume_tick`] exactly once,
//! in order. If it wakes up late and finds it has missed generations, it
//! consumes each of them before waiting again; ticks are never merged or
//! dropped for a live worker.
//!
//! Stop is cooperative. The worker checks for it before every tick, so a
//! transition already in progress always completes, and no tick is taken
//! once the stop is visible.

use std::sync::Arc;

use tokio::runtime::RuntimeFlavor;
use tokio::sync::{Barrier, watch};
use tracing::{debug, trace};

use crate::diagnostics::{Diagnostic, DiagnosticsSender};
use crate::tick::Beat;
use crate::unit::{SignalUnit, TickOutcome, UnitError};

/// Worker bound to one unit and the shared tick broadcast.
pub(crate) struct SignalWorker {
    /// The unit this worker drives.
    unit: Arc<SignalUnit>,
    /// Subscription to the conductor's tick broadcast.
    beats: watch::Receiver<Beat>,
    /// Where sink failures and overruns are reported.
    diagnostics: DiagnosticsSender,
    /// Last tick generation consumed.
    last_tick: u64,
}

impl SignalWorker {
    pub(crate) const fn new(
        unit: Arc<SignalUnit>,
        beats: watch::Receiver<Beat>,
        diagnostics: DiagnosticsSender,
    ) -> Self {
        Self {
            unit,
            beats,
            diagnostics,
            last_tick: 0,
        }
    }

    pub(crate) fn unit_name(&self) -> &str {
        self.unit.name()
    }

    /// Run until stop. `ready` is passed once the worker is subscribed and
    /// about to wait for its first tick.
    pub(crate) async fn run(mut self, ready: Arc<Barrier>) {
        let _ = ready.wait().await;
        debug!(unit = %self.unit.name(), "worker waiting for ticks");

        loop {
            if self.beats.changed().await.is_err() {
                debug!(unit = %self.unit.name(), "tick bus closed");
                break;
            }
            let beat = *self.beats.borrow_and_update();
            let target = match beat {
                Beat::Idle => continue,
                Beat::Stop => break,
                Beat::Tick(generation) => generation,
            };
            if !self.catch_up(target) {
                break;
            }
        }

        debug!(
            unit = %self.unit.name(),
            last_tick = self.last_tick,
            ticks_consumed = self.unit.ticks_consumed(),
            "worker stopped"
        );
    }

    /// Consume every generation up to `target`. Returns `false` if a stop
    /// became visible first.
    fn catch_up(&mut self, target: u64) -> bool {
        let owed = target.saturating_sub(self.last_tick);
        if owed > 1 {
            self.diagnostics.report(Diagnostic::TickOverrun {
                unit: self.unit.name().to_owned(),
                tick: target,
                behind: owed.saturating_sub(1),
            });
        }

        while self.last_tick < target {
            if *self.beats.borrow() == Beat::Stop {
                return false;
            }
            self.last_tick = self.last_tick.saturating_add(1);
            self.consume(self.last_tick);
        }
        true
    }

    fn consume(&self, tick: u64) {
        match off_runtime(|| self.unit.consume_tick()) {
            Ok(TickOutcome::Advanced { phase }) => {
                trace!(unit = %self.unit.name(), tick, phase, "tick advanced phase");
            }
            Ok(TickOutcome::Held { .. }) => {}
            Err(UnitError::Io { unit, source }) => {
                self.diagnostics.report(Diagnostic::SinkFailure {
                    unit,
                    tick: Some(tick),
                    message: source.to_string(),
                });
            }
            Err(err) => {
                self.diagnostics.report(Diagnostic::UnitFault {
                    unit: self.unit.name().to_owned(),
                    tick: Some(tick),
                    message: err.to_string(),
                });
            }
        }
    }
}

/// Run a call that may block in a sink write.
///
/// On a multi-thread runtime the call runs under
/// [`tokio::task::block_in_place`], leaving the timer and the runtime clock
/// free while a sink is stuck. Elsewhere it runs in place.
fn off_runtime<T>(call: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(call)
        }
        _ => call(),
    }
}

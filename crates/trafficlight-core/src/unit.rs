//! Signal unit: the phase state machine behind one signal head.
//!
//! A unit holds the program it is running, the index of the active phase,
//! and how many ticks remain before the next phase. All three are replaced
//! together under the unit's own lock, so a program switch racing with a
//! tick is fully serialized: the unit never combines the phase of one
//! program with the timing of another.
//!
//! The output sink is written inside the same critical section, which
//! keeps the device in step with the phase index. Each unit has its own
//! lock; units never contend with each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;
use trafficlight_types::{OutputState, Program, ProgramAssignment, UnitId};

use crate::sink::{OutputSink, SinkError};

/// Errors raised by signal unit operations.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    /// The requested start phase does not exist in the program.
    #[error("unit {unit}: phase index {index} out of range for program of {len} phases")]
    InvalidPhaseIndex {
        /// Name of the unit.
        unit: String,
        /// The rejected index.
        index: usize,
        /// Number of phases in the program.
        len: usize,
    },

    /// The output sink failed to show the new state.
    #[error("unit {unit}: {source}")]
    Io {
        /// Name of the unit.
        unit: String,
        /// The underlying sink error.
        source: SinkError,
    },

    /// A thread panicked while holding the unit's lock.
    #[error("unit {unit}: state lock poisoned")]
    LockPoisoned {
        /// Name of the unit.
        unit: String,
    },
}

/// What a single consumed tick did to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The active phase continues.
    Held {
        /// Ticks left in the active phase.
        remaining: u32,
    },
    /// The unit moved on to a new phase.
    Advanced {
        /// Index of the new phase.
        phase: usize,
    },
}

/// Consistent view of a unit's state, read under its lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSnapshot {
    /// Index of the active phase.
    pub phase: usize,
    /// Ticks left before the next phase.
    pub remaining_ticks: u32,
    /// Number of phases in the running program.
    pub program_len: usize,
    /// Output state of the active phase.
    pub output: OutputState,
}

#[derive(Debug)]
struct UnitState {
    /// Program being run.
    program: Arc<Program>,
    /// Index of the current phase.
    phase: usize,
    /// Ticks left before the next phase.
    remaining: u32,
}

/// One signal head driven through a phase program.
pub struct SignalUnit {
    /// Unique identifier.
    id: UnitId,
    /// Human-readable name, used in logs and diagnostics.
    name: String,
    /// Where lamp states are written.
    sink: Arc<dyn OutputSink>,
    /// Phase state; sink writes happen while it is held.
    state: Mutex<UnitState>,
    /// Ticks consumed so far.
    ticks_consumed: AtomicU64,
    /// Failed sink writes so far.
    sink_failures: AtomicU64,
}

impl std::fmt::Debug for SignalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalUnit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SignalUnit {
    /// Create a unit bound to `sink` and show the assignment's start phase.
    ///
    /// # Errors
    ///
    /// Returns [`UnitError::InvalidPhaseIndex`] if the start phase is out of
    /// range, or [`UnitError::Io`] if the first write fails.
    pub fn new(
        name: impl Into<String>,
        sink: Arc<dyn OutputSink>,
        assignment: &ProgramAssignment,
    ) -> Result<Self, UnitError> {
        let name = name.into();
        let (phase, remaining, output) =
            start_of(&name, &assignment.program, assignment.initial_phase)?;
        let unit = Self {
            id: UnitId::new(),
            name,
            sink,
            state: Mutex::new(UnitState {
                program: Arc::clone(&assignment.program),
                phase,
                remaining,
            }),
            ticks_consumed: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
        };
        unit.write(output)?;
        Ok(unit)
    }

    /// Unique identifier of this unit.
    pub const fn id(&self) -> UnitId {
        self.id
    }

    /// Human-readable name used in logs and diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the running program and jump to `initial_phase`.
    ///
    /// The index is checked before anything changes. On success the new
    /// phase's output is written immediately and its full duration starts
    /// counting down.
    ///
    /// # Errors
    ///
    /// Returns [`UnitError::InvalidPhaseIndex`] (state untouched) for an
    /// out-of-range index, or [`UnitError::Io`] if the sink write fails.
    /// After an I/O failure the new program is still active; the next
    /// phase change writes again.
    pub fn set_program(
        &self,
        program: Arc<Program>,
        initial_phase: usize,
    ) -> Result<(), UnitError> {
        let (phase, remaining, output) = start_of(&self.name, &program, initial_phase)?;
        let mut state = self.lock()?;
        state.program = program;
        state.phase = phase;
        state.remaining = remaining;
        debug!(unit = %self.name, phase, remaining, lamps = %output, "program set");
        self.write(output)
    }

    /// [`set_program`](Self::set_program) from a prepared assignment.
    pub fn apply(&self, assignment: &ProgramAssignment) -> Result<(), UnitError> {
        self.set_program(Arc::clone(&assignment.program), assignment.initial_phase)
    }

    /// Consume one tick.
    ///
    /// Decrements the remaining ticks; when they reach zero the unit moves
    /// to the next phase (wrapping), writes its output, and restarts the
    /// countdown from the new phase's duration.
    ///
    /// # Errors
    ///
    /// Returns [`UnitError::Io`] if the phase changed but the sink write
    /// failed; the phase change itself stands.
    pub fn consume_tick(&self) -> Result<TickOutcome, UnitError> {
        let mut state = self.lock()?;
        self.ticks_consumed.fetch_add(1, Ordering::Relaxed);

        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining > 0 {
            return Ok(TickOutcome::Held {
                remaining: state.remaining,
            });
        }

        let next = state.program.next_index(state.phase);
        let (phase, remaining, output) = start_of(&self.name, &state.program, next)?;
        state.phase = phase;
        state.remaining = remaining;
        debug!(unit = %self.name, phase, remaining, lamps = %output, "phase advanced");
        self.write(output)?;
        Ok(TickOutcome::Advanced { phase })
    }

    /// Read the active phase, countdown, and output together.
    pub fn snapshot(&self) -> Result<UnitSnapshot, UnitError> {
        let state = self.lock()?;
        let output = state
            .program
            .phase(state.phase)
            .map(|phase| phase.state.clone())
            .ok_or_else(|| UnitError::InvalidPhaseIndex {
                unit: self.name.clone(),
                index: state.phase,
                len: state.program.len(),
            })?;
        Ok(UnitSnapshot {
            phase: state.phase,
            remaining_ticks: state.remaining,
            program_len: state.program.len(),
            output,
        })
    }

    /// Total ticks this unit has consumed.
    pub fn ticks_consumed(&self) -> u64 {
        self.ticks_consumed.load(Ordering::Relaxed)
    }

    /// Total failed sink writes.
    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, UnitState>, UnitError> {
        self.state.lock().map_err(|_err| UnitError::LockPoisoned {
            unit: self.name.clone(),
        })
    }

    fn write(&self, output: OutputState) -> Result<(), UnitError> {
        self.sink.write_state(&output).map_err(|source| {
            self.sink_failures.fetch_add(1, Ordering::Relaxed);
            UnitError::Io {
                unit: self.name.clone(),
                source,
            }
        })
    }
}

/// Resolve the phase at `index`: its index, duration, and output.
fn start_of(
    unit: &str,
    program: &Program,
    index: usize,
) -> Result<(usize, u32, OutputState), UnitError> {
    program
        .phase(index)
        .map(|phase| (index, phase.duration_ticks(), phase.state.clone()))
        .ok_or_else(|| UnitError::InvalidPhaseIndex {
            unit: unit.to_owned(),
            index,
            len: program.len(),
        })
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use trafficlight_types::Lamp;

    use super::*;
    use crate::sink::RecordingSink;

    fn four_phase() -> Arc<Program> {
        Arc::new(
            Program::from_steps([
                (OutputState::lit(&[Lamp::Red]), 3),
                (OutputState::lit(&[Lamp::Red, Lamp::Yellow]), 1),
                (OutputState::lit(&[Lamp::Green]), 3),
                (OutputState::lit(&[Lamp::Yellow]), 1),
            ])
            .unwrap(),
        )
    }

    fn make_unit(initial_phase: usize) -> (SignalUnit, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new("test"));
        let assignment = ProgramAssignment::new(four_phase(), initial_phase);
        let unit = SignalUnit::new("North", Arc::clone(&sink) as Arc<dyn OutputSink>, &assignment)
            .unwrap();
        (unit, sink)
    }

    #[test]
    fn new_writes_start_phase() {
        let (unit, sink) = make_unit(2);
        assert_eq!(sink.last(), Some(OutputState::lit(&[Lamp::Green])));
        let snapshot = unit.snapshot().unwrap();
        assert_eq!(snapshot.phase, 2);
        assert_eq!(snapshot.remaining_ticks, 3);
        assert_eq!(snapshot.program_len, 4);
    }

    #[test]
    fn advances_exactly_on_duration_boundary() {
        let (unit, _sink) = make_unit(0);
        assert_eq!(unit.consume_tick().unwrap(), TickOutcome::Held { remaining: 2 });
        assert_eq!(unit.consume_tick().unwrap(), TickOutcome::Held { remaining: 1 });
        assert_eq!(unit.snapshot().unwrap().phase, 0);
        assert_eq!(unit.consume_tick().unwrap(), TickOutcome::Advanced { phase: 1 });
        assert_eq!(unit.consume_tick().unwrap(), TickOutcome::Advanced { phase: 2 });
    }

    #[test]
    fn full_cycle_returns_to_start() {
        let (unit, sink) = make_unit(0);
        for _ in 0..8 {
            let _ = unit.consume_tick().unwrap();
        }
        assert_eq!(unit.snapshot().unwrap().phase, 0);
        assert_eq!(unit.ticks_consumed(), 8);
        // Start write plus one write per phase change.
        assert_eq!(sink.history().len(), 5);
        assert_eq!(sink.last(), Some(OutputState::lit(&[Lamp::Red])));
    }

    #[test]
    fn phase_after_n_ticks_matches_cumulative_durations() {
        let durations = [3_u64, 1, 3, 1];
        for start in 0..durations.len() {
            let (unit, _sink) = make_unit(start);
            let mut expected = start;
            let mut elapsed_in_phase = 0_u64;
            for _ in 0..20 {
                let _ = unit.consume_tick().unwrap();
                elapsed_in_phase += 1;
                if elapsed_in_phase == durations[expected] {
                    expected = (expected + 1) % durations.len();
                    elapsed_in_phase = 0;
                }
                assert_eq!(unit.snapshot().unwrap().phase, expected);
            }
        }
    }

    #[test]
    fn set_program_shows_requested_phase_immediately() {
        let (unit, sink) = make_unit(0);
        let _ = unit.consume_tick().unwrap();
        unit.set_program(four_phase(), 3).unwrap();
        assert_eq!(sink.last(), Some(OutputState::lit(&[Lamp::Yellow])));
        let snapshot = unit.snapshot().unwrap();
        assert_eq!(snapshot.phase, 3);
        assert_eq!(snapshot.remaining_ticks, 1);
    }

    #[test]
    fn set_program_is_idempotent() {
        let (unit, sink) = make_unit(0);
        unit.set_program(four_phase(), 2).unwrap();
        let once = (unit.snapshot().unwrap(), sink.last());
        unit.set_program(four_phase(), 2).unwrap();
        let twice = (unit.snapshot().unwrap(), sink.last());
        assert_eq!(once, twice);
    }

    #[test]
    fn out_of_range_phase_is_rejected_without_change() {
        let (unit, sink) = make_unit(1);
        let _ = unit.consume_tick().unwrap();
        let before = unit.snapshot().unwrap();
        let writes = sink.attempts();

        let program = four_phase();
        let len = program.len();
        let err = unit.set_program(program, len).unwrap_err();
        assert!(matches!(
            err,
            UnitError::InvalidPhaseIndex { index: 4, len: 4, .. }
        ));
        assert_eq!(unit.snapshot().unwrap(), before);
        assert_eq!(sink.attempts(), writes);
    }

    #[test]
    fn sink_failure_is_reported_and_state_moves_on() {
        let (unit, sink) = make_unit(1);
        sink.fail_next(1);
        let err = unit.consume_tick().unwrap_err();
        assert!(matches!(err, UnitError::Io { .. }));
        assert_eq!(unit.sink_failures(), 1);
        assert_eq!(unit.snapshot().unwrap().phase, 2);
        // Next change writes normally again.
        for _ in 0..3 {
            let _ = unit.consume_tick();
        }
        assert_eq!(sink.last(), Some(OutputState::lit(&[Lamp::Yellow])));
    }

    #[test]
    fn concurrent_ticks_and_program_changes_stay_consistent() {
        let (unit, _sink) = make_unit(0);
        let unit = Arc::new(unit);
        let ticker = {
            let unit = Arc::clone(&unit);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _ = unit.consume_tick();
                }
            })
        };
        for round in 0..200 {
            unit.set_program(four_phase(), round % 4).unwrap();
            let snapshot = unit.snapshot().unwrap();
            assert!(snapshot.phase < snapshot.program_len);
            assert!(snapshot.remaining_ticks >= 1);
        }
        ticker.join().unwrap();
        assert_eq!(unit.ticks_consumed(), 1000);
    }
}

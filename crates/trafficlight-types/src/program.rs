//! Output states, phases, and phase programs.
//!
//! A [`Program`] is one complete signal cycle: an ordered, non-empty list
//! of [`Phase`]s, each holding the lamp levels to show and how many ticks
//! to show them for. Programs are validated on construction and never
//! mutated afterwards, so they are shared between units behind an [`Arc`].

use core::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::enums::Lamp;

/// Errors raised while building program data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramError {
    /// A program must contain at least one phase.
    #[error("program has no phases")]
    EmptyProgram,

    /// A phase must last at least one tick.
    #[error("phase duration must be at least one tick")]
    ZeroDuration,

    /// A level in an output state was neither 0 nor 1.
    #[error("output level {level} at position {position} is not 0 or 1")]
    LevelOutOfRange {
        /// Position of the offending level.
        position: usize,
        /// The raw value found.
        level: u8,
    },

    /// Phases of one program drive a different number of outputs.
    #[error("phase {phase} drives {found} outputs, expected {expected}")]
    MixedWidth {
        /// Index of the first phase with a different width.
        phase: usize,
        /// Width of phase 0.
        expected: usize,
        /// Width of the offending phase.
        found: usize,
    },
}

// ---------------------------------------------------------------------------
// OutputState
// ---------------------------------------------------------------------------

/// The levels written to a signal head's outputs, one per lamp.
///
/// Serialized as a list of `0`/`1` values, e.g. `[1, 1, 0]` for red+yellow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct OutputState(Vec<bool>);

impl OutputState {
    /// Build an output state from raw levels.
    pub const fn new(levels: Vec<bool>) -> Self {
        Self(levels)
    }

    /// A three-lamp state with exactly the given lamps lit.
    pub fn lit(lamps: &[Lamp]) -> Self {
        Self(Lamp::ALL.iter().map(|lamp| lamps.contains(lamp)).collect())
    }

    /// A three-lamp state with every lamp off.
    pub fn dark() -> Self {
        Self::lit(&[])
    }

    /// Raw levels in output order.
    pub fn levels(&self) -> &[bool] {
        &self.0
    }

    /// Number of outputs driven.
    pub fn width(&self) -> usize {
        self.0.len()
    }

    /// Whether the given lamp is lit. Lamps beyond the width read as off.
    pub fn is_on(&self, lamp: Lamp) -> bool {
        self.0.get(lamp.index()).copied().unwrap_or(false)
    }
}

impl TryFrom<Vec<u8>> for OutputState {
    type Error = ProgramError;

    fn try_from(raw: Vec<u8>) -> Result<Self, Self::Error> {
        raw.iter()
            .enumerate()
            .map(|(position, &level)| match level {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(ProgramError::LevelOutOfRange { position, level }),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl From<OutputState> for Vec<u8> {
    fn from(state: OutputState) -> Self {
        state.0.into_iter().map(u8::from).collect()
    }
}

impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, &on) in self.0.iter().enumerate() {
            if position > 0 {
                f.write_str(" ")?;
            }
            let symbol = match (on, Lamp::from_index(position)) {
                (false, _) => '-',
                (true, Some(lamp)) => lamp.symbol(),
                (true, None) => '#',
            };
            write!(f, "{symbol}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One step of a program: an output state held for a number of ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// Levels shown while the phase is active.
    pub state: OutputState,
    /// How many ticks the phase lasts.
    pub ticks: NonZeroU32,
}

impl Phase {
    /// Build a phase, rejecting a zero duration.
    pub fn new(state: OutputState, ticks: u32) -> Result<Self, ProgramError> {
        let ticks = NonZeroU32::new(ticks).ok_or(ProgramError::ZeroDuration)?;
        Ok(Self { state, ticks })
    }

    /// Duration in ticks (always at least one).
    pub const fn duration_ticks(&self) -> u32 {
        self.ticks.get()
    }
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// An ordered, non-empty cycle of phases with a uniform output width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Phase>", into = "Vec<Phase>")]
pub struct Program {
    phases: Vec<Phase>,
}

impl Program {
    /// Build a program from its phases.
    ///
    /// # Errors
    ///
    /// Returns [`ProgramError::EmptyProgram`] for an empty list and
    /// [`ProgramError::MixedWidth`] if phases drive different numbers of
    /// outputs.
    pub fn new(phases: Vec<Phase>) -> Result<Self, ProgramError> {
        let expected = phases
            .first()
            .map(|phase| phase.state.width())
            .ok_or(ProgramError::EmptyProgram)?;
        if let Some((phase, found)) = phases
            .iter()
            .map(|phase| phase.state.width())
            .enumerate()
            .find(|&(_, width)| width != expected)
        {
            return Err(ProgramError::MixedWidth {
                phase,
                expected,
                found,
            });
        }
        Ok(Self { phases })
    }

    /// Build a program from `(state, ticks)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`ProgramError::ZeroDuration`] for any zero duration, plus
    /// everything [`Program::new`] rejects.
    pub fn from_steps<I>(steps: I) -> Result<Self, ProgramError>
    where
        I: IntoIterator<Item = (OutputState, u32)>,
    {
        let phases = steps
            .into_iter()
            .map(|(state, ticks)| Phase::new(state, ticks))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(phases)
    }

    /// Number of phases (always at least one).
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    /// Always `false`: a program has at least one phase.
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// All phases in cycle order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// The phase at `index`, if in range.
    pub fn phase(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }

    /// Index of the phase following `index`, wrapping to the start.
    pub fn next_index(&self, index: usize) -> usize {
        index
            .checked_add(1)
            .and_then(|next| next.checked_rem(self.phases.len()))
            .unwrap_or(0)
    }

    /// Total ticks in one full cycle.
    pub fn cycle_ticks(&self) -> u64 {
        self.phases
            .iter()
            .map(|phase| u64::from(phase.duration_ticks()))
            .fold(0, u64::saturating_add)
    }

    /// Number of outputs every phase drives.
    pub fn width(&self) -> usize {
        self.phases.first().map_or(0, |phase| phase.state.width())
    }
}

impl TryFrom<Vec<Phase>> for Program {
    type Error = ProgramError;

    fn try_from(phases: Vec<Phase>) -> Result<Self, Self::Error> {
        Self::new(phases)
    }
}

impl From<Program> for Vec<Phase> {
    fn from(program: Program) -> Self {
        program.phases
    }
}

// ---------------------------------------------------------------------------
// ProgramAssignment
// ---------------------------------------------------------------------------

/// A program together with the phase a unit should start it at.
///
/// The start index is checked by the unit when the assignment is applied,
/// not here, so an out-of-range assignment can be built and rejected
/// without touching any unit state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramAssignment {
    /// The program to run.
    pub program: Arc<Program>,
    /// Phase to start at.
    pub initial_phase: usize,
}

impl ProgramAssignment {
    /// Pair a program with its start phase.
    pub const fn new(program: Arc<Program>, initial_phase: usize) -> Self {
        Self {
            program,
            initial_phase,
        }
    }

    /// Whether the start phase exists in the program.
    pub fn is_valid(&self) -> bool {
        self.initial_phase < self.program.len()
    }
}

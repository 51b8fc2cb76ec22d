//! Shared type definitions for the traffic light conductor.
//!
//! Phase programs and their building blocks are plain immutable data:
//! they are constructed once (from the standard catalog or from the
//! configuration file) and then shared read-only between the conductor
//! and every signal unit.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrapper for signal unit identity
//! - [`enums`] -- Lamps, pairing roles, and program variants
//! - [`program`] -- Output states, phases, programs, and assignments

pub mod enums;
pub mod ids;
pub mod program;

// Re-export all public types at crate root for convenience.
pub use enums::{Lamp, ProgramVariant, Role};
pub use ids::UnitId;
pub use program::{OutputState, Phase, Program, ProgramAssignment, ProgramError};

#[cfg(test)]
mod tests {
    //! Smoke tests for the crate-root re-exports.

    use super::*;

    #[test]
    fn reexports_are_usable() {
        let state = OutputState::lit(&[Lamp::Green]);
        assert!(state.is_on(Lamp::Green));
        assert_eq!(ProgramVariant::Normal(1).to_string(), "normal-1");
        assert_ne!(UnitId::new(), UnitId::new());
        assert_eq!(Role::Primary.other(), Role::Secondary);
    }
}

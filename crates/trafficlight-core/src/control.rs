//! Shared control state for a running conductor.
//!
//! Lifecycle, tick interval, and the tick counter are read on the timer
//! hot path and written from control calls, so they live in atomics that
//! both sides reach through one [`Arc`](std::sync::Arc) without locks.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shortest accepted tick interval in milliseconds.
pub const MIN_TICK_INTERVAL_MS: u64 = 10;

/// Longest accepted tick interval in milliseconds.
pub const MAX_TICK_INTERVAL_MS: u64 = 60_000;

/// Lifecycle of a conductor. A conductor moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Built; workers exist but are not running.
    Created,
    /// Workers and timer are running.
    Running,
    /// Stop requested; tasks are draining.
    Stopping,
    /// Every task has exited or been aborted.
    Stopped,
}

impl Lifecycle {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Stopping => 2,
            Self::Stopped => 3,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Whether `ms` is an acceptable tick interval.
pub const fn tick_interval_in_range(ms: u64) -> bool {
    ms >= MIN_TICK_INTERVAL_MS && ms <= MAX_TICK_INTERVAL_MS
}

/// Control fields shared between the conductor and its timer task.
#[derive(Debug)]
pub(crate) struct ControlState {
    /// Current [`Lifecycle`], stored as its `u8` code.
    lifecycle: AtomicU8,
    /// Interval the timer sleeps before the next tick.
    tick_interval_ms: AtomicU64,
    /// Last tick generation broadcast.
    ticks_broadcast: AtomicU64,
    /// When the timer started, set once.
    started_at: OnceLock<DateTime<Utc>>,
}

impl ControlState {
    pub(crate) const fn new(tick_interval_ms: u64) -> Self {
        Self {
            lifecycle: AtomicU8::new(Lifecycle::Created.as_u8()),
            tick_interval_ms: AtomicU64::new(tick_interval_ms),
            ticks_broadcast: AtomicU64::new(0),
            started_at: OnceLock::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. On failure returns the actual state.
    pub(crate) fn transition(&self, from: Lifecycle, to: Lifecycle) -> Result<(), Lifecycle> {
        self.lifecycle
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_prev| ())
            .map_err(Lifecycle::from_u8)
    }

    /// Move to `Stopping` from `Created` or `Running`.
    ///
    /// Returns the state that was left, or `None` if a stop was already
    /// under way (or finished).
    pub(crate) fn begin_stop(&self) -> Option<Lifecycle> {
        let mut current = self.lifecycle();
        loop {
            match current {
                Lifecycle::Created | Lifecycle::Running => {
                    match self.transition(current, Lifecycle::Stopping) {
                        Ok(()) => return Some(current),
                        Err(actual) => current = actual,
                    }
                }
                Lifecycle::Stopping | Lifecycle::Stopped => return None,
            }
        }
    }

    pub(crate) fn mark_started(&self) {
        let _ = self.started_at.set(Utc::now());
    }

    pub(crate) fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at.get().copied()
    }

    // -----------------------------------------------------------------------
    // Tick speed
    // -----------------------------------------------------------------------

    pub(crate) fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.load(Ordering::Acquire))
    }

    /// Set the interval. Returns the previous value, or `None` if `ms`
    /// is out of range.
    pub(crate) fn set_tick_interval_ms(&self, ms: u64) -> Option<u64> {
        if !tick_interval_in_range(ms) {
            return None;
        }
        Some(self.tick_interval_ms.swap(ms, Ordering::AcqRel))
    }

    // -----------------------------------------------------------------------
    // Tick counter
    // -----------------------------------------------------------------------

    pub(crate) fn ticks_broadcast(&self) -> u64 {
        self.ticks_broadcast.load(Ordering::Acquire)
    }

    /// Record that `generation` has been broadcast. Only the timer writes.
    pub(crate) fn record_tick(&self, generation: u64) {
        self.ticks_broadcast.store(generation, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_created_with_no_ticks() {
        let control = ControlState::new(100);
        assert_eq!(control.lifecycle(), Lifecycle::Created);
        assert_eq!(control.ticks_broadcast(), 0);
        assert_eq!(control.tick_interval(), Duration::from_millis(100));
        assert!(control.started_at().is_none());
    }

    #[test]
    fn transition_rejects_wrong_source_state() {
        let control = ControlState::new(100);
        assert_eq!(
            control.transition(Lifecycle::Running, Lifecycle::Stopping),
            Err(Lifecycle::Created)
        );
        assert!(
            control
                .transition(Lifecycle::Created, Lifecycle::Running)
                .is_ok()
        );
        assert_eq!(control.lifecycle(), Lifecycle::Running);
    }

    #[test]
    fn begin_stop_only_once() {
        let control = ControlState::new(100);
        let _ = control.transition(Lifecycle::Created, Lifecycle::Running);
        assert_eq!(control.begin_stop(), Some(Lifecycle::Running));
        assert_eq!(control.begin_stop(), None);
        assert_eq!(control.lifecycle(), Lifecycle::Stopping);
    }

    #[test]
    fn tick_interval_bounds() {
        let control = ControlState::new(100);
        assert_eq!(control.set_tick_interval_ms(250), Some(100));
        assert_eq!(control.set_tick_interval_ms(5), None);
        assert_eq!(control.set_tick_interval_ms(60_001), None);
        assert_eq!(control.tick_interval(), Duration::from_millis(250));
    }

    #[test]
    fn started_at_is_set_once() {
        let control = ControlState::new(100);
        control.mark_started();
        let first = control.started_at();
        control.mark_started();
        assert_eq!(control.started_at(), first);
    }
}

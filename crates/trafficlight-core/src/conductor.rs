//! The conductor: one timer, many signal workers, shared logical time.
//!
//! The conductor owns the tick broadcast, the signal units, and the
//! worker tasks that drive them. Its timer task sleeps for the tick
//! interval and then publishes the next tick generation with a single
//! broadcast, so every unit sees the same logical tick.
//!
//! # Lifecycle
//!
//! `Created -> Running -> Stopping -> Stopped`, forward only:
//!
//! - [`Conductor::start`] spawns the workers, waits until every one of
//!   them is subscribed and waiting, and only then starts the timer.
//! - [`Conductor::set_program`] and friends require `Running`.
//! - [`Conductor::stop`] publishes the stop signal and returns at once.
//! - [`Conductor::join`] waits, bounded by the grace period, for the timer
//!   and every worker to exit.
//!
//! A conductor is single-use; it cannot be restarted.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Barrier, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use trafficlight_types::{ProgramVariant, Role, UnitId};

use crate::catalog::{CatalogError, ProgramCatalog};
use crate::config::ConductorConfig;
use crate::control::{ControlState, Lifecycle, tick_interval_in_range};
use crate::diagnostics::{Diagnostic, DiagnosticsSender};
use crate::tick::{TickBus, stop_signalled};
use crate::unit::{SignalUnit, UnitError, UnitSnapshot};
use crate::worker::SignalWorker;

/// Label of the timer task in diagnostics.
const TIMER_TASK: &str = "timer";

/// Errors returned by conductor control calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConductorError {
    /// The call is not allowed in the conductor's current state.
    #[error("cannot {operation} while conductor is {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the conductor was in.
        state: Lifecycle,
    },

    /// Catalog lookup failed.
    #[error("catalog error: {source}")]
    Catalog {
        /// The underlying catalog error.
        #[from]
        source: CatalogError,
    },

    /// Tasks were still running when the join grace period ran out.
    #[error("{} task(s) did not stop within the grace period: {}", units.len(), units.join(", "))]
    ShutdownTimeout {
        /// Labels of the tasks still running.
        units: Vec<String>,
    },

    /// The tick interval is outside the accepted range.
    #[error("tick interval of {interval_ms} ms is out of range")]
    InvalidTickInterval {
        /// The rejected interval.
        interval_ms: u64,
    },

    /// The number of roles does not match the number of units.
    #[error("{roles} roles given for {units} units")]
    RoleCount {
        /// Number of units.
        units: usize,
        /// Number of roles.
        roles: usize,
    },
}

/// Timing settings of a conductor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConductorSettings {
    /// Time between ticks.
    pub tick_interval: Duration,
    /// How long [`Conductor::join`] waits before reporting stragglers.
    pub join_grace: Duration,
}

impl Default for ConductorSettings {
    fn default() -> Self {
        Self::from(&ConductorConfig::default())
    }
}

impl From<&ConductorConfig> for ConductorSettings {
    fn from(config: &ConductorConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            join_grace: config.join_grace(),
        }
    }
}

/// Roles alternating primary, secondary, primary, ... by registration order.
pub fn alternating_roles(count: usize) -> Vec<Role> {
    std::iter::successors(Some(Role::Primary), |role| Some(role.other()))
        .take(count)
        .collect()
}

/// Point-in-time view of a conductor, suitable for logging as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ConductorStatus {
    /// Lifecycle state.
    pub state: Lifecycle,
    /// Ticks broadcast so far.
    pub ticks_broadcast: u64,
    /// Current tick interval in milliseconds.
    pub tick_interval_ms: u64,
    /// When the timer started, if it has.
    pub started_at: Option<DateTime<Utc>>,
    /// Most recently activated program variant.
    pub active_variant: Option<ProgramVariant>,
    /// Per-unit state, in registration order.
    pub units: Vec<UnitStatus>,
}

/// Point-in-time view of one unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    /// Unit identifier.
    pub id: UnitId,
    /// Unit name.
    pub name: String,
    /// Pairing role.
    pub role: Role,
    /// Phase state, `None` if the unit's lock is poisoned.
    pub snapshot: Option<UnitSnapshot>,
    /// Ticks consumed so far.
    pub ticks_consumed: u64,
    /// Failed sink writes so far.
    pub sink_failures: u64,
}

/// A spawned timer or worker task.
struct TaskHandle {
    /// Unit name, or [`TIMER_TASK`].
    label: String,
    /// Handle used to join or abort the task.
    handle: JoinHandle<()>,
}

/// Broadcasts ticks to a fixed set of signal units and orchestrates
/// program changes and shutdown.
pub struct Conductor {
    /// Units in registration order.
    units: Vec<Arc<SignalUnit>>,
    /// Pairing role of each unit, same order as `units`.
    roles: Vec<Role>,
    /// Programs available to `set_program`.
    catalog: ProgramCatalog,
    /// Lifecycle, tick interval and counters shared with the timer.
    control: Arc<ControlState>,
    /// Tick broadcast shared with every worker.
    bus: Arc<TickBus>,
    /// Diagnostics published to subscribers.
    diagnostics: DiagnosticsSender,
    /// How long `join` waits for tasks to exit.
    join_grace: Duration,
    /// Workers built at construction, moved into tasks by `start`.
    pending: Mutex<Vec<SignalWorker>>,
    /// Spawned tasks not yet joined.
    tasks: Mutex<Vec<TaskHandle>>,
    /// Most recently applied variant.
    active_variant: Mutex<Option<ProgramVariant>>,
}

impl std::fmt::Debug for Conductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conductor")
            .field("units", &self.units)
            .field("roles", &self.roles)
            .field("state", &self.control.lifecycle())
            .finish_non_exhaustive()
    }
}

impl Conductor {
    /// Build a conductor whose units alternate primary/secondary roles by
    /// registration order.
    ///
    /// Alternation pairs units (0, 1), (2, 3), ...; with more than two
    /// units prefer [`Conductor::with_roles`].
    pub fn new(
        units: Vec<SignalUnit>,
        catalog: ProgramCatalog,
        settings: ConductorSettings,
    ) -> Result<Self, ConductorError> {
        if units.len() > 2 {
            warn!(
                units = units.len(),
                "pairing roles inferred by alternation; configure roles explicitly for more than two units"
            );
        }
        let roles = alternating_roles(units.len());
        Self::with_roles(units, roles, catalog, settings)
    }

    /// Build a conductor with an explicit role per unit.
    ///
    /// Workers are created here but not started. Every unit is switched to
    /// the self-test program.
    pub fn with_roles(
        units: Vec<SignalUnit>,
        roles: Vec<Role>,
        catalog: ProgramCatalog,
        settings: ConductorSettings,
    ) -> Result<Self, ConductorError> {
        if roles.len() != units.len() {
            return Err(ConductorError::RoleCount {
                units: units.len(),
                roles: roles.len(),
            });
        }
        let interval_ms = duration_ms(settings.tick_interval);
        if !tick_interval_in_range(interval_ms) {
            return Err(ConductorError::InvalidTickInterval { interval_ms });
        }

        let bus = Arc::new(TickBus::new());
        let diagnostics = DiagnosticsSender::new();
        let units: Vec<Arc<SignalUnit>> = units.into_iter().map(Arc::new).collect();
        let workers = units
            .iter()
            .map(|unit| SignalWorker::new(Arc::clone(unit), bus.subscribe(), diagnostics.clone()))
            .collect();

        let conductor = Self {
            units,
            roles,
            catalog,
            control: Arc::new(ControlState::new(interval_ms)),
            bus,
            diagnostics,
            join_grace: settings.join_grace,
            pending: Mutex::new(workers),
            tasks: Mutex::new(Vec::new()),
            active_variant: Mutex::new(None),
        };
        conductor.assign(ProgramVariant::Initialization)?;

        info!(
            units = conductor.units.len(),
            tick_interval_ms = interval_ms,
            join_grace_ms = duration_ms(settings.join_grace),
            "conductor created"
        );
        Ok(conductor)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn every worker, wait until all are ready, then start ticking.
    pub async fn start(&self) -> Result<(), ConductorError> {
        self.control
            .transition(Lifecycle::Created, Lifecycle::Running)
            .map_err(|state| ConductorError::InvalidState {
                operation: "start",
                state,
            })?;

        let workers = std::mem::take(&mut *lock(&self.pending));
        let ready = Arc::new(Barrier::new(workers.len().saturating_add(1)));
        let spawned: Vec<TaskHandle> = workers
            .into_iter()
            .map(|worker| TaskHandle {
                label: worker.unit_name().to_owned(),
                handle: tokio::spawn(worker.run(Arc::clone(&ready))),
            })
            .collect();
        let worker_count = spawned.len();
        lock(&self.tasks).extend(spawned);

        // No tick may go out before every worker is waiting for it.
        let _ = ready.wait().await;

        self.control.mark_started();
        let timer = tokio::spawn(run_timer(Arc::clone(&self.bus), Arc::clone(&self.control)));
        lock(&self.tasks).push(TaskHandle {
            label: TIMER_TASK.to_owned(),
            handle: timer,
        });

        info!(
            workers = worker_count,
            tick_interval_ms = duration_ms(self.control.tick_interval()),
            "conductor started"
        );
        Ok(())
    }

    /// Request shutdown and wake every waiting task. Does not wait.
    ///
    /// Allowed from `Created` (nothing to drain) and `Running`; repeated
    /// calls are no-ops.
    pub fn stop(&self) {
        match self.control.begin_stop() {
            Some(previous) => {
                if previous == Lifecycle::Created {
                    lock(&self.pending).clear();
                }
                self.bus.stop();
                info!(
                    previous = %previous,
                    ticks = self.control.ticks_broadcast(),
                    "stop requested"
                );
            }
            None => debug!(state = %self.control.lifecycle(), "stop already requested"),
        }
    }

    /// Wait for the timer and every worker to exit.
    ///
    /// Must follow [`stop`](Self::stop). Tasks still running after the
    /// grace period are reported as [`Diagnostic::ShutdownTimeout`] and
    /// returned as [`ConductorError::ShutdownTimeout`]; they are kept, so
    /// `join` can be retried or [`abort_stragglers`](Self::abort_stragglers)
    /// called. Must not be called concurrently with itself.
    pub async fn join(&self) -> Result<(), ConductorError> {
        match self.control.lifecycle() {
            Lifecycle::Stopped => return Ok(()),
            Lifecycle::Stopping => {}
            state => {
                return Err(ConductorError::InvalidState {
                    operation: "join",
                    state,
                });
            }
        }

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        let grace = self.join_grace;
        let outcomes = join_all(tasks.into_iter().map(|mut task| async move {
            let outcome = tokio::time::timeout(grace, &mut task.handle).await;
            (task, outcome)
        }))
        .await;

        let mut stragglers = Vec::new();
        for (task, outcome) in outcomes {
            match outcome {
                Ok(Ok(())) => trace!(task = %task.label, "task joined"),
                Ok(Err(err)) if err.is_panic() => {
                    self.diagnostics.report(Diagnostic::WorkerPanicked {
                        unit: task.label,
                        message: err.to_string(),
                    });
                }
                Ok(Err(err)) => debug!(task = %task.label, error = %err, "task cancelled"),
                Err(_elapsed) => stragglers.push(task),
            }
        }

        if stragglers.is_empty() {
            let _ = self
                .control
                .transition(Lifecycle::Stopping, Lifecycle::Stopped);
            info!(ticks = self.control.ticks_broadcast(), "conductor stopped");
            return Ok(());
        }

        let units: Vec<String> = stragglers.iter().map(|task| task.label.clone()).collect();
        lock(&self.tasks).extend(stragglers);
        self.diagnostics.report(Diagnostic::ShutdownTimeout {
            units: units.clone(),
            grace_ms: duration_ms(grace),
        });
        Err(ConductorError::ShutdownTimeout { units })
    }

    /// Abort every task not yet joined and mark the conductor stopped.
    ///
    /// Only acts while `Stopping`. Returns the labels of aborted tasks.
    /// After this the conductor is `Stopped` even though an aborted worker
    /// blocked in a sink write keeps its thread until the write returns.
    pub fn abort_stragglers(&self) -> Vec<String> {
        if self.control.lifecycle() != Lifecycle::Stopping {
            return Vec::new();
        }
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        let labels: Vec<String> = tasks
            .iter()
            .map(|task| {
                task.handle.abort();
                task.label.clone()
            })
            .collect();
        let _ = self
            .control
            .transition(Lifecycle::Stopping, Lifecycle::Stopped);
        if !labels.is_empty() {
            warn!(tasks = ?labels, "aborted tasks that missed the join grace period");
        }
        labels
    }

    // -----------------------------------------------------------------------
    // Programs
    // -----------------------------------------------------------------------

    /// Switch every unit to `variant`, each at the start phase of its role.
    ///
    /// Per-unit sink failures are reported as diagnostics and do not stop
    /// the other units from switching. Callers must not run this
    /// concurrently with itself.
    pub fn set_program(&self, variant: ProgramVariant) -> Result<(), ConductorError> {
        let state = self.control.lifecycle();
        if state != Lifecycle::Running {
            return Err(ConductorError::InvalidState {
                operation: "set program",
                state,
            });
        }
        self.assign(variant)
    }

    /// Switch to the lamp self-test program.
    pub fn set_initial_program(&self) -> Result<(), ConductorError> {
        self.set_program(ProgramVariant::Initialization)
    }

    /// Switch to the out-of-order blinking program.
    pub fn set_noop_program(&self) -> Result<(), ConductorError> {
        self.set_program(ProgramVariant::Noop)
    }

    /// Switch to normal operation variant `index`.
    pub fn set_normal_program(&self, index: usize) -> Result<(), ConductorError> {
        self.set_program(ProgramVariant::Normal(index))
    }

    fn assign(&self, variant: ProgramVariant) -> Result<(), ConductorError> {
        let plan = self.catalog.plan(variant)?;
        // Start phases were checked when the plan was built.
        for (unit, &role) in self.units.iter().zip(&self.roles) {
            match unit.apply(&plan.assignment(role)) {
                Ok(()) => {}
                Err(UnitError::Io { unit: name, source }) => {
                    self.diagnostics.report(Diagnostic::SinkFailure {
                        unit: name,
                        tick: None,
                        message: source.to_string(),
                    });
                }
                Err(err) => {
                    self.diagnostics.report(Diagnostic::UnitFault {
                        unit: unit.name().to_owned(),
                        tick: None,
                        message: err.to_string(),
                    });
                }
            }
        }

        *lock(&self.active_variant) = Some(variant);
        info!(variant = %variant, units = self.units.len(), "program set");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tick speed
    // -----------------------------------------------------------------------

    /// Current tick interval.
    pub fn tick_interval(&self) -> Duration {
        self.control.tick_interval()
    }

    /// Change the tick interval from the timer's next sleep on. Returns the
    /// previous interval.
    pub fn set_tick_interval(&self, interval: Duration) -> Result<Duration, ConductorError> {
        let interval_ms = duration_ms(interval);
        let previous = self
            .control
            .set_tick_interval_ms(interval_ms)
            .ok_or(ConductorError::InvalidTickInterval { interval_ms })?;
        info!(
            previous_ms = previous,
            tick_interval_ms = interval_ms,
            "tick interval changed"
        );
        Ok(Duration::from_millis(previous))
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        self.control.lifecycle()
    }

    /// Ticks broadcast so far.
    pub fn ticks_broadcast(&self) -> u64 {
        self.control.ticks_broadcast()
    }

    /// Managed units, in registration order.
    pub fn units(&self) -> &[Arc<SignalUnit>] {
        &self.units
    }

    /// Role of each unit, in registration order.
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// The program catalog.
    pub const fn catalog(&self) -> &ProgramCatalog {
        &self.catalog
    }

    /// Most recently activated program variant.
    pub fn active_variant(&self) -> Option<ProgramVariant> {
        *lock(&self.active_variant)
    }

    /// Receive diagnostics published from now on.
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    /// Snapshot of the conductor and every unit.
    pub fn status(&self) -> ConductorStatus {
        let units = self
            .units
            .iter()
            .zip(&self.roles)
            .map(|(unit, &role)| UnitStatus {
                id: unit.id(),
                name: unit.name().to_owned(),
                role,
                snapshot: unit.snapshot().ok(),
                ticks_consumed: unit.ticks_consumed(),
                sink_failures: unit.sink_failures(),
            })
            .collect();
        ConductorStatus {
            state: self.control.lifecycle(),
            ticks_broadcast: self.control.ticks_broadcast(),
            tick_interval_ms: duration_ms(self.control.tick_interval()),
            started_at: self.control.started_at(),
            active_variant: self.active_variant(),
            units,
        }
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        // Spawned tasks hold their own handles to the bus.
        if !self.bus.is_stopped() {
            debug!(state = %self.control.lifecycle(), "conductor dropped without stop");
            self.bus.stop();
        }
    }
}

/// Sleep, broadcast the next tick, repeat until stop.
async fn run_timer(bus: Arc<TickBus>, control: Arc<ControlState>) {
    let mut beats = bus.subscribe();
    loop {
        let interval = control.tick_interval();
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = stop_signalled(&mut beats) => break,
        }
        let generation = control.ticks_broadcast().saturating_add(1);
        if !bus.broadcast(generation) {
            break;
        }
        control.record_tick(generation);
        trace!(tick = generation, "tick");
    }
    debug!(ticks = control.ticks_broadcast(), "timer stopped");
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use trafficlight_types::{Lamp, OutputState, Program};

    use super::*;
    use crate::catalog::VariantPlan;
    use crate::sink::{OutputSink, RecordingSink};

    fn four_phase() -> Program {
        Program::from_steps([
            (OutputState::lit(&[Lamp::Red]), 3),
            (OutputState::lit(&[Lamp::Red, Lamp::Yellow]), 1),
            (OutputState::lit(&[Lamp::Green]), 3),
            (OutputState::lit(&[Lamp::Yellow]), 1),
        ])
        .unwrap()
    }

    /// Self-test replaced by the four-phase program so tick counting is easy.
    fn scenario_catalog() -> ProgramCatalog {
        let standard = ProgramCatalog::standard().unwrap();
        let noop = standard.plan(ProgramVariant::Noop).unwrap().clone();
        ProgramCatalog::new(
            VariantPlan::new(four_phase(), 0, 0).unwrap(),
            noop,
            vec![VariantPlan::opposed(four_phase()).unwrap()],
        )
    }

    fn settings() -> ConductorSettings {
        ConductorSettings {
            tick_interval: Duration::from_millis(100),
            join_grace: Duration::from_secs(1),
        }
    }

    fn make_units(count: usize) -> (Vec<SignalUnit>, Vec<Arc<RecordingSink>>) {
        let plan = VariantPlan::new(four_phase(), 0, 0).unwrap();
        (0..count)
            .map(|index| {
                let name = format!("U{index}");
                let sink = Arc::new(RecordingSink::new(name.clone()));
                let unit = SignalUnit::new(
                    name,
                    Arc::clone(&sink) as Arc<dyn OutputSink>,
                    &plan.assignment(Role::Primary),
                )
                .unwrap();
                (unit, sink)
            })
            .unzip()
    }

    fn make_conductor(count: usize) -> (Conductor, Vec<Arc<RecordingSink>>) {
        let (units, sinks) = make_units(count);
        let conductor = Conductor::new(units, scenario_catalog(), settings()).unwrap();
        (conductor, sinks)
    }

    fn phase_of(conductor: &Conductor, index: usize) -> usize {
        conductor.units()[index].snapshot().unwrap().phase
    }

    #[test]
    fn alternating_roles_pairs_by_order() {
        assert_eq!(
            alternating_roles(3),
            vec![Role::Primary, Role::Secondary, Role::Primary]
        );
        assert!(alternating_roles(0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_advances_on_tick_boundaries() {
        let (conductor, _sinks) = make_conductor(1);
        conductor.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(conductor.ticks_broadcast(), 2);
        assert_eq!(phase_of(&conductor, 0), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(phase_of(&conductor, 0), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(phase_of(&conductor, 0), 2);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(conductor.ticks_broadcast(), 8);
        assert_eq!(phase_of(&conductor, 0), 0);
        assert_eq!(conductor.units()[0].ticks_consumed(), 8);

        conductor.stop();
        conductor.join().await.unwrap();
        assert_eq!(conductor.state(), Lifecycle::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn every_unit_sees_every_tick() {
        let (conductor, _sinks) = make_conductor(4);
        conductor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1050)).await;
        for unit in conductor.units() {
            assert_eq!(unit.ticks_consumed(), 10, "{}", unit.name());
        }
        conductor.stop();
        conductor.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_is_consumed_after_stop() {
        let (conductor, _sinks) = make_conductor(2);
        conductor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        conductor.stop();
        let consumed: Vec<u64> = conductor
            .units()
            .iter()
            .map(|unit| unit.ticks_consumed())
            .collect();
        assert_eq!(consumed, vec![3, 3]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        conductor.join().await.unwrap();
        let after: Vec<u64> = conductor
            .units()
            .iter()
            .map(|unit| unit.ticks_consumed())
            .collect();
        assert_eq!(after, consumed);
        assert_eq!(conductor.ticks_broadcast(), 3);
    }

    #[tokio::test]
    async fn control_calls_check_lifecycle() {
        let (conductor, _sinks) = make_conductor(2);
        assert_eq!(
            conductor.set_noop_program(),
            Err(ConductorError::InvalidState {
                operation: "set program",
                state: Lifecycle::Created
            })
        );
        assert!(matches!(
            conductor.join().await,
            Err(ConductorError::InvalidState { .. })
        ));

        conductor.start().await.unwrap();
        assert_eq!(
            conductor.start().await,
            Err(ConductorError::InvalidState {
                operation: "start",
                state: Lifecycle::Running
            })
        );
        assert!(conductor.set_noop_program().is_ok());

        conductor.stop();
        assert_eq!(
            conductor.set_initial_program(),
            Err(ConductorError::InvalidState {
                operation: "set program",
                state: Lifecycle::Stopping
            })
        );
        conductor.stop();
        conductor.join().await.unwrap();
        conductor.join().await.unwrap();
    }

    #[tokio::test]
    async fn stop_before_start_needs_no_draining() {
        let (conductor, _sinks) = make_conductor(2);
        conductor.stop();
        assert_eq!(conductor.state(), Lifecycle::Stopping);
        conductor.join().await.unwrap();
        assert_eq!(conductor.state(), Lifecycle::Stopped);
        assert!(conductor.start().await.is_err());
    }

    #[tokio::test]
    async fn construction_applies_self_test_program() {
        let (units, sinks) = make_units(2);
        let conductor = Conductor::new(units, ProgramCatalog::standard().unwrap(), settings()).unwrap();
        let init = conductor
            .catalog()
            .plan(ProgramVariant::Initialization)
            .unwrap()
            .clone();
        assert_eq!(conductor.active_variant(), Some(ProgramVariant::Initialization));
        assert_eq!(phase_of(&conductor, 0), 0);
        assert_eq!(phase_of(&conductor, 1), 7);
        assert_eq!(
            sinks[1].last().as_ref(),
            Some(&init.program().phases()[7].state)
        );
    }

    #[tokio::test]
    async fn paired_units_start_in_complementary_phases() {
        let (conductor, sinks) = make_conductor(2);
        conductor.start().await.unwrap();
        conductor.set_normal_program(0).unwrap();
        assert_eq!(sinks[0].last(), Some(OutputState::lit(&[Lamp::Green])));
        assert_eq!(sinks[1].last(), Some(OutputState::lit(&[Lamp::Red])));
        conductor.stop();
        conductor.join().await.unwrap();
    }

    #[tokio::test]
    async fn explicit_roles_override_alternation() {
        let (units, sinks) = make_units(3);
        let conductor = Conductor::with_roles(
            units,
            vec![Role::Secondary, Role::Primary, Role::Primary],
            scenario_catalog(),
            settings(),
        )
        .unwrap();
        conductor.start().await.unwrap();
        conductor.set_normal_program(0).unwrap();
        let red = Some(OutputState::lit(&[Lamp::Red]));
        let green = Some(OutputState::lit(&[Lamp::Green]));
        assert_eq!(sinks[0].last(), red);
        assert_eq!(sinks[1].last(), green);
        assert_eq!(sinks[2].last(), green);
        conductor.stop();
        conductor.join().await.unwrap();
    }

    #[test]
    fn role_count_must_match_units() {
        let (units, _sinks) = make_units(2);
        let err = Conductor::with_roles(units, vec![Role::Primary], scenario_catalog(), settings())
            .unwrap_err();
        assert_eq!(err, ConductorError::RoleCount { units: 2, roles: 1 });
    }

    #[tokio::test]
    async fn unknown_variant_is_rejected() {
        let (conductor, _sinks) = make_conductor(2);
        conductor.start().await.unwrap();
        assert!(matches!(
            conductor.set_normal_program(5),
            Err(ConductorError::Catalog {
                source: CatalogError::UnknownVariant { .. }
            })
        ));
        conductor.stop();
        conductor.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_is_isolated_to_its_unit() {
        let (conductor, sinks) = make_conductor(2);
        let mut diagnostics = conductor.subscribe_diagnostics();
        conductor.start().await.unwrap();

        sinks[0].fail_next(1);
        conductor.set_noop_program().unwrap();
        let report = diagnostics.recv().await.unwrap();
        assert!(matches!(
            report,
            Diagnostic::SinkFailure { ref unit, tick: None, .. } if unit == "U0"
        ));
        assert_eq!(conductor.units()[0].sink_failures(), 1);
        assert_eq!(sinks[1].last(), Some(OutputState::lit(&[Lamp::Yellow])));

        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(conductor.units()[0].ticks_consumed(), 5);
        assert_eq!(conductor.units()[1].ticks_consumed(), 5);
        // Both blink in step after the failed write.
        assert_eq!(sinks[0].last(), sinks[1].last());
        assert_eq!(sinks[0].last(), Some(OutputState::dark()));

        conductor.stop();
        conductor.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn tick_interval_can_change_at_runtime() {
        let (conductor, _sinks) = make_conductor(1);
        assert!(matches!(
            conductor.set_tick_interval(Duration::from_millis(1)),
            Err(ConductorError::InvalidTickInterval { interval_ms: 1 })
        ));
        conductor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(conductor.ticks_broadcast(), 1);

        let previous = conductor.set_tick_interval(Duration::from_millis(20)).unwrap();
        assert_eq!(previous, Duration::from_millis(100));
        // The sleep already under way finishes at 200 ms; 20 ms ticks follow.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conductor.ticks_broadcast(), 4);

        conductor.stop();
        conductor.join().await.unwrap();
    }

    #[tokio::test]
    async fn status_serializes() {
        let (conductor, _sinks) = make_conductor(2);
        conductor.start().await.unwrap();
        let status = conductor.status();
        assert_eq!(status.state, Lifecycle::Running);
        assert_eq!(status.units.len(), 2);
        assert_eq!(status.units[1].role, Role::Secondary);
        assert!(status.started_at.is_some());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["units"][0]["name"], "U0");
        conductor.stop();
        conductor.join().await.unwrap();
    }
}

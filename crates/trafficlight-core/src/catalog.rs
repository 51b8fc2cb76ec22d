//! Program catalog: the named programs a conductor can switch between.
//!
//! The catalog is immutable once built and owned by the conductor. Each
//! variant is stored as a [`VariantPlan`]: the program plus the start
//! phase for each pairing [`Role`]. Start phases are checked when the plan
//! is built, so activating a variant can never fail on an index.
//!
//! [`ProgramCatalog::standard`] provides the stock programs. With a tick
//! of 100 ms, a main phase lasts 4 s and a transition 1 s.

use std::sync::Arc;

use tracing::debug;
use trafficlight_types::{
    Lamp, OutputState, Program, ProgramAssignment, ProgramError, ProgramVariant, Role,
};

use crate::config::{PlanConfig, ProgramsConfig};

/// Ticks of a main phase (red or green held).
pub const TICKS_MAIN: u32 = 40;
/// Ticks of a transition phase.
pub const TICKS_TRANSITION: u32 = 10;
/// Ticks of each half of the blinking out-of-order pattern.
pub const TICKS_NOOP: u32 = 5;
/// Ticks of a self-test step.
pub const TICKS_INIT: u32 = 1;

/// Start phase of the secondary head in the self-test program.
const INIT_SECONDARY_PHASE: usize = 7;

/// Errors raised while building or querying a catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// The variant is not in the catalog.
    #[error("unknown program variant {variant}")]
    UnknownVariant {
        /// The requested variant.
        variant: ProgramVariant,
    },

    /// A program failed validation.
    #[error("invalid program: {source}")]
    Program {
        /// The underlying program error.
        #[from]
        source: ProgramError,
    },

    /// A role's start phase does not exist in its program.
    #[error("{role} start phase {index} out of range for program of {len} phases")]
    InvalidStartPhase {
        /// The role whose start phase is wrong.
        role: Role,
        /// The rejected index.
        index: usize,
        /// Number of phases in the program.
        len: usize,
    },
}

/// A program with the start phase for each role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantPlan {
    program: Arc<Program>,
    primary_phase: usize,
    secondary_phase: usize,
}

impl VariantPlan {
    /// Build a plan, checking both start phases.
    pub fn new(
        program: Program,
        primary_phase: usize,
        secondary_phase: usize,
    ) -> Result<Self, CatalogError> {
        for (role, index) in [
            (Role::Primary, primary_phase),
            (Role::Secondary, secondary_phase),
        ] {
            if index >= program.len() {
                return Err(CatalogError::InvalidStartPhase {
                    role,
                    index,
                    len: program.len(),
                });
            }
        }
        Ok(Self {
            program: Arc::new(program),
            primary_phase,
            secondary_phase,
        })
    }

    /// Build a plan whose primary head starts at the middle of the cycle
    /// and whose secondary head starts at phase 0.
    ///
    /// For the normal programs the middle phase is the first green and
    /// phase 0 is red, which pairs the heads as green/red.
    pub fn opposed(program: Program) -> Result<Self, CatalogError> {
        let middle = program.len().checked_div(2).unwrap_or(0);
        Self::new(program, middle, 0)
    }

    /// The shared program.
    pub const fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Start phase for `role`.
    pub const fn start_phase(&self, role: Role) -> usize {
        match role {
            Role::Primary => self.primary_phase,
            Role::Secondary => self.secondary_phase,
        }
    }

    /// The assignment a unit with `role` receives.
    pub fn assignment(&self, role: Role) -> ProgramAssignment {
        ProgramAssignment::new(Arc::clone(&self.program), self.start_phase(role))
    }
}

/// Immutable set of programs keyed by [`ProgramVariant`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramCatalog {
    initialization: VariantPlan,
    noop: VariantPlan,
    normal: Vec<VariantPlan>,
}

impl ProgramCatalog {
    /// Assemble a catalog from validated plans.
    pub const fn new(
        initialization: VariantPlan,
        noop: VariantPlan,
        normal: Vec<VariantPlan>,
    ) -> Self {
        Self {
            initialization,
            noop,
            normal,
        }
    }

    /// The stock programs: lamp self-test, yellow blink, and three normal
    /// operation variants with increasingly long all-red clearances.
    pub fn standard() -> Result<Self, CatalogError> {
        Ok(Self::new(
            initialization_plan()?,
            noop_plan()?,
            vec![
                VariantPlan::opposed(normal_program_0()?)?,
                VariantPlan::opposed(normal_program_1()?)?,
                VariantPlan::opposed(normal_program_2()?)?,
            ],
        ))
    }

    /// The standard catalog with any programs given in `config` replacing
    /// their stock counterpart.
    pub fn from_config(config: &ProgramsConfig) -> Result<Self, CatalogError> {
        let mut catalog = Self::standard()?;
        if let Some(plan) = &config.initialization {
            catalog.initialization = plan_from_config(plan)?;
        }
        if let Some(plan) = &config.noop {
            catalog.noop = plan_from_config(plan)?;
        }
        if let Some(plans) = &config.normal {
            catalog.normal = plans
                .iter()
                .map(plan_from_config)
                .collect::<Result<Vec<_>, _>>()?;
        }
        debug!(
            normal_variants = catalog.normal.len(),
            "program catalog built"
        );
        Ok(catalog)
    }

    /// Look up the plan for `variant`.
    pub fn plan(&self, variant: ProgramVariant) -> Result<&VariantPlan, CatalogError> {
        match variant {
            ProgramVariant::Initialization => Ok(&self.initialization),
            ProgramVariant::Noop => Ok(&self.noop),
            ProgramVariant::Normal(index) => self
                .normal
                .get(index)
                .ok_or(CatalogError::UnknownVariant { variant }),
        }
    }

    /// Normal-operation variants in catalog order.
    pub fn normal_variants(&self) -> impl Iterator<Item = ProgramVariant> + '_ {
        (0..self.normal.len()).map(ProgramVariant::Normal)
    }

    /// Number of normal-operation variants.
    pub fn normal_count(&self) -> usize {
        self.normal.len()
    }
}

fn plan_from_config(plan: &PlanConfig) -> Result<VariantPlan, CatalogError> {
    VariantPlan::new(
        plan.phases.clone(),
        plan.primary_phase,
        plan.secondary_phase,
    )
}

// ---------------------------------------------------------------------------
// Stock programs
// ---------------------------------------------------------------------------

fn program(steps: &[(&[Lamp], u32)]) -> Result<Program, ProgramError> {
    Program::from_steps(
        steps
            .iter()
            .map(|&(lamps, ticks)| (OutputState::lit(lamps), ticks)),
    )
}

const RED: &[Lamp] = &[Lamp::Red];
const RED_YELLOW: &[Lamp] = &[Lamp::Red, Lamp::Yellow];
const YELLOW: &[Lamp] = &[Lamp::Yellow];
const GREEN: &[Lamp] = &[Lamp::Green];
const YELLOW_GREEN: &[Lamp] = &[Lamp::Yellow, Lamp::Green];
const RED_GREEN: &[Lamp] = &[Lamp::Red, Lamp::Green];
const ALL: &[Lamp] = &[Lamp::Red, Lamp::Yellow, Lamp::Green];
const OFF: &[Lamp] = &[];

fn normal_program_0() -> Result<Program, ProgramError> {
    program(&[
        (RED, TICKS_MAIN),
        (RED_YELLOW, TICKS_TRANSITION),
        (GREEN, TICKS_MAIN),
        (YELLOW, TICKS_TRANSITION),
    ])
}

fn normal_program_1() -> Result<Program, ProgramError> {
    program(&[
        (RED, TICKS_MAIN),
        (RED, TICKS_TRANSITION),
        (RED_YELLOW, TICKS_TRANSITION),
        (GREEN, TICKS_MAIN),
        (YELLOW, TICKS_TRANSITION),
        (RED, TICKS_TRANSITION),
    ])
}

fn normal_program_2() -> Result<Program, ProgramError> {
    program(&[
        (RED, TICKS_MAIN),
        (RED, TICKS_TRANSITION),
        (RED, TICKS_TRANSITION),
        (RED_YELLOW, TICKS_TRANSITION),
        (GREEN, TICKS_TRANSITION),
        (GREEN, TICKS_MAIN),
        (YELLOW, TICKS_TRANSITION),
        (RED, TICKS_TRANSITION),
        (RED, TICKS_TRANSITION),
        (RED, TICKS_TRANSITION),
    ])
}

fn noop_plan() -> Result<VariantPlan, CatalogError> {
    let blink = program(&[(YELLOW, TICKS_NOOP), (OFF, TICKS_NOOP)])?;
    VariantPlan::new(blink, 0, 0)
}

fn initialization_plan() -> Result<VariantPlan, CatalogError> {
    let double = TICKS_INIT.saturating_mul(2);
    let self_test = program(&[
        (RED, TICKS_INIT),
        (YELLOW, TICKS_INIT),
        (GREEN, TICKS_INIT),
        (YELLOW, TICKS_INIT),
        (RED, TICKS_INIT),
        (OFF, double),
        (ALL, double),
        (YELLOW_GREEN, TICKS_INIT),
        (RED_GREEN, TICKS_INIT),
        (RED_YELLOW, TICKS_INIT),
        (RED_GREEN, TICKS_INIT),
        (YELLOW_GREEN, TICKS_INIT),
        (OFF, double),
        (ALL, double),
    ])?;
    VariantPlan::new(self_test, 0, INIT_SECONDARY_PHASE)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use trafficlight_types::Phase;

    use super::*;
    use crate::sink::{OutputSink, RecordingSink};
    use crate::unit::SignalUnit;

    fn unit_for(plan: &VariantPlan, role: Role) -> SignalUnit {
        let sink: Arc<dyn OutputSink> = Arc::new(RecordingSink::new(role.to_string()));
        SignalUnit::new(role.to_string(), sink, &plan.assignment(role)).unwrap()
    }

    #[test]
    fn standard_catalog_builds() {
        let catalog = ProgramCatalog::standard().unwrap();
        assert_eq!(catalog.normal_count(), 3);
        assert_eq!(
            catalog.normal_variants().collect::<Vec<_>>(),
            vec![
                ProgramVariant::Normal(0),
                ProgramVariant::Normal(1),
                ProgramVariant::Normal(2)
            ]
        );
        let init = catalog.plan(ProgramVariant::Initialization).unwrap();
        assert_eq!(init.program().len(), 14);
        assert_eq!(init.start_phase(Role::Secondary), 7);
    }

    #[test]
    fn normal_plans_start_primary_green_secondary_red() {
        let catalog = ProgramCatalog::standard().unwrap();
        for variant in catalog.normal_variants() {
            let plan = catalog.plan(variant).unwrap();
            let primary = plan.program().phase(plan.start_phase(Role::Primary)).unwrap();
            let secondary = plan
                .program()
                .phase(plan.start_phase(Role::Secondary))
                .unwrap();
            assert!(primary.state.is_on(Lamp::Green), "{variant}");
            assert!(secondary.state.is_on(Lamp::Red), "{variant}");
        }
    }

    #[test]
    fn paired_heads_never_both_green() {
        let catalog = ProgramCatalog::standard().unwrap();
        for variant in catalog.normal_variants() {
            let plan = catalog.plan(variant).unwrap();
            let primary = unit_for(plan, Role::Primary);
            let secondary = unit_for(plan, Role::Secondary);
            let ticks = plan.program().cycle_ticks().saturating_mul(2);
            for tick in 0..ticks {
                let a = primary.snapshot().unwrap().output;
                let b = secondary.snapshot().unwrap().output;
                assert!(
                    !(a.is_on(Lamp::Green) && b.is_on(Lamp::Green)),
                    "{variant}: both heads green at tick {tick}"
                );
                let _ = primary.consume_tick().unwrap();
                let _ = secondary.consume_tick().unwrap();
            }
        }
    }

    #[test]
    fn unknown_normal_variant() {
        let catalog = ProgramCatalog::standard().unwrap();
        assert_eq!(
            catalog.plan(ProgramVariant::Normal(3)),
            Err(CatalogError::UnknownVariant {
                variant: ProgramVariant::Normal(3)
            })
        );
    }

    #[test]
    fn plan_rejects_out_of_range_start() {
        let program = normal_program_0().unwrap();
        let err = VariantPlan::new(program, 0, 4).unwrap_err();
        assert_eq!(
            err,
            CatalogError::InvalidStartPhase {
                role: Role::Secondary,
                index: 4,
                len: 4
            }
        );
    }

    #[test]
    fn config_with_out_of_range_start_is_rejected() {
        let blink = Program::new(vec![
            Phase::new(OutputState::lit(&[Lamp::Yellow]), 1).unwrap(),
            Phase::new(OutputState::dark(), 1).unwrap(),
        ])
        .unwrap();
        let config = ProgramsConfig {
            initialization: None,
            noop: None,
            normal: Some(vec![PlanConfig {
                phases: blink,
                primary_phase: 2,
                secondary_phase: 0,
            }]),
        };
        assert_eq!(
            ProgramCatalog::from_config(&config).unwrap_err(),
            CatalogError::InvalidStartPhase {
                role: Role::Primary,
                index: 2,
                len: 2
            }
        );
    }

    #[test]
    fn config_overrides_replace_stock_programs() {
        let blink = Program::new(vec![
            Phase::new(OutputState::lit(&[Lamp::Red]), 2).unwrap(),
            Phase::new(OutputState::dark(), 2).unwrap(),
        ])
        .unwrap();
        let config = ProgramsConfig {
            initialization: None,
            noop: Some(PlanConfig {
                phases: blink.clone(),
                primary_phase: 0,
                secondary_phase: 1,
            }),
            normal: Some(Vec::new()),
        };
        let catalog = ProgramCatalog::from_config(&config).unwrap();
        let noop = catalog.plan(ProgramVariant::Noop).unwrap();
        assert_eq!(noop.program().as_ref(), &blink);
        assert_eq!(noop.start_phase(Role::Secondary), 1);
        assert_eq!(catalog.normal_count(), 0);
        assert!(catalog.plan(ProgramVariant::Initialization).is_ok());
    }
}

//! The demo cycle: self-test, then blinking between every normal program.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{info, warn};
use trafficlight_core::config::CycleConfig;
use trafficlight_core::{Conductor, ConductorError, ProgramCatalog};
use trafficlight_types::ProgramVariant;

/// Why the demo cycle returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    /// `max_cycles` full cycles ran.
    Completed {
        /// Cycles finished.
        cycles: u64,
    },
    /// The shutdown future resolved first.
    Interrupted {
        /// Cycles finished before the interruption.
        cycles: u64,
    },
}

/// Programs of one cycle with how long each is kept: blinking, each normal
/// program followed by blinking, then the self-test.
pub fn schedule(catalog: &ProgramCatalog, cycle: &CycleConfig) -> Vec<(ProgramVariant, Duration)> {
    let keep_initial = Duration::from_millis(cycle.keep_initial_ms);
    let keep_noop = Duration::from_millis(cycle.keep_noop_ms);
    let keep_normal = Duration::from_millis(cycle.keep_normal_ms);

    let mut steps = vec![(ProgramVariant::Noop, keep_noop)];
    for variant in catalog.normal_variants() {
        steps.push((variant, keep_normal));
        steps.push((ProgramVariant::Noop, keep_noop));
    }
    steps.push((ProgramVariant::Initialization, keep_initial));
    steps
}

/// Run the demo cycle on a started conductor until `max_cycles` cycles
/// complete (never, if 0) or `shutdown` resolves.
///
/// The self-test is shown once up front, then the [`schedule`] repeats.
pub async fn run_demo_cycle<F>(
    conductor: &Conductor,
    cycle: &CycleConfig,
    shutdown: F,
) -> Result<CycleEnd, ConductorError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let steps = schedule(conductor.catalog(), cycle);
    let mut completed = 0_u64;

    conductor.set_initial_program()?;
    tokio::select! {
        () = tokio::time::sleep(Duration::from_millis(cycle.keep_initial_ms)) => {}
        () = shutdown.as_mut() => return Ok(CycleEnd::Interrupted { cycles: 0 }),
    }

    loop {
        if cycle.max_cycles != 0 && completed >= cycle.max_cycles {
            return Ok(CycleEnd::Completed { cycles: completed });
        }
        if !hold(&steps, conductor, &mut shutdown).await? {
            info!(cycles = completed, "demo cycle interrupted");
            return Ok(CycleEnd::Interrupted { cycles: completed });
        }
        completed = completed.saturating_add(1);
        info!(
            cycles = completed,
            ticks = conductor.ticks_broadcast(),
            "demo cycle complete"
        );
    }
}

/// Run the demo cycle, then stop and join the conductor whatever the
/// cycle returned.
///
/// Tasks still running after the join grace period are aborted. A cycle
/// error is returned after the conductor has drained.
pub async fn run_and_drain<F>(
    conductor: &Conductor,
    cycle: &CycleConfig,
    shutdown: F,
) -> Result<CycleEnd, ConductorError>
where
    F: Future<Output = ()>,
{
    let outcome = run_demo_cycle(conductor, cycle, shutdown).await;
    if let Err(err) = &outcome {
        warn!(error = %err, "demo cycle failed; draining conductor");
    }

    conductor.stop();
    match conductor.join().await {
        Ok(()) => outcome,
        Err(ConductorError::ShutdownTimeout { units }) => {
            let aborted = conductor.abort_stragglers();
            warn!(stragglers = ?units, aborted = ?aborted, "Forced shutdown");
            outcome
        }
        Err(err) => outcome.and(Err(err)),
    }
}

/// Switch to each program and keep it for its duration. Returns `false` as
/// soon as `shutdown` resolves.
async fn hold<F>(
    steps: &[(ProgramVariant, Duration)],
    conductor: &Conductor,
    shutdown: &mut Pin<&mut F>,
) -> Result<bool, ConductorError>
where
    F: Future<Output = ()>,
{
    for &(variant, keep) in steps {
        conductor.set_program(variant)?;
        tokio::select! {
            () = tokio::time::sleep(keep) => {}
            () = shutdown.as_mut() => return Ok(false),
        }
    }
    Ok(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use trafficlight_core::{ConductorSettings, Lifecycle, OutputSink, RecordingSink, SignalUnit};
    use trafficlight_types::Role;

    use super::*;

    fn short_cycle(max_cycles: u64) -> CycleConfig {
        CycleConfig {
            keep_initial_ms: 1000,
            keep_noop_ms: 1000,
            keep_normal_ms: 2000,
            max_cycles,
        }
    }

    async fn started_conductor() -> Conductor {
        let catalog = ProgramCatalog::standard().unwrap();
        let init = catalog.plan(ProgramVariant::Initialization).unwrap().clone();
        let units = ["North", "East"]
            .into_iter()
            .map(|name| {
                let sink: Arc<dyn OutputSink> = Arc::new(RecordingSink::new(name));
                SignalUnit::new(name, sink, &init.assignment(Role::Primary)).unwrap()
            })
            .collect();
        let conductor = Conductor::new(units, catalog, ConductorSettings::default()).unwrap();
        conductor.start().await.unwrap();
        conductor
    }

    #[test]
    fn schedule_covers_every_program() {
        let catalog = ProgramCatalog::standard().unwrap();
        let steps = schedule(&catalog, &short_cycle(0));
        let variants: Vec<ProgramVariant> = steps.iter().map(|&(variant, _)| variant).collect();
        assert_eq!(
            variants,
            vec![
                ProgramVariant::Noop,
                ProgramVariant::Normal(0),
                ProgramVariant::Noop,
                ProgramVariant::Normal(1),
                ProgramVariant::Noop,
                ProgramVariant::Normal(2),
                ProgramVariant::Noop,
                ProgramVariant::Initialization,
            ]
        );
        assert_eq!(steps.get(1).map(|&(_, keep)| keep), Some(Duration::from_secs(2)));
        assert_eq!(steps.last().map(|&(_, keep)| keep), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn completes_configured_cycles() {
        let conductor = started_conductor().await;
        let end = run_demo_cycle(&conductor, &short_cycle(2), std::future::pending())
            .await
            .unwrap();
        assert_eq!(end, CycleEnd::Completed { cycles: 2 });
        assert_eq!(conductor.active_variant(), Some(ProgramVariant::Initialization));
        // 1 s lead-in, then two cycles of 4 x 1 s + 3 x 2 s + 1 s, at 100 ms per tick.
        assert!(conductor.ticks_broadcast() >= 229);
        conductor.stop();
        conductor.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_the_cycle() {
        let conductor = started_conductor().await;
        let shutdown = tokio::time::sleep(Duration::from_millis(1500));
        let end = run_demo_cycle(&conductor, &short_cycle(0), shutdown)
            .await
            .unwrap();
        assert_eq!(end, CycleEnd::Interrupted { cycles: 0 });
        assert_eq!(conductor.active_variant(), Some(ProgramVariant::Noop));
        conductor.stop();
        conductor.join().await.unwrap();
    }

    #[tokio::test]
    async fn stopped_conductor_ends_the_cycle_with_an_error() {
        let conductor = started_conductor().await;
        conductor.stop();
        let result = run_demo_cycle(&conductor, &short_cycle(0), std::future::pending()).await;
        assert!(matches!(result, Err(ConductorError::InvalidState { .. })));
        conductor.join().await.unwrap();
    }

    #[tokio::test]
    async fn failed_cycle_still_drains_the_conductor() {
        let conductor = started_conductor().await;
        conductor.stop();
        let result = run_and_drain(&conductor, &short_cycle(0), std::future::pending()).await;
        assert!(matches!(result, Err(ConductorError::InvalidState { .. })));
        assert_eq!(conductor.state(), Lifecycle::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_cycle_leaves_the_conductor_stopped() {
        let conductor = started_conductor().await;
        let end = run_and_drain(&conductor, &short_cycle(1), std::future::pending())
            .await
            .unwrap();
        assert_eq!(end, CycleEnd::Completed { cycles: 1 });
        assert_eq!(conductor.state(), Lifecycle::Stopped);
    }
}

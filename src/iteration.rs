use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::errors::BenchError;
use crate::metrics::MetricSink;
use crate::target::{ReadyTiming, TargetControl, wait_until_ready};
use crate::types::IterationState;

/// State shared by the runner and the scenario hooks for one run.
#[derive(Debug)]
pub struct RunContext {
    pub temp_dir: PathBuf,
    pub profile_dir: PathBuf,
    pub target_name: String,
    pub sink: MetricSink,
}

/// Hook points a benchmark scenario plugs into the fixed run lifecycle.
///
/// Every hook defaults to doing nothing. `post_iteration` runs after every
/// iteration, with `success == false` when the iteration failed; in that case
/// it must only clean up, and must cope with a `pre_iteration` that stopped
/// halfway.
pub trait Scenario {
    fn set_up(&mut self, _ctx: &mut RunContext) -> Result<(), BenchError> {
        Ok(())
    }

    /// Factor applied to the requested iteration count.
    fn iteration_multiplier(&self) -> usize {
        1
    }

    fn pre_iteration(&mut self, _iteration: usize, _ctx: &mut RunContext) -> Result<(), BenchError> {
        Ok(())
    }

    /// Extra target arguments for this iteration.
    fn launch_args(&self, _iteration: usize) -> Vec<String> {
        Vec::new()
    }

    /// Workload body, run while the target is up.
    fn do_iteration(&mut self, _iteration: usize, _ctx: &mut RunContext) -> Result<(), BenchError> {
        Ok(())
    }

    fn post_iteration(
        &mut self,
        _iteration: usize,
        _success: bool,
        _ctx: &mut RunContext,
    ) -> Result<(), BenchError> {
        Ok(())
    }

    /// Runs once after every iteration succeeded.
    fn process_results(&mut self, _ctx: &mut RunContext) -> Result<(), BenchError> {
        Ok(())
    }

    /// Runs once at the end of every run, including failed ones.
    fn tear_down(&mut self, _ctx: &mut RunContext) -> Result<(), BenchError> {
        Ok(())
    }
}

fn advance(iteration: usize, stage: &mut IterationState, next: IterationState) {
    debug!(iteration, from = %stage, to = %next, "iteration state");
    *stage = next;
}

/// Drives one iteration through the state machine.
///
/// Once the target has been launched it is always shut down, exactly once,
/// whatever happens while waiting for it or running the workload. Errors come
/// back wrapped with the iteration index and the stage that failed.
pub fn run_iteration<T, S>(
    iteration: usize,
    target: &mut T,
    scenario: &mut S,
    ctx: &mut RunContext,
    timing: ReadyTiming,
) -> Result<(), BenchError>
where
    T: TargetControl + ?Sized,
    S: Scenario + ?Sized,
{
    info!("Starting iteration {iteration}.");
    let mut stage = IterationState::Idle;

    if let Err(err) = drive(iteration, target, scenario, ctx, timing, &mut stage) {
        let failed_in = stage;
        advance(iteration, &mut stage, IterationState::Failed);
        warn!(iteration, stage = %failed_in, error = %err, "iteration failed");
        if let Err(cleanup) = scenario.post_iteration(iteration, false, ctx) {
            warn!(iteration, error = %cleanup, "cleanup after failed iteration failed");
        }
        return Err(wrap(iteration, failed_in, err));
    }

    // Artifact processing failures surface at TornDown; the hook is not re-run.
    scenario
        .post_iteration(iteration, true, ctx)
        .map_err(|err| wrap(iteration, IterationState::TornDown, err))?;
    advance(iteration, &mut stage, IterationState::Idle);
    Ok(())
}

fn drive<T, S>(
    iteration: usize,
    target: &mut T,
    scenario: &mut S,
    ctx: &mut RunContext,
    timing: ReadyTiming,
    stage: &mut IterationState,
) -> Result<(), BenchError>
where
    T: TargetControl + ?Sized,
    S: Scenario + ?Sized,
{
    scenario.pre_iteration(iteration, ctx)?;
    advance(iteration, stage, IterationState::LoggingStarted);

    let args = scenario.launch_args(iteration);
    target.launch(&ctx.profile_dir, &args)?;
    advance(iteration, stage, IterationState::Launched);

    let outcome = ready_then_workload(iteration, target, scenario, ctx, timing, stage);
    let shutdown = target.shut_down(&ctx.profile_dir);

    if let Err(err) = outcome {
        if let Err(shutdown_err) = shutdown {
            warn!(iteration, error = %shutdown_err, "shutting down target after failure failed");
        }
        return Err(err);
    }
    shutdown?;
    advance(iteration, stage, IterationState::TornDown);
    Ok(())
}

fn ready_then_workload<T, S>(
    iteration: usize,
    target: &mut T,
    scenario: &mut S,
    ctx: &mut RunContext,
    timing: ReadyTiming,
    stage: &mut IterationState,
) -> Result<(), BenchError>
where
    T: TargetControl + ?Sized,
    S: Scenario + ?Sized,
{
    wait_until_ready(target, &ctx.profile_dir, timing)?;
    advance(iteration, stage, IterationState::Ready);

    advance(iteration, stage, IterationState::WorkloadRunning);
    scenario.do_iteration(iteration, ctx)
}

fn wrap(iteration: usize, stage: IterationState, err: BenchError) -> BenchError {
    BenchError::Iteration {
        iteration,
        stage,
        source: Box::new(err),
    }
}

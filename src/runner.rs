use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{info, warn};

use crate::errors::BenchError;
use crate::iteration::{RunContext, Scenario, run_iteration};
use crate::metrics::MetricSink;
use crate::target::{ReadyTiming, TargetControl, wait_until_ready};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Profile directory for the target. `None` uses a run-owned temporary one.
    pub profile_dir: Option<PathBuf>,
    /// Wipe the profile and launch the target once with `--no-first-run` before iterating.
    pub initialize_profile: bool,
    pub keep_temp_dirs: bool,
    pub timing: ReadyTiming,
}

/// Directories a run owns. Dropping it deletes whatever is still temporary.
struct RunDirs {
    temp: Option<TempDir>,
    temp_path: PathBuf,
    profile: Option<TempDir>,
    profile_path: PathBuf,
}

/// Runs a scenario against a target for a number of iterations.
pub struct Runner<T: TargetControl> {
    target: T,
    options: RunOptions,
    sink: MetricSink,
}

impl<T: TargetControl> Runner<T> {
    pub fn new(target: T, options: RunOptions) -> Self {
        Runner {
            target,
            options,
            sink: MetricSink::new(),
        }
    }

    /// Everything recorded so far, including what a failed run gathered
    /// before it stopped.
    pub fn sink(&self) -> &MetricSink {
        &self.sink
    }

    pub fn into_sink(self) -> MetricSink {
        self.sink
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Runs `iterations * scenario.iteration_multiplier()` iterations.
    ///
    /// Stops at the first failing iteration. Scenario tear-down and deletion
    /// of the run's temporary directories happen on every path once set-up
    /// has created them.
    pub fn run<S: Scenario + ?Sized>(
        &mut self,
        scenario: &mut S,
        iterations: usize,
    ) -> Result<(), BenchError> {
        let multiplier = scenario.iteration_multiplier().max(1);
        let total = iterations.checked_mul(multiplier).ok_or_else(|| {
            BenchError::Configuration(format!(
                "{iterations} iterations with a multiplier of {multiplier} overflows"
            ))
        })?;
        let dirs = self.create_dirs()?;
        let mut ctx = RunContext {
            temp_dir: dirs.temp_path.clone(),
            profile_dir: dirs.profile_path.clone(),
            target_name: self.target.name().to_string(),
            sink: std::mem::take(&mut self.sink),
        };

        let outcome = self.set_up_and_iterate(scenario, &mut ctx, dirs.profile.is_some(), total);

        let teardown = scenario.tear_down(&mut ctx);
        self.sink = std::mem::take(&mut ctx.sink);
        self.remove_dirs(dirs);

        match (outcome, teardown) {
            (Err(err), Err(teardown_err)) => {
                warn!(error = %teardown_err, "tear-down after failed run failed");
                Err(err)
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn set_up_and_iterate<S: Scenario + ?Sized>(
        &mut self,
        scenario: &mut S,
        ctx: &mut RunContext,
        profile_is_temp: bool,
        total: usize,
    ) -> Result<(), BenchError> {
        self.prepare_profile(&ctx.profile_dir, profile_is_temp)?;
        scenario.set_up(ctx)?;

        for i in 0..total {
            run_iteration(i, &mut self.target, scenario, ctx, self.options.timing)?;
        }
        scenario.process_results(ctx)
    }

    fn create_dirs(&self) -> Result<RunDirs, BenchError> {
        let temp = tempfile::Builder::new()
            .prefix("launchbench-")
            .tempdir()
            .map_err(|e| BenchError::io(std::env::temp_dir(), e))?;
        let temp_path = temp.path().to_path_buf();
        info!(path = %temp_path.display(), "created temporary directory");

        let (profile, profile_path) = match &self.options.profile_dir {
            Some(dir) => (None, dir.clone()),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("launchbench-profile-")
                    .tempdir()
                    .map_err(|e| BenchError::io(std::env::temp_dir(), e))?;
                let path = dir.path().to_path_buf();
                info!(path = %path.display(), "using temporary profile directory");
                (Some(dir), path)
            }
        };

        Ok(RunDirs {
            temp: Some(temp),
            temp_path,
            profile,
            profile_path,
        })
    }

    fn remove_dirs(&self, mut dirs: RunDirs) {
        if let Some(temp) = dirs.temp.take() {
            if self.options.keep_temp_dirs {
                let kept = temp.keep();
                info!(path = %kept.display(), "keeping temporary directory");
            } else {
                info!(path = %dirs.temp_path.display(), "deleting temporary directory");
                if let Err(e) = temp.close() {
                    warn!(error = %e, "failed to delete temporary directory");
                }
            }
        }
        if let Some(profile) = dirs.profile.take() {
            info!(path = %dirs.profile_path.display(), "deleting temporary profile directory");
            if let Err(e) = profile.close() {
                warn!(error = %e, "failed to delete temporary profile directory");
            }
        }
    }

    /// Wipes and initialises the profile when asked to, or when it does not exist yet.
    ///
    /// A profile that is already locked is only accepted when it is about to be wiped.
    fn prepare_profile(&mut self, profile: &Path, is_temp: bool) -> Result<(), BenchError> {
        let initialize = is_temp || self.options.initialize_profile || !profile.is_dir();
        if self.target.is_ready(profile) {
            if !initialize {
                return Err(BenchError::Configuration(format!(
                    "profile \"{}\" is locked by {}; stop it or remove the lock, \
                     or enable profile initialization",
                    profile.display(),
                    self.target.name()
                )));
            }
            // Wiping the profile below removes the lock along with it.
            warn!(path = %profile.display(), "profile lock already present, discarding it");
        }
        if !initialize {
            return Ok(());
        }

        if profile.exists() {
            fs::remove_dir_all(profile).map_err(|e| BenchError::io(profile, e))?;
        }
        fs::create_dir_all(profile).map_err(|e| BenchError::io(profile, e))?;

        info!(path = %profile.display(), "initializing profile directory");
        self.target
            .launch(profile, &["--no-first-run".to_string()])?;
        let ready = wait_until_ready(&mut self.target, profile, self.options.timing);
        let shutdown = self.target.shut_down(profile);
        ready?;
        shutdown
    }
}

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::counters::{CounterService, CounterSnapshot, record_counters};
use crate::errors::BenchError;
use crate::iteration::{RunContext, Scenario};
use crate::preload::{PreloadGuard, PreloadStore};
use crate::prefetch::PrefetchCache;
use crate::service::{Liveness, ServiceCommand, ServiceSlot};
use crate::trace::{
    EventCounter, TraceDecoder, decode_segments, record_page_faults, record_timings,
    segment_paths,
};
use crate::types::{CounterGroup, PrefetchPolicy, PreloadSetting};
use crate::workingset::{
    ProcessWorkingSet, WorkingSetSource, record_working_sets, summarize,
};

/// Per-iteration trace logging through a `start`/`stop` service.
pub struct TraceCapture {
    pub program: PathBuf,
    pub extra_args: Vec<String>,
    pub verbose: bool,
    pub extension: String,
    pub decoder: Box<dyn TraceDecoder>,
    pub liveness: Liveness,
}

/// Hardware counters sampled one group per iteration, cycling through the groups.
pub struct CounterSampling {
    pub service: Box<dyn CounterService>,
    pub groups: Vec<CounterGroup>,
}

impl CounterSampling {
    fn group_for(&self, iteration: usize) -> Option<&CounterGroup> {
        if self.groups.is_empty() {
            return None;
        }
        self.groups.get(iteration % self.groups.len())
    }
}

/// Startup benchmark: settles the target, then gathers trace timings, page
/// faults, hardware counters and working-set sizes for every iteration.
pub struct StartupBenchmark {
    graph: String,
    process_name: String,
    module_suffix: String,
    settle: Duration,
    prefetch: Option<(PrefetchPolicy, Box<dyn PrefetchCache>)>,
    preload: Option<(Box<dyn PreloadStore>, PreloadSetting)>,
    preload_guard: Option<PreloadGuard>,
    trace: Option<TraceCapture>,
    trace_slot: ServiceSlot,
    counters: Option<CounterSampling>,
    working_set: Option<Box<dyn WorkingSetSource>>,
    pending_counters: Option<CounterSnapshot>,
    pending_working_set: Option<Vec<ProcessWorkingSet>>,
}

impl StartupBenchmark {
    /// `process_name` selects the target's processes in traces, counter
    /// queries and working-set snapshots; `module_suffix` names its primary
    /// binary in working-set snapshots.
    pub fn new(graph: &str, process_name: &str, module_suffix: &str) -> Self {
        StartupBenchmark {
            graph: graph.to_string(),
            process_name: process_name.to_string(),
            module_suffix: module_suffix.to_string(),
            settle: Duration::from_secs(10),
            prefetch: None,
            preload: None,
            preload_guard: None,
            trace: None,
            trace_slot: ServiceSlot::new("trace"),
            counters: None,
            working_set: None,
            pending_counters: None,
            pending_working_set: None,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_prefetch(mut self, policy: PrefetchPolicy, cache: Box<dyn PrefetchCache>) -> Self {
        self.prefetch = Some((policy, cache));
        self
    }

    pub fn with_preload(mut self, store: Box<dyn PreloadStore>, setting: PreloadSetting) -> Self {
        self.preload = Some((store, setting));
        self
    }

    pub fn with_trace(mut self, trace: TraceCapture) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_counters(mut self, counters: CounterSampling) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn with_working_set(mut self, source: Box<dyn WorkingSetSource>) -> Self {
        self.working_set = Some(source);
        self
    }

    fn clear_prefetch(&mut self, iteration: usize, before: bool) -> Result<(), BenchError> {
        let Some((policy, cache)) = self.prefetch.as_mut() else {
            return Ok(());
        };
        let due = if before {
            policy.clears_before(iteration)
        } else {
            policy.clears_after(iteration)
        };
        if due {
            let when = if before { "before" } else { "after" };
            info!(iteration, "deleting prefetch files {when} iteration");
            cache.clear()?;
        }
        Ok(())
    }

    fn start_trace(&mut self, ctx: &RunContext) -> Result<(), BenchError> {
        let Some(trace) = &self.trace else {
            return Ok(());
        };
        for segment in segment_paths(&ctx.temp_dir, &ctx.target_name, &trace.extension) {
            if segment.exists() {
                fs::remove_file(&segment).map_err(|e| BenchError::io(&segment, e))?;
            }
        }
        let command = ServiceCommand::logging(
            "trace",
            &trace.program,
            &ctx.temp_dir,
            trace.verbose,
            &trace.extra_args,
        );
        let log_path = ctx.temp_dir.join("trace_service_log.txt");
        self.trace_slot.start(command, &log_path, trace.liveness)
    }

    /// Stops per-iteration services. Returns the first failure after trying all of them.
    fn stop_services(&mut self) -> Result<(), BenchError> {
        let counters = match self.counters.as_mut() {
            Some(sampling) if sampling.service.is_running() => sampling.service.stop(),
            _ => Ok(()),
        };
        let trace = self.trace_slot.stop_if_running();
        counters.and(trace)
    }

    fn process_artifacts(&mut self, ctx: &mut RunContext) -> Result<(), BenchError> {
        if let Some(trace) = &self.trace {
            let segments = segment_paths(&ctx.temp_dir, &ctx.target_name, &trace.extension);
            let events = decode_segments(trace.decoder.as_ref(), &segments)?;
            let counter = EventCounter::count(&events, &self.process_name);
            record_timings(&mut ctx.sink, &self.graph, &counter);
            record_page_faults(&mut ctx.sink, &self.graph, &counter);
        }

        if let (Some(snapshot), Some(sampling)) = (self.pending_counters.take(), &self.counters) {
            let reference = sampling.service.catalog().reference.clone();
            record_counters(&mut ctx.sink, &self.graph, &snapshot, &reference)?;
        }

        if let Some(snapshot) = self.pending_working_set.take() {
            let summaries = summarize(&snapshot, &self.module_suffix);
            record_working_sets(&mut ctx.sink, &self.graph, &summaries);
        }
        Ok(())
    }
}

impl Scenario for StartupBenchmark {
    fn set_up(&mut self, _ctx: &mut RunContext) -> Result<(), BenchError> {
        if let Some((store, setting)) = self.preload.take() {
            self.preload_guard = Some(PreloadGuard::apply(store, setting)?);
        }
        Ok(())
    }

    fn iteration_multiplier(&self) -> usize {
        self.counters
            .as_ref()
            .map(|c| c.groups.len().max(1))
            .unwrap_or(1)
    }

    fn pre_iteration(&mut self, iteration: usize, ctx: &mut RunContext) -> Result<(), BenchError> {
        self.pending_counters = None;
        self.pending_working_set = None;

        self.start_trace(ctx)?;
        self.clear_prefetch(iteration, true)?;

        if let Some(sampling) = self.counters.as_mut() {
            if sampling.service.is_running() {
                return Err(BenchError::ServiceAlreadyRunning {
                    service: "counters".to_string(),
                });
            }
            if let Some(group) = sampling.group_for(iteration).cloned() {
                sampling.service.start(&group)?;
            }
        }
        Ok(())
    }

    fn do_iteration(&mut self, _iteration: usize, _ctx: &mut RunContext) -> Result<(), BenchError> {
        info!(settle = ?self.settle, "letting the target settle");
        thread::sleep(self.settle);

        // Both captures need the target still running.
        if let Some(sampling) = self.counters.as_mut()
            && sampling.service.is_running()
        {
            self.pending_counters = Some(sampling.service.query(&self.process_name)?);
        }
        if let Some(source) = self.working_set.as_mut() {
            self.pending_working_set = Some(source.capture(&self.process_name)?);
        }
        Ok(())
    }

    fn post_iteration(
        &mut self,
        iteration: usize,
        success: bool,
        ctx: &mut RunContext,
    ) -> Result<(), BenchError> {
        let stopped = self.stop_services();

        let processed = if success {
            stopped.and_then(|()| self.process_artifacts(ctx))
        } else {
            if let Err(e) = stopped {
                warn!(iteration, error = %e, "stopping services after failure failed");
            }
            Ok(())
        };

        let cleared = self.clear_prefetch(iteration, false);
        if !success && let Err(e) = &cleared {
            warn!(iteration, error = %e, "deleting prefetch files after failure failed");
            return Ok(());
        }
        processed.and(cleared)
    }

    fn tear_down(&mut self, _ctx: &mut RunContext) -> Result<(), BenchError> {
        let stopped = self.stop_services();
        let restored = match self.preload_guard.take() {
            Some(guard) => guard.restore(),
            None => Ok(()),
        };
        stopped.and(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::plan_groups;
    use crate::runner::{RunOptions, Runner};
    use crate::target::ReadyTiming;
    use crate::testing::{
        CannedDecoder, FakeCounters, FakePrefetch, FakePreload, FakeTarget, FakeWorkingSet,
        HookLog,
    };
    use crate::trace::TraceEvent;
    use crate::types::Sample;
    use assert_fs::TempDir;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    fn runner(log: &HookLog, exit_early_at: Option<usize>) -> (TempDir, Runner<FakeTarget>) {
        let tmp = TempDir::new().unwrap();
        let profile = tmp.path().join("profile");
        fs::create_dir(&profile).unwrap();
        let mut target = FakeTarget::new(log.clone());
        target.exit_early_at = exit_early_at;
        let options = RunOptions {
            profile_dir: Some(profile),
            initialize_profile: false,
            keep_temp_dirs: false,
            timing: ReadyTiming {
                poll_interval: Duration::from_millis(1),
                timeout: Duration::from_millis(30),
            },
        };
        (tmp, Runner::new(target, options))
    }

    fn bench() -> StartupBenchmark {
        StartupBenchmark::new("Chrome", "chrome", "chrome").with_settle(Duration::ZERO)
    }

    #[test]
    fn disabled_prefetch_clears_before_and_after_every_iteration() {
        let log = HookLog::default();
        let (_tmp, mut runner) = runner(&log, None);
        let mut scenario =
            bench().with_prefetch(PrefetchPolicy::Disabled, Box::new(FakePrefetch(log.clone())));

        runner.run(&mut scenario, 3).unwrap();
        assert_eq!(log.count("prefetch clear"), 6);
    }

    #[test]
    fn reset_prefetch_clears_once_before_first_iteration() {
        let log = HookLog::default();
        let (_tmp, mut runner) = runner(&log, None);
        let mut scenario = bench().with_prefetch(
            PrefetchPolicy::ResetPriorToFirstLaunch,
            Box::new(FakePrefetch(log.clone())),
        );

        runner.run(&mut scenario, 3).unwrap();
        assert_eq!(log.count("prefetch clear"), 1);
        assert_eq!(log.entries()[0], "prefetch clear");
    }

    #[test]
    fn enabled_prefetch_never_clears() {
        let log = HookLog::default();
        let (_tmp, mut runner) = runner(&log, None);
        let mut scenario =
            bench().with_prefetch(PrefetchPolicy::Enabled, Box::new(FakePrefetch(log.clone())));

        runner.run(&mut scenario, 3).unwrap();
        assert_eq!(log.count("prefetch clear"), 0);
    }

    #[test]
    fn preload_is_restored_once_when_an_iteration_fails() {
        let log = HookLog::default();
        let (_tmp, mut runner) = runner(&log, Some(1));
        let current = Rc::new(RefCell::new(PreloadSetting::default()));
        let store = FakePreload {
            log: log.clone(),
            current: current.clone(),
        };
        let mut scenario = bench().with_preload(
            Box::new(store),
            PreloadSetting {
                enabled: true,
                size: None,
                stride: None,
            },
        );

        runner.run(&mut scenario, 3).unwrap_err();

        assert_eq!(log.count("preload set true"), 1);
        assert_eq!(log.count("preload set false"), 1);
        assert_eq!(log.count("shutdown"), 2);
        assert!(!current.borrow().enabled);
    }

    #[test]
    fn counter_groups_multiply_iterations_and_cycle() {
        let log = HookLog::default();
        let (_tmp, mut runner) = runner(&log, None);
        let service = FakeCounters::new(log.clone(), &["A", "B", "C"], 2);
        let groups = plan_groups(&BTreeSet::new(), &service.catalog).unwrap();
        assert_eq!(groups.len(), 3);
        let mut scenario = bench().with_counters(CounterSampling {
            service: Box::new(service),
            groups,
        });

        runner.run(&mut scenario, 2).unwrap();

        let starts: Vec<String> = log
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("counters start"))
            .collect();
        assert_eq!(
            starts,
            vec![
                "counters start {A, CYCLES}",
                "counters start {B, CYCLES}",
                "counters start {C, CYCLES}",
                "counters start {A, CYCLES}",
                "counters start {B, CYCLES}",
                "counters start {C, CYCLES}",
            ]
        );
        assert_eq!(log.count("counters stop"), 6);

        // Pid 200 has the larger CYCLES count, so it takes rank 0.
        let sink = runner.sink();
        assert_eq!(
            sink.get("Chrome", "Counters[CYCLES][0]").unwrap().samples,
            vec![Sample::Int(50); 6]
        );
        assert_eq!(
            sink.get("Chrome", "Counters[A][1]").unwrap().samples,
            vec![Sample::Int(5); 2]
        );
    }

    #[cfg(unix)]
    #[test]
    fn records_trace_and_working_set_metrics() {
        let log = HookLog::default();
        let (tmp, mut runner) = runner(&log, None);
        let svc = tmp.path().join("svc");
        write_service(&svc);

        let events = vec![
            TraceEvent::ProcessStart {
                timestamp: 1.0,
                pid: 1,
                image: "chrome".to_string(),
            },
            TraceEvent::MessageLoopBegin {
                timestamp: 1.5,
                pid: 1,
            },
            TraceEvent::HardFault {
                timestamp: 1.1,
                process_image: "chrome".to_string(),
                module: "libc.so".to_string(),
            },
        ];
        let mut scenario = bench()
            .with_trace(TraceCapture {
                program: svc,
                extra_args: Vec::new(),
                verbose: false,
                extension: "jsonl".to_string(),
                decoder: Box::new(CannedDecoder(events)),
                liveness: Liveness {
                    checks: 1,
                    interval: Duration::from_millis(20),
                },
            })
            .with_working_set(Box::new(FakeWorkingSet));

        runner.run(&mut scenario, 2).unwrap();

        let sink = runner.sink();
        assert_eq!(
            sink.get("Chrome", "MessageLoopStartTime").unwrap().samples,
            vec![Sample::Float(0.5); 2]
        );
        assert_eq!(
            sink.get("Chrome", "HardPageFaults[libc.so]").unwrap().samples,
            vec![Sample::Int(1); 2]
        );
        assert_eq!(
            sink.get("Chrome", "TotalWs[0][Pages]").unwrap().samples,
            vec![Sample::Int(300); 2]
        );
        assert_eq!(
            sink.get("Chrome", "BinaryWs[0][Pages]").unwrap().samples,
            vec![Sample::Int(120); 2]
        );
        assert!(sink.get("Chrome", "RendererLaunchTime").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn undecodable_trace_fails_at_torn_down() {
        let log = HookLog::default();
        let (tmp, mut runner) = runner(&log, None);
        let svc = tmp.path().join("svc");
        write_service(&svc);

        let mut scenario = bench().with_trace(TraceCapture {
            program: svc,
            extra_args: Vec::new(),
            verbose: false,
            extension: "bad".to_string(),
            decoder: Box::new(CannedDecoder(Vec::new())),
            liveness: Liveness {
                checks: 1,
                interval: Duration::from_millis(20),
            },
        });

        let err = runner.run(&mut scenario, 3).unwrap_err();
        assert_eq!(
            err.iteration_stage(),
            Some((0, crate::types::IterationState::TornDown))
        );
        assert_eq!(log.count("launch"), 1);
    }

    /// A logging service that stays up until its `stop` command runs.
    #[cfg(unix)]
    fn write_service(path: &std::path::Path) {
        use std::os::unix::fs::PermissionsExt;
        let marker = path.with_extension("stopped");
        fs::write(
            path,
            format!(
                "#!/bin/sh\ncase \"$1\" in\n  start) rm -f \"{m}\"; while [ ! -f \"{m}\" ]; do sleep 0.02; done ;;\n  stop) touch \"{m}\" ;;\nesac\n",
                m = marker.display()
            ),
        )
        .unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

//! In-memory collaborators for exercising the runner without real processes.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use assert_fs::TempDir;

use crate::counters::{CYCLES, CounterCatalog, CounterService, CounterSnapshot};
use crate::errors::BenchError;
use crate::iteration::{RunContext, Scenario};
use crate::metrics::MetricSink;
use crate::prefetch::PrefetchCache;
use crate::preload::PreloadStore;
use crate::target::TargetControl;
use crate::trace::{TraceDecoder, TraceEvent};
use crate::types::{CounterGroup, PreloadSetting};
use crate::workingset::{ModuleWorkingSet, ProcessWorkingSet, WorkingSetSource};

/// Shared, ordered record of observable side effects.
#[derive(Clone, Default)]
pub struct HookLog(Rc<RefCell<Vec<String>>>);

impl HookLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.borrow().iter().filter(|e| *e == entry).count()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.0.borrow().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub fn context() -> (TempDir, RunContext) {
    let tmp = TempDir::new().unwrap();
    let ctx = RunContext {
        temp_dir: tmp.path().to_path_buf(),
        profile_dir: tmp.path().join("profile"),
        target_name: "chrome".to_string(),
        sink: MetricSink::new(),
    };
    (tmp, ctx)
}

pub struct FakeTarget {
    log: HookLog,
    launches: usize,
    running: bool,
    exited: bool,
    /// Launch index (0-based, counting every launch) whose process exits before ready.
    pub exit_early_at: Option<usize>,
    pub never_ready: bool,
}

impl FakeTarget {
    pub fn new(log: HookLog) -> Self {
        FakeTarget {
            log,
            launches: 0,
            running: false,
            exited: false,
            exit_early_at: None,
            never_ready: false,
        }
    }
}

impl TargetControl for FakeTarget {
    fn name(&self) -> &str {
        "chrome"
    }

    fn launch(&mut self, _profile_dir: &Path, extra_args: &[String]) -> Result<(), BenchError> {
        if extra_args.is_empty() {
            self.log.push("launch");
        } else {
            self.log.push(format!("launch {}", extra_args.join(" ")));
        }
        self.exited = self.exit_early_at == Some(self.launches);
        self.running = !self.exited;
        self.launches += 1;
        Ok(())
    }

    fn is_ready(&mut self, _profile_dir: &Path) -> bool {
        self.running && !self.never_ready
    }

    fn exit_status(&mut self) -> Result<Option<String>, BenchError> {
        Ok(self.exited.then(|| "exit status: 1".to_string()))
    }

    fn shut_down(&mut self, _profile_dir: &Path) -> Result<(), BenchError> {
        if self.launches > 0 && (self.running || self.exited) {
            self.log.push("shutdown");
        }
        self.running = false;
        self.exited = false;
        Ok(())
    }
}

/// Scenario that records each hook call and fails on demand.
pub struct RecordingScenario {
    log: HookLog,
    pub multiplier: usize,
    pub fail_pre_at: Option<usize>,
    pub fail_workload_at: Option<usize>,
    pub fail_post_at: Option<usize>,
    pub fail_set_up: bool,
}

impl RecordingScenario {
    pub fn new(log: HookLog) -> Self {
        RecordingScenario {
            log,
            multiplier: 1,
            fail_pre_at: None,
            fail_workload_at: None,
            fail_post_at: None,
            fail_set_up: false,
        }
    }
}

fn boom(what: &str) -> BenchError {
    BenchError::artifact(what, "injected failure")
}

impl Scenario for RecordingScenario {
    fn set_up(&mut self, _ctx: &mut RunContext) -> Result<(), BenchError> {
        self.log.push("set_up");
        if self.fail_set_up {
            return Err(BenchError::Configuration("injected".to_string()));
        }
        Ok(())
    }

    fn iteration_multiplier(&self) -> usize {
        self.multiplier
    }

    fn pre_iteration(&mut self, iteration: usize, _ctx: &mut RunContext) -> Result<(), BenchError> {
        self.log.push(format!("pre {iteration}"));
        if self.fail_pre_at == Some(iteration) {
            return Err(boom("pre"));
        }
        Ok(())
    }

    fn do_iteration(&mut self, iteration: usize, _ctx: &mut RunContext) -> Result<(), BenchError> {
        self.log.push(format!("do {iteration}"));
        if self.fail_workload_at == Some(iteration) {
            return Err(boom("workload"));
        }
        Ok(())
    }

    fn post_iteration(
        &mut self,
        iteration: usize,
        success: bool,
        _ctx: &mut RunContext,
    ) -> Result<(), BenchError> {
        self.log.push(format!("post {iteration} {success}"));
        if success && self.fail_post_at == Some(iteration) {
            return Err(boom("post"));
        }
        Ok(())
    }

    fn process_results(&mut self, _ctx: &mut RunContext) -> Result<(), BenchError> {
        self.log.push("process_results");
        Ok(())
    }

    fn tear_down(&mut self, _ctx: &mut RunContext) -> Result<(), BenchError> {
        self.log.push("tear_down");
        Ok(())
    }
}

pub struct FakePrefetch(pub HookLog);

impl PrefetchCache for FakePrefetch {
    fn clear(&mut self) -> Result<usize, BenchError> {
        self.0.push("prefetch clear");
        Ok(1)
    }
}

pub struct FakePreload {
    pub log: HookLog,
    pub current: Rc<RefCell<PreloadSetting>>,
}

impl PreloadStore for FakePreload {
    fn get(&self) -> Result<PreloadSetting, BenchError> {
        Ok(*self.current.borrow())
    }

    fn set(&mut self, setting: PreloadSetting) -> Result<(), BenchError> {
        self.log.push(format!("preload set {}", setting.enabled));
        *self.current.borrow_mut() = setting;
        Ok(())
    }
}

/// Counter service with a fixed catalog that answers every query with `values`.
pub struct FakeCounters {
    pub log: HookLog,
    pub catalog: CounterCatalog,
    running: Option<CounterGroup>,
}

impl FakeCounters {
    pub fn new(log: HookLog, declared: &[&str], max_concurrent: usize) -> Self {
        let mut names = vec![CYCLES.to_string()];
        names.extend(declared.iter().map(|s| s.to_string()));
        FakeCounters {
            log,
            catalog: CounterCatalog {
                names,
                free: [CYCLES.to_string()].into(),
                max_concurrent,
                reference: CYCLES.to_string(),
            },
            running: None,
        }
    }
}

impl CounterService for FakeCounters {
    fn catalog(&self) -> &CounterCatalog {
        &self.catalog
    }

    fn start(&mut self, group: &CounterGroup) -> Result<(), BenchError> {
        self.log.push(format!("counters start {group}"));
        self.running = Some(group.clone());
        Ok(())
    }

    fn query(&mut self, _program: &str) -> Result<CounterSnapshot, BenchError> {
        let group = self
            .running
            .as_ref()
            .ok_or_else(|| BenchError::artifact("counter query", "no counters are running"))?;
        let mut snapshot = CounterSnapshot::default();
        for name in &group.names {
            snapshot
                .values
                .insert(name.clone(), BTreeMap::from([(100, 5), (200, 50)]));
        }
        Ok(snapshot)
    }

    fn stop(&mut self) -> Result<(), BenchError> {
        self.log.push("counters stop");
        self.running = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

pub struct FakeWorkingSet;

impl WorkingSetSource for FakeWorkingSet {
    fn capture(&mut self, _process_name: &str) -> Result<Vec<ProcessWorkingSet>, BenchError> {
        let module = |name: &str, pages| ModuleWorkingSet {
            module_name: name.to_string(),
            pages,
            shareable_pages: 1,
            shared_pages: 1,
            read_only_pages: 1,
            writable_pages: 1,
            executable_pages: 1,
        };
        Ok(vec![ProcessWorkingSet {
            process_id: Some(100),
            modules: vec![module("Total", 300), module("/opt/chrome/chrome", 120)],
        }])
    }
}

/// Decoder that ignores the segment path and returns canned events.
pub struct CannedDecoder(pub Vec<TraceEvent>);

impl TraceDecoder for CannedDecoder {
    fn decode(&self, segment: &Path) -> Result<Vec<TraceEvent>, BenchError> {
        if segment.extension().is_some_and(|ext| ext == "bad") {
            return Err(BenchError::artifact(
                segment.display().to_string(),
                "unreadable",
            ));
        }
        if segment.file_stem().is_some_and(|stem| stem == "kernel") {
            return Ok(self.0.clone());
        }
        Ok(Vec::new())
    }
}

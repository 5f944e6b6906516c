use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::info;

use crate::errors::BenchError;
use crate::iteration::{RunContext, Scenario};
use crate::service::{Liveness, ServiceCommand, ServiceSlot};

const TRACE_FILE_EXTENSION: &str = "bin";

/// Runs the target under a call-trace logging service that stays up for the
/// whole run, then collects the binary trace files it wrote.
pub struct CallTraceProfile {
    service: PathBuf,
    output_dir: PathBuf,
    verbose: bool,
    settle: Duration,
    liveness: Liveness,
    slot: ServiceSlot,
    trace_files: Vec<PathBuf>,
}

impl CallTraceProfile {
    pub fn new(service: &Path, output_dir: &Path) -> Self {
        CallTraceProfile {
            service: service.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            verbose: false,
            settle: Duration::from_secs(10),
            liveness: Liveness::default(),
            slot: ServiceSlot::new("call-trace"),
            trace_files: Vec::new(),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = liveness;
        self
    }

    /// Trace files found once all iterations completed.
    pub fn trace_files(&self) -> &[PathBuf] {
        &self.trace_files
    }
}

impl Scenario for CallTraceProfile {
    fn set_up(&mut self, _ctx: &mut RunContext) -> Result<(), BenchError> {
        fs::create_dir_all(&self.output_dir).map_err(|e| BenchError::io(&self.output_dir, e))?;
        let command =
            ServiceCommand::logging("call-trace", &self.service, &self.output_dir, self.verbose, &[]);
        let log_path = self.output_dir.join("call_trace_service_log.txt");
        self.slot.start(command, &log_path, self.liveness)
    }

    fn do_iteration(&mut self, _iteration: usize, _ctx: &mut RunContext) -> Result<(), BenchError> {
        thread::sleep(self.settle);
        Ok(())
    }

    fn process_results(&mut self, _ctx: &mut RunContext) -> Result<(), BenchError> {
        // The service only flushes its files on shutdown.
        self.slot.stop_if_running()?;
        self.trace_files = collect_trace_files(&self.output_dir)?;
        info!(count = self.trace_files.len(), "collected call-trace files");
        Ok(())
    }

    fn tear_down(&mut self, _ctx: &mut RunContext) -> Result<(), BenchError> {
        self.slot.stop_if_running()
    }
}

/// `*.bin` files directly inside `dir`, sorted by name.
pub fn collect_trace_files(dir: &Path) -> Result<Vec<PathBuf>, BenchError> {
    let entries = fs::read_dir(dir).map_err(|e| BenchError::io(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BenchError::io(dir, e))?;
        let path = entry.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(TRACE_FILE_EXTENSION))
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

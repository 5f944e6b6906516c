use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, error};

use crate::errors::BenchError;
use crate::metrics::MetricSink;

/// Metric name suffixes, in the order of [`ModuleWorkingSet::values`].
pub const OUTPUT_NAMES: [&str; 6] = [
    "Pages",
    "Shareable",
    "Shared",
    "ReadOnly",
    "Writable",
    "Executable",
];

const TOTAL_MODULE: &str = "Total";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModuleWorkingSet {
    pub module_name: String,
    pub pages: u64,
    pub shareable_pages: u64,
    pub shared_pages: u64,
    pub read_only_pages: u64,
    pub writable_pages: u64,
    pub executable_pages: u64,
}

impl ModuleWorkingSet {
    pub fn values(&self) -> [u64; 6] {
        [
            self.pages,
            self.shareable_pages,
            self.shared_pages,
            self.read_only_pages,
            self.writable_pages,
            self.executable_pages,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProcessWorkingSet {
    #[serde(default)]
    pub process_id: Option<u32>,
    pub modules: Vec<ModuleWorkingSet>,
}

/// Working-set snapshot of every live process of the target.
pub trait WorkingSetSource {
    fn capture(&mut self, process_name: &str) -> Result<Vec<ProcessWorkingSet>, BenchError>;
}

/// Runs `<tool> --process-name=<name>` and parses the JSON it prints.
#[derive(Debug, Clone)]
pub struct WsDumpTool {
    program: PathBuf,
}

impl WsDumpTool {
    pub fn new(program: &Path) -> Self {
        WsDumpTool {
            program: program.to_path_buf(),
        }
    }
}

impl WorkingSetSource for WsDumpTool {
    fn capture(&mut self, process_name: &str) -> Result<Vec<ProcessWorkingSet>, BenchError> {
        debug!(tool = %self.program.display(), process_name, "capturing working set");
        let output = Command::new(&self.program)
            .arg(format!("--process-name={process_name}"))
            .output()
            .map_err(|source| BenchError::Launch {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            error!("STDERR: {}", String::from_utf8_lossy(&output.stderr).trim());
            return Err(BenchError::artifact(
                "working set snapshot",
                format!("tool returned {}", output.status),
            ));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| BenchError::artifact("working set snapshot", e.to_string()))
    }
}

/// `(Total, primary binary)` values for one process.
pub type WorkingSetSummary = (Option<[u64; 6]>, Option<[u64; 6]>);

/// Picks the `Total` pseudo-module and the module whose path ends with
/// `module_suffix` from every process, then sorts the tuples so ranks are
/// assigned by content rather than by process id.
pub fn summarize(snapshot: &[ProcessWorkingSet], module_suffix: &str) -> Vec<WorkingSetSummary> {
    let suffix = module_suffix.to_ascii_lowercase();
    let mut summaries: Vec<WorkingSetSummary> = snapshot
        .iter()
        .map(|process| {
            let mut total = None;
            let mut binary = None;
            for module in &process.modules {
                if module.module_name == TOTAL_MODULE {
                    total = Some(module.values());
                }
                if is_module(&module.module_name, &suffix) {
                    binary = Some(module.values());
                }
            }
            (total, binary)
        })
        .collect();
    summaries.sort();
    summaries
}

fn is_module(module_name: &str, suffix: &str) -> bool {
    let lower = module_name.to_ascii_lowercase();
    lower == suffix || lower.ends_with(&format!("\\{suffix}")) || lower.ends_with(&format!("/{suffix}"))
}

/// Records `TotalWs[<rank>][<name>]` and `BinaryWs[<rank>][<name>]` samples.
pub fn record_working_sets(sink: &mut MetricSink, graph: &str, summaries: &[WorkingSetSummary]) {
    for (rank, (total, binary)) in summaries.iter().enumerate() {
        if let Some(values) = total {
            for (value, name) in values.iter().zip(OUTPUT_NAMES) {
                sink.add_result(graph, &format!("TotalWs[{rank}][{name}]"), *value, "");
            }
        }
        if let Some(values) = binary {
            for (value, name) in values.iter().zip(OUTPUT_NAMES) {
                sink.add_result(graph, &format!("BinaryWs[{rank}][{name}]"), *value, "");
            }
        }
    }
}

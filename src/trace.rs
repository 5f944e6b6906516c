use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::counters::program_root;
use crate::errors::BenchError;
use crate::metrics::MetricSink;

/// One decoded trace record. Timestamps are seconds on the trace clock.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    ProcessStart {
        timestamp: f64,
        pid: u32,
        image: String,
    },
    MessageLoopBegin {
        timestamp: f64,
        pid: u32,
    },
    HardFault {
        timestamp: f64,
        process_image: String,
        module: String,
    },
    SoftFault {
        timestamp: f64,
        process_image: String,
        module: String,
        fault_type: String,
    },
}

impl TraceEvent {
    pub fn timestamp(&self) -> f64 {
        match self {
            TraceEvent::ProcessStart { timestamp, .. }
            | TraceEvent::MessageLoopBegin { timestamp, .. }
            | TraceEvent::HardFault { timestamp, .. }
            | TraceEvent::SoftFault { timestamp, .. } => *timestamp,
        }
    }
}

/// Turns one raw trace segment into event records.
pub trait TraceDecoder {
    fn decode(&self, segment: &Path) -> Result<Vec<TraceEvent>, BenchError>;
}

/// Reads segments that already hold one JSON event per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesDecoder;

impl TraceDecoder for JsonLinesDecoder {
    fn decode(&self, segment: &Path) -> Result<Vec<TraceEvent>, BenchError> {
        let text = fs::read_to_string(segment)
            .map_err(|e| BenchError::artifact(segment.display().to_string(), e.to_string()))?;
        parse_json_lines(&text, &segment.display().to_string())
    }
}

/// Runs `<program> <segment>` and reads JSON-lines events from its stdout.
#[derive(Debug, Clone)]
pub struct CommandDecoder {
    program: PathBuf,
}

impl CommandDecoder {
    pub fn new(program: &Path) -> Self {
        CommandDecoder {
            program: program.to_path_buf(),
        }
    }
}

impl TraceDecoder for CommandDecoder {
    fn decode(&self, segment: &Path) -> Result<Vec<TraceEvent>, BenchError> {
        let name = segment.display().to_string();
        debug!(decoder = %self.program.display(), segment = %name, "decoding trace segment");
        let output = Command::new(&self.program)
            .arg(segment)
            .output()
            .map_err(|source| BenchError::Launch {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(BenchError::artifact(
                name,
                format!(
                    "decoder returned {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        parse_json_lines(&String::from_utf8_lossy(&output.stdout), &name)
    }
}

fn parse_json_lines(text: &str, artifact: &str) -> Result<Vec<TraceEvent>, BenchError> {
    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event = serde_json::from_str::<TraceEvent>(trimmed).map_err(|e| {
            BenchError::artifact(artifact, format!("line {}: {e}", idx + 1))
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Trace segment names for a run: `kernel.<ext>` and `<target>.<ext>`.
pub fn segment_paths(dir: &Path, target: &str, extension: &str) -> [PathBuf; 2] {
    [
        dir.join(format!("kernel.{extension}")),
        dir.join(format!("{target}.{extension}")),
    ]
}

/// Decodes every segment and merges the events, stably ordered by timestamp.
pub fn decode_segments(
    decoder: &dyn TraceDecoder,
    segments: &[PathBuf],
) -> Result<Vec<TraceEvent>, BenchError> {
    let mut events = Vec::new();
    for segment in segments {
        events.extend(decoder.decode(segment)?);
    }
    events.sort_by(|a, b| a.timestamp().total_cmp(&b.timestamp()));
    Ok(events)
}

/// Counts of the events relevant to one target process image.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EventCounter {
    pub process_launch: Vec<f64>,
    pub message_loop_begin: Vec<f64>,
    pub hard_faults: BTreeMap<String, u64>,
    pub soft_faults: BTreeMap<String, BTreeMap<String, u64>>,
}

impl EventCounter {
    /// Aggregates `events`, keeping launches and faults of `process_name` only.
    ///
    /// An image belongs to the target when its file stem equals the process
    /// name, ignoring ASCII case.
    pub fn count(events: &[TraceEvent], process_name: &str) -> Self {
        let wanted = program_root(process_name);
        let is_target = |image: &str| program_root(image).eq_ignore_ascii_case(wanted);

        let mut counter = EventCounter::default();
        for event in events {
            match event {
                TraceEvent::ProcessStart {
                    timestamp, image, ..
                } if is_target(image) => counter.process_launch.push(*timestamp),
                TraceEvent::MessageLoopBegin { timestamp, .. } => {
                    counter.message_loop_begin.push(*timestamp)
                }
                TraceEvent::HardFault {
                    process_image,
                    module,
                    ..
                } if is_target(process_image) => {
                    *counter.hard_faults.entry(module.clone()).or_insert(0) += 1;
                }
                TraceEvent::SoftFault {
                    process_image,
                    module,
                    fault_type,
                    ..
                } if is_target(process_image) => {
                    *counter
                        .soft_faults
                        .entry(module.clone())
                        .or_default()
                        .entry(fault_type.clone())
                        .or_insert(0) += 1;
                }
                _ => {}
            }
        }
        counter
    }

    /// Seconds from the first target launch to the first message loop.
    pub fn message_loop_start_time(&self) -> Option<f64> {
        let launch = self.process_launch.first()?;
        let loop_begin = self.message_loop_begin.first()?;
        Some(loop_begin - launch)
    }

    /// Seconds between the first and second target process launches.
    pub fn secondary_launch_time(&self) -> Option<f64> {
        match self.process_launch.as_slice() {
            [first, second, ..] => Some(second - first),
            _ => None,
        }
    }
}

/// Records the timing metrics derived from trace events.
pub fn record_timings(sink: &mut MetricSink, graph: &str, counter: &EventCounter) {
    if let Some(secs) = counter.message_loop_start_time() {
        sink.add_result(graph, "MessageLoopStartTime", secs, "s");
    }
    if let Some(secs) = counter.secondary_launch_time() {
        sink.add_result(graph, "RendererLaunchTime", secs, "s");
    }
    if counter.process_launch.is_empty() {
        warn!("no launch of the target process found in the trace");
    }
}

/// Records one sample per (module) hard-fault count and per (module, type) soft-fault count.
pub fn record_page_faults(sink: &mut MetricSink, graph: &str, counter: &EventCounter) {
    for (module, count) in &counter.hard_faults {
        sink.add_result(graph, &format!("HardPageFaults[{module}]"), *count, "");
    }
    for (module, by_type) in &counter.soft_faults {
        for (fault_type, count) in by_type {
            sink.add_result(
                graph,
                &format!("SoftPageFaults[{module}][{fault_type}]"),
                *count,
                "",
            );
        }
    }
}

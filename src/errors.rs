use std::path::PathBuf;

use crate::types::IterationState;

#[derive(thiserror::Error, Debug)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to start {service} ({detail}){}", format_log(.log))]
    ServiceStart {
        service: String,
        detail: String,
        log: String,
    },

    #[error("Failed to stop {service} ({detail}){}", format_log(.log))]
    ServiceStop {
        service: String,
        detail: String,
        log: String,
    },

    #[error("The {service} service is already running")]
    ServiceAlreadyRunning { service: String },

    #[error("Timed out after {waited_secs}s waiting for {target} to become ready")]
    IterationTimeout { target: String, waited_secs: u64 },

    #[error("{target} terminated early ({status}) before becoming ready")]
    EarlyTermination { target: String, status: String },

    #[error("Failed to process {artifact}: {detail}")]
    ArtifactProcessing { artifact: String, detail: String },

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Iteration {iteration} failed in state {stage}: {source}")]
    Iteration {
        iteration: usize,
        stage: IterationState,
        source: Box<BenchError>,
    },
}

impl BenchError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BenchError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn artifact(artifact: impl Into<String>, detail: impl Into<String>) -> Self {
        BenchError::ArtifactProcessing {
            artifact: artifact.into(),
            detail: detail.into(),
        }
    }

    /// The failing iteration and stage, if this error came out of the iteration loop.
    pub fn iteration_stage(&self) -> Option<(usize, IterationState)> {
        match self {
            BenchError::Iteration {
                iteration, stage, ..
            } => Some((*iteration, *stage)),
            _ => None,
        }
    }
}

fn format_log(log: &str) -> String {
    if log.trim().is_empty() {
        return String::new();
    }
    let mut out = String::from("\nService log:");
    for line in log.lines() {
        out.push_str("\n-- ");
        out.push_str(line.trim_end());
    }
    out
}

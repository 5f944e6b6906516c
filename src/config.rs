use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::counters::DEFAULT_MAX_CONCURRENT;
use crate::errors::BenchError;
use crate::target::DEFAULT_READY_LOCK;
use crate::types::{PrefetchPolicy, PreloadSetting};

/// Benchmark configuration, read from TOML. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub target: TargetConfig,
    pub trace: TraceConfig,
    pub counters: CountersConfig,
    pub working_set: WorkingSetConfig,
    pub prefetch: PrefetchConfig,
    pub preload: PreloadConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    pub executable: Option<PathBuf>,
    /// Process image name used to filter traces and snapshots. Defaults to the executable's stem.
    pub process_name: Option<String>,
    /// Graph name in the report. Defaults to the process name.
    pub graph: Option<String>,
    /// Primary binary in working-set snapshots. Defaults to the process name.
    pub module_suffix: Option<String>,
    pub extra_args: Vec<String>,
    pub launch_wrapper: Vec<String>,
    pub ready_lock: String,
    pub settle_secs: u64,
    pub ready_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            executable: None,
            process_name: None,
            graph: None,
            module_suffix: None,
            extra_args: Vec::new(),
            launch_wrapper: Vec::new(),
            ready_lock: DEFAULT_READY_LOCK.to_string(),
            settle_secs: 10,
            ready_timeout_secs: 5 * 60,
            poll_interval_ms: 1000,
            shutdown_timeout_secs: 30,
        }
    }
}

impl TargetConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn resolved_process_name(&self) -> String {
        if let Some(name) = &self.process_name {
            return name.clone();
        }
        self.executable
            .as_deref()
            .and_then(Path::file_stem)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_string())
    }

    pub fn resolved_graph(&self) -> String {
        self.graph
            .clone()
            .unwrap_or_else(|| self.resolved_process_name())
    }

    pub fn resolved_module_suffix(&self) -> String {
        self.module_suffix
            .clone()
            .unwrap_or_else(|| self.resolved_process_name())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceConfig {
    /// Logging service program. Trace capture is off when unset.
    pub service: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub verbose: bool,
    pub extension: String,
    /// External decoder run as `<decoder> <segment>`. Segments are read as JSON lines when unset.
    pub decoder: Option<PathBuf>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            service: None,
            extra_args: Vec::new(),
            verbose: false,
            extension: "jsonl".to_string(),
            decoder: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CountersConfig {
    pub enabled: bool,
    pub tool_dir: Option<PathBuf>,
    /// Counters to sample. Empty means every counter the tool declares.
    pub names: Vec<String>,
    pub max_concurrent: usize,
}

impl Default for CountersConfig {
    fn default() -> Self {
        CountersConfig {
            enabled: false,
            tool_dir: None,
            names: Vec::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkingSetConfig {
    pub tool: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrefetchConfig {
    pub policy: PrefetchPolicy,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreloadConfig {
    /// Preload state to apply for the run. The setting is left alone when unset.
    pub enabled: Option<bool>,
    pub size: Option<u32>,
    pub stride: Option<u32>,
    pub settings_file: Option<PathBuf>,
}

impl PreloadConfig {
    pub fn setting(&self) -> Option<PreloadSetting> {
        self.enabled.map(|enabled| PreloadSetting {
            enabled,
            size: self.size,
            stride: self.stride,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub iterations: usize,
    pub profile_dir: Option<PathBuf>,
    pub initialize_profile: bool,
    pub keep_temp_dirs: bool,
    pub partial_results: bool,
    pub json: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            iterations: 10,
            profile_dir: None,
            initialize_profile: true,
            keep_temp_dirs: false,
            partial_results: false,
            json: false,
        }
    }
}

impl BenchConfig {
    /// `<config dir>/launchbench/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("launchbench").join("config.toml"))
    }

    /// Reads `path`, or the default location if it exists, or falls back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, BenchError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, BenchError> {
        debug!(path = %path.display(), "loading configuration");
        let text = fs::read_to_string(path).map_err(|e| BenchError::io(path, e))?;
        Self::parse(&text).map_err(|e| match e {
            BenchError::Configuration(msg) => {
                BenchError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self, BenchError> {
        toml::from_str(text).map_err(|e| BenchError::Configuration(e.message().to_string()))
    }

    /// Rejects settings that cannot produce a run, before anything is launched.
    pub fn validate(&self) -> Result<(), BenchError> {
        let problem = |msg: &str| Err(BenchError::Configuration(msg.to_string()));

        if self.target.executable.is_none() {
            return problem("no target executable given");
        }
        if self.run.iterations == 0 {
            return problem("iterations must be at least 1");
        }
        if self.target.poll_interval_ms == 0 {
            return problem("target.poll_interval_ms must be positive");
        }
        if self.target.ready_lock.trim().is_empty() {
            return problem("target.ready_lock must not be empty");
        }
        if self.trace.extension.trim().is_empty() {
            return problem("trace.extension must not be empty");
        }
        if self.counters.enabled && self.counters.tool_dir.is_none() {
            return problem("counters are enabled but counters.tool_dir is not set");
        }
        if self.counters.enabled && self.counters.max_concurrent == 0 {
            return problem("counters.max_concurrent must be positive");
        }
        if self.preload.enabled.is_some() && self.preload.settings_file.is_none() {
            return problem("a preload setting was requested but preload.settings_file is not set");
        }
        if self.prefetch.policy != PrefetchPolicy::Enabled && self.prefetch.dir.is_none() {
            return problem("prefetch deletion was requested but prefetch.dir is not set");
        }
        Ok(())
    }
}

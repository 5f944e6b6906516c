use std::collections::BTreeSet;
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Unique `(graph, trace)` identifier of one reported time series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MetricKey {
    pub graph: String,
    pub trace: String,
}

impl MetricKey {
    pub fn new(graph: impl Into<String>, trace: impl Into<String>) -> Self {
        MetricKey {
            graph: graph.into(),
            trace: trace.into(),
        }
    }
}

/// One numeric sample. Counts stay integral; timings are fractional seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Sample {
    Int(i64),
    Float(f64),
}

impl From<i64> for Sample {
    fn from(v: i64) -> Self {
        Sample::Int(v)
    }
}

impl From<u64> for Sample {
    fn from(v: u64) -> Self {
        Sample::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for Sample {
    fn from(v: usize) -> Self {
        Sample::from(v as u64)
    }
}

impl From<f64> for Sample {
    fn from(v: f64) -> Self {
        Sample::Float(v)
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sample::Int(v) => write!(f, "{v}"),
            // Whole floats keep a fractional digit so they stay distinguishable from counts.
            Sample::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            Sample::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Unit plus the samples recorded for one metric key, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSeries {
    pub unit: String,
    pub samples: Vec<Sample>,
}

/// A set of hardware counters sampled together during one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterGroup {
    pub names: BTreeSet<String>,
}

impl CounterGroup {
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl fmt::Display for CounterGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.names.iter().map(String::as_str).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// Governs deletion of the OS prefetch cache entries for the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrefetchPolicy {
    /// Leave the OS alone, keep existing prefetch files.
    #[default]
    Enabled,
    /// Delete prefetch files before and after every iteration.
    Disabled,
    /// Delete prefetch files once, before the first iteration.
    ResetPriorToFirstLaunch,
}

impl PrefetchPolicy {
    pub fn clears_before(self, iteration: usize) -> bool {
        match self {
            PrefetchPolicy::Enabled => false,
            PrefetchPolicy::Disabled => true,
            PrefetchPolicy::ResetPriorToFirstLaunch => iteration == 0,
        }
    }

    pub fn clears_after(self, _iteration: usize) -> bool {
        self == PrefetchPolicy::Disabled
    }
}

/// Process-wide preload toggle for the target's primary binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct PreloadSetting {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stride: Option<u32>,
}

/// States of one benchmark iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationState {
    Idle,
    LoggingStarted,
    Launched,
    Ready,
    WorkloadRunning,
    TornDown,
    Failed,
}

impl fmt::Display for IterationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IterationState::Idle => "Idle",
            IterationState::LoggingStarted => "LoggingStarted",
            IterationState::Launched => "Launched",
            IterationState::Ready => "Ready",
            IterationState::WorkloadRunning => "WorkloadRunning",
            IterationState::TornDown => "TornDown",
            IterationState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

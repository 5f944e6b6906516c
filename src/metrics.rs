use std::collections::BTreeMap;

use tracing::info;

use crate::types::{MetricKey, MetricSeries, Sample};

/// Append-only store of benchmark samples keyed by `(graph, trace)`.
///
/// Iteration always yields keys in sorted order, regardless of the order
/// samples were recorded in. Not synchronised: the runner mutates it from a
/// single sequential path only.
#[derive(Debug, Default, Clone)]
pub struct MetricSink {
    results: BTreeMap<MetricKey, MetricSeries>,
}

impl MetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one sample. The unit given with the first sample of a key sticks.
    pub fn add_result(&mut self, graph: &str, trace: &str, sample: impl Into<Sample>, unit: &str) {
        let sample = sample.into();
        info!(graph, trace, %sample, unit, "adding result");
        self.results
            .entry(MetricKey::new(graph, trace))
            .or_insert_with(|| MetricSeries {
                unit: unit.to_string(),
                samples: Vec::new(),
            })
            .samples
            .push(sample);
    }

    pub fn get(&self, graph: &str, trace: &str) -> Option<&MetricSeries> {
        self.results.get(&MetricKey::new(graph, trace))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricKey, &MetricSeries)> {
        self.results.iter()
    }

    /// Number of distinct metric keys.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.results.values().map(|s| s.samples.len()).sum()
    }
}

use chrono::{DateTime, Utc};
use owo_colors::{OwoColorize, Stream, Style};
use serde::Serialize;

use crate::errors::BenchError;
use crate::metrics::MetricSink;
use crate::types::{MetricSeries, Sample};

/// Formats one report line:
///
/// `RESULT <graph>: <trace>= [<sample>, <sample>, ...] <unit>`
///
/// Downstream graphing tools parse this shape, so the space before the unit
/// is kept even when the unit is empty.
pub fn format_result_line(graph: &str, trace: &str, series: &MetricSeries) -> String {
    format!(
        "RESULT {}: {}= {} {}",
        graph,
        trace,
        format_samples(&series.samples),
        series.unit
    )
}

pub fn format_samples(samples: &[Sample]) -> String {
    let parts: Vec<String> = samples.iter().map(Sample::to_string).collect();
    format!("[{}]", parts.join(", "))
}

/// The full text report, one line per metric key in sorted key order.
pub fn format_report(sink: &MetricSink) -> String {
    let mut out = String::new();
    for (key, series) in sink.iter() {
        out.push_str(&format_result_line(&key.graph, &key.trace, series));
        out.push('\n');
    }
    out
}

/// JSON output format.
#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: String,
    results: Vec<JsonResult<'a>>,
}

#[derive(Serialize)]
struct JsonResult<'a> {
    graph: &'a str,
    trace: &'a str,
    unit: &'a str,
    samples: &'a [Sample],
}

pub fn format_json(sink: &MetricSink, now: DateTime<Utc>) -> String {
    let report = JsonReport {
        generated_at: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        results: sink
            .iter()
            .map(|(key, series)| JsonResult {
                graph: &key.graph,
                trace: &key.trace,
                unit: &series.unit,
                samples: &series.samples,
            })
            .collect(),
    };

    serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string())
}

fn style_failure() -> Style {
    Style::new().red().bold()
}

/// One-line failure summary for stderr, coloured when stderr supports it.
pub fn format_failure(err: &BenchError) -> String {
    let label = "FAILED"
        .if_supports_color(Stream::Stderr, |s| s.style(style_failure()))
        .to_string();
    match err.iteration_stage() {
        Some((iteration, stage)) => format!("{label} iteration {iteration} in state {stage}"),
        None => format!("{label} outside the iteration loop"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IterationState;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-18T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn result_line_shape() {
        let series = MetricSeries {
            unit: "s".to_string(),
            samples: vec![Sample::Float(0.1), Sample::Float(0.2), Sample::Float(0.3)],
        };
        assert_eq!(
            format_result_line("Chrome", "RendererLaunchTime", &series),
            "RESULT Chrome: RendererLaunchTime= [0.1, 0.2, 0.3] s"
        );
    }

    #[test]
    fn result_line_with_empty_unit_keeps_separator() {
        let series = MetricSeries {
            unit: String::new(),
            samples: vec![Sample::Int(3), Sample::Int(4)],
        };
        assert_eq!(
            format_result_line("Chrome", "HardPageFaults[chrome.dll]", &series),
            "RESULT Chrome: HardPageFaults[chrome.dll]= [3, 4] "
        );
    }

    #[test]
    fn report_is_sorted_regardless_of_recording_order() {
        let mut sink = MetricSink::new();
        sink.add_result("Chrome", "TotalWs[0][Pages]", 100u64, "");
        sink.add_result("Chrome", "MessageLoopStartTime", 0.5, "s");
        sink.add_result("Browser", "Zeta", 1u64, "");
        sink.add_result("Chrome", "MessageLoopStartTime", 0.25, "s");

        let report = format_report(&sink);
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(
            lines,
            vec![
                "RESULT Browser: Zeta= [1] ",
                "RESULT Chrome: MessageLoopStartTime= [0.5, 0.25] s",
                "RESULT Chrome: TotalWs[0][Pages]= [100] ",
            ]
        );
    }

    #[test]
    fn empty_report() {
        assert_eq!(format_report(&MetricSink::new()), "");
    }

    #[test]
    fn json_report_structure() {
        let mut sink = MetricSink::new();
        sink.add_result("Chrome", "B", 2u64, "");
        sink.add_result("Chrome", "A", 0.5, "s");

        let json = format_json(&sink, fixed_now());
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["generated_at"], "2026-02-18T00:00:00Z");
        let results = parsed["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["trace"], "A");
        assert_eq!(results[0]["unit"], "s");
        assert_eq!(results[0]["samples"][0], 0.5);
        assert_eq!(results[1]["trace"], "B");
        assert_eq!(results[1]["samples"][0], 2);
    }

    #[test]
    fn failure_line_names_iteration_and_stage() {
        let err = BenchError::Iteration {
            iteration: 1,
            stage: IterationState::Launched,
            source: Box::new(BenchError::IterationTimeout {
                target: "chrome".to_string(),
                waited_secs: 300,
            }),
        };
        let line = format_failure(&err);
        assert!(line.contains("FAILED"));
        assert!(line.contains("iteration 1 in state Launched"));
    }

    #[test]
    fn failure_line_without_iteration() {
        let err = BenchError::Configuration("no executable".to_string());
        assert!(format_failure(&err).contains("outside the iteration loop"));
    }
}

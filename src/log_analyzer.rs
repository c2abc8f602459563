//! Log analysis and deterministic job summaries.
//!
//! Regex-based detection of errors, warnings, and stack traces (Python,
//! Node, Go, Java) over captured step output. Summary generation is
//! template-based; no model or network dependency.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::schemas::{JobStatus, RunRecord, StepResult};

const MAX_STACK_TRACES: usize = 5;
const MAX_ERROR_LINES: usize = 20;
const MAX_LINE_LENGTH: usize = 200;

static ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\b(error|exception|fatal)\b[:\s]").unwrap(),
        Regex::new(r"(?i)\btraceback\b").unwrap(),
        Regex::new(r"(?i)\bfailed\b[:\s]").unwrap(),
        Regex::new(r"exit code [1-9]\d*").unwrap(),
        Regex::new(r"(?i)\bpanic\b[:\s]").unwrap(),
    ]
});

static WARNING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\b(warning|warn)\b[:\s]").unwrap(),
        Regex::new(r"(?i)\bdeprecated\b").unwrap(),
    ]
});

/// Opening lines of stack traces for the supported runtimes.
static STACK_TRACE_START: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Python
        Regex::new(r"Traceback \(most recent call last\)").unwrap(),
        // Node
        Regex::new(r"^\s+at\s+.+\(.+:\d+:\d+\)").unwrap(),
        // Go
        Regex::new(r"^goroutine \d+ \[").unwrap(),
        // Java
        Regex::new(r"^\s+at\s+[\w.$]+\([\w.]+\.java:\d+\)").unwrap(),
    ]
});

/// Extracted findings from one or more step outputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogAnalysis {
    pub error_count: usize,
    pub warning_count: usize,
    pub first_error: Option<String>,
    pub stack_traces: Vec<String>,
    pub error_lines: Vec<String>,
}

/// Pattern-based analyzer over captured stdout/stderr.
#[derive(Debug, Default)]
pub struct LogAnalyzer;

impl LogAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze_step(&self, step: &StepResult) -> LogAnalysis {
        self.analyze_text(&format!("{}\n{}", step.stdout, step.stderr))
    }

    /// Aggregate analysis across all steps of a record.
    pub fn analyze_record(&self, record: &RunRecord) -> LogAnalysis {
        let mut total = LogAnalysis::default();
        for step in &record.steps {
            let analysis = self.analyze_step(step);
            total.error_count += analysis.error_count;
            total.warning_count += analysis.warning_count;
            if total.first_error.is_none() {
                total.first_error = analysis.first_error;
            }
            total.stack_traces.extend(analysis.stack_traces);
            total.error_lines.extend(analysis.error_lines);
        }
        total.stack_traces.truncate(MAX_STACK_TRACES);
        total.error_lines.truncate(MAX_ERROR_LINES);
        total
    }

    fn analyze_text(&self, text: &str) -> LogAnalysis {
        let mut analysis = LogAnalysis::default();
        let mut current_trace: Vec<String> = Vec::new();
        let mut in_trace = false;

        for line in text.split('\n') {
            let stripped = line.trim();
            if stripped.is_empty() {
                if in_trace && !current_trace.is_empty() {
                    analysis.stack_traces.push(current_trace.join("\n"));
                    current_trace.clear();
                    in_trace = false;
                }
                continue;
            }

            // Match against the raw line: indentation carries signal here.
            let is_trace_start = STACK_TRACE_START.iter().any(|p| p.is_match(line));
            if is_trace_start {
                if in_trace && !current_trace.is_empty() {
                    analysis.stack_traces.push(current_trace.join("\n"));
                }
                current_trace = vec![stripped.to_string()];
                in_trace = true;
            } else if in_trace {
                let is_indented = line.starts_with("  ") || line.starts_with('\t');
                let is_continuation = stripped.starts_with("Caused by") || stripped.starts_with("...");
                if is_indented || is_continuation {
                    current_trace.push(stripped.to_string());
                } else {
                    // Closing exception line ("ValueError: bad") belongs to the trace
                    if stripped.contains(':') {
                        current_trace.push(stripped.to_string());
                    }
                    analysis.stack_traces.push(current_trace.join("\n"));
                    current_trace = Vec::new();
                    in_trace = false;
                }
            }

            if ERROR_PATTERNS.iter().any(|p| p.is_match(stripped)) {
                analysis.error_count += 1;
                let truncated: String = stripped.chars().take(MAX_LINE_LENGTH).collect();
                if analysis.first_error.is_none() {
                    analysis.first_error = Some(truncated.clone());
                }
                analysis.error_lines.push(truncated);
            } else if WARNING_PATTERNS.iter().any(|p| p.is_match(stripped)) {
                analysis.warning_count += 1;
            }
        }

        if in_trace && !current_trace.is_empty() {
            analysis.stack_traces.push(current_trace.join("\n"));
        }
        analysis.stack_traces.truncate(MAX_STACK_TRACES);
        analysis.error_lines.truncate(MAX_ERROR_LINES);
        analysis
    }
}

/// Full structured summary of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub one_liner: String,
    pub status_label: String,
    pub duration_human: String,
    pub step_count: usize,
    pub steps_passed: usize,
    pub steps_failed: usize,
    pub key_events: Vec<String>,
    pub errors: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Deterministic summary generation from a finalized record.
#[derive(Debug, Default)]
pub struct SummaryGenerator {
    analyzer: LogAnalyzer,
}

impl SummaryGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self, record: &RunRecord) -> JobSummary {
        let analysis = self.analyzer.analyze_record(record);
        let duration_human = format_duration(record.duration_seconds());
        let step_count = record.spec.commands.len();
        let steps_passed = record.steps.iter().filter(|s| s.exit_code == 0).count();
        let steps_failed = record.steps.len() - steps_passed;

        JobSummary {
            job_id: record.job_id.clone(),
            one_liner: self.one_liner(record, &duration_human, &analysis),
            status_label: record.status.to_string(),
            duration_human,
            step_count,
            steps_passed,
            steps_failed,
            key_events: self.key_events(record, step_count, steps_passed),
            errors: analysis.error_lines.iter().take(5).cloned().collect(),
            suggestions: self.suggestions(record, &analysis),
        }
    }

    /// The one-line summary stored on the run record.
    pub fn one_line_summary(&self, record: &RunRecord) -> String {
        let analysis = self.analyzer.analyze_record(record);
        self.one_liner(record, &format_duration(record.duration_seconds()), &analysis)
    }

    fn one_liner(&self, record: &RunRecord, duration: &str, analysis: &LogAnalysis) -> String {
        match record.status {
            JobStatus::Success => {
                format!("{} step(s) passed in {}", record.steps.len(), duration)
            }
            JobStatus::Failed => match &analysis.first_error {
                Some(err) => format!("failed: {}", err.chars().take(80).collect::<String>()),
                None => format!("failed after {}", duration),
            },
            JobStatus::TimedOut => format!("timed out after {}", duration),
            JobStatus::Cancelled => format!("cancelled after {}", duration),
            other => format!("{} after {}", other, duration),
        }
    }

    fn key_events(&self, record: &RunRecord, step_count: usize, steps_passed: usize) -> Vec<String> {
        let mut events = Vec::new();
        match record.status {
            JobStatus::Success => {
                events.push(format!("all {} step(s) completed successfully", step_count))
            }
            JobStatus::Failed => {
                events.push(format!("failed at step {} of {}", steps_passed + 1, step_count))
            }
            JobStatus::TimedOut => events.push("job exceeded its time limit".to_string()),
            JobStatus::Cancelled => events.push("job was cancelled".to_string()),
            _ => {}
        }
        if !record.artifacts.is_empty() {
            events.push(format!("collected {} artifact(s)", record.artifacts.len()));
        }
        if let Some(usage) = &record.resource_usage {
            if usage.memory_peak_mb > 0.0 {
                events.push(format!("peak memory: {:.1} MB", usage.memory_peak_mb));
            }
        }
        events
    }

    fn suggestions(&self, record: &RunRecord, analysis: &LogAnalysis) -> Vec<String> {
        let mut suggestions = Vec::new();
        if record.status == JobStatus::TimedOut {
            suggestions.push("consider increasing ttl_seconds or optimizing the command".into());
        }
        if record.status == JobStatus::Failed && !analysis.stack_traces.is_empty() {
            suggestions.push("review the stack trace(s) for the root cause".into());
        }
        if record.status == JobStatus::Failed && analysis.first_error.is_none() {
            suggestions.push("check step stderr output for error details".into());
        }
        if analysis.warning_count > 10 {
            suggestions.push(format!(
                "{} warnings detected, review for potential issues",
                analysis.warning_count
            ));
        }
        suggestions
    }
}

fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{:.1}s", seconds);
    }
    let minutes = (seconds / 60.0) as u64;
    let secs = (seconds % 60.0) as u64;
    if minutes < 60 {
        return format!("{}m {}s", minutes, secs);
    }
    format!("{}h {}m", minutes / 60, minutes % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::JobSpec;
    use chrono::{Duration, Utc};

    fn step(stdout: &str, stderr: &str, exit_code: i64) -> StepResult {
        StepResult {
            index: 0,
            command: "test".into(),
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration_seconds: 0.1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    fn analyzer() -> LogAnalyzer {
        LogAnalyzer::new()
    }

    #[test]
    fn counts_errors_and_warnings() {
        let analysis = analyzer().analyze_step(&step(
            "Warning: something minor\nERROR: it broke\nall good here",
            "fatal: cannot continue",
            1,
        ));
        assert_eq!(analysis.error_count, 2);
        assert_eq!(analysis.warning_count, 1);
        assert_eq!(analysis.first_error.as_deref(), Some("ERROR: it broke"));
    }

    #[test]
    fn extracts_python_traceback() {
        let output = "\
Traceback (most recent call last):
  File \"app.py\", line 3, in <module>
    main()
  File \"app.py\", line 2, in main
    raise ValueError(\"bad\")
ValueError: bad";
        let analysis = analyzer().analyze_step(&step(output, "", 1));
        assert_eq!(analysis.stack_traces.len(), 1);
        assert!(analysis.stack_traces[0].contains("ValueError: bad"));
    }

    #[test]
    fn extracts_node_and_go_traces() {
        let node = "    at doWork (app.js:10:5)\n    at main (app.js:20:3)";
        let analysis = analyzer().analyze_step(&step("", node, 1));
        assert_eq!(analysis.stack_traces.len(), 1);

        let go = "goroutine 1 [running]:\n  main.main()\n  \t/app/main.go:12 +0x40";
        let analysis = analyzer().analyze_step(&step("", go, 2));
        assert_eq!(analysis.stack_traces.len(), 1);
        assert!(analysis.stack_traces[0].starts_with("goroutine 1"));
    }

    #[test]
    fn long_lines_are_truncated() {
        let long = format!("error: {}", "x".repeat(500));
        let analysis = analyzer().analyze_step(&step(&long, "", 1));
        assert!(analysis.first_error.unwrap().len() <= MAX_LINE_LENGTH);
    }

    #[test]
    fn bounded_output() {
        let noisy: String = (0..50).map(|i| format!("error: {}\n", i)).collect();
        let analysis = analyzer().analyze_step(&step(&noisy, "", 1));
        assert_eq!(analysis.error_count, 50);
        assert_eq!(analysis.error_lines.len(), MAX_ERROR_LINES);
    }

    fn record_with_status(status: JobStatus, steps: Vec<StepResult>) -> RunRecord {
        let spec = JobSpec::new(
            "alpine:3.19",
            steps.iter().map(|s| s.command.clone()).collect(),
            60,
        );
        let mut record = RunRecord::queued(spec);
        let start = Utc::now() - Duration::seconds(5);
        record.started_at = Some(start);
        record.finished_at = Some(start + Duration::seconds(5));
        record.steps = steps;
        record.status = status;
        record
    }

    #[test]
    fn summary_for_success() {
        let record = record_with_status(JobStatus::Success, vec![step("done\n", "", 0)]);
        let summary = SummaryGenerator::new().generate(&record);
        assert_eq!(summary.status_label, "SUCCESS");
        assert!(summary.one_liner.contains("1 step(s) passed"));
        assert_eq!(summary.steps_failed, 0);
    }

    #[test]
    fn summary_for_failure_names_first_error() {
        let record = record_with_status(
            JobStatus::Failed,
            vec![step("", "Error: connection refused", 1)],
        );
        let summary = SummaryGenerator::new().generate(&record);
        assert!(summary.one_liner.starts_with("failed: Error: connection refused"));
        assert!(summary.key_events[0].contains("failed at step 1 of 1"));
    }

    #[test]
    fn summary_for_timeout_suggests_ttl() {
        let record = record_with_status(JobStatus::TimedOut, vec![step("", "", -1)]);
        let summary = SummaryGenerator::new().generate(&record);
        assert!(summary.one_liner.starts_with("timed out"));
        assert!(summary.suggestions.iter().any(|s| s.contains("ttl_seconds")));
    }

    #[test]
    fn duration_formats() {
        assert_eq!(format_duration(4.25), "4.2s");
        assert_eq!(format_duration(75.0), "1m 15s");
        assert_eq!(format_duration(3700.0), "1h 1m");
    }
}

//! Process-backed collaborators.
//!
//! Each collaborator is an external program from the configuration. The
//! loop appends the phase arguments (`--output`, `--fix`, ...) to the
//! configured ones, treats a non-zero exit status as an error, and reads
//! the program's result from the artifact it wrote.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

use super::traits::{
    AggregationRequest, Aggregator, Diagnoser, Diagnosis, DiagnosisRequest, Implementer,
    ImplementationRequest, TestReport, TestRequest, Tester,
};
use crate::config::CommandSpec;
use crate::metrics::MetricsSnapshot;

/// Turn a fix name into something safe to embed in a file name.
///
/// ```
/// use fixloop::collaborators::command::file_slug;
///
/// assert_eq!(file_slug("Update XPath Selectors"), "Update_XPath_Selectors");
/// assert_eq!(file_slug("a/b: c"), "a_b_c");
/// ```
#[must_use]
pub fn file_slug(name: &str) -> String {
    let slug = match Regex::new(r"[^A-Za-z0-9._-]+") {
        Ok(re) => re.replace_all(name.trim(), "_").into_owned(),
        Err(_) => name.replace(' ', "_"),
    };
    if slug.is_empty() {
        "fix".to_string()
    } else {
        slug
    }
}

/// Extract the counters from a plain-text aggregation report.
///
/// Lines look like `Title Match Failures: 12`. Counters that are absent
/// stay at zero.
#[must_use]
pub fn parse_aggregation_text(content: &str) -> MetricsSnapshot {
    let number = |label: &str| -> u64 {
        let pattern = format!(r"{}:\s+(\d+)", regex::escape(label));
        if let Ok(re) = Regex::new(&pattern) {
            if let Some(caps) = re.captures(content) {
                return caps[1].parse().unwrap_or(0);
            }
        }
        0
    };

    MetricsSnapshot {
        total_search_ops: number("Total Search Operations"),
        titles_found: number("Titles Found Events"),
        title_failures: number("Title Match Failures"),
        model_errors: number("Model Read Errors"),
        url_errors: number("URL Fetch Errors"),
    }
}

/// Read a metrics artifact, accepting either JSON or the plain-text report.
///
/// Content that looks like JSON must parse as JSON; only other content is
/// read as the plain-text report.
pub fn read_metrics(path: &Path) -> Result<MetricsSnapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read metrics from {}", path.display()))?;
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return serde_json::from_str(&content)
            .with_context(|| format!("Invalid metrics JSON in {}", path.display()));
    }

    let snapshot = parse_aggregation_text(&content);
    if snapshot == MetricsSnapshot::default() {
        warn!("No metric counters found in {}", path.display());
    }
    Ok(snapshot)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Runs one configured program.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    spec: CommandSpec,
    working_dir: PathBuf,
}

impl CommandRunner {
    #[must_use]
    pub fn new(spec: CommandSpec, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            spec,
            working_dir: working_dir.into(),
        }
    }

    #[must_use]
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Run the program with `extra` appended to its configured arguments and
    /// return its stdout.
    pub async fn run(&self, extra: &[String]) -> Result<String> {
        debug!(
            "Running {} {} {}",
            self.spec.program,
            self.spec.args.join(" "),
            extra.join(" ")
        );

        let output = AsyncCommand::new(&self.spec.program)
            .args(&self.spec.args)
            .args(extra)
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.spec.program))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.spec.program,
                output.status,
                stderr.trim()
            )
        }
    }
}

fn arg(value: impl ToString) -> String {
    value.to_string()
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// Aggregation backed by a program writing a report to `--output`.
#[derive(Debug, Clone)]
pub struct CommandAggregator(pub CommandRunner);

#[async_trait]
impl Aggregator for CommandAggregator {
    async fn aggregate(&self, request: &AggregationRequest) -> Result<MetricsSnapshot> {
        self.0
            .run(&[
                arg("--output"),
                path_arg(&request.output),
                arg("--timeframe"),
                arg(request.timeframe_hours),
            ])
            .await?;
        read_metrics(&request.output)
    }
}

/// Diagnosis backed by a program writing JSON to `--output`.
#[derive(Debug, Clone)]
pub struct CommandDiagnoser(pub CommandRunner);

#[async_trait]
impl Diagnoser for CommandDiagnoser {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis> {
        self.0
            .run(&[
                arg("--input"),
                path_arg(&request.aggregation_report),
                arg("--mode"),
                arg(request.mode),
                arg("--output"),
                path_arg(&request.output),
            ])
            .await?;
        read_json(&request.output)
    }
}

/// Implementation backed by a program; success is its exit status.
#[derive(Debug, Clone)]
pub struct CommandImplementer(pub CommandRunner);

#[async_trait]
impl Implementer for CommandImplementer {
    async fn implement(&self, request: &ImplementationRequest) -> Result<()> {
        let mut args = vec![arg("--fix"), request.fix.name.clone()];
        if let Some(report) = &request.diagnosis_report {
            args.push(arg("--diagnostic-report"));
            args.push(path_arg(report));
        }
        self.0.run(&args).await.map(|_| ())
    }
}

/// Testing backed by a program writing a JSON test report to `--output`.
#[derive(Debug, Clone)]
pub struct CommandTester(pub CommandRunner);

#[async_trait]
impl Tester for CommandTester {
    async fn test(&self, request: &TestRequest) -> Result<TestReport> {
        let mut args = vec![
            arg("--fix"),
            request.fix.clone(),
            arg("--baseline"),
            path_arg(&request.baseline_report),
            arg("--max-items"),
            arg(request.max_items),
            arg("--output"),
            path_arg(&request.output),
        ];
        if let Some(hours) = request.timeframe_hours {
            args.push(arg("--timeframe"));
            args.push(arg(hours));
        }
        self.0.run(&args).await?;
        read_json(&request.output)
    }
}

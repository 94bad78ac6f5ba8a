//! Mock collaborators.
//!
//! Scripted, thread-safe test doubles that let a full loop run without any
//! external program. Each mock replays a queue of results; once the queue
//! is drained the last entry is repeated.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::traits::{
    AggregationRequest, Aggregator, Diagnoser, Diagnosis, DiagnosisRequest, Implementer,
    ImplementationRequest, TestReport, TestRequest, Tester,
};
use crate::evaluator::{TestVerdict, Verdict};
use crate::metrics::MetricsSnapshot;
use crate::state::FixCandidate;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pops the next scripted value, repeating the last one once drained.
#[derive(Debug)]
struct Script<T: Clone> {
    queue: Mutex<VecDeque<T>>,
    last: Mutex<Option<T>>,
}

impl<T: Clone> Default for Script<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
        }
    }
}

impl<T: Clone> Script<T> {
    fn push(&self, value: T) {
        guard(&self.queue).push_back(value);
    }

    fn next(&self) -> Option<T> {
        let popped = guard(&self.queue).pop_front();
        let mut last = guard(&self.last);
        if let Some(value) = popped {
            *last = Some(value);
        }
        last.clone()
    }
}

/// Scripted aggregation.
///
/// # Example
///
/// ```rust,ignore
/// let aggregator = MockAggregator::new()
///     .with_snapshot(MetricsSnapshot::new(100).with_url_errors(40))
///     .with_snapshot(MetricsSnapshot::new(100).with_url_errors(10));
/// ```
#[derive(Debug, Default)]
pub struct MockAggregator {
    snapshots: Script<MetricsSnapshot>,
    fail_on_call: Option<(u32, String)>,
    hang_on_call: Option<u32>,
    call_count: AtomicU32,
    requests: Mutex<Vec<AggregationRequest>>,
}

impl MockAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a snapshot to return.
    #[must_use]
    pub fn with_snapshot(self, snapshot: MetricsSnapshot) -> Self {
        self.snapshots.push(snapshot);
        self
    }

    /// Queue snapshots with the given title failure counts.
    #[must_use]
    pub fn with_error_series(self, total: u64, errors: &[u64]) -> Self {
        for &count in errors {
            self.snapshots
                .push(MetricsSnapshot::new(total).with_title_failures(count));
        }
        self
    }

    /// Fail the `call`-th invocation (1-based).
    #[must_use]
    pub fn with_error_on_call(mut self, call: u32, error: &str) -> Self {
        self.fail_on_call = Some((call, error.to_string()));
        self
    }

    /// Never return from the `call`-th invocation (1-based).
    #[must_use]
    pub fn with_hang_on_call(mut self, call: u32) -> Self {
        self.hang_on_call = Some(call);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<AggregationRequest> {
        guard(&self.requests).clone()
    }
}

#[async_trait]
impl Aggregator for MockAggregator {
    async fn aggregate(&self, request: &AggregationRequest) -> Result<MetricsSnapshot> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        guard(&self.requests).push(request.clone());

        if self.hang_on_call == Some(call) {
            std::future::pending::<()>().await;
        }
        if let Some((n, ref error)) = self.fail_on_call {
            if n == call {
                bail!("{}", error)
            }
        }
        Ok(self.snapshots.next().unwrap_or_default())
    }
}

/// Scripted diagnosis.
#[derive(Debug, Default)]
pub struct MockDiagnoser {
    diagnoses: Script<Diagnosis>,
    error: Option<String>,
    call_count: AtomicU32,
    requests: Mutex<Vec<DiagnosisRequest>>,
}

impl MockDiagnoser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a diagnosis proposing the given HIGH fixes.
    #[must_use]
    pub fn with_fixes(self, names: &[&str]) -> Self {
        self.diagnoses.push(Diagnosis {
            fixes: names.iter().map(|n| FixCandidate::high(*n)).collect(),
            error_types: vec!["title_match".to_string()],
        });
        self
    }

    #[must_use]
    pub fn with_diagnosis(self, diagnosis: Diagnosis) -> Self {
        self.diagnoses.push(diagnosis);
        self
    }

    /// Fail every invocation.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<DiagnosisRequest> {
        guard(&self.requests).clone()
    }
}

#[async_trait]
impl Diagnoser for MockDiagnoser {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        guard(&self.requests).push(request.clone());

        if let Some(ref error) = self.error {
            bail!("{}", error)
        }
        Ok(self.diagnoses.next().unwrap_or_default())
    }
}

/// Records implemented fixes; selected fixes fail.
#[derive(Debug, Default)]
pub struct MockImplementer {
    failing: HashSet<String>,
    implemented: Mutex<Vec<String>>,
}

impl MockImplementer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make implementing `fix` fail.
    #[must_use]
    pub fn with_failure(mut self, fix: &str) -> Self {
        self.failing.insert(fix.to_string());
        self
    }

    /// Names handed to the implementer, in call order.
    pub fn implemented(&self) -> Vec<String> {
        guard(&self.implemented).clone()
    }
}

#[async_trait]
impl Implementer for MockImplementer {
    async fn implement(&self, request: &ImplementationRequest) -> Result<()> {
        guard(&self.implemented).push(request.fix.name.clone());
        if self.failing.contains(&request.fix.name) {
            bail!("patch for '{}' did not apply", request.fix.name)
        }
        Ok(())
    }
}

/// Scripted testing.
#[derive(Debug, Default)]
pub struct MockTester {
    reports: Script<TestReport>,
    error: Option<String>,
    fail_on_call: Option<(usize, String)>,
    requests: Mutex<Vec<TestRequest>>,
}

impl MockTester {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_report(self, report: TestReport) -> Self {
        self.reports.push(report);
        self
    }

    /// Queue a report carrying a ready-made verdict.
    #[must_use]
    pub fn with_verdict(self, decision: Verdict) -> Self {
        self.reports.push(TestReport {
            post_fix_metrics: MetricsSnapshot::default(),
            verdict: Some(verdict(decision)),
            alternative_solution: None,
        });
        self
    }

    /// Queue a report with only measurements; the loop evaluates it.
    #[must_use]
    pub fn with_measurement(self, post_fix: MetricsSnapshot) -> Self {
        self.reports.push(TestReport {
            post_fix_metrics: post_fix,
            verdict: None,
            alternative_solution: None,
        });
        self
    }

    /// Fail every invocation.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Fail only the `call`-th invocation (1-based).
    #[must_use]
    pub fn with_error_on_call(mut self, call: usize, error: &str) -> Self {
        self.fail_on_call = Some((call, error.to_string()));
        self
    }

    pub fn call_count(&self) -> usize {
        guard(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<TestRequest> {
        guard(&self.requests).clone()
    }
}

/// A verdict with plausible numbers for `decision`.
#[must_use]
pub fn verdict(decision: Verdict) -> TestVerdict {
    let success_count = match decision {
        Verdict::Keep => 4,
        Verdict::Monitor => 2,
        _ => 0,
    };
    TestVerdict {
        success_rate: f64::from(success_count) * 25.0,
        success_count,
        total_indicators: 4,
        decision,
        reason: String::new(),
        alternative_solution: None,
    }
}

#[async_trait]
impl Tester for MockTester {
    async fn test(&self, request: &TestRequest) -> Result<TestReport> {
        let call = {
            let mut requests = guard(&self.requests);
            requests.push(request.clone());
            requests.len()
        };
        if let Some(ref error) = self.error {
            bail!("{}", error)
        }
        if let Some((n, ref error)) = self.fail_on_call {
            if n == call {
                bail!("{}", error)
            }
        }
        match self.reports.next() {
            Some(report) => Ok(report),
            None => bail!("no test report scripted for '{}'", request.fix),
        }
    }
}

//! Validator and validation results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::finding::{Category, Finding, Severity};
use crate::id::{RunId, WorkItemId};
use crate::work_item::ComparisonArtifact;
use crate::Time;

/// Metric name a validator uses to report its own [0,100] sub-score.
pub const SCORE_METRIC: &str = "score";

/// Outcome of one validator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorStatus {
    /// Ran and found nothing serious
    Success,
    /// Ran and found issues worth a look
    Warning,
    /// Ran and found blocking issues
    Failure,
    /// Could not run to completion
    Error,
}

impl std::fmt::Display for ValidatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ValidatorStatus::Success => "success",
            ValidatorStatus::Warning => "warning",
            ValidatorStatus::Failure => "failure",
            ValidatorStatus::Error => "error",
        })
    }
}

/// Internal cause of an `error` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorFailure {
    /// Machine-readable code (`timeout`, `cancelled`, `panic`, or validator-defined)
    pub code: String,

    /// What went wrong
    pub message: String,

    /// Whether the validator considers this failure transient
    #[serde(default)]
    pub retryable: bool,
}

impl ValidatorFailure {
    /// Attempt exceeded its deadline.
    pub const TIMEOUT: &'static str = "timeout";
    /// Run-level cancellation reached the validator.
    pub const CANCELLED: &'static str = "cancelled";
    /// Validator panicked.
    pub const PANIC: &'static str = "panic";
    /// Validator returned data the engine could not accept.
    pub const MALFORMED: &'static str = "malformed-result";

    /// Create a failure description.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Mark as transient.
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

/// One validator's output for one run. Created once, never mutated after it
/// is handed to the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorResult {
    /// Validator identifier
    pub validator_id: String,

    /// Category the validator reports under
    pub category: Category,

    /// Outcome
    pub status: ValidatorStatus,

    /// Findings, in the order reported
    pub findings: Vec<Finding>,

    /// Numeric metrics
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,

    /// Cause, when `status == Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ValidatorFailure>,

    /// Attempts the engine made (retries included)
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Wall time of the final attempt
    #[serde(default)]
    pub duration_ms: u64,
}

fn default_attempts() -> u32 {
    1
}

impl ValidatorResult {
    /// Build a result whose status follows from its findings: any
    /// critical/high finding is a failure, any medium a warning.
    pub fn from_findings(
        validator_id: impl Into<String>,
        category: Category,
        findings: Vec<Finding>,
    ) -> Self {
        let worst = findings.iter().map(|f| f.severity).max();
        let status = match worst {
            Some(Severity::Critical) | Some(Severity::High) => ValidatorStatus::Failure,
            Some(Severity::Medium) => ValidatorStatus::Warning,
            _ => ValidatorStatus::Success,
        };
        Self {
            validator_id: validator_id.into(),
            category,
            status,
            findings,
            metrics: BTreeMap::new(),
            failure: None,
            attempts: 1,
            duration_ms: 0,
        }
    }

    /// Build an `error` result. The cause is also recorded as an `info`
    /// finding so it shows up wherever findings are listed.
    pub fn error(
        validator_id: impl Into<String>,
        category: Category,
        failure: ValidatorFailure,
    ) -> Self {
        let validator_id = validator_id.into();
        let finding = Finding::new(
            format!("{}.{}", validator_id, failure.code),
            category,
            Severity::Info,
            format!("validator did not complete ({}): {}", failure.code, failure.message),
        );
        Self {
            validator_id,
            category,
            status: ValidatorStatus::Error,
            findings: vec![finding],
            metrics: BTreeMap::new(),
            failure: Some(failure),
            attempts: 1,
            duration_ms: 0,
        }
    }

    /// Override the status.
    pub fn with_status(mut self, status: ValidatorStatus) -> Self {
        self.status = status;
        self
    }

    /// Record a metric.
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Record the validator's own sub-score.
    pub fn with_score(self, score: f64) -> Self {
        self.with_metric(SCORE_METRIC, score)
    }

    /// The self-reported sub-score, if any.
    pub fn reported_score(&self) -> Option<f64> {
        self.metrics.get(SCORE_METRIC).copied()
    }

    /// Whether the result is an `error`.
    pub fn is_error(&self) -> bool {
        self.status == ValidatorStatus::Error
    }

    /// Whether the failure is transient by the validator's own account.
    pub fn is_retryable(&self) -> bool {
        self.is_error() && self.failure.as_ref().map(|f| f.retryable).unwrap_or(false)
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Pass,
    Warning,
    Fail,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OverallStatus::Pass => "pass",
            OverallStatus::Warning => "warning",
            OverallStatus::Fail => "fail",
        })
    }
}

/// Run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Number of findings across all validators
    pub total_findings: usize,

    /// Finding counts per severity (every severity present, possibly 0)
    pub findings_by_severity: BTreeMap<Severity, usize>,

    /// Finding counts per validator
    pub findings_by_validator: BTreeMap<String, usize>,

    /// Overall status
    pub overall_status: OverallStatus,

    /// Weighted quality score in [0,100]
    pub quality_score: f64,

    /// Whether a human must review before progression
    pub human_review: bool,

    /// Validators that ended in `error`
    pub validator_errors: usize,
}

/// Score of one category bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    /// Mean of contributing validator sub-scores
    pub score: f64,

    /// Configured weight
    pub weight: f64,

    /// Weight actually applied after renormalization
    pub effective_weight: f64,

    /// Validators that contributed
    pub validators: Vec<String>,
}

/// A finding together with the validator that reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFinding {
    /// Reporting validator
    pub validator: String,

    /// The finding
    pub finding: Finding,
}

/// Everything a reviewer needs to decide without re-running validators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewContext {
    /// Why review was requested
    pub reasons: Vec<String>,

    /// Category-level scores
    pub category_scores: BTreeMap<Category, f64>,

    /// Full finding list, most severe first
    pub findings: Vec<ReviewFinding>,

    /// Original vs. final artifacts from upstream
    pub comparisons: Vec<ComparisonArtifact>,
}

/// Aggregate of all validators for one run. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Run identifier
    pub run_id: RunId,

    /// Validated work item
    pub work_item: WorkItemId,

    /// Validated revision
    pub revision: u32,

    /// When the result was assembled
    pub timestamp: Time,

    /// Per-validator results
    pub results: BTreeMap<String, ValidatorResult>,

    /// Summary
    pub summary: Summary,

    /// Per-category scores
    pub category_scores: BTreeMap<Category, CategoryScore>,

    /// Review context, present when `summary.human_review` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewContext>,
}

impl ValidationResult {
    /// Whether progression must wait for a human.
    pub fn needs_review(&self) -> bool {
        self.summary.human_review
    }

    /// Whether the run failed outright.
    pub fn failed(&self) -> bool {
        self.summary.overall_status == OverallStatus::Fail
    }

    /// All findings with their validator, in validator-id order.
    pub fn findings(&self) -> impl Iterator<Item = (&str, &Finding)> {
        self.results
            .iter()
            .flat_map(|(id, r)| r.findings.iter().map(move |f| (id.as_str(), f)))
    }
}

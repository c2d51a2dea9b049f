//! Run configuration.
//!
//! Loaded once at process start from JSON or YAML, validated, and then
//! passed by reference into every component. Loading fails closed: any
//! invalid field aborts before a validator runs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::finding::{Category, Severity};
use crate::stage::Stage;

/// Tolerance when checking that weights sum to 1.0.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Configuration errors. Every variant names the offending field.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Config path
        path: PathBuf,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON/YAML for this schema
    #[error("failed to parse config {path}: {message}")]
    Parse {
        /// Config path
        path: PathBuf,
        /// Parser message (includes line/column where available)
        message: String,
    },

    /// Unknown file extension
    #[error("unsupported config format '{0}' (expected .json, .yaml or .yml)")]
    UnsupportedFormat(String),

    /// A field holds an invalid value
    #[error("invalid value for `{field}`: {reason}")]
    InvalidField {
        /// Dotted field path
        field: String,
        /// What is wrong
        reason: String,
    },

    /// Category weights do not sum to 1.0
    #[error("`aggregation.weights` must sum to 1.0 (got {sum})")]
    WeightSum {
        /// Actual sum
        sum: f64,
    },

    /// Configured validator is not registered
    #[error("unknown validator `validators.{0}`")]
    UnknownValidator(String),

    /// A rule cannot be used
    #[error("malformed rule `validators.{validator}.rules[{index}]`: {reason}")]
    MalformedRule {
        /// Validator id
        validator: String,
        /// Rule position
        index: usize,
        /// What is wrong
        reason: String,
    },

    /// An enabled validator reports under a category with no weight
    #[error("validator `{validator}` reports under category `{category}`, which has no entry in `aggregation.weights`")]
    MissingWeight {
        /// Validator id
        validator: String,
        /// Its category
        category: Category,
    },

    /// A validator refused its settings during initialization
    #[error("validator `validators.{validator}` rejected its configuration: {reason}")]
    ValidatorInit {
        /// Validator id
        validator: String,
        /// Why
        reason: String,
    },
}

impl ConfigError {
    /// Dotted path of the field at fault, when there is one.
    pub fn field(&self) -> Option<String> {
        match self {
            ConfigError::InvalidField { field, .. } => Some(field.clone()),
            ConfigError::WeightSum { .. } => Some("aggregation.weights".to_string()),
            ConfigError::UnknownValidator(id) => Some(format!("validators.{}", id)),
            ConfigError::MalformedRule {
                validator, index, ..
            } => Some(format!("validators.{}.rules[{}]", validator, index)),
            ConfigError::MissingWeight { category, .. } => {
                Some(format!("aggregation.weights.{}", category))
            }
            ConfigError::ValidatorInit { validator, .. } => {
                Some(format!("validators.{}", validator))
            }
            ConfigError::Io { .. } | ConfigError::Parse { .. } | ConfigError::UnsupportedFormat(_) => {
                None
            }
        }
    }

    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    /// Per-validator settings, keyed by validator id
    #[serde(default)]
    pub validators: BTreeMap<String, ValidatorSettings>,

    /// Scoring and gating
    pub aggregation: AggregationConfig,

    /// Report output
    #[serde(default)]
    pub reporting: ReportingConfig,

    /// Validator dispatch
    #[serde(default)]
    pub engine: EngineSettings,

    /// Multi-stage pipeline
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Inference collaborator
    #[serde(default)]
    pub inference: InferenceSettings,
}

/// Settings for one validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorSettings {
    /// Whether the validator runs
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Severity forced onto every finding this validator reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,

    /// Validator-specific options
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,

    /// Rules for rule-driven validators
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            severity: None,
            options: BTreeMap::new(),
            rules: Vec::new(),
        }
    }
}

impl ValidatorSettings {
    /// String option.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    /// Unsigned integer option.
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.as_u64())
    }

    /// Float option.
    pub fn option_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(|v| v.as_f64())
    }

    /// List-of-strings option. Non-string entries are ignored.
    pub fn option_strings(&self, key: &str) -> Vec<String> {
        self.options
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Per-validator timeout override (`options.timeoutSecs`).
    pub fn timeout(&self) -> Option<Duration> {
        self.option_u64("timeoutSecs").map(Duration::from_secs)
    }
}

/// A pattern rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    /// Rule identifier
    pub id: String,

    /// Regular expression matched line by line
    pub pattern: String,

    /// Severity of each match
    pub severity: Severity,

    /// Category override (defaults to the validator's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,

    /// Message reported for a match
    pub message: String,

    /// Suggested fix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl RuleSpec {
    /// Compile the pattern.
    pub fn compile(&self) -> Result<Regex, regex::Error> {
        Regex::new(&self.pattern)
    }
}

/// How `error` validators count toward the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Drop them and renormalize over the remaining weights
    #[default]
    Exclude,
    /// Count them as a zero sub-score in their bucket
    Zero,
}

/// Per-severity deductions used when a validator reports no score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityWeights {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
    pub info: f64,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            critical: 40.0,
            high: 20.0,
            medium: 10.0,
            low: 3.0,
            info: 0.0,
        }
    }
}

impl SeverityWeights {
    /// Deduction for one finding of `severity`.
    pub fn weight(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Info => self.info,
        }
    }
}

fn default_threshold() -> f64 {
    80.0
}

fn default_max_high() -> usize {
    2
}

/// Scoring and gating configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationConfig {
    /// Weight per category; must sum to 1.0
    pub weights: BTreeMap<Category, f64>,

    /// Scores below this are sent to human review
    #[serde(default = "default_threshold")]
    pub human_review_threshold: f64,

    /// More high findings than this fail the run
    #[serde(default = "default_max_high")]
    pub max_high_findings: usize,

    /// Deductions for derived sub-scores
    #[serde(default)]
    pub severity_weights: SeverityWeights,

    /// How error validators count toward the score
    #[serde(default)]
    pub error_policy: ErrorPolicy,

    /// Request review whenever a validator ends in `error`
    #[serde(default = "default_true")]
    pub review_on_validator_error: bool,
}

impl AggregationConfig {
    /// Equal weights over `categories`.
    pub fn equal_weights(categories: &[Category]) -> Self {
        let w = 1.0 / categories.len().max(1) as f64;
        Self {
            weights: categories.iter().map(|c| (*c, w)).collect(),
            human_review_threshold: default_threshold(),
            max_high_findings: default_max_high(),
            severity_weights: SeverityWeights::default(),
            error_policy: ErrorPolicy::default(),
            review_on_validator_error: true,
        }
    }
}

/// Report formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Markdown,
    Text,
    Junit,
}

impl ReportFormat {
    /// All formats.
    pub const ALL: [ReportFormat; 4] = [
        ReportFormat::Json,
        ReportFormat::Markdown,
        ReportFormat::Text,
        ReportFormat::Junit,
    ];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Markdown => "markdown",
            ReportFormat::Text => "text",
            ReportFormat::Junit => "junit",
        }
    }

    /// File extension for written reports.
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Markdown => "md",
            ReportFormat::Text => "txt",
            ReportFormat::Junit => "xml",
        }
    }
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "markdown" | "md" => Ok(ReportFormat::Markdown),
            "text" | "txt" => Ok(ReportFormat::Text),
            "junit" | "xml" => Ok(ReportFormat::Junit),
            other => Err(format!("unknown report format '{}'", other)),
        }
    }
}

/// Where reports go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Standard output
    Stdout,
    /// One file per format in this directory
    Directory(PathBuf),
}

impl OutputTarget {
    /// Parse `stdout` or a directory path.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "stdout" | "-" => OutputTarget::Stdout,
            dir => OutputTarget::Directory(PathBuf::from(dir)),
        }
    }
}

fn default_formats() -> Vec<String> {
    vec!["json".to_string()]
}

fn default_outputs() -> Vec<String> {
    vec!["stdout".to_string()]
}

/// Report configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportingConfig {
    /// Formats to render
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,

    /// `stdout` or directories
    #[serde(default = "default_outputs")]
    pub outputs: Vec<String>,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            formats: default_formats(),
            outputs: default_outputs(),
        }
    }
}

impl ReportingConfig {
    /// Parsed formats. Only valid after [`ValidationConfig::validate`].
    pub fn parsed_formats(&self) -> Vec<ReportFormat> {
        self.formats.iter().filter_map(|f| f.parse().ok()).collect()
    }

    /// Parsed output targets.
    pub fn targets(&self) -> Vec<OutputTarget> {
        self.outputs.iter().map(|o| OutputTarget::parse(o)).collect()
    }
}

/// Validator dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Validators running at once
    pub max_concurrency: usize,

    /// Per-attempt deadline
    pub timeout_secs: u64,

    /// Retries for transient validator errors
    pub max_retries: u32,

    /// First backoff delay
    pub backoff_base_ms: u64,

    /// Backoff ceiling
    pub backoff_max_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            timeout_secs: 60,
            max_retries: 2,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
        }
    }
}

impl EngineSettings {
    /// Per-attempt deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// External command standing in for one stage's collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorSpec {
    /// Program
    pub command: String,

    /// Arguments; `{input}`, `{workspace}`, `{output}` and `{item}` are substituted
    #[serde(default)]
    pub args: Vec<String>,

    /// Output path, relative to the run workspace
    pub output: String,

    /// Content types of the output (inferred from `output` when empty)
    #[serde(default)]
    pub content_types: Vec<String>,

    /// Deadline for one invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Exit codes meaning "collaborator unavailable, try again"
    #[serde(default)]
    pub transient_exit_codes: Vec<i32>,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".stagegate")
}

/// Pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    /// Durable state directory
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Parent of per-run workspaces (system temp when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Retries for transient collaborator errors
    #[serde(default = "default_integration_retries")]
    pub integration_retries: u32,

    /// First backoff delay for collaborator retries
    #[serde(default = "default_integration_backoff")]
    pub integration_backoff_ms: u64,

    /// Collaborator per stage
    #[serde(default)]
    pub collaborators: BTreeMap<Stage, CollaboratorSpec>,
}

fn default_integration_retries() -> u32 {
    2
}

fn default_integration_backoff() -> u64 {
    500
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            workspace_root: None,
            integration_retries: default_integration_retries(),
            integration_backoff_ms: default_integration_backoff(),
            collaborators: BTreeMap::new(),
        }
    }
}

/// Which inference backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackendKind {
    /// HTTP service
    Live,
    /// Replay from a recordings file
    Recorded,
    /// Fixed response
    #[default]
    Mock,
}

/// Inference collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InferenceSettings {
    /// Backend kind
    pub backend: InferenceBackendKind,

    /// Live endpoint base URL
    pub endpoint: String,

    /// Live model name
    pub model: String,

    /// Live request deadline
    pub timeout_secs: u64,

    /// Concurrent requests allowed toward the backend
    pub max_concurrent_requests: usize,

    /// Retries for transient backend errors
    pub max_retries: u32,

    /// Recordings file for the recorded backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recordings: Option<PathBuf>,

    /// Mock response text
    pub mock_content: String,

    /// Mock confidence
    pub mock_confidence: f64,

    /// Cost accounting for live calls
    pub cost_per_1k_tokens: f64,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            backend: InferenceBackendKind::Mock,
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
            timeout_secs: 120,
            max_concurrent_requests: 1,
            max_retries: 2,
            recordings: None,
            mock_content: "No issues found.".to_string(),
            mock_confidence: 0.9,
            cost_per_1k_tokens: 0.0,
        }
    }
}

impl ValidationConfig {
    /// Read, parse and validate a config file (`.json`, `.yaml`, `.yml`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let config = match ext.as_str() {
            "json" => serde_json::from_str::<Self>(&text).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            "yaml" | "yml" => serde_yaml::from_str::<Self>(&text).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        config.validate()?;
        tracing::debug!(
            "Loaded config {} ({} validators)",
            path.display(),
            config.validators.len()
        );
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field that can be checked without knowing the registered
    /// validators.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let agg = &self.aggregation;

        if agg.weights.is_empty() {
            return Err(ConfigError::invalid(
                "aggregation.weights",
                "at least one category weight is required",
            ));
        }
        for (category, weight) in &agg.weights {
            if !weight.is_finite() || *weight < 0.0 || *weight > 1.0 {
                return Err(ConfigError::invalid(
                    format!("aggregation.weights.{}", category),
                    format!("weight {} is outside [0, 1]", weight),
                ));
            }
        }
        let sum: f64 = agg.weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::WeightSum { sum });
        }

        if !agg.human_review_threshold.is_finite()
            || !(0.0..=100.0).contains(&agg.human_review_threshold)
        {
            return Err(ConfigError::invalid(
                "aggregation.humanReviewThreshold",
                format!("{} is outside [0, 100]", agg.human_review_threshold),
            ));
        }

        for severity in Severity::DESCENDING {
            let w = agg.severity_weights.weight(severity);
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::invalid(
                    format!("aggregation.severityWeights.{}", severity),
                    format!("{} must be a non-negative number", w),
                ));
            }
        }

        for (id, settings) in &self.validators {
            for (index, rule) in settings.rules.iter().enumerate() {
                let malformed = |reason: String| ConfigError::MalformedRule {
                    validator: id.clone(),
                    index,
                    reason,
                };
                if rule.id.trim().is_empty() {
                    return Err(malformed("rule id is empty".to_string()));
                }
                if rule.message.trim().is_empty() {
                    return Err(malformed("rule message is empty".to_string()));
                }
                if rule.pattern.is_empty() {
                    return Err(malformed("pattern is empty".to_string()));
                }
                rule.compile().map_err(|e| malformed(e.to_string()))?;
            }
        }

        if self.reporting.formats.is_empty() {
            return Err(ConfigError::invalid(
                "reporting.formats",
                "at least one format is required",
            ));
        }
        for (i, format) in self.reporting.formats.iter().enumerate() {
            format
                .parse::<ReportFormat>()
                .map_err(|e| ConfigError::invalid(format!("reporting.formats[{}]", i), e))?;
        }

        if self.engine.max_concurrency == 0 {
            return Err(ConfigError::invalid(
                "engine.maxConcurrency",
                "must be at least 1",
            ));
        }
        if self.engine.timeout_secs == 0 {
            return Err(ConfigError::invalid("engine.timeoutSecs", "must be at least 1"));
        }
        if self.engine.backoff_max_ms < self.engine.backoff_base_ms {
            return Err(ConfigError::invalid(
                "engine.backoffMaxMs",
                "must not be smaller than engine.backoffBaseMs",
            ));
        }

        for (stage, spec) in &self.pipeline.collaborators {
            if spec.command.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("pipeline.collaborators.{}.command", stage),
                    "command is empty",
                ));
            }
            let output = Path::new(&spec.output);
            if spec.output.trim().is_empty()
                || output.is_absolute()
                || output.components().any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(ConfigError::invalid(
                    format!("pipeline.collaborators.{}.output", stage),
                    "must be a relative path inside the run workspace",
                ));
            }
        }

        if self.inference.max_concurrent_requests == 0 {
            return Err(ConfigError::invalid(
                "inference.maxConcurrentRequests",
                "must be at least 1",
            ));
        }
        if self.inference.backend == InferenceBackendKind::Recorded
            && self.inference.recordings.is_none()
        {
            return Err(ConfigError::invalid(
                "inference.recordings",
                "required when inference.backend is 'recorded'",
            ));
        }
        if !(0.0..=1.0).contains(&self.inference.mock_confidence) {
            return Err(ConfigError::invalid(
                "inference.mockConfidence",
                "must lie in [0, 1]",
            ));
        }

        Ok(())
    }

    /// Check the configuration against the registered validators:
    /// every configured id must be registered and every enabled validator's
    /// category must carry a weight.
    pub fn check_registry<'a>(
        &self,
        registered: impl IntoIterator<Item = (&'a str, Category)>,
    ) -> Result<(), ConfigError> {
        let registered: BTreeMap<&str, Category> = registered.into_iter().collect();

        for id in self.validators.keys() {
            if !registered.contains_key(id.as_str()) {
                return Err(ConfigError::UnknownValidator(id.clone()));
            }
        }

        for (id, category) in &registered {
            if self.is_enabled(id) && !self.aggregation.weights.contains_key(category) {
                return Err(ConfigError::MissingWeight {
                    validator: id.to_string(),
                    category: *category,
                });
            }
        }
        Ok(())
    }

    /// Validators run only when listed and enabled.
    pub fn is_enabled(&self, id: &str) -> bool {
        self.validators.get(id).map(|s| s.enabled).unwrap_or(false)
    }

    /// Settings for `id` (defaults when unlisted).
    pub fn settings_for(&self, id: &str) -> ValidatorSettings {
        self.validators.get(id).cloned().unwrap_or_default()
    }
}

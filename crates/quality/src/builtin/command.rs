//! External command validator: the plug point for linters and scanners.
//!
//! The command prints a JSON report on stdout (see [`crate::parser`]).
//! Options:
//!
//! - `command` (required), `args` with `{root}`, `{id}` and `{revision}`
//!   placeholders
//! - `findingsPath` / `metricsPath` (default `findings` / `metrics`)
//! - `retryableExitCodes`: exit codes that mean "try again"
//! - `severityMap`: tool severity label -> common severity

use async_trait::async_trait;
use stagegate_core::{
    CancellationToken, Category, Severity, ValidatorFailure, ValidatorResult, ValidatorSettings,
    WorkItem,
};
use stagegate_tools::{substitute, CommandError, CommandRunner, CommandSpec};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::parser::parse_tool_report;
use crate::validator::{Validator, ValidatorDescriptor};

/// Failure code for a retryable exit status.
pub const EXIT_CODE: &str = "exit-code";

/// Runs a configured command and parses its report.
pub struct ExternalCommandValidator {
    desc: ValidatorDescriptor,
    runner: Arc<dyn CommandRunner>,
    command: String,
    args: Vec<String>,
    findings_path: String,
    metrics_path: String,
    retryable_exit_codes: Vec<i32>,
}

impl ExternalCommandValidator {
    /// Default identifier.
    pub const ID: &'static str = "external-command";

    /// Validator registered as `external-command` under `quality`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_id(runner, Self::ID, Category::Quality)
    }

    /// Validator with its own id and category, one per external tool.
    pub fn with_id(runner: Arc<dyn CommandRunner>, id: impl Into<String>, category: Category) -> Self {
        let id = id.into();
        let desc = ValidatorDescriptor::new(id.clone(), "External command", env!("CARGO_PKG_VERSION"), category)
            .with_content_types(["*"])
            .with_schema(serde_json::json!({
                "type": "object",
                "required": ["command"],
                "properties": {
                    "command": { "type": "string" },
                    "args": { "type": "array", "items": { "type": "string" } },
                    "findingsPath": { "type": "string" },
                    "metricsPath": { "type": "string" },
                    "retryableExitCodes": { "type": "array", "items": { "type": "integer" } },
                    "severityMap": { "type": "object" }
                }
            }))
            .retryable_code(EXIT_CODE)
            .retryable_code("io");
        Self {
            desc,
            runner,
            command: String::new(),
            args: Vec::new(),
            findings_path: "findings".to_string(),
            metrics_path: "metrics".to_string(),
            retryable_exit_codes: Vec::new(),
        }
    }

    fn error(&self, failure: ValidatorFailure) -> ValidatorResult {
        ValidatorResult::error(&self.desc.id, self.desc.category, failure)
    }
}

#[async_trait]
impl Validator for ExternalCommandValidator {
    fn descriptor(&self) -> &ValidatorDescriptor {
        &self.desc
    }

    fn initialize(&mut self, settings: &ValidatorSettings) -> Result<(), String> {
        self.command = settings
            .option_str("command")
            .filter(|c| !c.trim().is_empty())
            .ok_or("options.command is required")?
            .to_string();
        self.args = settings.option_strings("args");
        if let Some(path) = settings.option_str("findingsPath") {
            self.findings_path = path.to_string();
        }
        if let Some(path) = settings.option_str("metricsPath") {
            self.metrics_path = path.to_string();
        }
        self.retryable_exit_codes = settings
            .options
            .get("retryableExitCodes")
            .and_then(|v| v.as_array())
            .map(|codes| {
                codes
                    .iter()
                    .filter_map(|c| c.as_i64())
                    .filter_map(|c| i32::try_from(c).ok())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(map) = settings.options.get("severityMap").and_then(|v| v.as_object()) {
            for (label, sev) in map {
                let severity: Severity = sev
                    .as_str()
                    .ok_or_else(|| format!("severityMap.{} must be a string", label))?
                    .parse()?;
                self.desc = self.desc.clone().map_severity(label, severity);
            }
        }
        Ok(())
    }

    async fn validate(&self, item: &WorkItem, cancel: &CancellationToken) -> ValidatorResult {
        let mut vars = BTreeMap::new();
        vars.insert("root", item.root.display().to_string());
        vars.insert("id", item.id.to_string());
        vars.insert("revision", item.revision.to_string());
        let spec = CommandSpec::new(&self.command)
            .args(substitute(&self.args, &vars))
            .env("STAGEGATE_WORK_ITEM", item.id.as_str())
            .env("STAGEGATE_ROOT", item.root.display().to_string());

        tracing::debug!(validator = %self.desc.id, "Running: {}", spec.display());
        let output = match self.runner.run(&spec, cancel).await {
            Ok(output) => output,
            Err(e) => {
                let failure = match &e {
                    CommandError::Timeout { .. } => {
                        ValidatorFailure::new(ValidatorFailure::TIMEOUT, e.to_string()).retryable()
                    }
                    CommandError::Cancelled { .. } => {
                        ValidatorFailure::new(ValidatorFailure::CANCELLED, e.to_string())
                    }
                    CommandError::Io { .. } => ValidatorFailure::new("io", e.to_string()).retryable(),
                    CommandError::Spawn { .. } => ValidatorFailure::new("spawn", e.to_string()),
                };
                return self.error(failure);
            }
        };

        if self.retryable_exit_codes.contains(&output.exit_code) {
            return self.error(
                ValidatorFailure::new(
                    EXIT_CODE,
                    format!("`{}` exited with {}", self.command, output.exit_code),
                )
                .retryable(),
            );
        }

        match parse_tool_report(
            &output.stdout,
            &self.desc.id,
            self.desc.category,
            &self.findings_path,
            &self.metrics_path,
        ) {
            Ok(report) => {
                let mut result =
                    ValidatorResult::from_findings(&self.desc.id, self.desc.category, report.findings);
                result.metrics = report.metrics;
                result.with_metric("exit_code", output.exit_code as f64)
            }
            Err(e) => {
                let stderr = output.stderr.trim();
                let tail: String = stderr
                    .chars()
                    .skip(stderr.chars().count().saturating_sub(400))
                    .collect();
                self.error(ValidatorFailure::new(
                    ValidatorFailure::MALFORMED,
                    format!("`{}` exited with {}: {}; stderr: {}", self.command, output.exit_code, e, tail),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagegate_core::{ValidatorStatus, WorkItemId};
    use stagegate_tools::CommandOutput;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays canned outputs and records the specs it was given.
    struct ScriptedRunner {
        outputs: Mutex<Vec<Result<CommandOutput, CommandError>>>,
        seen: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<Result<CommandOutput, CommandError>>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            spec: &CommandSpec,
            _cancel: &CancellationToken,
        ) -> Result<CommandOutput, CommandError> {
            self.seen.lock().unwrap().push(spec.clone());
            self.outputs.lock().unwrap().remove(0)
        }
    }

    fn output(code: i32, stdout: &str) -> Result<CommandOutput, CommandError> {
        Ok(CommandOutput {
            exit_code: code,
            stdout: stdout.to_string(),
            stderr: "boom".to_string(),
            duration: Duration::from_millis(5),
        })
    }

    fn validator(runner: Arc<ScriptedRunner>, options: serde_json::Value) -> ExternalCommandValidator {
        let mut v = ExternalCommandValidator::with_id(runner, "lint", Category::Style);
        let settings: ValidatorSettings =
            serde_json::from_value(serde_json::json!({ "options": options })).unwrap();
        v.initialize(&settings).unwrap();
        v
    }

    fn item() -> WorkItem {
        WorkItem::new(WorkItemId::new("book").unwrap(), "/work/book.md")
    }

    #[tokio::test]
    async fn test_report_is_parsed_and_args_substituted() {
        let runner = ScriptedRunner::new(vec![output(
            1,
            r#"{"findings": [{"severity": "warn", "message": "long line"}], "metrics": {"score": 88}}"#,
        )]);
        let v = validator(
            runner.clone(),
            serde_json::json!({
                "command": "lint",
                "args": ["--format", "json", "{root}"],
                "severityMap": { "warn": "medium" }
            }),
        );

        let result = v.validate(&item(), &CancellationToken::new()).await;
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].native_severity.as_deref(), Some("warn"));
        assert_eq!(result.reported_score(), Some(88.0));
        assert_eq!(result.metrics.get("exit_code"), Some(&1.0));
        assert_eq!(v.descriptor().normalize("WARN"), Some(Severity::Medium));

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].args, vec!["--format", "json", "/work/book.md"]);
    }

    #[tokio::test]
    async fn test_retryable_exit_code() {
        let runner = ScriptedRunner::new(vec![output(75, "")]);
        let v = validator(
            runner,
            serde_json::json!({ "command": "scan", "retryableExitCodes": [75] }),
        );
        let result = v.validate(&item(), &CancellationToken::new()).await;
        assert!(result.is_retryable());
        assert_eq!(result.failure.unwrap().code, EXIT_CODE);
    }

    #[tokio::test]
    async fn test_out_of_range_exit_code_is_ignored() {
        // 2^32 + 75 must not wrap around to 75.
        let runner = ScriptedRunner::new(vec![output(75, r#"{"findings": []}"#)]);
        let v = validator(
            runner,
            serde_json::json!({ "command": "scan", "retryableExitCodes": [4294967371u64] }),
        );
        let result = v.validate(&item(), &CancellationToken::new()).await;
        assert_eq!(result.status, ValidatorStatus::Success);
        assert!(result.failure.is_none());
    }

    #[tokio::test]
    async fn test_garbage_output_is_malformed() {
        let runner = ScriptedRunner::new(vec![output(2, "Segmentation fault")]);
        let v = validator(runner, serde_json::json!({ "command": "scan" }));
        let result = v.validate(&item(), &CancellationToken::new()).await;
        assert_eq!(result.status, ValidatorStatus::Error);
        let failure = result.failure.unwrap();
        assert_eq!(failure.code, ValidatorFailure::MALFORMED);
        assert!(failure.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transient_failure() {
        let runner = ScriptedRunner::new(vec![Err(CommandError::Timeout {
            program: "scan".to_string(),
            timeout: Duration::from_secs(1),
        })]);
        let v = validator(runner, serde_json::json!({ "command": "scan" }));
        let result = v.validate(&item(), &CancellationToken::new()).await;
        assert_eq!(result.failure.as_ref().unwrap().code, ValidatorFailure::TIMEOUT);
        assert!(result.is_retryable());
    }

    #[test]
    fn test_command_is_required() {
        let mut v = ExternalCommandValidator::new(ScriptedRunner::new(vec![]));
        assert!(v.initialize(&ValidatorSettings::default()).is_err());
    }
}

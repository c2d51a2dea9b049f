//! Validation engine.
//!
//! Dispatches every applicable validator concurrently (bounded by
//! `engine.maxConcurrency`), each attempt in its own task with its own
//! deadline. A validator that panics, times out, is cancelled or returns
//! malformed data becomes an `error` result; the run itself only fails when
//! the work item is invalid or no validator applies.

use stagegate_core::{
    CancellationToken, ConfigError, RunId, ValidationConfig, ValidationResult, ValidatorFailure,
    ValidatorResult, WorkItem, WorkItemError, WorkItemId, SCORE_METRIC,
};
use stagegate_tools::RetryPolicy;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregator::ResultsAggregator;
use crate::registry::ValidatorRegistry;
use crate::validator::{Validator, ValidatorDescriptor};

/// Run-level errors. Validator failures are never reported here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The work item cannot be validated
    #[error("invalid work item: {0}")]
    InvalidWorkItem(#[from] WorkItemError),

    /// No enabled validator supports the item's content types
    #[error("no validator applies to work item '{work_item}' (content types: {content_types})")]
    NoValidators {
        /// Work item
        work_item: WorkItemId,
        /// Its content types
        content_types: String,
    },
}

/// Orchestrates validator runs.
pub struct ValidationEngine {
    registry: Arc<ValidatorRegistry>,
    config: Arc<ValidationConfig>,
    aggregator: ResultsAggregator,
}

impl ValidationEngine {
    /// Configure `registry` with `config` and build an engine. Fails before
    /// any validator runs if the configuration does not fit the registry.
    pub fn new(
        mut registry: ValidatorRegistry,
        config: Arc<ValidationConfig>,
    ) -> Result<Self, ConfigError> {
        registry.configure(&config)?;
        let aggregator = ResultsAggregator::from_config(&config, &registry);
        Ok(Self {
            registry: Arc::new(registry),
            config,
            aggregator,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Registered validators.
    pub fn registry(&self) -> &ValidatorRegistry {
        &self.registry
    }

    /// Validate `item` and aggregate the results.
    pub async fn validate(&self, item: &WorkItem) -> Result<ValidationResult, EngineError> {
        self.validate_with_cancel(item, &CancellationToken::new())
            .await
    }

    /// Validate `item`; cancelling `cancel` turns every in-flight validator
    /// into a `cancelled` error result.
    pub async fn validate_with_cancel(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<ValidationResult, EngineError> {
        let run_id = RunId::new();
        let results = self.run_validators(item, run_id, cancel).await?;
        Ok(self.aggregator.aggregate(item, run_id, results))
    }

    /// Dispatch validators and collect one result per resolved validator.
    pub async fn run_validators(
        &self,
        item: &WorkItem,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, ValidatorResult>, EngineError> {
        item.validate()?;

        let validators = self.registry.resolve_for(item, &self.config);
        if validators.is_empty() {
            return Err(EngineError::NoValidators {
                work_item: item.id.clone(),
                content_types: item
                    .content_types
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        tracing::info!(
            work_item = %item.id,
            run_id = %run_id,
            "Dispatching {} validators",
            validators.len()
        );

        let engine = &self.config.engine;
        let permits = Arc::new(Semaphore::new(engine.max_concurrency.max(1)));
        let retry = RetryPolicy::new(
            engine.max_retries,
            Duration::from_millis(engine.backoff_base_ms),
            Duration::from_millis(engine.backoff_max_ms),
        );
        let item = Arc::new(item.clone());

        let mut set = JoinSet::new();
        for validator in &validators {
            let timeout = self
                .config
                .validators
                .get(validator.id())
                .and_then(|s| s.timeout())
                .unwrap_or_else(|| engine.timeout());
            let dispatch = Dispatch {
                validator: validator.clone(),
                item: item.clone(),
                timeout,
                retry,
                cancel: cancel.clone(),
                permits: permits.clone(),
            };
            set.spawn(dispatch.run());
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    results.insert(result.validator_id.clone(), result);
                }
                Err(e) => tracing::error!("Validator dispatch task failed: {}", e),
            }
        }

        // Every resolved validator gets a result, even if its dispatch task died.
        let seen: HashSet<String> = results.keys().cloned().collect();
        for validator in &validators {
            let desc = validator.descriptor();
            if !seen.contains(&desc.id) {
                results.insert(
                    desc.id.clone(),
                    ValidatorResult::error(
                        &desc.id,
                        desc.category,
                        ValidatorFailure::new(
                            ValidatorFailure::PANIC,
                            "dispatch task ended without a result",
                        ),
                    ),
                );
            }
        }

        Ok(results)
    }
}

/// One validator's dispatch: attempts, deadline and retries.
struct Dispatch {
    validator: Arc<dyn Validator>,
    item: Arc<WorkItem>,
    timeout: Duration,
    retry: RetryPolicy,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
}

impl Dispatch {
    async fn run(self) -> ValidatorResult {
        let desc = self.validator.descriptor().clone();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let started = Instant::now();

            let permit = tokio::select! {
                p = self.permits.acquire() => p.ok(),
                _ = self.cancel.cancelled() => None,
            };
            let raw = match permit {
                Some(_permit) => self.attempt(&desc).await,
                None => cancelled(&desc),
            };

            let mut result = check_result(raw, &desc);
            result.attempts = attempts;
            result.duration_ms = started.elapsed().as_millis() as u64;

            if is_transient(&result, &desc)
                && self.retry.allows(attempts)
                && !self.cancel.is_cancelled()
            {
                let delay = self.retry.delay(attempts);
                tracing::warn!(
                    validator = %desc.id,
                    "Attempt {} failed ({}), retrying in {:?}",
                    attempts,
                    result.failure.as_ref().map(|f| f.code.as_str()).unwrap_or("error"),
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = self.cancel.cancelled() => {
                        let mut result = cancelled(&desc);
                        result.attempts = attempts;
                        return result;
                    }
                }
            }

            tracing::debug!(
                validator = %desc.id,
                "Finished with status {} after {} attempt(s)",
                result.status,
                attempts
            );
            return result;
        }
    }

    /// One attempt in its own task so a panic stays contained.
    async fn attempt(&self, desc: &ValidatorDescriptor) -> ValidatorResult {
        let validator = self.validator.clone();
        let item = self.item.clone();
        let cancel = self.cancel.clone();
        let mut handle =
            tokio::spawn(async move { validator.validate(&item, &cancel).await });

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    tracing::error!(validator = %desc.id, "Validator panicked: {}", message);
                    ValidatorResult::error(
                        &desc.id,
                        desc.category,
                        ValidatorFailure::new(ValidatorFailure::PANIC, message),
                    )
                }
                Err(e) => ValidatorResult::error(
                    &desc.id,
                    desc.category,
                    ValidatorFailure::new(ValidatorFailure::CANCELLED, e.to_string()),
                ),
            },
            _ = tokio::time::sleep(self.timeout) => {
                handle.abort();
                tracing::warn!(validator = %desc.id, "Timed out after {:?}", self.timeout);
                ValidatorResult::error(
                    &desc.id,
                    desc.category,
                    ValidatorFailure::new(
                        ValidatorFailure::TIMEOUT,
                        format!("no result within {:?}", self.timeout),
                    )
                    .retryable(),
                )
            }
            _ = self.cancel.cancelled() => {
                handle.abort();
                cancelled(desc)
            }
        }
    }
}

fn cancelled(desc: &ValidatorDescriptor) -> ValidatorResult {
    ValidatorResult::error(
        &desc.id,
        desc.category,
        ValidatorFailure::new(ValidatorFailure::CANCELLED, "run was cancelled"),
    )
}

/// Timeouts, validator-flagged failures and declared codes are transient;
/// cancellation never is.
fn is_transient(result: &ValidatorResult, desc: &ValidatorDescriptor) -> bool {
    let Some(failure) = result.failure.as_ref().filter(|_| result.is_error()) else {
        return false;
    };
    if failure.code == ValidatorFailure::CANCELLED {
        return false;
    }
    failure.code == ValidatorFailure::TIMEOUT
        || failure.retryable
        || desc.retryable_codes.contains(&failure.code)
}

/// Replace results the engine cannot accept with `malformed-result` errors
/// and make every error carry a cause.
fn check_result(mut result: ValidatorResult, desc: &ValidatorDescriptor) -> ValidatorResult {
    let malformed = |reason: String| {
        tracing::warn!(validator = %desc.id, "Malformed result: {}", reason);
        ValidatorResult::error(
            &desc.id,
            desc.category,
            ValidatorFailure::new(ValidatorFailure::MALFORMED, reason),
        )
    };

    if result.validator_id != desc.id {
        return malformed(format!(
            "result is labelled '{}' instead of '{}'",
            result.validator_id, desc.id
        ));
    }
    if let Some(score) = result.metrics.get(SCORE_METRIC) {
        if !score.is_finite() {
            return malformed(format!("score metric is not finite ({})", score));
        }
    }
    let mut ids = HashSet::new();
    if let Some(dup) = result.findings.iter().find(|f| !ids.insert(f.id.as_str())) {
        return malformed(format!("duplicate finding id '{}'", dup.id));
    }

    result.category = desc.category;
    if result.is_error() && result.failure.is_none() {
        let message = result
            .findings
            .first()
            .map(|f| f.message.clone())
            .unwrap_or_else(|| "validator reported an error without a cause".to_string());
        let fallback = ValidatorResult::error(
            &desc.id,
            desc.category,
            ValidatorFailure::new("unspecified", message),
        );
        result.failure = fallback.failure;
        if result.findings.is_empty() {
            result.findings = fallback.findings;
        }
    }
    result
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "validator panicked".to_string()
    }
}

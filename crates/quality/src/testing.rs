//! Scripted validators for tests.

use crate::validator::{Validator, ValidatorDescriptor};
use async_trait::async_trait;
use stagegate_core::{
    CancellationToken, Category, Finding, Severity, ValidatorFailure, ValidatorResult,
    ValidatorSettings, WorkItem,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) enum Behavior {
    /// Return the result as given
    Return(ValidatorResult),
    /// Panic inside `validate`
    Panic,
    /// Never finish unless cancelled
    Hang,
    /// Fail transiently `n` times, then return the result
    Transient(usize, ValidatorResult),
    /// Sleep while counted in `gauge`, then return the result
    Slow(Duration, Arc<Gauge>, ValidatorResult),
}

/// Tracks how many validators run at once.
#[derive(Default)]
pub(crate) struct Gauge {
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

pub(crate) struct FakeValidator {
    desc: ValidatorDescriptor,
    behavior: Behavior,
    pub calls: Arc<AtomicUsize>,
    pub initialized: Option<ValidatorSettings>,
}

impl FakeValidator {
    pub fn new(id: &str, category: Category, behavior: Behavior) -> Self {
        Self {
            desc: ValidatorDescriptor::new(id, id, "1.0.0", category).with_content_types(["markdown"]),
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
            initialized: None,
        }
    }

    /// Succeeds with `score` and the given findings.
    pub fn scored(id: &str, category: Category, score: f64, findings: Vec<Finding>) -> Self {
        let result = ValidatorResult::from_findings(id, category, findings).with_score(score);
        Self::new(id, category, Behavior::Return(result))
    }

    pub fn with_descriptor(mut self, f: impl FnOnce(ValidatorDescriptor) -> ValidatorDescriptor) -> Self {
        self.desc = f(self.desc);
        self
    }
}

#[async_trait]
impl Validator for FakeValidator {
    fn descriptor(&self) -> &ValidatorDescriptor {
        &self.desc
    }

    fn initialize(&mut self, settings: &ValidatorSettings) -> Result<(), String> {
        if settings.option_str("reject").is_some() {
            return Err("rejected by test".to_string());
        }
        self.initialized = Some(settings.clone());
        Ok(())
    }

    async fn validate(&self, _item: &WorkItem, _cancel: &CancellationToken) -> ValidatorResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Return(result) => result.clone(),
            Behavior::Panic => panic!("validator {} crashed", self.desc.id),
            Behavior::Hang => std::future::pending::<ValidatorResult>().await,
            Behavior::Transient(n, result) => {
                if call < *n {
                    ValidatorResult::error(
                        &self.desc.id,
                        self.desc.category,
                        ValidatorFailure::new("backend-busy", "try later").retryable(),
                    )
                } else {
                    result.clone()
                }
            }
            Behavior::Slow(delay, gauge, result) => {
                let now = gauge.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                gauge.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(*delay).await;
                gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
                result.clone()
            }
        }
    }
}

pub(crate) fn finding(id: &str, severity: Severity) -> Finding {
    Finding::new(id, Category::Quality, severity, format!("{} finding", severity))
}

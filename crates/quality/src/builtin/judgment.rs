//! Natural-language judgment through the inference collaborator.

use async_trait::async_trait;
use stagegate_ai::{InferenceBackend, JudgmentRequest};
use stagegate_core::{
    CancellationToken, Category, Finding, Severity, ValidatorFailure, ValidatorResult,
    ValidatorSettings, WorkItem,
};
use std::sync::Arc;

use super::pattern::NO_TEXT;
use crate::parser::parse_judgment;
use crate::validator::{Validator, ValidatorDescriptor};

/// Failure code for backend errors.
pub const INFERENCE: &str = "inference";

const DEFAULT_PROMPT: &str =
    "You are reviewing a document before publication. Judge it strictly on the given aspect.";

/// Asks the backend to judge the item's text on one aspect.
///
/// The answer is expected to be JSON (`score`, `confidence`, `findings`);
/// a plain-text answer counts as "no findings". Answers below
/// `minConfidence` add a medium finding so a human looks at them.
pub struct AiJudgmentValidator {
    desc: ValidatorDescriptor,
    backend: Arc<dyn InferenceBackend>,
    aspect: String,
    prompt: String,
    min_confidence: f64,
    max_chars: usize,
}

impl AiJudgmentValidator {
    /// Default identifier.
    pub const ID: &'static str = "ai-judgment";

    /// Validator registered as `ai-judgment` under `quality`.
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self::with_id(backend, Self::ID, Category::Quality)
    }

    /// Validator with its own id and category, one per aspect.
    pub fn with_id(
        backend: Arc<dyn InferenceBackend>,
        id: impl Into<String>,
        category: Category,
    ) -> Self {
        let id = id.into();
        let desc = ValidatorDescriptor::new(id.clone(), "AI judgment", env!("CARGO_PKG_VERSION"), category)
            .with_content_types(["*"])
            .with_schema(serde_json::json!({
                "type": "object",
                "properties": {
                    "aspect": { "type": "string" },
                    "prompt": { "type": "string" },
                    "minConfidence": { "type": "number", "minimum": 0, "maximum": 1 },
                    "maxChars": { "type": "integer" }
                }
            }))
            .retryable_code(INFERENCE);
        Self {
            desc,
            backend,
            aspect: "overall quality".to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            min_confidence: 0.5,
            max_chars: 20_000,
        }
    }

    fn error(&self, failure: ValidatorFailure) -> ValidatorResult {
        ValidatorResult::error(&self.desc.id, self.desc.category, failure)
    }
}

#[async_trait]
impl Validator for AiJudgmentValidator {
    fn descriptor(&self) -> &ValidatorDescriptor {
        &self.desc
    }

    fn initialize(&mut self, settings: &ValidatorSettings) -> Result<(), String> {
        if let Some(aspect) = settings.option_str("aspect") {
            self.aspect = aspect.to_string();
        }
        if let Some(prompt) = settings.option_str("prompt") {
            self.prompt = prompt.to_string();
        }
        if let Some(min) = settings.option_f64("minConfidence") {
            if !(0.0..=1.0).contains(&min) {
                return Err(format!("minConfidence must lie in [0,1] (got {})", min));
            }
            self.min_confidence = min;
        }
        if let Some(max) = settings.option_u64("maxChars") {
            self.max_chars = max as usize;
        }
        Ok(())
    }

    async fn validate(&self, item: &WorkItem, cancel: &CancellationToken) -> ValidatorResult {
        let docs = match item.read_text().await {
            Ok(docs) if !docs.is_empty() => docs,
            Ok(_) => {
                return self.error(ValidatorFailure::new(
                    NO_TEXT,
                    format!("{} holds no text to judge", item.root.display()),
                ))
            }
            Err(e) => {
                return self.error(ValidatorFailure::new(
                    "io",
                    format!("cannot read {}: {}", item.root.display(), e),
                ))
            }
        };

        let mut content: String = docs
            .iter()
            .map(|d| format!("## {}\n\n{}\n", d.path, d.text))
            .collect();
        if let Some((cut, _)) = content.char_indices().nth(self.max_chars) {
            content.truncate(cut);
        }

        let request = JudgmentRequest::new(&self.aspect, &self.prompt, content);
        tracing::debug!(
            validator = %self.desc.id,
            "Requesting '{}' judgment from {}",
            self.aspect,
            self.backend.name()
        );
        let judgment = tokio::select! {
            j = self.backend.judge(&request) => j,
            _ = cancel.cancelled() => {
                return self.error(ValidatorFailure::new(ValidatorFailure::CANCELLED, "run was cancelled"));
            }
        };
        let judgment = match judgment {
            Ok(j) => j,
            Err(e) => {
                let failure = ValidatorFailure::new(INFERENCE, e.to_string());
                return self.error(if e.is_transient() {
                    failure.retryable()
                } else {
                    failure
                });
            }
        };

        let parsed = match parse_judgment(&judgment.content, &self.desc.id, self.desc.category) {
            Ok(parsed) => parsed,
            Err(_) if !judgment.content.contains('{') => Default::default(),
            Err(e) => {
                return self.error(ValidatorFailure::new(ValidatorFailure::MALFORMED, e.to_string()))
            }
        };

        let confidence = judgment.confidence.or(parsed.confidence);
        let mut findings = parsed.findings;
        if let Some(c) = confidence.filter(|c| *c < self.min_confidence) {
            findings.push(Finding::new(
                format!("{}.low-confidence", self.desc.id),
                self.desc.category,
                Severity::Medium,
                format!(
                    "{} judged '{}' with confidence {:.2} (below {:.2}); verify by hand",
                    judgment.model, self.aspect, c, self.min_confidence
                ),
            ));
        }

        let mut result = ValidatorResult::from_findings(&self.desc.id, self.desc.category, findings)
            .with_metric("prompt_tokens", judgment.usage.prompt_tokens as f64)
            .with_metric("completion_tokens", judgment.usage.completion_tokens as f64)
            .with_metric("cost", judgment.usage.cost)
            .with_metric(format!("model.{}", judgment.model), 1.0);
        if let Some(c) = confidence {
            result = result.with_metric("confidence", c);
        }
        if let Some(score) = parsed.score {
            result = result.with_score(score);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagegate_ai::{InferenceError, Judgment, MockBackend, Usage};
    use stagegate_core::{ValidatorStatus, WorkItemId};
    use tempfile::TempDir;

    struct Failing;

    #[async_trait]
    impl InferenceBackend for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn judge(&self, _request: &JudgmentRequest) -> Result<Judgment, InferenceError> {
            Err(InferenceError::Status {
                status: 503,
                body: "overloaded".to_string(),
            })
        }
    }

    struct Fixed(Judgment);

    #[async_trait]
    impl InferenceBackend for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn judge(&self, _request: &JudgmentRequest) -> Result<Judgment, InferenceError> {
            Ok(self.0.clone())
        }
    }

    fn doc() -> (TempDir, WorkItem) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chapter.md");
        std::fs::write(&path, "It was a dark and stormy night.").unwrap();
        (dir, WorkItem::new(WorkItemId::new("book").unwrap(), path))
    }

    #[tokio::test]
    async fn test_json_judgment_with_score() {
        let (_dir, item) = doc();
        let backend = Fixed(Judgment {
            content: r#"{"score": 72, "findings": [{"severity": "medium", "message": "cliche opening"}]}"#
                .to_string(),
            model: "llama3.1".to_string(),
            usage: Usage {
                prompt_tokens: 120,
                completion_tokens: 30,
                cost: 0.002,
            },
            confidence: Some(0.9),
        });
        let v = AiJudgmentValidator::new(Arc::new(backend));
        let result = v.validate(&item, &CancellationToken::new()).await;

        assert_eq!(result.status, ValidatorStatus::Warning);
        assert_eq!(result.reported_score(), Some(72.0));
        assert_eq!(result.metrics.get("prompt_tokens"), Some(&120.0));
        assert_eq!(result.metrics.get("confidence"), Some(&0.9));
        assert_eq!(result.metrics.get("model.llama3.1"), Some(&1.0));
    }

    #[tokio::test]
    async fn test_low_confidence_adds_finding() {
        let (_dir, item) = doc();
        let mut v =
            AiJudgmentValidator::new(Arc::new(MockBackend::new("No issues found.", 0.3)));
        let settings: ValidatorSettings =
            serde_json::from_value(serde_json::json!({ "options": { "minConfidence": 0.6 } }))
                .unwrap();
        v.initialize(&settings).unwrap();

        let result = v.validate(&item, &CancellationToken::new()).await;
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].id, "ai-judgment.low-confidence");
        assert_eq!(result.findings[0].severity, Severity::Medium);
        assert_eq!(result.reported_score(), None);
    }

    #[tokio::test]
    async fn test_backend_error_is_transient() {
        let (_dir, item) = doc();
        let v = AiJudgmentValidator::new(Arc::new(Failing));
        let result = v.validate(&item, &CancellationToken::new()).await;
        assert!(result.is_retryable());
        assert_eq!(result.failure.unwrap().code, INFERENCE);
    }

    #[test]
    fn test_min_confidence_range() {
        let mut v = AiJudgmentValidator::new(Arc::new(MockBackend::new("ok", 1.0)));
        let settings: ValidatorSettings =
            serde_json::from_value(serde_json::json!({ "options": { "minConfidence": 1.5 } }))
                .unwrap();
        assert!(v.initialize(&settings).is_err());
    }
}

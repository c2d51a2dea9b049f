//! Built-in generic validators.
//!
//! These are adapters, not domain checks: regex rules, an external command
//! speaking a JSON report format, and an inference-backed judgment. Each
//! can be registered several times under different ids; `options.kind`
//! picks the adapter and `options.category` the weight bucket.

mod command;
mod judgment;
mod pattern;

pub use command::ExternalCommandValidator;
pub use judgment::AiJudgmentValidator;
pub use pattern::PatternRulesValidator;

use stagegate_ai::InferenceBackend;
use stagegate_core::{Category, ConfigError, ValidationConfig};
use stagegate_tools::CommandRunner;
use std::sync::Arc;

use crate::registry::ValidatorRegistry;

/// Build a registry holding one built-in validator per configured id.
///
/// The adapter is `options.kind` when given, else the id itself when it
/// names a built-in (`pattern-rules`, `external-command`, `ai-judgment`).
/// The registry is returned unconfigured; the engine configures it.
pub fn registry_from_config(
    config: &ValidationConfig,
    runner: Arc<dyn CommandRunner>,
    backend: Arc<dyn InferenceBackend>,
) -> Result<ValidatorRegistry, ConfigError> {
    let mut registry = ValidatorRegistry::new();
    for (id, settings) in &config.validators {
        let kind = settings.option_str("kind").unwrap_or(id.as_str());
        let category = match settings.option_str("category") {
            Some(c) => c.parse::<Category>().map_err(|reason| ConfigError::InvalidField {
                field: format!("validators.{}.options.category", id),
                reason,
            })?,
            None => Category::Quality,
        };

        let registered = match kind {
            PatternRulesValidator::ID => {
                registry.register(PatternRulesValidator::with_id(id.clone(), category))
            }
            ExternalCommandValidator::ID => registry.register(ExternalCommandValidator::with_id(
                runner.clone(),
                id.clone(),
                category,
            )),
            AiJudgmentValidator::ID => registry.register(AiJudgmentValidator::with_id(
                backend.clone(),
                id.clone(),
                category,
            )),
            _ => return Err(ConfigError::UnknownValidator(id.clone())),
        };
        registered.map_err(|e| ConfigError::InvalidField {
            field: format!("validators.{}", id),
            reason: e.to_string(),
        })?;
        tracing::debug!("Validator {} uses the {} adapter ({})", id, kind, category);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagegate_ai::MockBackend;
    use stagegate_tools::ProcessRunner;

    fn build(yaml: &str) -> Result<ValidatorRegistry, ConfigError> {
        let config = ValidationConfig::from_yaml_str(yaml).unwrap();
        registry_from_config(
            &config,
            Arc::new(ProcessRunner::new()),
            Arc::new(MockBackend::new("ok", 1.0)),
        )
    }

    #[test]
    fn test_kinds_and_categories() {
        let registry = build(
            r#"
validators:
  secrets:
    options: { kind: pattern-rules, category: security }
    rules:
      - { id: key, pattern: "api_key", severity: critical, message: "key" }
  ai-judgment: {}
aggregation:
  weights: { security: 0.5, quality: 0.5 }
"#,
        )
        .unwrap();
        assert_eq!(
            registry.ids_and_categories(),
            vec![("ai-judgment", Category::Quality), ("secrets", Category::Security)]
        );
    }

    #[test]
    fn test_unknown_kind() {
        let err = build(
            "validators:\n  mystery: {}\naggregation:\n  weights: { quality: 1.0 }\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownValidator(id) if id == "mystery"));
    }

    #[test]
    fn test_bad_category() {
        let err = build(
            "validators:\n  lint:\n    options: { kind: external-command, category: vibes, command: x }\naggregation:\n  weights: { quality: 1.0 }\n",
        )
        .unwrap_err();
        assert_eq!(err.field().as_deref(), Some("validators.lint.options.category"));
    }
}

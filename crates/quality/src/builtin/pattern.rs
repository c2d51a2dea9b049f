//! Regex rules applied line by line to the text content.

use async_trait::async_trait;
use regex::Regex;
use stagegate_core::{
    CancellationToken, Category, Finding, Location, RuleSpec, ValidatorFailure, ValidatorResult,
    ValidatorSettings, WorkItem,
};

use crate::validator::{Validator, ValidatorDescriptor};

/// Failure code when the item holds no readable text (binary artifacts).
pub const NO_TEXT: &str = "no-text";

struct CompiledRule {
    spec: RuleSpec,
    regex: Regex,
}

/// Validator driven by `rules[]` from its configuration.
pub struct PatternRulesValidator {
    desc: ValidatorDescriptor,
    rules: Vec<CompiledRule>,
}

impl PatternRulesValidator {
    /// Default identifier.
    pub const ID: &'static str = "pattern-rules";

    /// Validator registered as `pattern-rules` under `quality`.
    pub fn new() -> Self {
        Self::with_id(Self::ID, Category::Quality)
    }

    /// Validator with its own id and category, for several rule sets.
    pub fn with_id(id: impl Into<String>, category: Category) -> Self {
        let id = id.into();
        let desc = ValidatorDescriptor::new(id.clone(), "Pattern rules", env!("CARGO_PKG_VERSION"), category)
            .with_content_types(["*"])
            .with_schema(serde_json::json!({
                "type": "object",
                "properties": {
                    "rules": {
                        "type": "array",
                        "items": { "required": ["id", "pattern", "severity", "message"] }
                    }
                }
            }));
        Self {
            desc,
            rules: Vec::new(),
        }
    }
}

impl Default for PatternRulesValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Validator for PatternRulesValidator {
    fn descriptor(&self) -> &ValidatorDescriptor {
        &self.desc
    }

    fn initialize(&mut self, settings: &ValidatorSettings) -> Result<(), String> {
        self.rules = settings
            .rules
            .iter()
            .map(|spec| {
                spec.compile()
                    .map(|regex| CompiledRule {
                        spec: spec.clone(),
                        regex,
                    })
                    .map_err(|e| format!("rule '{}': {}", spec.id, e))
            })
            .collect::<Result<_, _>>()?;
        if self.rules.is_empty() {
            return Err("no rules configured".to_string());
        }
        Ok(())
    }

    async fn validate(&self, item: &WorkItem, cancel: &CancellationToken) -> ValidatorResult {
        let docs = match item.read_text().await {
            Ok(docs) if !docs.is_empty() => docs,
            Ok(_) => {
                return ValidatorResult::error(
                    &self.desc.id,
                    self.desc.category,
                    ValidatorFailure::new(
                        NO_TEXT,
                        format!("{} holds no readable text", item.root.display()),
                    ),
                )
            }
            Err(e) => {
                return ValidatorResult::error(
                    &self.desc.id,
                    self.desc.category,
                    ValidatorFailure::new("io", format!("cannot read {}: {}", item.root.display(), e)),
                )
            }
        };

        let mut findings = Vec::new();
        for doc in &docs {
            if cancel.is_cancelled() {
                return ValidatorResult::error(
                    &self.desc.id,
                    self.desc.category,
                    ValidatorFailure::new(ValidatorFailure::CANCELLED, "run was cancelled"),
                );
            }
            for (line_no, line) in doc.text.lines().enumerate() {
                for rule in &self.rules {
                    for m in rule.regex.find_iter(line) {
                        let column = line[..m.start()].chars().count() + 1;
                        let mut finding = Finding::new(
                            format!("{}@{}:{}:{}", rule.spec.id, doc.path, line_no + 1, column),
                            rule.spec.category.unwrap_or(self.desc.category),
                            rule.spec.severity,
                            rule.spec.message.clone(),
                        )
                        .with_rule(rule.spec.id.clone())
                        .with_location(Location::at(doc.path.clone(), line_no + 1, column));
                        if let Some(fix) = &rule.spec.remediation {
                            finding = finding.with_remediation(fix.clone());
                        }
                        findings.push(finding);
                    }
                }
            }
        }

        tracing::debug!(
            validator = %self.desc.id,
            "{} rule(s) over {} document(s): {} match(es)",
            self.rules.len(),
            docs.len(),
            findings.len()
        );
        ValidatorResult::from_findings(&self.desc.id, self.desc.category, findings)
            .with_metric("documents", docs.len() as f64)
    }
}

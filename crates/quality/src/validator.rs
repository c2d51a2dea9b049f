//! Validator plugin contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagegate_core::{
    CancellationToken, Category, ContentType, Severity, ValidatorResult, ValidatorSettings,
    WorkItem,
};
use std::collections::{BTreeMap, BTreeSet};

/// Static description of a validator. Registered once, never mutated during
/// a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorDescriptor {
    /// Unique identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Semantic version
    pub version: String,

    /// Category the validator's sub-score is weighted under
    pub category: Category,

    /// Content types the validator can check (`*` for any)
    pub content_types: BTreeSet<ContentType>,

    /// JSON-schema-like description of accepted settings
    pub config_schema: serde_json::Value,

    /// Mapping from the validator's own severity labels to the common scale
    pub severity_map: BTreeMap<String, Severity>,

    /// Failure codes the validator considers transient
    pub retryable_codes: BTreeSet<String>,
}

impl ValidatorDescriptor {
    /// Create a descriptor.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        category: Category,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            category,
            content_types: BTreeSet::new(),
            config_schema: serde_json::json!({ "type": "object" }),
            severity_map: BTreeMap::new(),
            retryable_codes: BTreeSet::new(),
        }
    }

    /// Declare supported content types.
    pub fn with_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.content_types
            .extend(types.into_iter().map(ContentType::new));
        self
    }

    /// Set the config schema.
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.config_schema = schema;
        self
    }

    /// Map a native severity label.
    pub fn map_severity(mut self, label: impl AsRef<str>, severity: Severity) -> Self {
        self.severity_map
            .insert(label.as_ref().to_lowercase(), severity);
        self
    }

    /// Declare a transient failure code.
    pub fn retryable_code(mut self, code: impl Into<String>) -> Self {
        self.retryable_codes.insert(code.into());
        self
    }

    /// Normalized severity for a native label, if mapped.
    pub fn normalize(&self, label: &str) -> Option<Severity> {
        self.severity_map.get(&label.to_lowercase()).copied()
    }
}

/// One independently pluggable check.
///
/// `validate` must not modify the work item and must never signal failure
/// by returning an empty result: internal problems are reported as a
/// result with status `error` (see [`ValidatorResult::error`]). The engine
/// enforces the deadline and isolates panics.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Static description.
    fn descriptor(&self) -> &ValidatorDescriptor;

    /// Apply settings before the first run. Returns the reason when the
    /// settings are unusable.
    fn initialize(&mut self, _settings: &ValidatorSettings) -> Result<(), String> {
        Ok(())
    }

    /// Check `item`. Long-running validators should watch `cancel`.
    async fn validate(&self, item: &WorkItem, cancel: &CancellationToken) -> ValidatorResult;

    /// Identifier.
    fn id(&self) -> &str {
        &self.descriptor().id
    }

    /// Supported content types.
    fn supported_content_types(&self) -> &BTreeSet<ContentType> {
        &self.descriptor().content_types
    }

    /// Settings schema.
    fn config_schema(&self) -> &serde_json::Value {
        &self.descriptor().config_schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_map_is_case_insensitive() {
        let desc = ValidatorDescriptor::new("lint", "Lint", "1.0.0", Category::Style)
            .map_severity("ERROR", Severity::High)
            .map_severity("warn", Severity::Low);
        assert_eq!(desc.normalize("error"), Some(Severity::High));
        assert_eq!(desc.normalize("Warn"), Some(Severity::Low));
        assert_eq!(desc.normalize("note"), None);
    }

    #[test]
    fn test_content_types_are_normalized() {
        let desc = ValidatorDescriptor::new("lint", "Lint", "1.0.0", Category::Style)
            .with_content_types(["Markdown", "latex"]);
        assert!(desc.content_types.contains(&ContentType::new("markdown")));
        assert_eq!(desc.content_types.len(), 2);
    }
}

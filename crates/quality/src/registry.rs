//! Validator registry.

use crate::validator::{Validator, ValidatorDescriptor};
use stagegate_core::{Category, ConfigError, ContentType, ValidationConfig, WorkItem};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Registration errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Identifier already registered
    #[error("validator '{0}' is already registered")]
    Duplicate(String),

    /// Descriptor is unusable
    #[error("validator '{id}' has an invalid descriptor: {reason}")]
    InvalidDescriptor {
        /// Validator id
        id: String,
        /// What is wrong
        reason: String,
    },

    /// Validator supports none of the content types in scope
    #[error("validator '{id}' supports none of the content types [{types}]")]
    Unsupported {
        /// Validator id
        id: String,
        /// Content types in scope
        types: String,
    },
}

/// Holds validators in registration order.
///
/// A registry created with [`ValidatorRegistry::for_work_item`] is scoped to
/// that item's content types and rejects validators that support none of
/// them.
pub struct ValidatorRegistry {
    validators: Vec<Arc<dyn Validator>>,
    index: HashMap<String, usize>,
    scope: Option<BTreeSet<ContentType>>,
}

impl ValidatorRegistry {
    /// Create an unscoped registry.
    pub fn new() -> Self {
        Self {
            validators: Vec::new(),
            index: HashMap::new(),
            scope: None,
        }
    }

    /// Create a registry scoped to `item`'s content types.
    pub fn for_work_item(item: &WorkItem) -> Self {
        Self {
            scope: Some(item.content_types.clone()),
            ..Self::new()
        }
    }

    /// Register a validator.
    pub fn register(&mut self, validator: impl Validator + 'static) -> Result<(), RegistryError> {
        self.register_boxed(Box::new(validator))
    }

    /// Register a boxed validator.
    pub fn register_boxed(&mut self, validator: Box<dyn Validator>) -> Result<(), RegistryError> {
        let desc = validator.descriptor();
        let id = desc.id.clone();

        if id.trim().is_empty() {
            return Err(RegistryError::InvalidDescriptor {
                id,
                reason: "identifier is empty".to_string(),
            });
        }
        if self.index.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        if desc.content_types.is_empty() {
            return Err(RegistryError::InvalidDescriptor {
                id,
                reason: "declares no supported content types".to_string(),
            });
        }
        if let Some(scope) = &self.scope {
            let supported = desc.content_types.iter().any(ContentType::is_any)
                || desc.content_types.iter().any(|t| scope.contains(t));
            if !supported {
                return Err(RegistryError::Unsupported {
                    id,
                    types: scope
                        .iter()
                        .map(ContentType::as_str)
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }

        tracing::debug!("Registered validator: {} v{}", id, desc.version);
        self.index.insert(id, self.validators.len());
        self.validators.push(Arc::from(validator));
        Ok(())
    }

    /// Check `config` against the registered validators, then initialize
    /// every enabled validator with its settings.
    ///
    /// Must be called before validators are shared with a running engine.
    pub fn configure(&mut self, config: &ValidationConfig) -> Result<(), ConfigError> {
        config.check_registry(self.ids_and_categories())?;

        for validator in &mut self.validators {
            let id = validator.id().to_string();
            if !config.is_enabled(&id) {
                continue;
            }
            let settings = config.settings_for(&id);
            let v = Arc::get_mut(validator).ok_or_else(|| ConfigError::ValidatorInit {
                validator: id.clone(),
                reason: "validator is in use and cannot be reconfigured".to_string(),
            })?;
            v.initialize(&settings)
                .map_err(|reason| ConfigError::ValidatorInit {
                    validator: id.clone(),
                    reason,
                })?;
            tracing::debug!("Initialized validator: {}", id);
        }
        Ok(())
    }

    /// Enabled validators supporting `item`, in registration order.
    pub fn resolve_for(&self, item: &WorkItem, config: &ValidationConfig) -> Vec<Arc<dyn Validator>> {
        self.validators
            .iter()
            .filter(|v| config.is_enabled(v.id()))
            .filter(|v| item.has_any_type(v.supported_content_types()))
            .cloned()
            .collect()
    }

    /// Get a validator by id.
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Validator>> {
        self.index.get(id).map(|&i| &self.validators[i])
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> Vec<&ValidatorDescriptor> {
        self.validators.iter().map(|v| v.descriptor()).collect()
    }

    /// `(id, category)` pairs, as needed by [`ValidationConfig::check_registry`].
    pub fn ids_and_categories(&self) -> Vec<(&str, Category)> {
        self.validators
            .iter()
            .map(|v| (v.id(), v.descriptor().category))
            .collect()
    }

    /// Number of registered validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field(
                "validators",
                &self.validators.iter().map(|v| v.descriptor().id.as_str()).collect::<Vec<_>>(),
            )
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behavior, FakeValidator};
    use stagegate_core::{ValidatorResult, WorkItemId};

    fn ok(id: &str) -> FakeValidator {
        FakeValidator::new(
            id,
            Category::Quality,
            Behavior::Return(ValidatorResult::from_findings(id, Category::Quality, vec![])),
        )
    }

    fn config(yaml_validators: &str) -> ValidationConfig {
        ValidationConfig::from_yaml_str(&format!(
            "validators:\n{}aggregation:\n  weights:\n    quality: 1.0\n",
            yaml_validators
        ))
        .unwrap()
    }

    fn item() -> WorkItem {
        WorkItem::new(WorkItemId::new("doc").unwrap(), "doc.md")
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ValidatorRegistry::new();
        registry.register(ok("a")).unwrap();
        assert!(matches!(
            registry.register(ok("a")),
            Err(RegistryError::Duplicate(id)) if id == "a"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_debug_lists_ids() {
        let mut registry = ValidatorRegistry::new();
        registry.register(ok("grammar")).unwrap();
        registry.register(ok("links")).unwrap();
        let shown = format!("{:?}", registry);
        assert!(shown.contains("[\"grammar\", \"links\"]"), "{}", shown);
    }

    #[test]
    fn test_scoped_registry_rejects_unsupported() {
        let pdf_item = WorkItem::new(WorkItemId::new("doc").unwrap(), "doc.pdf");
        let mut registry = ValidatorRegistry::for_work_item(&pdf_item);
        assert!(matches!(
            registry.register(ok("md-only")),
            Err(RegistryError::Unsupported { .. })
        ));

        let any = ok("any").with_descriptor(|d| d.with_content_types(["*"]));
        registry.register(any).unwrap();
    }

    #[test]
    fn test_no_content_types_rejected() {
        let mut registry = ValidatorRegistry::new();
        let none = ok("none").with_descriptor(|mut d| {
            d.content_types.clear();
            d
        });
        assert!(matches!(
            registry.register(none),
            Err(RegistryError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn test_resolve_keeps_registration_order_and_filters() {
        let mut registry = ValidatorRegistry::new();
        for id in ["c", "a", "b", "off"] {
            registry.register(ok(id)).unwrap();
        }
        let tex = ok("tex").with_descriptor(|mut d| {
            d.content_types = [ContentType::new("latex")].into_iter().collect();
            d
        });
        registry.register(tex).unwrap();

        let config = config(
            "  c: {}\n  a: {}\n  b: {}\n  tex: {}\n  off:\n    enabled: false\n",
        );
        registry.configure(&config).unwrap();

        let ids: Vec<_> = registry
            .resolve_for(&item(), &config)
            .iter()
            .map(|v| v.id().to_string())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_configure_rejects_unknown_id() {
        let mut registry = ValidatorRegistry::new();
        registry.register(ok("a")).unwrap();
        let err = registry.configure(&config("  ghost: {}\n")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownValidator(id) if id == "ghost"));
    }

    #[test]
    fn test_configure_reports_init_failure() {
        let mut registry = ValidatorRegistry::new();
        registry.register(ok("a")).unwrap();
        let err = registry
            .configure(&config("  a:\n    options:\n      reject: yes\n"))
            .unwrap_err();
        assert_eq!(err.field().as_deref(), Some("validators.a"));
    }
}

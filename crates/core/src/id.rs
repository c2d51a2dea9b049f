//! Identifiers for stagegate entities.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Error returned when a work item identifier is not usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid work item id '{0}': use 1-128 characters from [A-Za-z0-9._-], not starting with '.'")]
pub struct InvalidIdError(pub String);

/// Identifier of a work item.
///
/// Supplied by the caller (a manuscript slug, a change-set id, ...). It keys
/// the persisted stage records and names the item's directory in the store,
/// so it is restricted to path-safe characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    /// Create a validated identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidIdError> {
        let id = id.into();
        if Self::is_valid(&id) {
            Ok(Self(id))
        } else {
            Err(InvalidIdError(id))
        }
    }

    /// Whether `id` is an acceptable identifier.
    pub fn is_valid(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= 128
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for WorkItemId {
    type Err = InvalidIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Unique identifier for one validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(Ulid);

impl RunId {
    /// Generate a new RunId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RunId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_id_accepts_slugs() {
        assert!(WorkItemId::new("manuscript-42").is_ok());
        assert!(WorkItemId::new("chapter_3.v2").is_ok());
    }

    #[test]
    fn test_work_item_id_rejects_paths() {
        assert!(WorkItemId::new("").is_err());
        assert!(WorkItemId::new("../etc").is_err());
        assert!(WorkItemId::new("a/b").is_err());
        assert!(WorkItemId::new(".hidden").is_err());
        assert!(WorkItemId::new("x".repeat(129)).is_err());
    }

    #[test]
    fn test_run_id_parses_back() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}

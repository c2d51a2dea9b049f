//! Stage state store trait.

use async_trait::async_trait;
use stagegate_core::{RunId, Stage, StageRecord, ValidationResult, WorkItem, WorkItemId};
use std::path::PathBuf;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored document exists but cannot be used
    #[error("corrupt record {path}: {reason}")]
    Corrupt {
        /// Offending file or key
        path: String,
        /// What is wrong
        reason: String,
    },

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Per-work-item artifact areas kept next to the stage records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactArea {
    /// Copied stage outputs
    Outputs,
    /// Rendered validation reports
    Reports,
    /// Human review packets
    Review,
}

impl ArtifactArea {
    /// Directory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactArea::Outputs => "outputs",
            ArtifactArea::Reports => "reports",
            ArtifactArea::Review => "review",
        }
    }
}

/// Durable per-work-item stage state.
///
/// Records survive process restarts so a pipeline can be resumed. All
/// methods take `&self`; implementations synchronise internally so one
/// store can be shared across concurrent pipeline runs.
#[async_trait]
pub trait StageStateStore: Send + Sync {
    // === Work items ===

    /// Save the work item as first submitted.
    async fn save_work_item(&self, item: &WorkItem) -> Result<()>;

    /// Load a work item.
    async fn load_work_item(&self, id: &WorkItemId) -> Result<Option<WorkItem>>;

    /// List all known work items.
    async fn list_work_items(&self) -> Result<Vec<WorkItemId>>;

    // === Stage records ===

    /// Save (create or replace) one stage record.
    async fn save_record(&self, record: &StageRecord) -> Result<()>;

    /// Load one stage record.
    async fn load_record(&self, id: &WorkItemId, stage: Stage) -> Result<Option<StageRecord>>;

    /// Load every stored record of a work item, in pipeline order.
    async fn load_records(&self, id: &WorkItemId) -> Result<Vec<StageRecord>>;

    // === Validation results ===

    /// Save a validation result.
    async fn save_validation(&self, result: &ValidationResult) -> Result<()>;

    /// Load a validation result.
    async fn load_validation(
        &self,
        id: &WorkItemId,
        run_id: &RunId,
    ) -> Result<Option<ValidationResult>>;

    // === Artifacts ===

    /// Directory for durable artifacts of `id`, created if missing.
    async fn artifact_dir(&self, id: &WorkItemId, area: ArtifactArea) -> Result<PathBuf>;
}

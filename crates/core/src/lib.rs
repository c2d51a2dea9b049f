//! stagegate core data models.
//!
//! This crate defines the data structures shared by the validation engine,
//! the stage state store and the multi-stage pipeline.

#![warn(missing_docs)]

// Identities
mod id;

// Units of work and what validators report about them
mod work_item;
mod finding;
mod result;

// Pipeline state
mod stage;

// Configuration and run control
pub mod config;
mod cancel;

// Re-exports
pub use id::{InvalidIdError, RunId, WorkItemId};

pub use work_item::{ComparisonArtifact, ContentType, TextDocument, WorkItem, WorkItemError};
pub use finding::{Category, Finding, Location, Severity};
pub use result::{
    CategoryScore, OverallStatus, ReviewContext, ReviewFinding, Summary, ValidationResult,
    ValidatorFailure, ValidatorResult, ValidatorStatus, SCORE_METRIC,
};

pub use stage::{
    PipelineState, ReviewDecision, Stage, StageRecord, StageStatus, TransitionError,
    ValidationRef,
};

pub use config::{
    AggregationConfig, CollaboratorSpec, ConfigError, EngineSettings, ErrorPolicy,
    InferenceBackendKind, InferenceSettings, OutputTarget, PipelineSettings, ReportFormat,
    ReportingConfig, RuleSpec, SeverityWeights, ValidationConfig, ValidatorSettings,
};
pub use cancel::CancellationToken;

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;

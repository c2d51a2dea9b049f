//! Multi-stage pipeline
//!
//! Stage collaborators, per-run workspaces and the process manager that
//! sequences, gates and resumes work items.

#![warn(missing_docs)]

pub mod collaborator;
pub mod workspace;
pub mod manager;

pub use collaborator::{
    CollaboratorError, CommandCollaborator, PassThrough, StageCollaborator, StageInput,
    StageOutput,
};
pub use workspace::{copy_output, RunWorkspace};
pub use manager::{
    MultiStageProcessManager, PipelineError, PipelineOutcome, PipelineStatus, StageError,
    StageFailure,
};

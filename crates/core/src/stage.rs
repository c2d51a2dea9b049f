//! Pipeline stages and their persisted records.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::id::{RunId, WorkItemId};
use crate::result::OverallStatus;
use crate::work_item::WorkItem;
use crate::Time;

/// The four ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    MetadataGeneration,
    ContentFinalization,
    IntermediateConversion,
    ArtifactGeneration,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [
        Stage::MetadataGeneration,
        Stage::ContentFinalization,
        Stage::IntermediateConversion,
        Stage::ArtifactGeneration,
    ];

    /// Position in the pipeline (0-based).
    pub fn index(&self) -> usize {
        match self {
            Stage::MetadataGeneration => 0,
            Stage::ContentFinalization => 1,
            Stage::IntermediateConversion => 2,
            Stage::ArtifactGeneration => 3,
        }
    }

    /// The stage after this one.
    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    /// The stage before this one.
    pub fn previous(&self) -> Option<Stage> {
        self.index().checked_sub(1).map(|i| Stage::ALL[i])
    }

    /// Kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::MetadataGeneration => "metadata-generation",
            Stage::ContentFinalization => "content-finalization",
            Stage::IntermediateConversion => "intermediate-conversion",
            Stage::ArtifactGeneration => "artifact-generation",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .find(|stage| stage.as_str() == s.trim())
            .copied()
            .ok_or_else(|| {
                format!(
                    "unknown stage '{}' (expected one of: {})",
                    s,
                    Stage::ALL.map(|st| st.as_str()).join(", ")
                )
            })
    }
}

/// Status of one stage for one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    AwaitingReview,
}

impl StageStatus {
    /// Whether this status blocks forward progress until someone acts.
    pub fn is_blocking(&self) -> bool {
        matches!(self, StageStatus::Failed | StageStatus::AwaitingReview)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, AwaitingReview)
                | (AwaitingReview, Completed)
                | (AwaitingReview, Failed)
                | (Failed, Pending)
                // interrupted run found on resume
                | (Running, Pending)
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::AwaitingReview => "awaiting-review",
        })
    }
}

/// Illegal stage status transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stage {stage} of '{work_item}' cannot move from {from} to {to}")]
pub struct TransitionError {
    /// Work item
    pub work_item: WorkItemId,
    /// Stage
    pub stage: Stage,
    /// Current status
    pub from: StageStatus,
    /// Requested status
    pub to: StageStatus,
}

/// Pointer to the validation run that gated a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRef {
    /// Run identifier; the full result is stored under this id
    pub run_id: RunId,

    /// Weighted quality score
    pub quality_score: f64,

    /// Overall status
    pub overall_status: OverallStatus,

    /// Whether review was requested
    pub human_review: bool,
}

/// A reviewer's decision on a stage awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    /// Who decided
    pub reviewer: String,

    /// Approved (continue) or rejected (fail the stage)
    pub approved: bool,

    /// Reviewer comments
    #[serde(default)]
    pub comments: String,

    /// When
    pub decided_at: Time,
}

impl ReviewDecision {
    /// An approval.
    pub fn approve(reviewer: impl Into<String>, comments: impl Into<String>) -> Self {
        Self {
            reviewer: reviewer.into(),
            approved: true,
            comments: comments.into(),
            decided_at: chrono::Utc::now(),
        }
    }

    /// A rejection.
    pub fn reject(reviewer: impl Into<String>, comments: impl Into<String>) -> Self {
        Self {
            approved: false,
            ..Self::approve(reviewer, comments)
        }
    }
}

/// Persisted status and outputs for one (work item, stage) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Work item
    pub work_item: WorkItemId,

    /// Stage
    pub stage: Stage,

    /// Current status
    pub status: StageStatus,

    /// Revision produced by this stage (its durable output)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<WorkItem>,

    /// Validation run that gated this stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRef>,

    /// Review packet written for a reviewer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_packet: Option<PathBuf>,

    /// Reviewer decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewDecision>,

    /// Last error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Collaborator attempts in the last execution
    #[serde(default)]
    pub attempts: u32,

    /// Times this stage has been started
    #[serde(default)]
    pub executions: u32,

    /// Creation timestamp
    pub created_at: Time,

    /// Last start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Time>,

    /// Last finish (completed, failed or paused for review)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Time>,

    /// Last update timestamp
    pub updated_at: Time,
}

impl StageRecord {
    /// A fresh `pending` record.
    pub fn pending(work_item: WorkItemId, stage: Stage) -> Self {
        let now = chrono::Utc::now();
        Self {
            work_item,
            stage,
            status: StageStatus::Pending,
            output: None,
            validation: None,
            review_packet: None,
            review: None,
            error: None,
            attempts: 0,
            executions: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Move to `to`, stamping timestamps. Illegal transitions are rejected
    /// and leave the record untouched.
    pub fn transition(&mut self, to: StageStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                work_item: self.work_item.clone(),
                stage: self.stage,
                from: self.status,
                to,
            });
        }

        let now = chrono::Utc::now();
        match to {
            StageStatus::Running => {
                self.started_at = Some(now);
                self.finished_at = None;
                self.executions += 1;
                self.error = None;
            }
            StageStatus::Completed | StageStatus::Failed | StageStatus::AwaitingReview => {
                self.finished_at = Some(now);
            }
            StageStatus::Pending => {
                self.output = None;
                self.validation = None;
                self.review_packet = None;
                self.review = None;
            }
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

/// Where a work item stands in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No stage has started
    NotStarted,
    /// `next` is the first stage not yet completed, and it is runnable
    InProgress {
        /// First non-completed stage
        next: Stage,
    },
    /// A stage is failed or awaiting review
    Blocked {
        /// Blocking stage
        stage: Stage,
        /// Its status
        status: StageStatus,
    },
    /// `artifact-generation` completed
    Done,
}

impl PipelineState {
    /// Derive the state from a work item's records (any order, missing
    /// stages count as pending).
    pub fn from_records(records: &[StageRecord]) -> Self {
        let status_of = |stage: Stage| {
            records
                .iter()
                .find(|r| r.stage == stage)
                .map(|r| r.status)
                .unwrap_or(StageStatus::Pending)
        };

        if let Some(stage) = Stage::ALL.into_iter().find(|s| status_of(*s).is_blocking()) {
            return PipelineState::Blocked {
                stage,
                status: status_of(stage),
            };
        }

        match Stage::ALL
            .into_iter()
            .find(|s| status_of(*s) != StageStatus::Completed)
        {
            None => PipelineState::Done,
            Some(Stage::MetadataGeneration)
                if status_of(Stage::MetadataGeneration) == StageStatus::Pending =>
            {
                PipelineState::NotStarted
            }
            Some(next) => PipelineState::InProgress { next },
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::NotStarted => write!(f, "not started"),
            PipelineState::InProgress { next } => write!(f, "in progress (next: {})", next),
            PipelineState::Blocked { stage, status } => {
                write!(f, "blocked at {} ({})", stage, status)
            }
            PipelineState::Done => write!(f, "done"),
        }
    }
}

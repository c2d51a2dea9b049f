//! Multi-stage process manager.
//!
//! Drives a work item through `metadata-generation -> content-finalization
//! -> intermediate-conversion -> artifact-generation`. Before each stage the
//! manager consults the store; after each stage the output is copied into
//! the store, validated, and gated. Every transition is persisted before
//! the next step so a crashed or paused run can be resumed by a later
//! process at exactly the first stage that is not completed.

use stagegate_core::{
    CancellationToken, OverallStatus, PipelineSettings, PipelineState, ReportFormat,
    ReviewDecision, Stage, StageRecord, StageStatus, TransitionError, ValidationRef,
    ValidationResult, WorkItem, WorkItemError, WorkItemId,
};
use stagegate_quality::{EngineError, GateDecision, ReportGenerator, ReviewPacket, ValidationEngine};
use stagegate_storage::{ArtifactArea, StageStateStore, StorageError};
use stagegate_tools::RetryPolicy;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::collaborator::{
    CollaboratorError, PassThrough, StageCollaborator, StageInput, StageOutput,
};
use crate::workspace::{copy_output, RunWorkspace};

/// Why a stage failed.
#[derive(Debug, thiserror::Error)]
pub enum StageFailure {
    /// The collaborator failed, after retries when transient
    #[error("{source} (after {attempts} attempt(s))")]
    Collaborator {
        /// Attempts made
        attempts: u32,
        /// Last error
        #[source]
        source: CollaboratorError,
    },

    /// The produced output is missing, empty or unreadable
    #[error("stage output is unusable: {0}")]
    Output(String),

    /// Validation could not run at all
    #[error("validation could not run: {0}")]
    Engine(#[from] EngineError),

    /// Validation ran and failed the stage
    #[error("validation failed (score {score:.1}, status {status})")]
    Validation {
        /// Weighted score
        score: f64,
        /// Overall status
        status: OverallStatus,
    },
}

/// A stage failed; the work item is blocked there until restarted.
#[derive(Debug, thiserror::Error)]
#[error(
    "work item '{work_item}' is blocked at stage {stage}: {cause}\n  to retry: stagegate restart {work_item} --stage {stage} && stagegate resume {work_item} --from-stage {stage}"
)]
pub struct StageError {
    /// Work item
    pub work_item: WorkItemId,
    /// Failed stage
    pub stage: Stage,
    /// Cause
    #[source]
    pub cause: StageFailure,
}

/// Pipeline operation errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Persisted state could not be read or written
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The submitted work item is unusable
    #[error(transparent)]
    InvalidWorkItem(#[from] WorkItemError),

    /// A stage failed and was recorded `failed`
    #[error(transparent)]
    Stage(#[from] StageError),

    /// A record cannot move to the requested status
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Nothing is stored for this id
    #[error("unknown work item '{0}'")]
    UnknownWorkItem(WorkItemId),

    /// `run` was called for an item that already has progress
    #[error("work item '{work_item}' is already {state}; use resume")]
    AlreadyStarted {
        /// Work item
        work_item: WorkItemId,
        /// Current state
        state: PipelineState,
    },

    /// Resuming anywhere but the first non-completed stage
    #[error("cannot resume '{work_item}' at {requested}: {reason}")]
    NotResumable {
        /// Work item
        work_item: WorkItemId,
        /// Requested stage
        requested: Stage,
        /// Why
        reason: String,
    },

    /// A stage waits for a reviewer
    #[error("stage {stage} of '{work_item}' is awaiting review; record a decision with: stagegate review {work_item} --stage {stage} --approve|--reject --reviewer <name>")]
    AwaitingReview {
        /// Work item
        work_item: WorkItemId,
        /// Stage
        stage: Stage,
    },

    /// The run was cancelled; the interrupted stage is back to `pending`
    #[error("run of '{work_item}' was cancelled during {stage}")]
    Cancelled {
        /// Work item
        work_item: WorkItemId,
        /// Interrupted stage
        stage: Stage,
    },

    /// Workspace or artifact I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of driving the pipeline until it finished or had to stop.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Work item
    pub work_item: WorkItemId,
    /// State after the run
    pub state: PipelineState,
    /// Stages executed by this call
    pub executed: Vec<Stage>,
    /// Validation of the last executed stage
    pub last_validation: Option<ValidationRef>,
    /// Review packet, when the run paused for review
    pub review_packet: Option<PathBuf>,
    /// Reports written by this call
    pub reports: Vec<PathBuf>,
}

/// Per-stage records and overall state of one work item.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    /// Work item
    pub work_item: WorkItemId,
    /// One record per stage, in pipeline order (missing stages as pending)
    pub records: Vec<StageRecord>,
    /// Overall state
    pub state: PipelineState,
}

enum StageEnd {
    Completed(WorkItem),
    Paused(PathBuf),
}

/// Sequences the stages of each work item.
pub struct MultiStageProcessManager {
    store: Arc<dyn StageStateStore>,
    engine: Arc<ValidationEngine>,
    collaborators: BTreeMap<Stage, Arc<dyn StageCollaborator>>,
    reports: ReportGenerator,
    report_formats: Vec<ReportFormat>,
    workspace_root: Option<PathBuf>,
    retry: RetryPolicy,
}

impl MultiStageProcessManager {
    /// Create a manager. Stages without a collaborator pass their input on.
    pub fn new(
        store: Arc<dyn StageStateStore>,
        engine: Arc<ValidationEngine>,
        settings: &PipelineSettings,
    ) -> Self {
        let backoff = Duration::from_millis(settings.integration_backoff_ms);
        Self {
            store,
            engine,
            collaborators: BTreeMap::new(),
            reports: ReportGenerator::new(),
            report_formats: vec![ReportFormat::Json, ReportFormat::Markdown],
            workspace_root: settings.workspace_root.clone(),
            retry: RetryPolicy::new(settings.integration_retries, backoff, backoff * 16),
        }
    }

    /// Use `collaborator` for `stage`.
    pub fn with_collaborator(mut self, stage: Stage, collaborator: Arc<dyn StageCollaborator>) -> Self {
        self.collaborators.insert(stage, collaborator);
        self
    }

    /// Formats written for every stage validation.
    pub fn with_report_formats(mut self, formats: Vec<ReportFormat>) -> Self {
        self.report_formats = formats;
        self
    }

    /// Store in use.
    pub fn store(&self) -> &Arc<dyn StageStateStore> {
        &self.store
    }

    /// Submit `item` and run it from the first stage.
    pub async fn run(
        &self,
        item: WorkItem,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        item.validate()?;
        let records = self.store.load_records(&item.id).await?;
        let state = PipelineState::from_records(&records);
        if state != PipelineState::NotStarted {
            return Err(PipelineError::AlreadyStarted {
                work_item: item.id.clone(),
                state,
            });
        }

        tracing::info!(work_item = %item.id, "Starting pipeline at {}", item.root.display());
        self.store.save_work_item(&item).await?;
        for stage in Stage::ALL {
            if self.store.load_record(&item.id, stage).await?.is_none() {
                self.store
                    .save_record(&StageRecord::pending(item.id.clone(), stage))
                    .await?;
            }
        }
        self.drive(item, Stage::MetadataGeneration, cancel).await
    }

    /// Re-enter the pipeline at `stage`, which must be the first stage that
    /// is not completed. A `failed` or interrupted stage is put back to
    /// `pending` first; earlier stages are never re-executed.
    pub async fn resume_from(
        &self,
        id: &WorkItemId,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let status = self.status(id).await?;
        let not_resumable = |reason: String| PipelineError::NotResumable {
            work_item: id.clone(),
            requested: stage,
            reason,
        };

        let first_open = status
            .records
            .iter()
            .find(|r| r.status != StageStatus::Completed);
        let Some(first_open) = first_open else {
            return Err(not_resumable("all stages are completed".to_string()));
        };
        if first_open.stage != stage {
            let reason = if stage < first_open.stage {
                format!("{} is already completed", stage)
            } else {
                format!("{} is not completed (status {})", first_open.stage, first_open.status)
            };
            return Err(not_resumable(reason));
        }

        let mut record = first_open.clone();
        match record.status {
            StageStatus::AwaitingReview => {
                return Err(PipelineError::AwaitingReview {
                    work_item: id.clone(),
                    stage,
                })
            }
            StageStatus::Failed | StageStatus::Running => {
                tracing::info!(work_item = %id, stage = %stage, "Resetting {} stage to pending", record.status);
                record.transition(StageStatus::Pending)?;
                self.store.save_record(&record).await?;
            }
            StageStatus::Pending | StageStatus::Completed => {}
        }

        let input = self.input_for(id, stage, &status.records).await?;
        tracing::info!(work_item = %id, stage = %stage, "Resuming pipeline");
        self.drive(input, stage, cancel).await
    }

    /// Put a `failed` stage back to `pending` without running it.
    pub async fn restart(&self, id: &WorkItemId, stage: Stage) -> Result<StageRecord, PipelineError> {
        let mut record = self
            .store
            .load_record(id, stage)
            .await?
            .ok_or_else(|| PipelineError::UnknownWorkItem(id.clone()))?;
        if record.status != StageStatus::Failed {
            return Err(TransitionError {
                work_item: id.clone(),
                stage,
                from: record.status,
                to: StageStatus::Pending,
            }
            .into());
        }
        record.transition(StageStatus::Pending)?;
        self.store.save_record(&record).await?;
        tracing::info!(work_item = %id, stage = %stage, "Stage restarted");
        Ok(record)
    }

    /// Record a reviewer's decision on a stage awaiting review: approval
    /// completes it, rejection fails it.
    pub async fn review(
        &self,
        id: &WorkItemId,
        stage: Stage,
        decision: ReviewDecision,
    ) -> Result<StageRecord, PipelineError> {
        let mut record = self
            .store
            .load_record(id, stage)
            .await?
            .ok_or_else(|| PipelineError::UnknownWorkItem(id.clone()))?;
        let to = if decision.approved {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        };
        if record.status != StageStatus::AwaitingReview {
            return Err(TransitionError {
                work_item: id.clone(),
                stage,
                from: record.status,
                to,
            }
            .into());
        }

        record.transition(to)?;
        if !decision.approved {
            record.error = Some(format!(
                "rejected by {}: {}",
                decision.reviewer, decision.comments
            ));
        }
        tracing::info!(
            work_item = %id,
            stage = %stage,
            "Review by {}: {}",
            decision.reviewer,
            if decision.approved { "approved" } else { "rejected" }
        );
        record.review = Some(decision);
        self.store.save_record(&record).await?;
        Ok(record)
    }

    /// Per-stage records and overall state.
    pub async fn status(&self, id: &WorkItemId) -> Result<PipelineStatus, PipelineError> {
        if self.store.load_work_item(id).await?.is_none() {
            return Err(PipelineError::UnknownWorkItem(id.clone()));
        }
        let stored = self.store.load_records(id).await?;
        let records: Vec<StageRecord> = Stage::ALL
            .into_iter()
            .map(|stage| {
                stored
                    .iter()
                    .find(|r| r.stage == stage)
                    .cloned()
                    .unwrap_or_else(|| StageRecord::pending(id.clone(), stage))
            })
            .collect();
        let state = PipelineState::from_records(&records);
        Ok(PipelineStatus {
            work_item: id.clone(),
            records,
            state,
        })
    }

    /// Stored validation of a stage, if it has been validated.
    pub async fn validation_of(
        &self,
        record: &StageRecord,
    ) -> Result<Option<ValidationResult>, PipelineError> {
        match &record.validation {
            Some(v) => Ok(self
                .store
                .load_validation(&record.work_item, &v.run_id)
                .await?),
            None => Ok(None),
        }
    }

    /// Input of `stage`: the previous stage's output, or the submitted item.
    async fn input_for(
        &self,
        id: &WorkItemId,
        stage: Stage,
        records: &[StageRecord],
    ) -> Result<WorkItem, PipelineError> {
        match stage.previous() {
            None => self
                .store
                .load_work_item(id)
                .await?
                .ok_or_else(|| PipelineError::UnknownWorkItem(id.clone())),
            Some(prev) => records
                .iter()
                .find(|r| r.stage == prev)
                .and_then(|r| r.output.clone())
                .ok_or_else(|| PipelineError::NotResumable {
                    work_item: id.clone(),
                    requested: stage,
                    reason: format!("{} has no recorded output", prev),
                }),
        }
    }

    /// Run stages from `from` until done, paused or failed.
    async fn drive(
        &self,
        mut input: WorkItem,
        from: Stage,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let id = input.id.clone();
        let mut outcome = PipelineOutcome {
            work_item: id.clone(),
            state: PipelineState::InProgress { next: from },
            executed: Vec::new(),
            last_validation: None,
            review_packet: None,
            reports: Vec::new(),
        };

        let mut stage = Some(from);
        while let Some(current) = stage {
            outcome.executed.push(current);
            match self.run_stage(current, &input, cancel, &mut outcome).await? {
                StageEnd::Completed(output) => {
                    input = output;
                    stage = current.next();
                }
                StageEnd::Paused(packet) => {
                    outcome.review_packet = Some(packet);
                    break;
                }
            }
        }

        outcome.state = self.status(&id).await?.state;
        tracing::info!(work_item = %id, "Pipeline {}", outcome.state);
        Ok(outcome)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        input: &WorkItem,
        cancel: &CancellationToken,
        outcome: &mut PipelineOutcome,
    ) -> Result<StageEnd, PipelineError> {
        let id = &input.id;
        let mut record = self
            .store
            .load_record(id, stage)
            .await?
            .unwrap_or_else(|| StageRecord::pending(id.clone(), stage));
        record.transition(StageStatus::Running)?;
        record.attempts = 0;
        self.store.save_record(&record).await?;
        tracing::info!(work_item = %id, stage = %stage, "Stage running (execution {})", record.executions);

        let workspace = RunWorkspace::create(self.workspace_root.as_deref(), id, stage)?;

        let produced = match self.produce(stage, input, &workspace, cancel, &mut record).await {
            Ok(produced) => produced,
            Err(CollaboratorError::Cancelled) => return self.interrupted(record).await,
            Err(source) => {
                let attempts = record.attempts;
                return self
                    .fail(record, StageFailure::Collaborator { attempts, source })
                    .await;
            }
        };

        let outputs = self
            .store
            .artifact_dir(id, ArtifactArea::Outputs)
            .await?
            .join(stage.as_str());
        let stored_root = match copy_output(&produced.root, &outputs).await {
            Ok(root) => root,
            Err(e) => {
                return self
                    .fail(record, StageFailure::Output(format!("{}: {}", produced.root.display(), e)))
                    .await
            }
        };
        drop(workspace);

        let mut metadata = produced.metadata;
        metadata.insert("stage".to_string(), serde_json::json!(stage.as_str()));
        let revision = input.next_revision(stored_root, produced.content_types, metadata);

        let result = match self.engine.validate_with_cancel(&revision, cancel).await {
            Ok(result) => result,
            Err(e) => return self.fail(record, StageFailure::Engine(e)).await,
        };
        if cancel.is_cancelled() {
            return self.interrupted(record).await;
        }

        self.store.save_validation(&result).await?;
        let validation = ValidationRef {
            run_id: result.run_id,
            quality_score: result.summary.quality_score,
            overall_status: result.summary.overall_status,
            human_review: result.summary.human_review,
        };
        record.validation = Some(validation.clone());
        outcome.last_validation = Some(validation);
        outcome
            .reports
            .extend(self.write_reports(&result, stage).await?);

        let decision = GateDecision::from_result(&result);
        tracing::info!(
            work_item = %id,
            stage = %stage,
            run_id = %result.run_id,
            "Gate: {} (score {:.1}, status {})",
            decision,
            result.summary.quality_score,
            result.summary.overall_status
        );

        if decision.allows_progress() {
            record.output = Some(revision.clone());
            record.transition(decision.target_status())?;
            self.store.save_record(&record).await?;
            return Ok(StageEnd::Completed(revision));
        }
        if decision == GateDecision::Escalate {
            let dir = self.store.artifact_dir(id, ArtifactArea::Review).await?;
            let packet = ReviewPacket::new(stage, &result).write(&dir).await?;
            record.output = Some(revision);
            record.review_packet = Some(packet.clone());
            record.transition(decision.target_status())?;
            self.store.save_record(&record).await?;
            return Ok(StageEnd::Paused(packet));
        }
        let cause = StageFailure::Validation {
            score: result.summary.quality_score,
            status: result.summary.overall_status,
        };
        self.fail(record, cause).await
    }

    /// Invoke the stage's collaborator, retrying transient errors.
    async fn produce(
        &self,
        stage: Stage,
        input: &WorkItem,
        workspace: &RunWorkspace,
        cancel: &CancellationToken,
        record: &mut StageRecord,
    ) -> Result<StageOutput, CollaboratorError> {
        let collaborator = self
            .collaborators
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| Arc::new(PassThrough) as Arc<dyn StageCollaborator>);

        loop {
            record.attempts += 1;
            let attempt = StageInput {
                stage,
                item: input,
                workspace: workspace.path(),
            };
            let result = tokio::select! {
                r = collaborator.produce(attempt, cancel) => r,
                _ = cancel.cancelled() => Err(CollaboratorError::Cancelled),
            };
            match result {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transient() && self.retry.allows(record.attempts) => {
                    let delay = self.retry.delay(record.attempts);
                    tracing::warn!(
                        work_item = %input.id,
                        stage = %stage,
                        "{} attempt {} failed: {}; retrying in {:?}",
                        collaborator.name(),
                        record.attempts,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(CollaboratorError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_reports(
        &self,
        result: &ValidationResult,
        stage: Stage,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let dir = self
            .store
            .artifact_dir(&result.work_item, ArtifactArea::Reports)
            .await?
            .join(stage.as_str());
        let mut batch = self.reports.generate_all(result, &self.report_formats);
        let paths = batch.write_all(&dir, &result.run_id.to_string()).await;
        for e in &batch.errors {
            tracing::warn!(work_item = %result.work_item, stage = %stage, "Report not written: {}", e);
        }
        Ok(paths)
    }

    async fn fail(&self, mut record: StageRecord, cause: StageFailure) -> Result<StageEnd, PipelineError> {
        tracing::error!(work_item = %record.work_item, stage = %record.stage, "Stage failed: {}", cause);
        record.error = Some(cause.to_string());
        record.transition(StageStatus::Failed)?;
        self.store.save_record(&record).await?;
        Err(StageError {
            work_item: record.work_item,
            stage: record.stage,
            cause,
        }
        .into())
    }

    async fn interrupted(&self, mut record: StageRecord) -> Result<StageEnd, PipelineError> {
        tracing::warn!(work_item = %record.work_item, stage = %record.stage, "Stage cancelled");
        record.transition(StageStatus::Pending)?;
        self.store.save_record(&record).await?;
        Err(PipelineError::Cancelled {
            work_item: record.work_item,
            stage: record.stage,
        })
    }
}

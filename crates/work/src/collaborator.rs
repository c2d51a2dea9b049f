//! Stage collaborators: the external producers, converters and renderers
//! whose output each stage validates.

use async_trait::async_trait;
use stagegate_core::{CancellationToken, CollaboratorSpec, ContentType, Stage, WorkItem};
use stagegate_tools::{substitute, CommandError, CommandRunner, CommandSpec};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// What a collaborator is asked to work on.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    /// Stage being executed
    pub stage: Stage,
    /// Output of the previous stage (or the submitted item)
    pub item: &'a WorkItem,
    /// Private scratch directory for this run
    pub workspace: &'a Path,
}

/// What a collaborator produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    /// Produced file or directory
    pub root: PathBuf,
    /// Content types of the output
    pub content_types: BTreeSet<ContentType>,
    /// Metadata to merge into the next revision
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StageOutput {
    /// Output at `root`, content type inferred from its extension.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let content_types = ContentType::from_path(&root).into_iter().collect();
        Self {
            root,
            content_types,
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Collaborator failures.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// The collaborator could not be reached; worth retrying
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator ran and failed
    #[error("collaborator failed: {0}")]
    Failed(String),

    /// Running the command failed
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The declared output was not produced
    #[error("expected output {0} was not produced")]
    MissingOutput(PathBuf),

    /// Run was cancelled
    #[error("collaborator was cancelled")]
    Cancelled,
}

impl CollaboratorError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CollaboratorError::Unavailable(_) => true,
            CollaboratorError::Command(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Produces one stage's output.
#[async_trait]
pub trait StageCollaborator: Send + Sync {
    /// Name, for logs.
    fn name(&self) -> &str;

    /// Produce the stage output, writing only inside `input.workspace`.
    async fn produce(
        &self,
        input: StageInput<'_>,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, CollaboratorError>;
}

/// Hands the input on unchanged. Used for stages with no collaborator
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl StageCollaborator for PassThrough {
    fn name(&self) -> &str {
        "pass-through"
    }

    async fn produce(
        &self,
        input: StageInput<'_>,
        _cancel: &CancellationToken,
    ) -> Result<StageOutput, CollaboratorError> {
        Ok(StageOutput {
            root: input.item.root.clone(),
            content_types: input.item.content_types.clone(),
            metadata: BTreeMap::new(),
        })
    }
}

/// Runs an external command (converter, renderer, generator) per
/// `pipeline.collaborators.<stage>`.
pub struct CommandCollaborator {
    name: String,
    spec: CollaboratorSpec,
    runner: Arc<dyn CommandRunner>,
}

impl CommandCollaborator {
    /// Create a collaborator.
    pub fn new(spec: CollaboratorSpec, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            name: spec.command.clone(),
            spec,
            runner,
        }
    }
}

#[async_trait]
impl StageCollaborator for CommandCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn produce(
        &self,
        input: StageInput<'_>,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, CollaboratorError> {
        let output_path = input.workspace.join(&self.spec.output);
        let mut vars = BTreeMap::new();
        vars.insert("input", input.item.root.display().to_string());
        vars.insert("workspace", input.workspace.display().to_string());
        vars.insert("output", output_path.display().to_string());
        vars.insert("item", input.item.id.to_string());

        let mut spec = CommandSpec::new(&self.spec.command)
            .args(substitute(&self.spec.args, &vars))
            .cwd(input.workspace)
            .env("STAGEGATE_STAGE", input.stage.as_str());
        if let Some(secs) = self.spec.timeout_secs {
            spec = spec.timeout(Duration::from_secs(secs));
        }

        tracing::info!(stage = %input.stage, "Running collaborator: {}", spec.display());
        let out = self.runner.run(&spec, cancel).await.map_err(|e| match e {
            CommandError::Cancelled { .. } => CollaboratorError::Cancelled,
            e => CollaboratorError::Command(e),
        })?;

        if self.spec.transient_exit_codes.contains(&out.exit_code) {
            return Err(CollaboratorError::Unavailable(format!(
                "`{}` exited with {}: {}",
                self.spec.command,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        if !out.success() {
            return Err(CollaboratorError::Failed(format!(
                "`{}` exited with {}: {}",
                self.spec.command,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        if tokio::fs::metadata(&output_path).await.is_err() {
            return Err(CollaboratorError::MissingOutput(output_path));
        }

        let mut output = StageOutput::at(&output_path);
        if !self.spec.content_types.is_empty() {
            output.content_types = self.spec.content_types.iter().map(ContentType::new).collect();
        }
        if output.content_types.is_empty() {
            output.content_types = input.item.content_types.clone();
        }
        Ok(output.with_metadata(
            format!("{}.collaborator", input.stage),
            serde_json::json!(self.spec.command),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use stagegate_core::WorkItemId;
    use stagegate_tools::ProcessRunner;
    use tempfile::TempDir;

    fn spec(script: &str, output: &str) -> CollaboratorSpec {
        CollaboratorSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            output: output.to_string(),
            content_types: Vec::new(),
            timeout_secs: Some(10),
            transient_exit_codes: vec![75],
        }
    }

    fn collaborator(spec: CollaboratorSpec) -> CommandCollaborator {
        CommandCollaborator::new(spec, Arc::new(ProcessRunner::new()))
    }

    #[tokio::test]
    async fn test_command_output_is_returned() {
        let ws = TempDir::new().unwrap();
        let item = WorkItem::new(WorkItemId::new("book").unwrap(), "book.md");
        let c = collaborator(spec("echo converted > {output}", "book.tex"));

        let out = c
            .produce(
                StageInput {
                    stage: Stage::IntermediateConversion,
                    item: &item,
                    workspace: ws.path(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.root, ws.path().join("book.tex"));
        assert!(out.content_types.contains(&ContentType::new("latex")));
        assert!(out.metadata.contains_key("intermediate-conversion.collaborator"));
    }

    #[tokio::test]
    async fn test_exit_codes_are_classified() {
        let ws = TempDir::new().unwrap();
        let item = WorkItem::new(WorkItemId::new("book").unwrap(), "book.md");
        let input = StageInput {
            stage: Stage::ArtifactGeneration,
            item: &item,
            workspace: ws.path(),
        };

        let err = collaborator(spec("exit 75", "book.pdf"))
            .produce(input, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let err = collaborator(spec("echo broken >&2; exit 1", "book.pdf"))
            .produce(input, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("broken"));

        let err = collaborator(spec("true", "book.pdf"))
            .produce(input, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::MissingOutput(_)));
    }
}

//! stagegate CLI - validation gates for multi-stage content pipelines.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stagegate_ai::InferenceError;
use stagegate_core::{
    CancellationToken, ConfigError, InvalidIdError, OutputTarget, PipelineState, ReportFormat,
    ReviewDecision, Stage, StageStatus, ValidationConfig, WorkItem, WorkItemId,
};
use stagegate_quality::{registry_from_config, EngineError, ReportGenerator, ValidationEngine};
use stagegate_storage::JsonStageStore;
use stagegate_tools::{CommandRunner, ProcessRunner};
use stagegate_work::{CommandCollaborator, MultiStageProcessManager, PipelineError, PipelineOutcome};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const EXIT_INTERNAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_VALIDATION_FAILED: u8 = 3;
const EXIT_STAGE_FAILED: u8 = 4;
const EXIT_AWAITING_REVIEW: u8 = 5;

#[derive(Parser)]
#[command(name = "stagegate")]
#[command(about = "Validation gates for multi-stage content pipelines", long_about = None)]
struct Cli {
    /// Configuration file (JSON or YAML)
    #[arg(long, global = true, default_value = "stagegate.yaml")]
    config: PathBuf,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a file or directory once, without the pipeline
    Validate {
        /// File or directory to validate
        path: PathBuf,
        /// Work item id (defaults to the file stem)
        #[arg(long)]
        id: Option<String>,
        /// Report formats, overriding `reporting.formats`
        #[arg(long = "format")]
        formats: Vec<ReportFormat>,
    },
    /// Submit a work item and run it through every stage
    Run {
        /// Source file or directory
        path: PathBuf,
        /// Work item id
        #[arg(long)]
        id: String,
    },
    /// Continue a work item at its first non-completed stage
    Resume {
        /// Work item id
        id: String,
        /// Stage to resume at
        #[arg(long = "from-stage")]
        from_stage: Stage,
    },
    /// Put a failed stage back to pending
    Restart {
        /// Work item id
        id: String,
        /// Failed stage
        #[arg(long)]
        stage: Stage,
    },
    /// Record a decision on a stage awaiting review
    Review {
        /// Work item id
        id: String,
        /// Stage awaiting review
        #[arg(long)]
        stage: Stage,
        /// Approve and let the pipeline continue
        #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
        approve: bool,
        /// Reject and fail the stage
        #[arg(long)]
        reject: bool,
        /// Reviewer name
        #[arg(long)]
        reviewer: String,
        /// Comments
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Show per-stage status
    Status {
        /// Work item id
        id: String,
    },
    /// List report formats
    Formats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    match execute(cli, &cancel).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn execute(cli: Cli, cancel: &CancellationToken) -> Result<u8> {
    if let Commands::Formats = cli.command {
        for format in ReportGenerator::new().supported_formats() {
            println!("{:<10} .{}", format.as_str(), format.extension());
        }
        return Ok(0);
    }

    let app = App::load(&cli.config)?;
    match cli.command {
        Commands::Validate { path, id, formats } => {
            let id = match id {
                Some(id) => id,
                None => path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "item".to_string()),
            };
            let item = WorkItem::new(WorkItemId::new(id)?, path);
            let engine = app.engine()?;
            let result = engine.validate_with_cancel(&item, cancel).await?;

            let formats = if formats.is_empty() {
                app.config.reporting.parsed_formats()
            } else {
                formats
            };
            let mut batch = ReportGenerator::new().generate_all(&result, &formats);
            for target in app.config.reporting.targets() {
                match target {
                    OutputTarget::Stdout => {
                        for report in &batch.reports {
                            println!("{}", report.content);
                        }
                    }
                    OutputTarget::Directory(dir) => {
                        for path in batch.write_all(&dir, &result.run_id.to_string()).await {
                            tracing::info!("Report written: {}", path.display());
                        }
                    }
                }
            }
            for err in &batch.errors {
                tracing::warn!("{}", err);
            }

            Ok(if result.failed() {
                EXIT_VALIDATION_FAILED
            } else if result.needs_review() {
                EXIT_AWAITING_REVIEW
            } else {
                0
            })
        }
        Commands::Run { path, id } => {
            let manager = app.manager().await?;
            let item = WorkItem::new(WorkItemId::new(id)?, path);
            let outcome = manager.run(item, cancel).await?;
            print_outcome(&outcome);
            Ok(outcome_code(&outcome))
        }
        Commands::Resume { id, from_stage } => {
            let manager = app.manager().await?;
            let outcome = manager
                .resume_from(&WorkItemId::new(id)?, from_stage, cancel)
                .await?;
            print_outcome(&outcome);
            Ok(outcome_code(&outcome))
        }
        Commands::Restart { id, stage } => {
            let manager = app.manager().await?;
            let id = WorkItemId::new(id)?;
            manager.restart(&id, stage).await?;
            println!("{} {} is pending; continue with: stagegate resume {} --from-stage {}", id, stage, id, stage);
            Ok(0)
        }
        Commands::Review {
            id,
            stage,
            approve,
            reject: _,
            reviewer,
            comment,
        } => {
            let manager = app.manager().await?;
            let decision = if approve {
                ReviewDecision::approve(reviewer, comment)
            } else {
                ReviewDecision::reject(reviewer, comment)
            };
            let record = manager.review(&WorkItemId::new(id)?, stage, decision).await?;
            println!("{} {}: {}", record.work_item, stage, record.status);
            if record.status == StageStatus::Completed {
                if let Some(next) = stage.next() {
                    println!("continue with: stagegate resume {} --from-stage {}", record.work_item, next);
                }
            }
            Ok(0)
        }
        Commands::Status { id } => {
            let manager = app.manager().await?;
            let status = manager.status(&WorkItemId::new(id)?).await?;
            println!("{}: {}", status.work_item, status.state);
            for record in &status.records {
                let score = record
                    .validation
                    .as_ref()
                    .map(|v| format!("{:.1} ({})", v.quality_score, v.overall_status))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<24} {:<16} score {:<16} runs {}",
                    record.stage.as_str(),
                    record.status.to_string(),
                    score,
                    record.executions
                );
                if let Some(error) = &record.error {
                    println!("    error: {}", error);
                }
                if let Some(packet) = &record.review_packet {
                    println!("    review packet: {}", packet.display());
                }
            }
            Ok(0)
        }
        Commands::Formats => Ok(0),
    }
}

/// Loaded configuration and the collaborators built from it.
struct App {
    config: Arc<ValidationConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl App {
    fn load(path: &Path) -> Result<Self> {
        let config = ValidationConfig::load(path)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(Self {
            config: Arc::new(config),
            runner: Arc::new(ProcessRunner::new()),
        })
    }

    fn engine(&self) -> Result<ValidationEngine> {
        let backend = stagegate_ai::from_settings(&self.config.inference)?;
        let registry = registry_from_config(&self.config, self.runner.clone(), backend)?;
        Ok(ValidationEngine::new(registry, self.config.clone())?)
    }

    async fn manager(&self) -> Result<MultiStageProcessManager> {
        let store_dir = &self.config.pipeline.store_dir;
        let store = JsonStageStore::new(store_dir)
            .await
            .with_context(|| format!("opening store at {}", store_dir.display()))?;
        let mut manager = MultiStageProcessManager::new(
            Arc::new(store),
            Arc::new(self.engine()?),
            &self.config.pipeline,
        )
        .with_report_formats(self.config.reporting.parsed_formats());

        for (stage, spec) in &self.config.pipeline.collaborators {
            manager = manager.with_collaborator(
                *stage,
                Arc::new(CommandCollaborator::new(spec.clone(), self.runner.clone())),
            );
        }
        Ok(manager)
    }
}

fn print_outcome(outcome: &PipelineOutcome) {
    println!("{}: {}", outcome.work_item, outcome.state);
    let ran: Vec<&str> = outcome.executed.iter().map(|s| s.as_str()).collect();
    println!("  ran: {}", ran.join(", "));
    if let Some(v) = &outcome.last_validation {
        println!(
            "  last validation: {} score {:.1} ({}{})",
            v.run_id,
            v.quality_score,
            v.overall_status,
            if v.human_review { ", review required" } else { "" }
        );
    }
    if let Some(packet) = &outcome.review_packet {
        println!("  review packet: {}", packet.display());
    }
}

fn outcome_code(outcome: &PipelineOutcome) -> u8 {
    match outcome.state {
        PipelineState::Blocked {
            status: StageStatus::AwaitingReview,
            ..
        } => EXIT_AWAITING_REVIEW,
        PipelineState::Blocked { .. } => EXIT_STAGE_FAILED,
        _ => 0,
    }
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some()
        || err.downcast_ref::<InferenceError>().is_some()
        || err.downcast_ref::<InvalidIdError>().is_some()
        || err.downcast_ref::<EngineError>().is_some()
    {
        return EXIT_CONFIG;
    }
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::Stage(_)) => EXIT_STAGE_FAILED,
        Some(PipelineError::AwaitingReview { .. }) => EXIT_AWAITING_REVIEW,
        Some(
            PipelineError::InvalidWorkItem(_)
            | PipelineError::UnknownWorkItem(_)
            | PipelineError::AlreadyStarted { .. }
            | PipelineError::NotResumable { .. }
            | PipelineError::Transition(_),
        ) => EXIT_CONFIG,
        _ => EXIT_INTERNAL,
    }
}

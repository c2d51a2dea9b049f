//! Process-backed command runner.

use super::r#trait::*;
use async_trait::async_trait;
use stagegate_core::CancellationToken;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs commands as child processes. Children are killed when their
/// deadline passes or the run is cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        if cancel.is_cancelled() {
            return Err(CommandError::Cancelled {
                program: spec.program.clone(),
            });
        }

        let start = std::time::Instant::now();
        tracing::debug!("Running: {}", spec.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Fed from its own task so a child that never reads its input
        // still falls under the deadline and cancellation below.
        let feeder = match (&spec.stdin, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => {
                let input = input.clone();
                Some(tokio::spawn(async move {
                    let written = stdin.write_all(input.as_bytes()).await;
                    // Dropping closes the pipe so the child sees EOF.
                    drop(stdin);
                    match written {
                        // Child exited without reading its input.
                        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                        other => other,
                    }
                }))
            }
            _ => None,
        };

        let wait = child.wait_with_output();
        let deadline = async {
            match spec.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Dropping `wait` drops the child, and kill_on_drop kills it.
        let output = tokio::select! {
            out = wait => out.map_err(|source| CommandError::Io {
                program: spec.program.clone(),
                source,
            })?,
            _ = deadline => {
                tracing::warn!("Command timed out: {}", spec.display());
                return Err(CommandError::Timeout {
                    program: spec.program.clone(),
                    timeout: spec.timeout.unwrap_or_default(),
                });
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Command cancelled: {}", spec.display());
                return Err(CommandError::Cancelled {
                    program: spec.program.clone(),
                });
            }
        };

        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    return Err(CommandError::Io {
                        program: spec.program.clone(),
                        source,
                    })
                }
                Err(e) => tracing::warn!("stdin writer for {} failed: {}", spec.program, e),
            }
        }

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }
}

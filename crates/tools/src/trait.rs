//! Command runner abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagegate_core::CancellationToken;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Runs external commands.
///
/// Validators and stage collaborators hold an `Arc<dyn CommandRunner>` so
/// tests can substitute a scripted runner for real processes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion, its deadline, or cancellation.
    ///
    /// A non-zero exit is not an error: it is reported in
    /// [`CommandOutput::exit_code`].
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError>;
}

/// What to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program
    pub program: String,

    /// Command arguments
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Standard input
    #[serde(default)]
    pub stdin: Option<String>,

    /// Deadline
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Create a spec for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            stdin: None,
            timeout: None,
        }
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Feed `input` on stdin.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Set deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program and arguments as one line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output of a finished command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal)
    pub exit_code: i32,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// Execution duration
    pub duration: Duration,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Why a command produced no output.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The program could not be started
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        /// Program
        program: String,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// I/O while talking to the child
    #[error("I/O error running `{program}`: {source}")]
    Io {
        /// Program
        program: String,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// Deadline passed; the child was killed
    #[error("`{program}` timed out after {timeout:?}")]
    Timeout {
        /// Program
        program: String,
        /// Deadline that passed
        timeout: Duration,
    },

    /// Run was cancelled; the child was killed
    #[error("`{program}` was cancelled")]
    Cancelled {
        /// Program
        program: String,
    },
}

impl CommandError {
    /// Failures that may succeed on another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, CommandError::Timeout { .. } | CommandError::Io { .. })
    }
}

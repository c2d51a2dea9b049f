//! External command execution.
//!
//! Run external programs (linters, scanners, converters, renderers) with a
//! deadline and run-level cancellation, and retry transient failures with
//! exponential backoff.

#![warn(missing_docs)]

pub mod r#trait;
pub mod process;
pub mod retry;

pub use r#trait::{CommandError, CommandOutput, CommandRunner, CommandSpec};
pub use process::ProcessRunner;
pub use retry::{substitute, RetryPolicy};

// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The opaque "executor" collaborator (spec §4.6): runs one work unit
//! payload and produces a result or a failure.
//!
//! Grounded in the teacher's `distributed::worker::TaskExecutor` trait
//! (`core/src/distributed/worker.rs`), generalized from a JSON task
//! request/response pair to the opaque byte payloads this spec's work
//! units carry: the core never inspects the payload or result, so the
//! trait passes `Vec<u8>` rather than a typed task struct.

use async_trait::async_trait;

use crate::error::ExecutorError;

/// The outcome of running one work unit.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Clean exit; `result` is the bytes to upload.
    Success(Vec<u8>),
    /// Nonzero exit or nonempty stderr; `message` is reported to the
    /// coordinator as the error-opcode upload (spec §4.6, §7).
    Failure(String),
}

/// Runs a single work unit payload to completion.
///
/// What the worker does with the downloaded worker-code blob (compile
/// it, load it, spawn it) is outside the core (spec §1); this trait is
/// the seam between "we have a payload and a worker-code binary" and
/// "here is a result or a failure".
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `payload` and report the outcome.
    async fn execute(&self, payload: &[u8]) -> Result<ExecutionOutcome, ExecutorError>;
}

/// Runs the downloaded worker-code blob as a child process, feeding
/// `payload` on stdin and reading the result from stdout.
///
/// A nonzero exit status or any stderr output is treated as failure
/// (spec §4.6: "Any nonzero exit or nonempty error stream transitions
/// the slot to failed").
pub struct ProcessExecutor {
    program: std::path::PathBuf,
}

impl ProcessExecutor {
    /// Build an executor that spawns `program` per work unit.
    pub fn new(program: impl Into<std::path::PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    async fn execute(&self, payload: &[u8]) -> Result<ExecutionOutcome, ExecutorError> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Ok(ExecutionOutcome::Failure(format!(
                "executor exited with {}",
                output.status
            )));
        }
        if !output.stderr.is_empty() {
            return Ok(ExecutionOutcome::Failure(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(ExecutionOutcome::Success(output.stdout))
    }
}

/// An in-process executor driven by a plain closure; used in tests in
/// place of spawning a real child process.
pub struct FnExecutor<F>
where
    F: Fn(&[u8]) -> Result<ExecutionOutcome, ExecutorError> + Send + Sync,
{
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&[u8]) -> Result<ExecutionOutcome, ExecutorError> + Send + Sync,
{
    /// Wrap `f` as a [`TaskExecutor`].
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> TaskExecutor for FnExecutor<F>
where
    F: Fn(&[u8]) -> Result<ExecutionOutcome, ExecutorError> + Send + Sync,
{
    async fn execute(&self, payload: &[u8]) -> Result<ExecutionOutcome, ExecutorError> {
        (self.f)(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_executor_reports_success() {
        let exec = FnExecutor::new(|p: &[u8]| Ok(ExecutionOutcome::Success(p.to_vec())));
        let outcome = exec.execute(b"hi").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Success(ref b) if b == b"hi"));
    }

    #[tokio::test]
    async fn fn_executor_reports_failure() {
        let exec =
            FnExecutor::new(|_: &[u8]| Ok(ExecutionOutcome::Failure("boom".to_string())));
        let outcome = exec.execute(b"hi").await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Failure(ref m) if m == "boom"));
    }
}

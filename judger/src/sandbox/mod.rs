//! Isolated execution of untrusted submissions.

mod container;
mod docker;
mod util;
mod workspace;

use std::{borrow::Cow, time::Duration};

use async_trait::async_trait;
use err_derive::Error;

use crate::model::Problem;

pub use container::{reclaim_containers, Container, CreateContainerConfig, MANAGED_LABEL};
pub use docker::DockerSandbox;
pub use util::*;
pub use workspace::*;

/// Raw observations of one run. Interpreting them is up to the evaluator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    /// Bytes past the read cap were dropped from `stdout`.
    pub stdout_truncated: bool,
    pub stderr: Vec<u8>,
    /// Wall-clock time from start to exit, or to the kill.
    pub duration: Duration,
    /// Peak memory in bytes, if docker reported any.
    pub peak_memory: Option<u64>,
    pub timed_out: bool,
    pub oom_killed: bool,
}

/// Failures to set up or observe a run. These say nothing about the
/// submitted program.
#[derive(Debug, Error)]
pub enum SandboxErr {
    #[error(display = "Failed to allocate work area: {}", _0)]
    WorkArea(#[error(source, no_from)] std::io::Error),

    #[error(display = "Failed to write {} into work area: {}", _0, _1)]
    WriteFile(String, #[error(source, no_from)] std::io::Error),

    #[error(display = "Failed to prepare image {}: {}", _0, _1)]
    Image(String, String),

    #[error(display = "Failed to create container: {}", _0)]
    CreateContainer(String),

    #[error(display = "Failed to start container: {}", _0)]
    StartContainer(#[error(source, no_from)] bollard::errors::Error),

    #[error(display = "Failed to inspect container: {}", _0)]
    Inspect(#[error(source, no_from)] bollard::errors::Error),

    #[error(display = "Container did not stop: {}", _0)]
    Wait(String),

    #[error(display = "Failed to read {} from work area: {}", _0, _1)]
    ReadOutput(String, #[error(source, no_from)] std::io::Error),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> Cow<'static, str>;

    /// One-off preparation before the first run.
    async fn prepare(&self) -> Result<(), SandboxErr> {
        Ok(())
    }

    /// Run `code` against `problem`'s input under `problem`'s limits.
    async fn run(&self, code: &str, problem: &Problem) -> Result<ExecutionOutcome, SandboxErr>;

    /// Retry removal of anything earlier runs failed to clean up. Returns
    /// the number of items reclaimed.
    async fn reclaim(&self) -> usize {
        0
    }
}

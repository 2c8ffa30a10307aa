//! The backlog of submissions and the in-process claim guard.
//!
//! A claim is a single atomic read-and-mark: the oldest `pending` submission
//! (by creation time, then id) is flipped to `processing` under the store's
//! exclusive lock and handed to exactly one caller.

use async_trait::async_trait;
use err_derive::Error;

use crate::model::{
    Job, JudgeResult, Problem, ProblemId, Submission, SubmissionId, SubmissionStatus,
};

mod guard;
mod memory;

pub use guard::*;
pub use memory::*;

#[derive(Debug, Error)]
pub enum QueueErr {
    #[error(display = "No such submission: {}", _0)]
    NotFound(SubmissionId),

    #[error(display = "Status `{}` is not terminal", _0)]
    NotTerminal(SubmissionStatus),

    #[error(display = "Backing store unavailable: {}", _0)]
    Unavailable(String),
}

#[async_trait]
pub trait SubmissionQueue: Send + Sync {
    /// Claim the oldest pending submission, or `None` if the backlog is empty.
    ///
    /// On `Err(_)` the caller must not assume anything was claimed.
    async fn claim_next(&self) -> Result<Option<Submission>, QueueErr>;

    /// Write a terminal result. Re-applying an identical result is a no-op.
    async fn complete(
        &self,
        id: SubmissionId,
        result: &JudgeResult,
    ) -> Result<Submission, QueueErr>;

    async fn get(&self, id: SubmissionId) -> Result<Option<Submission>, QueueErr>;

    async fn problem(&self, id: ProblemId) -> Result<Option<Problem>, QueueErr>;
}

/// Claim the next submission together with its problem.
///
/// A claimed submission whose problem has vanished can never be judged, so it
/// is closed with an `error` status right away instead of being left in
/// `processing`.
pub async fn claim_job(queue: &dyn SubmissionQueue) -> Result<Option<Job>, QueueErr> {
    let submission = match queue.claim_next().await? {
        Some(s) => s,
        None => return Ok(None),
    };

    match queue.problem(submission.problem_id).await? {
        Some(problem) => Ok(Some(Job {
            submission,
            problem,
        })),
        None => {
            tracing::warn!(
                submission_id = submission.id,
                problem_id = submission.problem_id,
                "Claimed submission references a missing problem"
            );
            queue
                .complete(
                    submission.id,
                    &JudgeResult::error("Failed to retrieve problem details"),
                )
                .await?;
            Ok(None)
        }
    }
}

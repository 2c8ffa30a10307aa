//! Records shared between the queue owner, the wire protocol and the worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SubmissionId = u64;
pub type ProblemId = u64;

/// Lifecycle status of a [`Submission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Processing,
    Accepted,
    Rejected,
    Error,
}

impl SubmissionStatus {
    /// Terminal statuses never transition anywhere else.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubmissionStatus::Accepted | SubmissionStatus::Rejected | SubmissionStatus::Error
        )
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Processing => "processing",
            SubmissionStatus::Accepted => "accepted",
            SubmissionStatus::Rejected => "rejected",
            SubmissionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// What the judged program did. Only meaningful once the status is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "Compile Error")]
    CompileError,
    #[serde(rename = "Wrong Answer")]
    WrongAnswer,
    #[serde(rename = "Memory Limit")]
    MemoryLimitExceeded,
    #[serde(rename = "Time Limit")]
    TimeLimitExceeded,
    #[serde(rename = "Runtime Error")]
    RuntimeError,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Ok => "OK",
            Verdict::CompileError => "Compile Error",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::MemoryLimitExceeded => "Memory Limit",
            Verdict::TimeLimitExceeded => "Time Limit",
            Verdict::RuntimeError => "Runtime Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub user_id: u64,
    pub problem_id: ProblemId,
    pub code: String,
    pub status: SubmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Verdict>,
    /// Milliseconds.
    #[serde(default)]
    pub execution_time: u64,
    /// Megabytes.
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    /// Overwrite the judging fields with `result`. Returns `false` if nothing
    /// changed, in which case `updated_at` is left alone as well.
    pub fn apply_result(&mut self, result: &JudgeResult, now: DateTime<Utc>) -> bool {
        let unchanged = self.status == result.status
            && self.result == result.result
            && self.execution_time == result.execution_time
            && self.memory_used == result.memory_used
            && self.error_message == result.error_message;
        if unchanged {
            return false;
        }
        self.status = result.status;
        self.result = result.result;
        self.execution_time = result.execution_time;
        self.memory_used = result.memory_used;
        self.error_message = result.error_message.clone();
        self.updated_at = now;
        true
    }
}

/// A new submission as handed over by whoever accepts user code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubmission {
    pub user_id: u64,
    pub problem_id: ProblemId,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemStatus {
    Draft,
    Published,
}

impl Default for ProblemStatus {
    fn default() -> Self {
        ProblemStatus::Published
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub id: ProblemId,
    #[serde(default)]
    pub title: String,
    /// Milliseconds.
    pub time_limit: u64,
    /// Megabytes.
    pub memory_limit: u64,
    pub input: String,
    /// Expected standard output, compared byte for byte.
    pub output: String,
    #[serde(default)]
    pub status: ProblemStatus,
}

/// One unit of work: a claimed submission and the problem it targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub submission: Submission,
    pub problem: Problem,
}

/// The terminal state written back for a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub status: SubmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Verdict>,
    /// Milliseconds.
    #[serde(default)]
    pub execution_time: u64,
    /// Megabytes.
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub error_message: String,
}

impl JudgeResult {
    /// A result for failures that are not the program's fault.
    pub fn error(message: impl Into<String>) -> JudgeResult {
        JudgeResult {
            status: SubmissionStatus::Error,
            result: None,
            execution_time: 0,
            memory_used: 0,
            error_message: message.into(),
        }
    }
}

pub const PROCESSING_TIMED_OUT: &str = "processing timed out";

//! Turning raw execution observations into a verdict.

use crate::{
    model::{JudgeResult, Problem, SubmissionStatus, Verdict},
    sandbox::ExecutionOutcome,
};

pub const TIME_LIMIT_MESSAGE: &str = "Time limit exceeded";
pub const MEMORY_LIMIT_MESSAGE: &str = "Memory limit exceeded";
pub const WRONG_ANSWER_MESSAGE: &str = "Output does not match expected output";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub status: SubmissionStatus,
    pub verdict: Verdict,
    pub diagnostic: String,
}

impl Evaluation {
    fn rejected(verdict: Verdict, diagnostic: impl Into<String>) -> Evaluation {
        Evaluation {
            status: SubmissionStatus::Rejected,
            verdict,
            diagnostic: diagnostic.into(),
        }
    }

    /// The terminal result reported for this evaluation of `outcome`.
    pub fn into_result(self, outcome: &ExecutionOutcome) -> JudgeResult {
        JudgeResult {
            status: self.status,
            result: Some(self.verdict),
            execution_time: outcome.duration.as_millis() as u64,
            memory_used: outcome.peak_memory.map_or(0, |b| b / (1024 * 1024)),
            error_message: self.diagnostic,
        }
    }
}

/// Classify `outcome`. The first matching rule wins:
///
/// 1. killed at the deadline: Time Limit
/// 2. killed for memory: Memory Limit
/// 3. stderr output and a non-zero exit: Runtime Error
/// 4. stderr output and a zero exit: Compile Error
/// 5. otherwise stdout is compared byte for byte with the expected output,
///    whatever the exit code. Truncated stdout never matches.
///
/// Rule 4 assumes a toolchain that reports build failures on stderr while
/// exiting cleanly, which is only a heuristic.
pub fn evaluate(outcome: &ExecutionOutcome, problem: &Problem) -> Evaluation {
    if outcome.timed_out {
        return Evaluation::rejected(Verdict::TimeLimitExceeded, TIME_LIMIT_MESSAGE);
    }
    if outcome.oom_killed {
        return Evaluation::rejected(Verdict::MemoryLimitExceeded, MEMORY_LIMIT_MESSAGE);
    }
    if !outcome.stderr.is_empty() {
        let stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();
        let verdict = if outcome.exit_code != 0 {
            Verdict::RuntimeError
        } else {
            Verdict::CompileError
        };
        return Evaluation::rejected(verdict, stderr);
    }
    if !outcome.stdout_truncated && outcome.stdout == problem.output.as_bytes() {
        Evaluation {
            status: SubmissionStatus::Accepted,
            verdict: Verdict::Ok,
            diagnostic: String::new(),
        }
    } else {
        Evaluation::rejected(Verdict::WrongAnswer, WRONG_ANSWER_MESSAGE)
    }
}

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{QueueErr, SubmissionQueue};
use crate::model::{
    JudgeResult, NewSubmission, Problem, ProblemId, Submission, SubmissionId, SubmissionStatus,
};

/// Initial contents of a [`MemoryQueue`], usually read from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub problems: Vec<Problem>,
    pub submissions: Vec<Submission>,
}

#[derive(Debug, Default)]
struct State {
    submissions: BTreeMap<SubmissionId, Submission>,
    problems: HashMap<ProblemId, Problem>,
    /// Pending submissions ordered by `(created_at, id)`.
    pending: BTreeSet<(DateTime<Utc>, SubmissionId)>,
    next_id: SubmissionId,
}

impl State {
    fn insert(&mut self, submission: Submission) {
        if let Some(old) = self.submissions.get(&submission.id) {
            self.pending.remove(&(old.created_at, old.id));
        }
        if submission.status == SubmissionStatus::Pending {
            self.pending.insert((submission.created_at, submission.id));
        }
        self.next_id = self.next_id.max(submission.id + 1);
        self.submissions.insert(submission.id, submission);
    }
}

/// A submission store held in process memory.
///
/// Every operation runs under one exclusive lock, which makes claim-and-mark
/// a single transaction.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> MemoryQueue {
        MemoryQueue {
            state: Mutex::new(State {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    pub fn from_seed(seed: Seed) -> MemoryQueue {
        let queue = MemoryQueue::new();
        {
            let mut state = queue.state.lock().unwrap_or_else(|e| e.into_inner());
            for problem in seed.problems {
                state.problems.insert(problem.id, problem);
            }
            for submission in seed.submissions {
                state.insert(submission);
            }
        }
        queue
    }

    pub async fn load_seed(path: &Path) -> anyhow::Result<MemoryQueue> {
        use anyhow::Context;
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading seed file {}", path.display()))?;
        let seed = serde_json::from_slice::<Seed>(&data)
            .with_context(|| format!("parsing seed file {}", path.display()))?;
        tracing::info!(
            problems = seed.problems.len(),
            submissions = seed.submissions.len(),
            "Loaded seed file"
        );
        Ok(MemoryQueue::from_seed(seed))
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueErr> {
        self.state
            .lock()
            .map_err(|_| QueueErr::Unavailable("submission store lock poisoned".into()))
    }

    /// Append a new `pending` submission with the next free id.
    pub fn enqueue(&self, new: NewSubmission) -> Result<Submission, QueueErr> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let submission = Submission {
            id: state.next_id,
            user_id: new.user_id,
            problem_id: new.problem_id,
            code: new.code,
            status: SubmissionStatus::Pending,
            result: None,
            execution_time: 0,
            memory_used: 0,
            error_message: String::new(),
            created_at: now,
            updated_at: now,
        };
        state.insert(submission.clone());
        Ok(submission)
    }

    pub fn has_problem(&self, id: ProblemId) -> Result<bool, QueueErr> {
        Ok(self.lock()?.problems.contains_key(&id))
    }

    pub fn pending_count(&self) -> Result<usize, QueueErr> {
        Ok(self.lock()?.pending.len())
    }

    pub fn submissions(&self) -> Result<Vec<Submission>, QueueErr> {
        Ok(self.lock()?.submissions.values().cloned().collect())
    }
}

#[async_trait]
impl SubmissionQueue for MemoryQueue {
    async fn claim_next(&self) -> Result<Option<Submission>, QueueErr> {
        let mut state = self.lock()?;
        let key = match state.pending.iter().next() {
            Some(&key) => key,
            None => return Ok(None),
        };
        state.pending.remove(&key);
        let id = key.1;

        let submission = state
            .submissions
            .get_mut(&id)
            .ok_or(QueueErr::NotFound(id))?;
        submission.status = SubmissionStatus::Processing;
        submission.updated_at = Utc::now();
        Ok(Some(submission.clone()))
    }

    async fn complete(
        &self,
        id: SubmissionId,
        result: &JudgeResult,
    ) -> Result<Submission, QueueErr> {
        if !result.status.is_terminal() {
            return Err(QueueErr::NotTerminal(result.status));
        }
        let mut state = self.lock()?;
        let submission = state.submissions.get_mut(&id).ok_or(QueueErr::NotFound(id))?;
        let was_pending = submission.status == SubmissionStatus::Pending;
        let created_at = submission.created_at;
        if submission.status.is_terminal() && submission.status != result.status {
            tracing::warn!(
                submission_id = id,
                from = %submission.status,
                to = %result.status,
                "Overwriting terminal status"
            );
        }
        submission.apply_result(result, Utc::now());
        let submission = submission.clone();
        if was_pending {
            state.pending.remove(&(created_at, id));
        }
        Ok(submission)
    }

    async fn get(&self, id: SubmissionId) -> Result<Option<Submission>, QueueErr> {
        Ok(self.lock()?.submissions.get(&id).cloned())
    }

    async fn problem(&self, id: ProblemId) -> Result<Option<Problem>, QueueErr> {
        Ok(self.lock()?.problems.get(&id).cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Verdict;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn problem() -> Problem {
        Problem {
            id: 1,
            title: "echo".into(),
            time_limit: 1000,
            memory_limit: 64,
            input: "42\n".into(),
            output: "42\n".into(),
            status: Default::default(),
        }
    }

    fn submission_at(id: SubmissionId, secs: i64) -> Submission {
        let at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        Submission {
            id,
            user_id: 1,
            problem_id: 1,
            code: format!("// {}", id),
            status: SubmissionStatus::Pending,
            result: None,
            execution_time: 0,
            memory_used: 0,
            error_message: String::new(),
            created_at: at,
            updated_at: at,
        }
    }

    fn accepted() -> JudgeResult {
        JudgeResult {
            status: SubmissionStatus::Accepted,
            result: Some(Verdict::Ok),
            execution_time: 12,
            memory_used: 3,
            error_message: String::new(),
        }
    }

    #[tokio::test]
    async fn test_claims_oldest_first() {
        let queue = MemoryQueue::from_seed(Seed {
            problems: vec![problem()],
            submissions: vec![
                submission_at(1, 30),
                submission_at(2, 10),
                submission_at(3, 20),
            ],
        });

        let mut order = vec![];
        while let Some(s) = queue.claim_next().await.unwrap() {
            assert_eq!(s.status, SubmissionStatus::Processing);
            order.push(s.id);
        }
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn test_equal_timestamps_break_ties_by_id() {
        let queue = MemoryQueue::from_seed(Seed {
            problems: vec![],
            submissions: vec![submission_at(9, 0), submission_at(4, 0), submission_at(6, 0)],
        });
        let first = queue.claim_next().await.unwrap().unwrap();
        let second = queue.claim_next().await.unwrap().unwrap();
        assert_eq!((first.id, second.id), (4, 6));
    }

    #[tokio::test]
    async fn test_empty_backlog_is_not_an_error() {
        let queue = MemoryQueue::new();
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claimed_and_terminal_submissions_are_skipped() {
        let mut done = submission_at(1, 0);
        done.status = SubmissionStatus::Rejected;
        let queue = MemoryQueue::from_seed(Seed {
            problems: vec![],
            submissions: vec![done, submission_at(2, 5)],
        });
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, 2);
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_terminal_write_is_idempotent() {
        let queue = MemoryQueue::from_seed(Seed {
            problems: vec![problem()],
            submissions: vec![submission_at(1, 0)],
        });
        queue.claim_next().await.unwrap();

        let once = queue.complete(1, &accepted()).await.unwrap();
        let twice = queue.complete(1, &accepted()).await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(queue.get(1).await.unwrap().unwrap(), once);
        assert_eq!(once.result, Some(Verdict::Ok));
    }

    #[tokio::test]
    async fn test_non_terminal_write_is_refused() {
        let queue = MemoryQueue::from_seed(Seed {
            problems: vec![],
            submissions: vec![submission_at(1, 0)],
        });
        let mut result = accepted();
        result.status = SubmissionStatus::Pending;
        assert!(matches!(
            queue.complete(1, &result).await,
            Err(QueueErr::NotTerminal(SubmissionStatus::Pending))
        ));
        assert!(matches!(
            queue.complete(99, &accepted()).await,
            Err(QueueErr::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_terminal_write_on_pending_removes_it_from_backlog() {
        let queue = MemoryQueue::from_seed(Seed {
            problems: vec![],
            submissions: vec![submission_at(1, 0)],
        });
        queue.complete(1, &JudgeResult::error("boom")).await.unwrap();
        assert_eq!(queue.pending_count().unwrap(), 0);
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_assigns_increasing_ids() {
        let queue = MemoryQueue::from_seed(Seed {
            problems: vec![problem()],
            submissions: vec![submission_at(5, 0)],
        });
        let a = queue
            .enqueue(NewSubmission {
                user_id: 2,
                problem_id: 1,
                code: "a".into(),
            })
            .unwrap();
        let b = queue
            .enqueue(NewSubmission {
                user_id: 2,
                problem_id: 1,
                code: "b".into(),
            })
            .unwrap();
        assert_eq!((a.id, b.id), (6, 7));
        assert_eq!(queue.pending_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_claim_job_closes_submissions_without_problem() {
        let mut orphan = submission_at(1, 0);
        orphan.problem_id = 404;
        let queue = MemoryQueue::from_seed(Seed {
            problems: vec![problem()],
            submissions: vec![orphan, submission_at(2, 1)],
        });

        assert!(crate::queue::claim_job(&queue).await.unwrap().is_none());
        let orphan = queue.get(1).await.unwrap().unwrap();
        assert_eq!(orphan.status, SubmissionStatus::Error);

        let job = crate::queue::claim_job(&queue).await.unwrap().unwrap();
        assert_eq!(job.submission.id, 2);
        assert_eq!(job.problem.id, 1);
    }
}

use std::{
    borrow::Cow,
    collections::HashMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::{
    model::{Problem, Submission, SubmissionId, SubmissionStatus},
    sandbox::{ExecutionOutcome, Reclaimer, Sandbox, SandboxErr, WorkArea},
    util::AsyncTeardown,
};

#[derive(Debug, Clone)]
enum Action {
    Finish,
    Fail(String),
    Hang,
}

#[derive(Debug, Clone)]
struct Behavior {
    action: Action,
    outcome: ExecutionOutcome,
    delay: Duration,
    ignores_deadline: bool,
}

/// A sandbox that answers by source code instead of running anything.
///
/// Every run still allocates a real work area under `work_root`, so tests
/// can observe when areas are released.
pub struct MockSandbox {
    behaviors: HashMap<String, Behavior>,
    work_root: PathBuf,
    reclaimer: Reclaimer,
    grace: Duration,
    runs: AtomicUsize,
}

impl MockSandbox {
    pub fn new(work_root: &Path) -> MockSandbox {
        MockSandbox {
            behaviors: HashMap::new(),
            work_root: work_root.to_owned(),
            reclaimer: Reclaimer::new(),
            grace: Duration::from_millis(50),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn when(&mut self, code: impl Into<String>) -> MockBehaviorBuilder<'_> {
        MockBehaviorBuilder {
            sandbox: self,
            code: code.into(),
            behavior: Behavior {
                action: Action::Finish,
                outcome: ExecutionOutcome::default(),
                delay: Duration::ZERO,
                ignores_deadline: false,
            },
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Work areas currently present on disk.
    pub fn live_areas(&self) -> usize {
        std::fs::read_dir(&self.work_root)
            .map(|d| d.count())
            .unwrap_or(0)
    }
}

pub struct MockBehaviorBuilder<'a> {
    sandbox: &'a mut MockSandbox,
    code: String,
    behavior: Behavior,
}

impl<'a> MockBehaviorBuilder<'a> {
    pub fn returns(mut self, exit_code: i64) -> Self {
        self.behavior.outcome.exit_code = exit_code;
        self
    }

    pub fn stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.behavior.outcome.stdout = stdout.into();
        self
    }

    pub fn stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.behavior.outcome.stderr = stderr.into();
        self
    }

    pub fn peak_memory(mut self, bytes: u64) -> Self {
        self.behavior.outcome.peak_memory = Some(bytes);
        self
    }

    /// Take `delay` before answering. Runs longer than the time limit plus
    /// grace are cut off and reported as timed out, like the real thing.
    pub fn takes(mut self, delay: Duration) -> Self {
        self.behavior.delay = delay;
        self
    }

    /// Sleep the full delay regardless of the time limit.
    pub fn ignores_deadline(mut self) -> Self {
        self.behavior.ignores_deadline = true;
        self
    }

    pub fn hangs(mut self) -> Self {
        self.behavior.action = Action::Hang;
        self
    }

    pub fn fails(mut self, message: impl Into<String>) -> Self {
        self.behavior.action = Action::Fail(message.into());
        self
    }

    pub fn finish(self) {
        self.sandbox.behaviors.insert(self.code, self.behavior);
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn name(&self) -> Cow<'static, str> {
        "mock".into()
    }

    async fn run(&self, code: &str, problem: &Problem) -> Result<ExecutionOutcome, SandboxErr> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .get(code)
            .cloned()
            .unwrap_or_else(|| panic!("No mock behavior for {:?}", code));

        let mut area =
            WorkArea::create(&self.work_root, self.reclaimer.clone(), "main.go", code, problem)
                .await?;

        let res = match behavior.action {
            Action::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            Action::Fail(msg) => Err(SandboxErr::CreateContainer(msg)),
            Action::Finish => {
                let deadline = Duration::from_millis(problem.time_limit) + self.grace;
                let mut outcome = behavior.outcome;
                if behavior.delay > deadline && !behavior.ignores_deadline {
                    tokio::time::sleep(deadline).await;
                    outcome.timed_out = true;
                    outcome.duration = deadline;
                } else {
                    tokio::time::sleep(behavior.delay).await;
                    outcome.duration = behavior.delay;
                }
                Ok(outcome)
            }
        };

        area.teardown().await;
        res
    }

    async fn reclaim(&self) -> usize {
        self.reclaimer.sweep().await
    }
}

pub fn problem(id: u64, time_limit: u64, output: &str) -> Problem {
    Problem {
        id,
        title: format!("problem {}", id),
        time_limit,
        memory_limit: 64,
        input: "".into(),
        output: output.into(),
        status: Default::default(),
    }
}

pub fn pending_submission(id: SubmissionId, problem_id: u64, code: &str) -> Submission {
    let at = Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap();
    Submission {
        id,
        user_id: 1,
        problem_id,
        code: code.into(),
        status: SubmissionStatus::Pending,
        result: None,
        execution_time: 0,
        memory_used: 0,
        error_message: String::new(),
        created_at: at,
        updated_at: at,
    }
}

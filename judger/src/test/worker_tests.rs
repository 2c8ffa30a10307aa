//! Tests to verify that [`crate::worker::Worker`] cycles behave correctly.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use test_env_log::test;

use super::util::{pending_submission, problem, MockSandbox};
use crate::{
    client::{
        config::{ClientConfig, DockerConfig},
        JobSource, LocalSource, TransportErr,
    },
    model::{Job, JudgeResult, Problem, SubmissionId, SubmissionStatus, Verdict, PROCESSING_TIMED_OUT},
    prelude::CancellationTokenHandle,
    queue::{MemoryQueue, Seed, SubmissionQueue},
    sandbox::Sandbox,
    worker::{CycleOutcome, Worker},
};

fn cfg(tasks: usize) -> Arc<ClientConfig> {
    Arc::new(ClientConfig {
        max_concurrent_tasks: tasks,
        poll_interval_ms: 10,
        retry_interval_ms: 10,
        report_retries: 2,
        supervisor_multiplier: 1.0,
        supervisor_margin_ms: 100,
        docker_config: Arc::new(DockerConfig {
            grace_ms: 50,
            ..Default::default()
        }),
        ..Default::default()
    })
}

struct Fixture {
    queue: Arc<MemoryQueue>,
    sandbox: Arc<MockSandbox>,
    worker: Arc<Worker>,
    shutdown: CancellationTokenHandle,
    _dir: tempfile::TempDir,
}

fn fixture(
    problems: Vec<Problem>,
    codes: &[&str],
    tasks: usize,
    mock: impl FnOnce(&mut MockSandbox),
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut sandbox = MockSandbox::new(dir.path());
    mock(&mut sandbox);
    let sandbox = Arc::new(sandbox);

    let problem_id = problems.first().map_or(1, |p| p.id);
    let queue = Arc::new(MemoryQueue::from_seed(Seed {
        problems,
        submissions: codes
            .iter()
            .enumerate()
            .map(|(i, code)| pending_submission(i as u64 + 1, problem_id, code))
            .collect(),
    }));
    let shutdown = CancellationTokenHandle::new();
    let worker = Arc::new(Worker::new(
        Arc::new(LocalSource::new(queue.clone())),
        sandbox.clone(),
        cfg(tasks),
        shutdown.clone(),
    ));
    Fixture {
        queue,
        sandbox,
        worker,
        shutdown,
        _dir: dir,
    }
}

#[test(tokio::test)]
async fn test_accepted() {
    let f = fixture(vec![problem(1, 1000, "42\n")], &["ok"], 1, |m| {
        m.when("ok")
            .returns(0)
            .stdout("42\n")
            .peak_memory(3 * 1024 * 1024)
            .takes(Duration::from_millis(5))
            .finish()
    });

    assert_eq!(f.worker.run_cycle().await, CycleOutcome::Reported);
    let s = f.queue.get(1).await.unwrap().unwrap();
    assert_eq!(s.status, SubmissionStatus::Accepted);
    assert_eq!(s.result, Some(Verdict::Ok));
    assert_eq!(s.memory_used, 3);
    assert!(s.execution_time >= 5);
    assert!(f.worker.guard().is_empty());
    assert_eq!(f.sandbox.live_areas(), 0);
}

#[test(tokio::test)]
async fn test_idle_on_empty_backlog() {
    let f = fixture(vec![problem(1, 1000, "")], &[], 1, |_| {});
    assert_eq!(f.worker.run_cycle().await, CycleOutcome::Idle);
    assert_eq!(f.sandbox.runs(), 0);
}

#[test(tokio::test)]
async fn test_verdicts_flow_into_the_record() {
    let f = fixture(
        vec![problem(1, 1000, "42\n")],
        &["wrong", "crash", "warn"],
        1,
        |m| {
            m.when("wrong").returns(0).stdout("41\n").finish();
            m.when("crash").returns(2).stderr("panic: x").finish();
            m.when("warn").returns(0).stderr("warning: y").finish();
        },
    );
    for _ in 0..3 {
        assert_eq!(f.worker.run_cycle().await, CycleOutcome::Reported);
    }

    let expect = [
        (1, Verdict::WrongAnswer, "Output does not match expected output"),
        (2, Verdict::RuntimeError, "panic: x"),
        (3, Verdict::CompileError, "warning: y"),
    ];
    for (id, verdict, message) in expect {
        let s = f.queue.get(id).await.unwrap().unwrap();
        assert_eq!(s.status, SubmissionStatus::Rejected);
        assert_eq!(s.result, Some(verdict));
        assert_eq!(s.error_message, message);
    }
}

#[test(tokio::test)]
async fn test_sleeping_past_the_limit_is_time_limit() {
    let f = fixture(vec![problem(1, 100, "42\n")], &["sleepy"], 1, |m| {
        m.when("sleepy")
            .stdout("42\n")
            .takes(Duration::from_secs(30))
            .finish()
    });

    let started = Instant::now();
    assert_eq!(f.worker.run_cycle().await, CycleOutcome::Reported);
    // time limit + grace, with slack for the scheduler
    assert!(started.elapsed() < Duration::from_millis(100 + 50 + 500));

    let s = f.queue.get(1).await.unwrap().unwrap();
    assert_eq!(s.status, SubmissionStatus::Rejected);
    assert_eq!(s.result, Some(Verdict::TimeLimitExceeded));
    assert_eq!(s.error_message, "Time limit exceeded");
}

#[test(tokio::test)]
async fn test_hanging_execution_is_abandoned() {
    let f = fixture(vec![problem(1, 50, "")], &["hang"], 1, |m| {
        m.when("hang").hangs().finish()
    });

    let started = Instant::now();
    assert_eq!(f.worker.run_cycle().await, CycleOutcome::Reported);
    let bound = f.worker_cfg_deadline(50);
    assert!(started.elapsed() >= bound);
    assert!(started.elapsed() < bound + Duration::from_millis(500));

    let s = f.queue.get(1).await.unwrap().unwrap();
    assert_eq!(s.status, SubmissionStatus::Error);
    assert_eq!(s.result, None);
    assert_eq!(s.error_message, PROCESSING_TIMED_OUT);
    assert!(!f.worker.guard().contains(1));

    assert_eq!(f.sandbox.live_areas(), 1);
    assert_eq!(f.sandbox.reclaim().await, 1);
    assert_eq!(f.sandbox.live_areas(), 0);
}

#[test(tokio::test)]
async fn test_abandoned_execution_never_reports() {
    let f = fixture(vec![problem(1, 50, "42\n")], &["slow"], 1, |m| {
        m.when("slow")
            .stdout("42\n")
            .takes(Duration::from_millis(600))
            .ignores_deadline()
            .finish()
    });

    assert_eq!(f.worker.run_cycle().await, CycleOutcome::Reported);
    let s = f.queue.get(1).await.unwrap().unwrap();
    assert_eq!(s.error_message, PROCESSING_TIMED_OUT);
    assert!(f.worker.guard().is_empty());
    assert_eq!(f.sandbox.reclaim().await, 1);
    assert_eq!(f.sandbox.live_areas(), 0);

    tokio::time::sleep(Duration::from_millis(800)).await;
    let later = f.queue.get(1).await.unwrap().unwrap();
    assert_eq!(later, s);
}

#[test(tokio::test)]
async fn test_sandbox_failure_is_error() {
    let f = fixture(vec![problem(1, 1000, "")], &["broken"], 1, |m| {
        m.when("broken").fails("docker is gone").finish()
    });

    assert_eq!(f.worker.run_cycle().await, CycleOutcome::Reported);
    let s = f.queue.get(1).await.unwrap().unwrap();
    assert_eq!(s.status, SubmissionStatus::Error);
    assert_eq!(s.error_message, "Failed to create container: docker is gone");
    assert_eq!(f.sandbox.live_areas(), 0);
}

#[test(tokio::test)]
async fn test_in_flight_submission_is_skipped() {
    let f = fixture(vec![problem(1, 1000, "")], &["ok"], 1, |m| {
        m.when("ok").finish()
    });

    let _held = f.worker.guard().try_acquire(1).unwrap();
    assert_eq!(f.worker.run_cycle().await, CycleOutcome::Skipped);
    assert_eq!(f.sandbox.runs(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_judge_everything_once() {
    const N: usize = 40;
    let codes = vec!["ok"; N];
    let f = fixture(vec![problem(1, 1000, "42\n")], &codes, 4, |m| {
        m.when("ok")
            .stdout("42\n")
            .takes(Duration::from_millis(10))
            .finish()
    });

    let running = tokio::spawn(f.worker.clone().run());
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let done = f
            .queue
            .submissions()
            .unwrap()
            .iter()
            .filter(|s| s.status.is_terminal())
            .count();
        if done == N {
            break;
        }
        assert!(Instant::now() < deadline, "only {} of {} judged", done, N);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    f.shutdown.cancel();
    running.await.unwrap().unwrap();

    assert_eq!(f.sandbox.runs(), N);
    for s in f.queue.submissions().unwrap() {
        assert_eq!(s.status, SubmissionStatus::Accepted);
    }
}

/// Claims from a queue, but the results never arrive.
struct LossySource {
    inner: LocalSource,
    reports: AtomicUsize,
}

#[async_trait]
impl JobSource for LossySource {
    async fn fetch_next(&self) -> Result<Option<Job>, TransportErr> {
        self.inner.fetch_next().await
    }

    async fn report(&self, _id: SubmissionId, _result: &JudgeResult) -> Result<(), TransportErr> {
        self.reports.fetch_add(1, Ordering::SeqCst);
        Err(TransportErr::Status {
            status: 503,
            body: "unavailable".into(),
        })
    }
}

#[test(tokio::test)]
async fn test_failed_report_is_retried_then_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let mut sandbox = MockSandbox::new(dir.path());
    sandbox.when("ok").finish();
    let queue = Arc::new(MemoryQueue::from_seed(Seed {
        problems: vec![problem(1, 1000, "")],
        submissions: vec![pending_submission(1, 1, "ok")],
    }));
    let source = Arc::new(LossySource {
        inner: LocalSource::new(queue.clone()),
        reports: AtomicUsize::new(0),
    });
    let worker = Worker::new(
        source.clone(),
        Arc::new(sandbox),
        cfg(1),
        CancellationTokenHandle::new(),
    );

    assert_eq!(worker.run_cycle().await, CycleOutcome::ReportFailed);
    assert_eq!(source.reports.load(Ordering::SeqCst), 3);
    let s = queue.get(1).await.unwrap().unwrap();
    assert_eq!(s.status, SubmissionStatus::Processing);
    assert!(worker.guard().is_empty());
}

impl Fixture {
    fn worker_cfg_deadline(&self, time_limit: u64) -> Duration {
        cfg(1).supervisor_deadline(time_limit)
    }
}

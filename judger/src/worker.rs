//! The judging loop: claim, execute, report.

use std::sync::Arc;

use anyhow::Context;
use tracing::info_span;
use tracing_futures::Instrument;

use crate::{
    client::{config::ClientConfig, JobSource},
    evaluator::evaluate,
    model::{Job, JudgeResult, SubmissionId, PROCESSING_TIMED_OUT},
    prelude::*,
    queue::ClaimGuard,
    sandbox::Sandbox,
};

/// How a single cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The backlog was empty.
    Idle,
    /// Claiming failed; nothing was claimed as far as this worker knows.
    ClaimFailed,
    /// The claimed submission is already being handled in this process.
    Skipped,
    Reported,
    /// A result was produced but could not be written back.
    ReportFailed,
}

pub struct Worker {
    source: Arc<dyn JobSource>,
    sandbox: Arc<dyn Sandbox>,
    guard: ClaimGuard,
    cfg: Arc<ClientConfig>,
    shutdown: CancellationTokenHandle,
}

impl Worker {
    pub fn new(
        source: Arc<dyn JobSource>,
        sandbox: Arc<dyn Sandbox>,
        cfg: Arc<ClientConfig>,
        shutdown: CancellationTokenHandle,
    ) -> Worker {
        Worker {
            source,
            sandbox,
            guard: ClaimGuard::new(),
            cfg,
            shutdown,
        }
    }

    pub fn guard(&self) -> &ClaimGuard {
        &self.guard
    }

    /// Prepare the sandbox, then run `max_concurrent_tasks` cycle loops
    /// until shutdown is requested. In-flight cycles are allowed to finish.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.sandbox
            .prepare()
            .await
            .with_context(|| format!("preparing sandbox {}", self.sandbox.name()))?;

        tracing::info!(
            "Worker started with {} concurrent tasks on {}",
            self.cfg.max_concurrent_tasks,
            self.sandbox.name()
        );
        let loops = (0..self.cfg.max_concurrent_tasks).map(|i| {
            let worker = self.clone();
            tokio::spawn(
                async move { worker.run_loop().await }.instrument(info_span!("task", id = i)),
            )
        });
        for res in futures::future::join_all(loops).await {
            if let Err(e) = res {
                tracing::error!("Worker task failed: {}", e);
            }
        }
        self.sandbox.reclaim().await;
        tracing::info!("Worker stopped");
        Ok(())
    }

    async fn run_loop(&self) {
        while !self.shutdown.is_cancelled() {
            let pause = match self.run_cycle().await {
                CycleOutcome::Reported | CycleOutcome::ReportFailed => {
                    self.sandbox.reclaim().await;
                    continue;
                }
                CycleOutcome::Idle | CycleOutcome::Skipped => self.cfg.poll_interval(),
                CycleOutcome::ClaimFailed => self.cfg.retry_interval(),
            };
            tokio::time::sleep(pause)
                .with_cancel(self.shutdown.cancelled())
                .await;
        }
    }

    /// Run one `claim -> execute -> report` cycle.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let job = match self.source.fetch_next().await {
            Ok(Some(job)) => job,
            Ok(None) => return CycleOutcome::Idle,
            Err(e) => {
                tracing::warn!("Failed to claim a submission: {}", e);
                return CycleOutcome::ClaimFailed;
            }
        };

        let id = job.submission.id;
        let ticket = match self.guard.try_acquire(id) {
            Some(t) => t,
            None => {
                tracing::warn!(submission_id = id, "Submission already in flight, skipping");
                return CycleOutcome::Skipped;
            }
        };

        let span = info_span!("judge", submission_id = id, problem_id = job.problem.id);
        async move {
            tracing::info!("Claimed submission");
            let result = self.supervise(job).await;
            let reported = self.report(id, &result).await;
            ticket.release();
            if reported {
                CycleOutcome::Reported
            } else {
                CycleOutcome::ReportFailed
            }
        }
        .instrument(span)
        .await
    }

    /// Execute `job` on its own task under the supervisory deadline. An
    /// execution that outlives the deadline is aborted; whatever it held is
    /// dropped and left to [`Sandbox::reclaim`].
    async fn supervise(&self, job: Job) -> JudgeResult {
        let deadline = self.cfg.supervisor_deadline(job.problem.time_limit);
        let sandbox = self.sandbox.clone();
        let mut handle = tokio::spawn(
            async move { execute(&*sandbox, &job).await }.instrument(tracing::Span::current()),
        );

        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!("Execution task failed: {}", e);
                JudgeResult::error(format!("Execution task failed: {}", e))
            }
            Err(_) => {
                tracing::warn!("No result within {:?}, abandoning execution", deadline);
                handle.abort();
                match handle.await {
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => tracing::error!("Abandoned execution failed: {}", e),
                    Ok(_) => tracing::debug!("Abandoned execution finished late, result dropped"),
                }
                JudgeResult::error(PROCESSING_TIMED_OUT)
            }
        }
    }

    /// Write `result`, retrying up to `report_retries` times.
    async fn report(&self, id: SubmissionId, result: &JudgeResult) -> bool {
        let retries = self.cfg.report_retries;
        for attempt in 0..=retries {
            match self.source.report(id, result).await {
                Ok(()) => {
                    tracing::info!(status = %result.status, "Reported result");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(attempt, "Failed to report result: {}", e);
                    if attempt < retries {
                        tokio::time::sleep(self.cfg.retry_interval()).await;
                    }
                }
            }
        }
        tracing::error!(
            "Giving up reporting after {} attempts; submission stays processing",
            retries + 1
        );
        false
    }
}

/// Run and evaluate one job. Sandbox failures become `error` results.
pub async fn execute(sandbox: &dyn Sandbox, job: &Job) -> JudgeResult {
    match sandbox.run(&job.submission.code, &job.problem).await {
        Ok(outcome) => {
            let evaluation = evaluate(&outcome, &job.problem);
            tracing::info!(
                verdict = %evaluation.verdict,
                time_ms = outcome.duration.as_millis() as u64,
                "Evaluated"
            );
            evaluation.into_result(&outcome)
        }
        Err(e) => {
            tracing::error!("Sandbox failure: {}", e);
            JudgeResult::error(e.to_string())
        }
    }
}

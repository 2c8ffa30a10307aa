use anyhow::Context;
use clap::Parser;
use codejudge_judger::{
    client::{config::ClientConfig, HttpTransport, LocalSource},
    config::{load_toml, ServerConfig},
    model::{Job, Problem, Submission, SubmissionStatus},
    prelude::CancellationTokenHandle,
    queue::MemoryQueue,
    sandbox::{DockerSandbox, Sandbox},
    server::{self, AppState},
    worker::{execute, Worker},
};
use once_cell::sync::Lazy;
use std::{
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing_subscriber::EnvFilter;

mod opt;

static CTRL_C: AtomicBool = AtomicBool::new(false);
static CTRL_C_TWICE: AtomicBool = AtomicBool::new(false);
static SHUTDOWN: Lazy<CancellationTokenHandle> = Lazy::new(CancellationTokenHandle::new);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = opt::Opts::parse();
    init_logging()?;

    ctrlc::set_handler(handle_ctrl_c).context("Failed to set termination handler")?;

    match opt.cmd {
        opt::SubCmd::Work(cmd) => work(cmd).await,
        opt::SubCmd::Serve(cmd) => serve(cmd).await,
        opt::SubCmd::Run(cmd) => run(cmd).await,
    }
}

fn init_logging() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logger")?;
    tracing_log::LogTracer::init().context("Failed to bridge log records")?;
    Ok(())
}

async fn work(cmd: opt::WorkSubCmd) -> anyhow::Result<()> {
    let mut cfg: ClientConfig = load_toml(cmd.config.as_deref()).await?;
    cfg.host = cmd.host;
    cfg.ssl |= cmd.ssl;
    if let Some(token) = cmd.token {
        cfg.access_token = Some(token);
    }
    if let Some(folder) = cmd.cache_folder {
        cfg.cache_folder = folder;
    }
    if let Some(n) = cmd.concurrency {
        cfg.max_concurrent_tasks = n;
    }
    cfg.validate()?;
    let cfg = Arc::new(cfg);

    tracing::info!("Working for {}", cfg.host);
    let transport = HttpTransport::new(cfg.clone())?;
    let sandbox = DockerSandbox::connect(cfg.docker_config.clone(), &cfg.work_folder_root())?;
    let worker = Arc::new(Worker::new(
        Arc::new(transport),
        Arc::new(sandbox),
        cfg,
        SHUTDOWN.clone(),
    ));
    worker.run().await
}

async fn serve(cmd: opt::ServeSubCmd) -> anyhow::Result<()> {
    let mut cfg: ServerConfig = load_toml(cmd.config.as_deref()).await?;
    if let Some(bind) = cmd.bind {
        cfg.bind = bind;
    }
    if let Some(token) = cmd.token {
        cfg.api_token = Some(token);
    }
    if let Some(seed) = cmd.seed {
        cfg.seed = Some(seed);
    }
    if let Some(n) = cmd.workers {
        cfg.workers = n;
    }
    cfg.allow_any_network |= cmd.allow_any_network;
    cfg.validate()?;

    let queue = match &cfg.seed {
        Some(path) => MemoryQueue::load_seed(path).await?,
        None => MemoryQueue::new(),
    };
    let queue = Arc::new(queue);
    let state = Arc::new(AppState {
        queue: queue.clone(),
        api_token: cfg.api_token.clone().unwrap_or_default(),
        allow_any_network: cfg.allow_any_network,
    });

    let (addr, serving) = server::bind(cfg.bind, state, SHUTDOWN.clone())
        .with_context(|| format!("Failed to bind {}", cfg.bind))?;
    let serving = tokio::spawn(serving);
    tracing::info!("Serving on {}", addr);

    if cfg.workers > 0 {
        let mut worker_cfg: ClientConfig = load_toml(cmd.worker_config.as_deref()).await?;
        worker_cfg.max_concurrent_tasks = cfg.workers;
        worker_cfg.validate()?;
        let worker_cfg = Arc::new(worker_cfg);

        let sandbox = DockerSandbox::connect(
            worker_cfg.docker_config.clone(),
            &worker_cfg.work_folder_root(),
        )?;
        let worker = Arc::new(Worker::new(
            Arc::new(LocalSource::new(queue)),
            Arc::new(sandbox),
            worker_cfg,
            SHUTDOWN.clone(),
        ));
        worker.run().await?;
    }

    serving.await??;
    Ok(())
}

async fn run(cmd: opt::RunSubCmd) -> anyhow::Result<()> {
    let cfg: ClientConfig = load_toml(cmd.config.as_deref()).await?;
    let code = tokio::fs::read_to_string(&cmd.source)
        .await
        .with_context(|| format!("Failed to read {}", cmd.source.display()))?;
    let problem = tokio::fs::read(&cmd.problem)
        .await
        .with_context(|| format!("Failed to read {}", cmd.problem.display()))?;
    let problem: Problem = serde_json::from_slice(&problem)
        .with_context(|| format!("Failed to parse {}", cmd.problem.display()))?;

    let sandbox = DockerSandbox::connect(cfg.docker_config.clone(), &cfg.work_folder_root())?;
    sandbox.prepare().await?;

    let now = chrono::Utc::now();
    let job = Job {
        submission: Submission {
            id: 0,
            user_id: 0,
            problem_id: problem.id,
            code,
            status: SubmissionStatus::Processing,
            result: None,
            execution_time: 0,
            memory_used: 0,
            error_message: String::new(),
            created_at: now,
            updated_at: now,
        },
        problem,
    };
    let result = execute(&sandbox, &job).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn handle_ctrl_c() {
    if !CTRL_C.load(Ordering::SeqCst) {
        tracing::warn!("Waiting for existing jobs to complete... Press Ctrl-C again to force quit.");
        CTRL_C.store(true, Ordering::SeqCst);
        SHUTDOWN.cancel();
    } else if !CTRL_C_TWICE.load(Ordering::SeqCst) {
        tracing::error!("Force quit!");
        CTRL_C_TWICE.store(true, Ordering::SeqCst);
        exit(101);
    }
}

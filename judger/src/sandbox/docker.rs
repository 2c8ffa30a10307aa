use std::{
    borrow::Cow,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bollard::{image::CreateImageOptions, Docker};
use tokio_stream::StreamExt;

use super::{
    container::{reclaim_containers, Container, CreateContainerConfig, CreateContainerConfigBuilder},
    workspace::{reclaim_stale, Reclaimer, WorkArea, ERROR_FILE, INPUT_FILE, OUTPUT_FILE},
    ExecutionOutcome, Sandbox, SandboxErr,
};
use crate::{client::config::DockerConfig, model::Problem, util::AsyncTeardown};

/// Runs every submission in a fresh, network-less container.
pub struct DockerSandbox {
    docker: Docker,
    cfg: Arc<DockerConfig>,
    work_root: PathBuf,
    reclaimer: Reclaimer,
}

impl DockerSandbox {
    pub fn new(docker: Docker, cfg: Arc<DockerConfig>, work_root: PathBuf) -> DockerSandbox {
        DockerSandbox {
            docker,
            cfg,
            work_root,
            reclaimer: Reclaimer::new(),
        }
    }

    /// Connect to the local docker daemon. `work_root` is made absolute so
    /// it can be bind-mounted.
    pub fn connect(cfg: Arc<DockerConfig>, work_root: &Path) -> anyhow::Result<DockerSandbox> {
        use anyhow::Context;
        let docker = Docker::connect_with_local_defaults().context("connecting to docker")?;
        let work_root = if work_root.is_absolute() {
            work_root.to_owned()
        } else {
            std::env::current_dir()?.join(work_root)
        };
        Ok(DockerSandbox::new(docker, cfg, work_root))
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    /// Pull the configured image unless it is already present.
    pub async fn ensure_image(&self) -> Result<(), SandboxErr> {
        let image = &self.cfg.image;
        if self.docker.inspect_image(image).await.is_ok() {
            tracing::debug!("Image {} already present", image);
            return Ok(());
        }

        tracing::info!("Pulling image {}", image);
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.as_str(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(res) = pull.next().await {
            let info = res.map_err(|e| SandboxErr::Image(image.clone(), e.to_string()))?;
            if let Some(err) = info.error {
                return Err(SandboxErr::Image(image.clone(), err));
            }
            if let Some(status) = info.status {
                tracing::trace!("pull {}: {}", image, status);
            }
        }
        tracing::info!("Pulled image {}", image);
        Ok(())
    }

    fn container_config(
        &self,
        area: &WorkArea,
        problem: &Problem,
    ) -> Result<CreateContainerConfig, SandboxErr> {
        let command = format!(
            "cd {} && {} < {} > {} 2> {}",
            super::container::MOUNT_POINT,
            self.cfg.run_command,
            INPUT_FILE,
            OUTPUT_FILE,
            ERROR_FILE
        );

        let mut builder = CreateContainerConfigBuilder::default();
        builder
            .image(self.cfg.image.clone())
            .work_dir(area.path().to_string_lossy().into_owned())
            .command(command)
            .tag_name(area.id().to_string())
            .cpu_quota(self.cfg.run_cpu_share)
            .pids_limit(self.cfg.pids_limit)
            .network_enabled(false);
        if problem.memory_limit > 0 {
            builder.mem_limit((problem.memory_limit * 1024 * 1024) as i64);
        }
        if let Some(user) = &self.cfg.docker_user {
            builder.docker_user(user.clone());
        }
        builder
            .build()
            .map_err(|e| SandboxErr::CreateContainer(e.to_string()))
    }

    async fn execute(
        &self,
        container: &Container,
        area: &WorkArea,
        problem: &Problem,
    ) -> Result<ExecutionOutcome, SandboxErr> {
        let deadline = self.cfg.run_deadline(problem.time_limit);
        container.start().await.map_err(SandboxErr::StartContainer)?;
        let started = Instant::now();
        let memory = container.watch_memory();

        let timed_out = tokio::time::timeout(deadline, container.wait())
            .await
            .is_err();
        let duration = started.elapsed();
        if timed_out {
            tracing::info!("{} ran past {:?}, killing", container.name(), deadline);
            container.kill().await;
        }
        let peak_memory = memory.finish();

        let state = container.exit_state().await.map_err(SandboxErr::Inspect)?;
        if state.running && !timed_out {
            return Err(SandboxErr::Wait(format!(
                "{} still running after wait returned",
                container.name()
            )));
        }

        let stdout = area
            .read_capped(OUTPUT_FILE, stdout_cap(self.cfg.stdout_size_limit, problem))
            .await?;
        let stderr = area
            .read_capped(ERROR_FILE, self.cfg.stderr_size_limit)
            .await?;

        Ok(ExecutionOutcome {
            exit_code: state.exit_code,
            stdout_truncated: stdout.is_oversized(),
            stdout: stdout.into_vec(),
            stderr: stderr.into_vec(),
            duration,
            peak_memory,
            timed_out,
            oom_killed: state.oom_killed,
        })
    }
}

/// Stdout is always read one byte past the expected output, so an answer
/// followed by extra bytes cannot pass as a match.
fn stdout_cap(limit: usize, problem: &Problem) -> usize {
    limit.max(problem.output.len() + 1)
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> Cow<'static, str> {
        format!("docker ({})", self.cfg.image).into()
    }

    async fn prepare(&self) -> Result<(), SandboxErr> {
        tokio::fs::create_dir_all(&self.work_root)
            .await
            .map_err(SandboxErr::WorkArea)?;
        let stale_after = Duration::from_secs(self.cfg.stale_area_secs);
        if let Err(e) = reclaim_stale(&self.work_root, stale_after).await {
            tracing::warn!("Failed to sweep {}: {}", self.work_root.display(), e);
        }
        if let Err(e) = reclaim_containers(&self.docker, stale_after).await {
            tracing::warn!("Failed to sweep stale containers: {}", e);
        }
        self.ensure_image().await
    }

    async fn run(&self, code: &str, problem: &Problem) -> Result<ExecutionOutcome, SandboxErr> {
        let mut area = WorkArea::create(
            &self.work_root,
            self.reclaimer.clone(),
            &self.cfg.source_file,
            code,
            problem,
        )
        .await?;

        let res = async {
            let cfg = self.container_config(&area, problem)?;
            let container = Container::create(self.docker.clone(), cfg)
                .await
                .map_err(|e| SandboxErr::CreateContainer(e.to_string()))?;
            tracing::debug!("Created {}", container.name());

            let res = self.execute(&container, &area, problem).await;
            container.remove().await;
            res
        }
        .await;

        area.teardown().await;
        res
    }

    async fn reclaim(&self) -> usize {
        self.reclaimer.sweep().await
    }
}

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use bollard::{
    container::{
        Config, InspectContainerOptions, KillContainerOptions, ListContainersOptions,
        RemoveContainerOptions, StatsOptions, WaitContainerOptions,
    },
    models::HostConfig,
    Docker,
};
use derive_builder::Builder;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use super::is_recoverable_error;

/// Label put on every container this crate creates.
pub const MANAGED_LABEL: &str = "codejudge.managed";

/// Where the work area is mounted inside the container.
pub const MOUNT_POINT: &str = "/app";

#[derive(Debug, Builder)]
#[builder(setter(into, strip_option))]
pub struct CreateContainerConfig {
    image: String,

    /// Host directory bind-mounted at [`MOUNT_POINT`].
    work_dir: String,

    /// Shell command run by `sh -c`.
    command: String,

    /// A tag for this container. Purely for labelling & debugging use.
    #[builder(default)]
    tag_name: Option<String>,

    /// The user to be used when running docker commands
    #[builder(default)]
    docker_user: Option<String>,

    /// The memory limit of this container, in bytes. Swap is capped to the
    /// same value.
    #[builder(default)]
    mem_limit: Option<i64>,

    /// The CPU fraction allowed to use
    #[builder(default)]
    cpu_quota: Option<f64>,

    #[builder(default)]
    pids_limit: Option<i64>,

    /// Whether network is allowed in this container
    #[builder(default = "false")]
    network_enabled: bool,
}

/// What docker knows about a container after it stopped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitState {
    pub exit_code: i64,
    pub oom_killed: bool,
    pub running: bool,
}

#[derive(Debug)]
pub struct Container {
    docker: Docker,
    id: String,
    tag: Option<String>,
    removed: bool,
}

impl Container {
    pub async fn create(
        docker: Docker,
        cfg: CreateContainerConfig,
    ) -> Result<Self, bollard::errors::Error> {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        if let Some(tag) = &cfg.tag_name {
            labels.insert(format!("{}.tag", MANAGED_LABEL), tag.clone());
        }

        let res = docker
            .create_container::<String, _>(
                None,
                Config {
                    image: Some(cfg.image),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    tty: Some(false),
                    // set docker user
                    user: cfg.docker_user,
                    labels: Some(labels),
                    working_dir: Some(MOUNT_POINT.into()),
                    cmd: Some(vec!["sh".into(), "-c".into(), cfg.command]),
                    host_config: Some(HostConfig {
                        binds: Some(vec![format!("{}:{}", cfg.work_dir, MOUNT_POINT)]),
                        network_mode: (!cfg.network_enabled).then(|| "none".to_string()),
                        // set memory limits
                        memory: cfg.mem_limit,
                        memory_swap: cfg.mem_limit,
                        pids_limit: cfg.pids_limit,
                        // set cpu limits
                        cpu_period: cfg.cpu_quota.map(|_| 100_000),
                        cpu_quota: cfg.cpu_quota.map(|x| (x * 100_000.0) as i64),
                        cap_drop: Some(vec!["ALL".into()]),
                        security_opt: Some(vec!["no-new-privileges".into()]),
                        ..Default::default()
                    }),
                    // Set network availability
                    network_disabled: Some(!cfg.network_enabled),
                    ..Default::default()
                },
            )
            .await?;
        for warning in &res.warnings {
            tracing::warn!("docker: {}", warning);
        }
        Ok(Container {
            docker,
            id: res.id,
            tag: cfg.tag_name,
            removed: false,
        })
    }

    pub fn name(&self) -> String {
        if let Some(tag) = &self.tag {
            format!("Container {} ({})", tag, self.id)
        } else {
            format!("Container {}", self.id)
        }
    }

    pub async fn start(&self) -> Result<(), bollard::errors::Error> {
        self.docker.start_container::<String>(&self.id, None).await
    }

    /// Resolve once docker reports the container as stopped. Errors on the
    /// wait stream are logged only; callers confirm the stop through
    /// [`Container::exit_state`].
    pub async fn wait(&self) {
        let mut stream = self
            .docker
            .wait_container(&self.id, None::<WaitContainerOptions<String>>);
        while let Some(item) = stream.next().await {
            match item {
                Ok(res) => {
                    tracing::trace!("{} exited with {}", self.name(), res.status_code);
                    return;
                }
                Err(e) if is_recoverable_error(&e) => continue,
                Err(e) => {
                    tracing::debug!("{} wait: {}", self.name(), e);
                    return;
                }
            }
        }
    }

    pub async fn kill(&self) {
        if let Err(e) = self
            .docker
            .kill_container(&self.id, None::<KillContainerOptions<String>>)
            .await
        {
            tracing::debug!("Failed to kill {}: {}", self.name(), e);
        }
    }

    pub async fn exit_state(&self) -> Result<ExitState, bollard::errors::Error> {
        let info = self
            .docker
            .inspect_container(&self.id, None::<InspectContainerOptions>)
            .await?;
        let state = info.state.unwrap_or_default();
        Ok(ExitState {
            exit_code: state.exit_code.unwrap_or(-1),
            oom_killed: state.oom_killed.unwrap_or(false),
            running: state.running.unwrap_or(false),
        })
    }

    /// Start sampling memory usage in the background.
    pub fn watch_memory(&self) -> MemoryWatch {
        let peak = Arc::new(AtomicU64::new(0));
        let docker = self.docker.clone();
        let id = self.id.clone();
        let task = {
            let peak = peak.clone();
            tokio::spawn(async move {
                let mut stats = docker.stats(
                    &id,
                    Some(StatsOptions {
                        stream: true,
                        one_shot: false,
                    }),
                );
                while let Some(sample) = stats.next().await {
                    let sample = match sample {
                        Ok(s) => s,
                        Err(e) if is_recoverable_error(&e) => continue,
                        Err(_) => break,
                    };
                    let mem = &sample.memory_stats;
                    if let Some(used) = mem.max_usage.or(mem.usage) {
                        peak.fetch_max(used, Ordering::Relaxed);
                    }
                }
            })
        };
        MemoryWatch { peak, task }
    }

    /// Force-remove the container. Failures are logged; the start-up sweep
    /// picks up whatever is left.
    pub async fn remove(mut self) {
        self.removed = true;
        match force_remove(&self.docker, &self.id).await {
            Ok(()) => tracing::trace!("Removed {}", self.name()),
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.name(), e),
        }
    }
}

impl Drop for Container {
    /// A container dropped before [`Container::remove`], e.g. by an aborted
    /// run, is force-removed in the background.
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let name = self.name();
        let docker = self.docker.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    match force_remove(&docker, &id).await {
                        Ok(()) => tracing::debug!("Removed dropped {}", name),
                        Err(e) => tracing::warn!("Failed to remove dropped {}: {}", name, e),
                    }
                });
            }
            Err(_) => tracing::warn!("{} dropped outside a runtime, left for the sweep", name),
        }
    }
}

async fn force_remove(docker: &Docker, id: &str) -> Result<(), bollard::errors::Error> {
    docker
        .remove_container(
            id,
            Some(RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        )
        .await
}

pub struct MemoryWatch {
    peak: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl MemoryWatch {
    /// Stop sampling and return the highest usage seen, in bytes.
    pub fn finish(self) -> Option<u64> {
        match self.peak.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }
}

impl Drop for MemoryWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Whether a container created at `created` (unix seconds) is older than
/// `older_than`. Containers without a creation time are kept.
fn created_before(created: Option<i64>, now: SystemTime, older_than: Duration) -> bool {
    let created = match created.and_then(|t| u64::try_from(t).ok()) {
        Some(t) => SystemTime::UNIX_EPOCH + Duration::from_secs(t),
        None => return false,
    };
    now.duration_since(created).map_or(false, |age| age >= older_than)
}

/// Remove stopped containers created more than `older_than` ago. Younger
/// ones may belong to another worker sharing the daemon and are left alone.
pub async fn reclaim_containers(
    docker: &Docker,
    older_than: Duration,
) -> Result<usize, bollard::errors::Error> {
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);
    filters.insert(
        "status".to_string(),
        vec!["exited".to_string(), "created".to_string(), "dead".to_string()],
    );
    let containers = docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await?;

    let now = SystemTime::now();
    let stale = containers
        .into_iter()
        .filter(|c| created_before(c.created, now, older_than))
        .filter_map(|c| c.id);

    let mut removed = 0;
    for id in stale {
        match force_remove(docker, &id).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Unable to remove stale container {}: {}", id, e),
        }
    }
    if removed > 0 {
        tracing::info!("Removed {} stale containers", removed);
    }
    Ok(removed)
}

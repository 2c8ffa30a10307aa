use crate::{config::ConfigErr, model::SubmissionId};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host (and port) of the queue owner.
    pub host: String,
    pub ssl: bool,
    pub access_token: Option<String>,
    /// Number of judging cycles this process runs side by side.
    pub max_concurrent_tasks: usize,
    /// Working areas live under `cache_folder/work`.
    pub cache_folder: PathBuf,
    /// Sleep between claim attempts, in milliseconds.
    pub poll_interval_ms: u64,
    /// Back-off after a failed claim or report, in milliseconds.
    pub retry_interval_ms: u64,
    /// Upper bound of a single HTTP request, in milliseconds.
    pub request_timeout_ms: u64,
    /// Extra attempts made when reporting a result fails.
    pub report_retries: u32,
    /// The supervisory deadline of a cycle is
    /// `time_limit * supervisor_multiplier + grace + supervisor_margin`.
    pub supervisor_multiplier: f64,
    pub supervisor_margin_ms: u64,
    #[serde(default)]
    pub docker_config: Arc<DockerConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "".into(),
            ssl: false,
            access_token: None,
            max_concurrent_tasks: 1,
            cache_folder: crate::config::default_cache_folder(),
            poll_interval_ms: 500,
            retry_interval_ms: 1000,
            request_timeout_ms: 10_000,
            report_retries: 3,
            supervisor_multiplier: 2.0,
            supervisor_margin_ms: 5000,
            docker_config: Arc::new(Default::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Image every submission runs in.
    pub image: String,
    /// File name the source payload is written to.
    pub source_file: String,
    /// Shell command that builds and runs the source inside `/app`.
    pub run_command: String,
    /// The user every docker container should run as.
    pub docker_user: Option<String>,

    /// Slack added to the problem's time limit before the run is killed, in
    /// milliseconds.
    pub grace_ms: u64,

    /// CPU share available for running use. The container may run
    /// `run_cpu_share * 100ms` in every 100ms of CPU time.
    pub run_cpu_share: f64,

    /// Maximum number of processes and threads inside the container.
    pub pids_limit: i64,

    pub stdout_size_limit: usize,
    pub stderr_size_limit: usize,

    /// Working areas older than this are considered abandoned, in seconds.
    pub stale_area_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        DockerConfig {
            image: "golang:1.24-alpine".into(),
            source_file: "main.go".into(),
            run_command: "go run main.go".into(),
            docker_user: None,
            grace_ms: 1000,
            run_cpu_share: 1.0,
            pids_limit: 100,
            stdout_size_limit: 1024 * 1024,
            stderr_size_limit: 100 * 1024,
            stale_area_secs: 60 * 60,
        }
    }
}

impl DockerConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Wall-clock deadline for one run of a program with the given time limit.
    pub fn run_deadline(&self, time_limit_ms: u64) -> Duration {
        Duration::from_millis(time_limit_ms) + self.grace()
    }
}

impl ClientConfig {
    fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}/internal", scheme, self.host)
    }

    pub fn next_job_endpoint(&self) -> String {
        format!("{}/submissions/next", self.base_url())
    }

    pub fn result_endpoint(&self, id: SubmissionId) -> String {
        format!("{}/submissions/{}/result", self.base_url(), id)
    }

    pub fn work_folder_root(&self) -> PathBuf {
        self.cache_folder.join("work")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Bound on a whole judging cycle. Always strictly longer than the run
    /// deadline of the same problem.
    pub fn supervisor_deadline(&self, time_limit_ms: u64) -> Duration {
        Duration::from_millis(time_limit_ms).mul_f64(self.supervisor_multiplier)
            + self.docker_config.grace()
            + Duration::from_millis(self.supervisor_margin_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigErr> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigErr::Invalid(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if !(self.supervisor_multiplier >= 1.0) {
            return Err(ConfigErr::Invalid(
                "supervisor_multiplier must be at least 1.0".into(),
            ));
        }
        if self.supervisor_margin_ms == 0 {
            return Err(ConfigErr::Invalid(
                "supervisor_margin_ms must be positive".into(),
            ));
        }
        let docker = &self.docker_config;
        if !(docker.run_cpu_share > 0.0) {
            return Err(ConfigErr::Invalid("run_cpu_share must be positive".into()));
        }
        if docker.pids_limit <= 0 {
            return Err(ConfigErr::Invalid("pids_limit must be positive".into()));
        }
        if docker.source_file.is_empty() || docker.source_file.contains('/') {
            return Err(ConfigErr::Invalid(
                "source_file must be a plain file name".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_supervisor_deadline_dominates_run_deadline() {
        let cfg = ClientConfig {
            supervisor_multiplier: 1.0,
            supervisor_margin_ms: 1,
            ..Default::default()
        };
        for limit in [0, 1, 1000, 15_000] {
            assert!(cfg.supervisor_deadline(limit) > cfg.docker_config.run_deadline(limit));
        }
    }

    #[test]
    fn test_endpoints() {
        let cfg = ClientConfig {
            host: "10.0.0.2:8080".into(),
            ..Default::default()
        };
        assert_eq!(
            cfg.next_job_endpoint(),
            "http://10.0.0.2:8080/internal/submissions/next"
        );
        assert_eq!(
            cfg.result_endpoint(12),
            "http://10.0.0.2:8080/internal/submissions/12/result"
        );
    }

    #[test]
    fn test_rejects_nonsense() {
        let cfg = ClientConfig {
            supervisor_multiplier: 0.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig {
            max_concurrent_tasks: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig {
            docker_config: Arc::new(DockerConfig {
                source_file: "../main.go".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        ClientConfig::default().validate().unwrap();
    }
}

//! Per-run working areas on the host file system.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use dashmap::DashSet;
use serde::Serialize;
use tokio::io::AsyncReadExt;

use super::{SandboxErr, SizeConstraintBytesMut};
use crate::{model::Problem, prelude::FlowSnake, util::AsyncTeardown};

pub const INPUT_FILE: &str = "input.txt";
pub const OUTPUT_FILE: &str = "output.txt";
pub const ERROR_FILE: &str = "error.txt";
pub const LIMITS_FILE: &str = "limits.json";

#[derive(Debug, Serialize)]
struct Limits {
    time_limit: u64,
    memory_limit: u64,
}

/// Paths whose removal failed or never happened. Swept later.
#[derive(Debug, Clone, Default)]
pub struct Reclaimer {
    pending: Arc<DashSet<PathBuf>>,
}

impl Reclaimer {
    pub fn new() -> Reclaimer {
        Default::default()
    }

    pub fn register(&self, path: PathBuf) {
        tracing::debug!("Registered {} for reclamation", path.display());
        self.pending.insert(path);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.pending.contains(path)
    }

    /// Try to remove every registered path. Returns how many were removed;
    /// paths that still cannot be removed stay registered.
    pub async fn sweep(&self) -> usize {
        let paths: Vec<PathBuf> = self.pending.iter().map(|p| p.key().clone()).collect();
        let mut removed = 0;
        for path in paths {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    self.pending.remove(&path);
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.pending.remove(&path);
                }
                Err(e) => {
                    tracing::warn!("Still unable to remove {}: {}", path.display(), e);
                }
            }
        }
        if removed > 0 {
            tracing::info!("Reclaimed {} work areas", removed);
        }
        removed
    }
}

/// A disposable directory holding one submission's files.
///
/// Call [`AsyncTeardown::teardown`] when done. A work area dropped without
/// teardown is registered with its [`Reclaimer`] instead.
#[derive(Debug)]
pub struct WorkArea {
    id: FlowSnake,
    path: PathBuf,
    reclaimer: Reclaimer,
    torn_down: bool,
}

impl WorkArea {
    /// Allocate `<root>/<id>` and fill it with the source, the input and the
    /// limits of `problem`, plus empty output files.
    pub async fn create(
        root: &Path,
        reclaimer: Reclaimer,
        source_file: &str,
        code: &str,
        problem: &Problem,
    ) -> Result<WorkArea, SandboxErr> {
        let (id, path) = allocate(root, FlowSnake::generate)
            .await
            .map_err(SandboxErr::WorkArea)?;

        let area = WorkArea {
            id,
            path,
            reclaimer,
            torn_down: false,
        };
        // containers run without capabilities and possibly as another user
        area.set_mode(&area.path, 0o777).await?;

        let limits = serde_json::to_vec(&Limits {
            time_limit: problem.time_limit,
            memory_limit: problem.memory_limit,
        })
        .map_err(|e| {
            SandboxErr::WriteFile(
                LIMITS_FILE.into(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;

        area.write(source_file, code.as_bytes()).await?;
        area.write(INPUT_FILE, problem.input.as_bytes()).await?;
        area.write(LIMITS_FILE, &limits).await?;
        area.write(OUTPUT_FILE, b"").await?;
        area.write(ERROR_FILE, b"").await?;

        tracing::debug!("Allocated work area {}", area.path.display());
        Ok(area)
    }

    pub fn id(&self) -> FlowSnake {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<(), SandboxErr> {
        let file = self.path.join(name);
        tokio::fs::write(&file, data)
            .await
            .map_err(|e| SandboxErr::WriteFile(name.into(), e))?;
        self.set_mode(&file, 0o666).await
    }

    #[cfg(unix)]
    async fn set_mode(&self, path: &Path, mode: u32) -> Result<(), SandboxErr> {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(SandboxErr::WorkArea)
    }

    #[cfg(not(unix))]
    async fn set_mode(&self, _path: &Path, _mode: u32) -> Result<(), SandboxErr> {
        Ok(())
    }

    /// Read at most `limit` bytes of a file in this work area. The returned
    /// buffer tells whether anything was cut off.
    pub async fn read_capped(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<SizeConstraintBytesMut, SandboxErr> {
        let map_err = |e| SandboxErr::ReadOutput(name.into(), e);
        let mut file = tokio::fs::File::open(self.path.join(name))
            .await
            .map_err(map_err)?;
        let mut out = SizeConstraintBytesMut::new(limit);
        let mut chunk = vec![0u8; 8192];
        loop {
            let n = file.read(&mut chunk).await.map_err(map_err)?;
            if n == 0 {
                break;
            }
            out.append(&chunk[..n]);
            if out.is_oversized() {
                tracing::debug!("{} capped at {} bytes", name, limit);
                break;
            }
        }
        Ok(out)
    }
}

const ALLOCATE_ATTEMPTS: usize = 8;

/// Create a fresh directory `<root>/<id>`. An id whose directory already
/// exists is never reused.
async fn allocate(
    root: &Path,
    mut next_id: impl FnMut() -> FlowSnake,
) -> std::io::Result<(FlowSnake, PathBuf)> {
    tokio::fs::create_dir_all(root).await?;
    for _ in 0..ALLOCATE_ATTEMPTS {
        let id = next_id();
        let path = root.join(id.to_string());
        match tokio::fs::create_dir(&path).await {
            Ok(()) => return Ok((id, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!("Work area {} already exists, picking another id", path.display());
            }
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free work area id under {}", root.display()),
    ))
}

#[async_trait]
impl AsyncTeardown for WorkArea {
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => tracing::debug!("Removed work area {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("Failed to remove work area {}: {}", self.path.display(), e);
                self.reclaimer.register(self.path.clone());
            }
        }
    }
}

impl Drop for WorkArea {
    fn drop(&mut self) {
        if !self.torn_down {
            self.reclaimer.register(self.path.clone());
        }
    }
}

/// Remove work areas under `root` last modified more than `older_than` ago.
/// Entries whose names are not work area ids are left alone.
pub async fn reclaim_stale(root: &Path, older_than: Duration) -> std::io::Result<usize> {
    let mut dir = match tokio::fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let is_ours = name.to_str().and_then(FlowSnake::parse).is_some();
        if !is_ours {
            continue;
        }
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age < older_than {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Unable to reclaim {}: {}", path.display(), e),
        }
    }
    if removed > 0 {
        tracing::info!("Reclaimed {} stale work areas in {}", removed, root.display());
    }
    Ok(removed)
}

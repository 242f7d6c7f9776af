//! Artifact store: lifecycle of transient input, output and temp files.
//!
//! Every file the pipeline writes goes through [`ArtifactStore`]. Names are
//! collision-free (`<unix-millis>-<9 random digits><ext>`, created with
//! `create_new`), so concurrent jobs never contend on a path. Release is a
//! single map removal, which makes deletion exactly-once under concurrent
//! release and sweep.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::config::StorageConfig;
use webmforge_common::{ArtifactId, ArtifactRole, Error, JobId, Result};

const MAX_NAME_ATTEMPTS: usize = 16;

/// Directories holding each artifact role.
#[derive(Debug, Clone)]
pub struct ArtifactRoots {
    pub input: PathBuf,
    pub output: PathBuf,
    pub temp: PathBuf,
}

impl ArtifactRoots {
    /// `uploads/`, `output/` and `temp/` under `base`.
    pub fn under(base: &Path) -> Self {
        Self {
            input: base.join("uploads"),
            output: base.join("output"),
            temp: base.join("temp"),
        }
    }

    pub fn get(&self, role: ArtifactRole) -> &Path {
        match role {
            ArtifactRole::Input => &self.input,
            ArtifactRole::Output => &self.output,
            ArtifactRole::Temp => &self.temp,
        }
    }
}

impl From<&StorageConfig> for ArtifactRoots {
    fn from(cfg: &StorageConfig) -> Self {
        Self {
            input: cfg.input_dir.clone(),
            output: cfg.output_dir.clone(),
            temp: cfg.temp_dir.clone(),
        }
    }
}

/// Process-wide reclamation policy. Immutable after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// Age after which the sweep reclaims any artifact.
    pub max_age: Duration,
    /// Lifetime of a published download.
    pub download_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
            download_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl From<&StorageConfig> for ExpiryPolicy {
    fn from(cfg: &StorageConfig) -> Self {
        Self {
            max_age: cfg.max_age(),
            download_ttl: cfg.download_ttl(),
            sweep_interval: cfg.sweep_interval(),
        }
    }
}

/// A tracked transient file.
#[derive(Debug, Clone, Serialize)]
pub struct StagedArtifact {
    pub id: ArtifactId,
    pub role: ArtifactRole,
    pub path: PathBuf,
    pub owner: Option<JobId>,
    pub created_at: DateTime<Utc>,
    /// When the download link closes. The file itself stays until it is
    /// reclaimed.
    pub expires_at: Option<DateTime<Utc>>,
    /// Reclamation deadline registered by [`ArtifactStore::schedule_expiry`].
    /// Never earlier than `created_at + max_age`.
    pub reclaim_at: Option<DateTime<Utc>>,
    /// Present once the artifact is published for download.
    pub download_name: Option<String>,
}

impl StagedArtifact {
    pub fn is_published(&self) -> bool {
        self.download_name.is_some()
    }

    fn is_due(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.created_at > max_age
    }
}

/// Retrievable identifier of a published output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHandle {
    pub id: ArtifactId,
    pub file_name: String,
    pub size: u64,
    pub expires_at: DateTime<Utc>,
}

/// Where a live download can be read from.
#[derive(Debug, Clone)]
pub struct ResolvedDownload {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub expires_at: DateTime<Utc>,
}

/// What one sweep reclaimed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Tracked artifacts released for age.
    pub expired: usize,
    /// Untracked files left by an earlier process.
    pub orphaned: usize,
    /// Untracked files that could not be removed.
    pub failed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired + self.orphaned
    }
}

pub struct ArtifactStore {
    roots: ArtifactRoots,
    policy: ExpiryPolicy,
    entries: DashMap<ArtifactId, StagedArtifact>,
}

impl ArtifactStore {
    /// Create the store, creating the role directories if needed.
    pub fn new(roots: ArtifactRoots, policy: ExpiryPolicy) -> Result<Self> {
        for role in ArtifactRole::ALL {
            std::fs::create_dir_all(roots.get(role))?;
        }
        Ok(Self {
            roots,
            policy,
            entries: DashMap::new(),
        })
    }

    pub fn from_config(cfg: &StorageConfig) -> Result<Self> {
        Self::new(ArtifactRoots::from(cfg), ExpiryPolicy::from(cfg))
    }

    pub fn roots(&self) -> &ArtifactRoots {
        &self.roots
    }

    pub fn policy(&self) -> ExpiryPolicy {
        self.policy
    }

    /// Persist `bytes` under a fresh name in the role's directory.
    ///
    /// # Errors
    ///
    /// `StorageFull` when the device is full, `Io` for any other write
    /// failure. A partially written file is removed.
    pub async fn stage(
        &self,
        bytes: &[u8],
        role: ArtifactRole,
        owner: Option<JobId>,
        ext: &str,
    ) -> Result<StagedArtifact> {
        let (path, mut file) = self.create_unique(role, ext).await?;

        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            drop(file);
            remove_path(&path);
            tracing::error!(path = %path.display(), error = %e, "Failed to stage artifact");
            return Err(Error::from(e));
        }

        let artifact = self.track(path, role, owner);
        tracing::debug!(
            artifact = %artifact.id,
            role = %role,
            bytes = bytes.len(),
            "Staged artifact"
        );
        Ok(artifact)
    }

    /// Reserve an empty file for an engine to write into.
    pub async fn allocate(
        &self,
        role: ArtifactRole,
        owner: Option<JobId>,
        ext: &str,
    ) -> Result<StagedArtifact> {
        let (path, file) = self.create_unique(role, ext).await?;
        drop(file);
        Ok(self.track(path, role, owner))
    }

    /// Delete an artifact. Idempotent: releasing an unknown or already
    /// released artifact, or one whose file is gone, is a logged no-op.
    ///
    /// Returns whether this call released it.
    pub fn release(&self, id: ArtifactId) -> bool {
        match self.entries.remove(&id) {
            Some((_, artifact)) => {
                remove_path(&artifact.path);
                tracing::debug!(artifact = %id, role = %artifact.role, "Released artifact");
                true
            }
            None => {
                tracing::trace!(artifact = %id, "Artifact already released");
                false
            }
        }
    }

    /// Release every unpublished artifact owned by `job`.
    pub fn release_owned_by(&self, job: JobId) -> usize {
        let ids: Vec<ArtifactId> = self
            .entries
            .iter()
            .filter(|e| e.owner == Some(job) && !e.is_published())
            .map(|e| *e.key())
            .collect();
        ids.into_iter().filter(|id| self.release(*id)).count()
    }

    /// Register the artifact for reclamation `after` from now.
    ///
    /// The deadline is never earlier than `created_at + max_age`. Deletion
    /// itself is left to [`Self::sweep`], which reclaims anything older than
    /// `max_age`. Returns false when the artifact is no longer tracked.
    pub fn schedule_expiry(&self, id: ArtifactId, after: Duration) -> bool {
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return false;
        };
        let earliest = entry.created_at + to_chrono(self.policy.max_age);
        let reclaim_at = (Utc::now() + to_chrono(after)).max(earliest);
        entry.reclaim_at = Some(reclaim_at);
        tracing::debug!(artifact = %id, reclaim_at = %reclaim_at, "Scheduled artifact expiry");
        true
    }

    /// Mark an output as downloadable under `download_name`.
    ///
    /// The download link closes after the policy's download TTL. The file is
    /// scheduled for reclamation through [`Self::schedule_expiry`].
    pub fn publish(&self, id: ArtifactId, download_name: impl Into<String>) -> Result<DownloadHandle> {
        let path = self
            .entries
            .get(&id)
            .map(|e| e.path.clone())
            .ok_or_else(|| Error::not_found("artifact", id))?;
        let size = std::fs::metadata(&path)?.len();

        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("artifact", id))?;
        let expires_at = Utc::now() + to_chrono(self.policy.download_ttl);
        let file_name = download_name.into();
        entry.download_name = Some(file_name.clone());
        entry.expires_at = Some(expires_at);
        drop(entry);
        self.schedule_expiry(id, self.policy.download_ttl);

        tracing::info!(artifact = %id, size, expires_at = %expires_at, "Published artifact");
        Ok(DownloadHandle {
            id,
            file_name,
            size,
            expires_at,
        })
    }

    /// Look up a live download.
    pub fn resolve(&self, id: ArtifactId) -> Option<ResolvedDownload> {
        self.resolve_at(id, Utc::now())
    }

    pub fn resolve_at(&self, id: ArtifactId, now: DateTime<Utc>) -> Option<ResolvedDownload> {
        let entry = self.entries.get(&id)?;
        let file_name = entry.download_name.clone()?;
        let expires_at = entry.expires_at?;
        if expires_at <= now {
            return None;
        }
        let path = entry.path.clone();
        drop(entry);

        let size = std::fs::metadata(&path).ok()?.len();
        Some(ResolvedDownload {
            path,
            file_name,
            size,
            expires_at,
        })
    }

    /// Reclaim everything due at `now`.
    ///
    /// Releases tracked artifacts older than `max_age`, then removes
    /// untracked entries of the role directories whose modification time is
    /// older than `max_age`. Never touches anything created after
    /// `now - max_age`, published or not.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let max_age = to_chrono(self.policy.max_age);
        let mut report = SweepReport::default();

        let due: Vec<ArtifactId> = self
            .entries
            .iter()
            .filter(|e| e.is_due(now, max_age))
            .map(|e| *e.key())
            .collect();
        report.expired = due.into_iter().filter(|id| self.release(*id)).count();

        let tracked: HashSet<PathBuf> = self.entries.iter().map(|e| e.path.clone()).collect();
        let mut seen_dirs = HashSet::new();
        for role in ArtifactRole::ALL {
            let dir = self.roots.get(role);
            if !seen_dirs.insert(dir.to_path_buf()) {
                continue;
            }
            self.sweep_untracked(dir, &tracked, now, max_age, &mut report);
        }

        if report.total() > 0 || report.failed > 0 {
            tracing::info!(
                expired = report.expired,
                orphaned = report.orphaned,
                failed = report.failed,
                "Artifact sweep complete"
            );
        }
        report
    }

    fn sweep_untracked(
        &self,
        dir: &Path,
        tracked: &HashSet<PathBuf>,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
        report: &mut SweepReport,
    ) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Cannot scan artifact directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if tracked.contains(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            if now - DateTime::<Utc>::from(modified) <= max_age {
                continue;
            }

            let removed = if meta.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match removed {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Removed orphaned artifact");
                    report.orphaned += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove orphaned artifact");
                    report.failed += 1;
                }
            }
        }
    }

    pub fn get(&self, id: ArtifactId) -> Option<StagedArtifact> {
        self.entries.get(&id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: ArtifactId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Snapshot of all tracked artifacts.
    pub fn tracked(&self) -> Vec<StagedArtifact> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Tracked artifacts owned by `job`.
    pub fn owned_by(&self, job: JobId) -> Vec<StagedArtifact> {
        self.entries
            .iter()
            .filter(|e| e.owner == Some(job))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn create_unique(&self, role: ArtifactRole, ext: &str) -> io::Result<(PathBuf, tokio::fs::File)> {
        let dir = self.roots.get(role);
        let ext = normalize_ext(ext);
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = dir.join(unique_name(&ext));
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not allocate a unique artifact name",
        ))
    }

    fn track(&self, path: PathBuf, role: ArtifactRole, owner: Option<JobId>) -> StagedArtifact {
        let artifact = StagedArtifact {
            id: ArtifactId::new(),
            role,
            path,
            owner,
            created_at: Utc::now(),
            expires_at: None,
            reclaim_at: None,
            download_name: None,
        };
        self.entries.insert(artifact.id, artifact.clone());
        artifact
    }
}

fn remove_path(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "Artifact file already gone");
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete artifact file");
        }
    }
}

/// `<unix-millis>-<9 random digits><ext>`
fn unique_name(ext: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
    format!("{}-{:09}{}", Utc::now().timestamp_millis(), suffix, ext)
}

/// `"webm"`, `".WEBM"` -> `".webm"`; anything odd -> `""`.
fn normalize_ext(ext: &str) -> String {
    let ext = ext.trim().trim_start_matches('.');
    if ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return String::new();
    }
    format!(".{}", ext.to_ascii_lowercase())
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

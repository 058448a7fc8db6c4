//! On-disk job store.
//!
//! Layout per job: `jobs/<job_id>/<filename>` (scene file),
//! `jobs/<job_id>/metadata.json`, `jobs/<job_id>/renders/<frame>.png` and,
//! once stitched, `jobs/<job_id>/renders/output_video.mp4`.
//!
//! Metadata updates are read-modify-write; each job's writers are confined
//! to a single task per role, so the store itself stays lock-free.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::error::{NodeError, Result};
use crate::jobs::model::JobMetadata;

pub const METADATA_FILE: &str = "metadata.json";
pub const RENDERS_DIR: &str = "renders";
pub const VIDEO_FILE: &str = "output_video.mp4";

#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        JobStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn metadata_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(METADATA_FILE)
    }

    pub fn renders_dir(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(RENDERS_DIR)
    }

    pub fn video_path(&self, job_id: &str) -> PathBuf {
        self.renders_dir(job_id).join(VIDEO_FILE)
    }

    pub fn scene_path(&self, job_id: &str, filename: &str) -> PathBuf {
        self.job_dir(job_id).join(filename)
    }

    pub async fn exists(&self, job_id: &str) -> bool {
        fs::try_exists(self.metadata_path(job_id))
            .await
            .unwrap_or(false)
    }

    /// Create the job directory and persist the scene file bytes.
    pub async fn save_scene(&self, job_id: &str, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir).await?;
        let path = self.scene_path(job_id, filename);
        fs::write(&path, bytes).await?;
        Ok(path)
    }

    pub async fn save_metadata(&self, meta: &JobMetadata) -> Result<()> {
        let dir = self.job_dir(&meta.job_id);
        fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(meta)?;
        fs::write(self.metadata_path(&meta.job_id), json).await?;
        Ok(())
    }

    /// Persist raw metadata bytes exactly as sent by the leader.
    pub async fn save_metadata_bytes(&self, job_id: &str, bytes: &[u8]) -> Result<()> {
        // Reject bytes that do not parse; a corrupt file would wedge the job.
        let _: JobMetadata = serde_json::from_slice(bytes)?;
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir).await?;
        fs::write(self.metadata_path(job_id), bytes).await?;
        Ok(())
    }

    pub async fn load_metadata(&self, job_id: &str) -> Result<JobMetadata> {
        let path = self.metadata_path(job_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(NodeError::JobNotFound(job_id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read-modify-write on a job's metadata; returns the updated record.
    pub async fn update_metadata<F>(&self, job_id: &str, mutate: F) -> Result<JobMetadata>
    where
        F: FnOnce(&mut JobMetadata),
    {
        let mut meta = self.load_metadata(job_id).await?;
        mutate(&mut meta);
        self.save_metadata(&meta).await?;
        Ok(meta)
    }

    /// Store one rendered frame; duplicates overwrite (renders are
    /// deterministic per frame, last writer wins).
    pub async fn save_frame(&self, job_id: &str, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.renders_dir(job_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(filename);
        fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Count frame artifacts on disk (the stitched video is not a frame).
    pub async fn count_frames(&self, job_id: &str) -> Result<u32> {
        let dir = self.renders_dir(job_id);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(0);
        }
        let mut entries = fs::read_dir(&dir).await?;
        let mut count = 0u32;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".png") {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn list_job_ids(&self) -> Result<Vec<String>> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// All jobs with readable metadata; unreadable ones are skipped.
    pub async fn list_jobs(&self) -> Result<Vec<JobMetadata>> {
        let mut jobs = Vec::new();
        for id in self.list_job_ids().await? {
            match self.load_metadata(&id).await {
                Ok(meta) => jobs.push(meta),
                Err(err) => debug!(job_id = %id, error = %err, "skipping unreadable job"),
            }
        }
        Ok(jobs)
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let dir = self.job_dir(job_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_all(&self) -> Result<usize> {
        let mut deleted = 0;
        for id in self.list_job_ids().await? {
            match self.delete_job(&id).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(err) => warn!(job_id = %id, error = %err, "failed to delete job"),
            }
        }
        Ok(deleted)
    }

    /// Client-side storage of the finished video delivered by the leader.
    pub async fn save_delivered_video(&self, job_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(VIDEO_FILE);
        fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Copy a job's scene file into a derived job's directory (used by
    /// reassignment).
    pub async fn copy_scene(
        &self,
        from_job: &str,
        to_job: &str,
        filename: &str,
    ) -> Result<PathBuf> {
        let src = self.scene_path(from_job, filename);
        let dst_dir = self.job_dir(to_job);
        fs::create_dir_all(&dst_dir).await?;
        let dst = self.scene_path(to_job, filename);
        fs::copy(&src, &dst).await?;
        Ok(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobParams, JobStatus};
    use std::collections::BTreeMap;

    fn meta(job_id: &str) -> JobMetadata {
        JobMetadata {
            job_id: job_id.into(),
            filename: "scene.blend".into(),
            created_at: chrono::Utc::now(),
            status: JobStatus::Created,
            leader_ip: "10.0.0.2".parse().unwrap(),
            no_of_nodes: 1,
            metadata: JobParams {
                frame_start: 1,
                frame_end: 3,
                fps: 24,
                renderer: None,
                initiator_client_ip: "10.0.0.1".parse().unwrap(),
                initiator_is_participant: true,
                extra: BTreeMap::new(),
            },
            jobs: BTreeMap::new(),
            total_no_frames: 0,
            remaining_frames: 0,
            scores: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.save_metadata(&meta("job-a")).await.unwrap();

        let loaded = store.load_metadata("job-a").await.unwrap();
        assert_eq!(loaded.job_id, "job-a");
        assert_eq!(loaded.status, JobStatus::Created);
    }

    #[tokio::test]
    async fn test_missing_job_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        match store.load_metadata("nope").await {
            Err(NodeError::JobNotFound(id)) => assert_eq!(id, "nope"),
            other => panic!("expected JobNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_metadata_read_modify_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.save_metadata(&meta("job-b")).await.unwrap();

        let updated = store
            .update_metadata("job-b", |m| m.status = JobStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::InProgress);

        let reloaded = store.load_metadata("job-b").await.unwrap();
        assert_eq!(reloaded.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_duplicate_frame_overwrites_without_inflating_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.save_frame("job-c", "1.png", b"first").await.unwrap();
        store.save_frame("job-c", "2.png", b"other").await.unwrap();
        store.save_frame("job-c", "1.png", b"second").await.unwrap();

        assert_eq!(store.count_frames("job-c").await.unwrap(), 2);
        let bytes = fs::read(store.renders_dir("job-c").join("1.png"))
            .await
            .unwrap();
        assert_eq!(bytes, b"second");
    }

    #[tokio::test]
    async fn test_delete_all_removes_every_job_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.save_metadata(&meta("one")).await.unwrap();
        store.save_metadata(&meta("two")).await.unwrap();

        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert!(store.list_job_ids().await.unwrap().is_empty());
        assert!(!store.delete_job("one").await.unwrap(), "already gone");
    }

    #[tokio::test]
    async fn test_save_metadata_bytes_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        assert!(store.save_metadata_bytes("j", b"not json").await.is_err());
        assert!(!store.exists("j").await, "no partial state on bad input");
    }
}

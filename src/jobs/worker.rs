//! Worker-side job runtime.
//!
//! Accepts job packages from the leader, obeys sequenced control messages,
//! renders its assigned slice one frame at a time and streams each frame
//! back to the leader. A `JOB_COMMIT` that arrives before the package is
//! remembered in the pending-commits set and re-applied once the files
//! land (the commit may race ahead of the HTTP upload).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::HTTP_TIMEOUT;
use crate::error::{NodeError, Result};
use crate::identity::NodeIdentity;
use crate::jobs::model::{JobMetadata, JobStatus};
use crate::jobs::store::JobStore;
use crate::render::BlenderService;
use crate::sequencer::{ControlKind, ControlMessage};

/// Scratch directory for frames rendered locally before upload.
const WORK_DIR: &str = "worker_out";

pub struct WorkerRuntime {
    identity: NodeIdentity,
    store: JobStore,
    renderer: BlenderService,
    http: reqwest::Client,
    http_port: u16,
    pending_commits: Mutex<HashSet<String>>,
    active_renders: Mutex<HashSet<String>>,
}

impl WorkerRuntime {
    pub fn new(
        identity: NodeIdentity,
        store: JobStore,
        renderer: BlenderService,
        http: reqwest::Client,
        http_port: u16,
    ) -> Arc<Self> {
        Arc::new(WorkerRuntime {
            identity,
            store,
            renderer,
            http,
            http_port,
            pending_commits: Mutex::new(HashSet::new()),
            active_renders: Mutex::new(HashSet::new()),
        })
    }

    /// Store an incoming job package. If the commit for this job already
    /// arrived over the control channel, apply it now.
    pub async fn accept_job(
        self: &Arc<Self>,
        job_id: &str,
        blend_filename: &str,
        blend_bytes: &[u8],
        metadata_bytes: &[u8],
    ) -> Result<()> {
        self.store
            .save_scene(job_id, blend_filename, blend_bytes)
            .await?;
        self.store.save_metadata_bytes(job_id, metadata_bytes).await?;
        info!(%job_id, filename = blend_filename, "job package received");

        let committed_early = self
            .pending_commits
            .lock()
            .expect("pending commits lock poisoned")
            .remove(job_id);
        if committed_early {
            debug!(%job_id, "applying commit that raced ahead of the upload");
            self.commit_job(job_id).await;
        }
        Ok(())
    }

    /// Apply one sequenced control message. Called in strict seq order by
    /// the control dispatcher.
    pub async fn apply_control(self: &Arc<Self>, msg: &ControlMessage) {
        match msg.kind {
            ControlKind::JobCommit => {
                if let Some(job_id) = msg.job_id() {
                    self.commit_job(job_id).await;
                }
            }
            ControlKind::StopRender => {
                if let Some(job_id) = msg.job_id() {
                    if let Err(err) = self.stop_render_local(job_id).await {
                        debug!(%job_id, error = %err, "stop-render skipped");
                    }
                }
            }
            ControlKind::CancelJob => {
                if let Some(job_id) = msg.job_id() {
                    match self.store.delete_job(job_id).await {
                        Ok(true) => info!(%job_id, "job directory deleted"),
                        Ok(false) => debug!(%job_id, "cancel for unknown job"),
                        Err(err) => warn!(%job_id, error = %err, "cancel failed"),
                    }
                }
            }
            ControlKind::CancelAll => match self.store.delete_all().await {
                Ok(deleted) => info!(deleted, "all jobs deleted"),
                Err(err) => warn!(error = %err, "cancel-all failed"),
            },
            ControlKind::JobCreated
            | ControlKind::JobBroadcastBegin
            | ControlKind::JobSent
            | ControlKind::JobBroadcastDone => {
                debug!(seq = msg.seq, kind = ?msg.kind, "lifecycle marker observed");
            }
        }
    }

    /// Commit a job: start rendering the local slice, or remember the
    /// commit if the package has not arrived yet.
    pub async fn commit_job(self: &Arc<Self>, job_id: &str) {
        if !self.store.exists(job_id).await {
            debug!(%job_id, "commit before files; parking in pending set");
            self.pending_commits
                .lock()
                .expect("pending commits lock poisoned")
                .insert(job_id.to_string());
            return;
        }

        let meta = match self.store.load_metadata(job_id).await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(%job_id, error = %err, "commit for unreadable job");
                return;
            }
        };
        match meta.status {
            JobStatus::Created | JobStatus::Ready | JobStatus::InProgress => {}
            status => {
                debug!(%job_id, ?status, "commit ignored in current status");
                return;
            }
        }
        if meta.status != JobStatus::InProgress {
            if let Err(err) = self
                .store
                .update_metadata(job_id, |m| m.status = JobStatus::InProgress)
                .await
            {
                warn!(%job_id, error = %err, "failed to mark job in progress");
                return;
            }
        }

        let assignment = meta.assignment_for(self.identity.ip);
        if assignment.is_empty() {
            debug!(%job_id, "no frames assigned to this node");
            return;
        }

        let already_running = !self
            .active_renders
            .lock()
            .expect("active renders lock poisoned")
            .insert(job_id.to_string());
        if already_running {
            debug!(%job_id, "render already running");
            return;
        }

        let runtime = self.clone();
        let job = job_id.to_string();
        tokio::spawn(async move {
            runtime.render_assignment(&job).await;
            runtime
                .active_renders
                .lock()
                .expect("active renders lock poisoned")
                .remove(&job);
        });
    }

    /// Render the local slice frame by frame. Status is re-read between
    /// frames so a cancellation takes effect at the next frame boundary;
    /// an in-flight frame render is never preempted.
    async fn render_assignment(&self, job_id: &str) {
        let Ok(meta) = self.store.load_metadata(job_id).await else {
            warn!(%job_id, "job vanished before rendering started");
            return;
        };
        let frames = meta.assignment_for(self.identity.ip).to_vec();
        let scene = self.store.scene_path(job_id, &meta.filename);
        let work_dir = self.store.job_dir(job_id).join(WORK_DIR);
        info!(%job_id, frames = frames.len(), "starting assigned render");

        for frame in frames {
            match self.store.load_metadata(job_id).await {
                Ok(current) if current.status == JobStatus::InProgress => {}
                Ok(current) => {
                    info!(%job_id, status = ?current.status, "stopping render; job status changed");
                    break;
                }
                Err(_) => {
                    info!(%job_id, "stopping render; job removed");
                    break;
                }
            }

            let image = match self.renderer.render_frame(&scene, frame, &work_dir).await {
                Ok(path) => path,
                Err(err) => {
                    // No per-frame retry: the leader's remaining count
                    // stays put and the gap is operator-visible.
                    warn!(%job_id, frame, error = %err, "frame render failed");
                    continue;
                }
            };

            if let Err(err) = self.upload_frame(&meta, frame, &image).await {
                warn!(%job_id, frame, error = %err, "frame upload failed");
            }
        }

        if let Err(err) = tokio::fs::remove_dir_all(&work_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(%job_id, error = %err, "work dir cleanup failed");
            }
        }
        info!(%job_id, "assigned render finished");
    }

    async fn upload_frame(
        &self,
        meta: &JobMetadata,
        frame: u32,
        image: &std::path::Path,
    ) -> Result<()> {
        let bytes = tokio::fs::read(image).await?;
        let url = format!(
            "http://{}:{}/api/jobs/submit-frames",
            meta.leader_ip, self.http_port
        );
        let form = reqwest::multipart::Form::new()
            .text("uuid", meta.job_id.clone())
            .part(
                "image",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(format!("{frame}.png"))
                    .mime_str("image/png")?,
            );

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NodeError::PeerRejected {
                peer: meta.leader_ip,
                detail: format!("submit-frames returned {}", response.status()),
            });
        }
        debug!(job_id = %meta.job_id, frame, "frame uploaded");
        Ok(())
    }

    /// Mark a job canceled locally so the render loop stops at the next
    /// frame boundary.
    pub async fn stop_render_local(&self, job_id: &str) -> Result<JobStatus> {
        let meta = self.store.load_metadata(job_id).await?;
        match meta.status {
            JobStatus::InProgress | JobStatus::Ready | JobStatus::Created => {
                let updated = self
                    .store
                    .update_metadata(job_id, |m| m.status = JobStatus::Canceled)
                    .await?;
                info!(%job_id, "render stopped");
                Ok(updated.status)
            }
            status => Ok(status),
        }
    }

    /// True when a commit is parked waiting for the job package.
    pub fn has_pending_commit(&self, job_id: &str) -> bool {
        self.pending_commits
            .lock()
            .expect("pending commits lock poisoned")
            .contains(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::JobParams;
    use std::collections::BTreeMap;

    fn runtime(store_root: &std::path::Path) -> Arc<WorkerRuntime> {
        WorkerRuntime::new(
            NodeIdentity::new("worker", "10.0.0.5".parse().unwrap()),
            JobStore::new(store_root),
            BlenderService::new("blender"),
            reqwest::Client::new(),
            5050,
        )
    }

    fn metadata_bytes(job_id: &str, status: JobStatus) -> Vec<u8> {
        let meta = JobMetadata {
            job_id: job_id.into(),
            filename: "scene.blend".into(),
            created_at: chrono::Utc::now(),
            status,
            leader_ip: "10.0.0.2".parse().unwrap(),
            no_of_nodes: 1,
            metadata: JobParams {
                frame_start: 1,
                frame_end: 2,
                fps: 24,
                renderer: None,
                initiator_client_ip: "10.0.0.1".parse().unwrap(),
                initiator_is_participant: true,
                extra: BTreeMap::new(),
            },
            jobs: BTreeMap::new(),
            total_no_frames: 2,
            remaining_frames: 2,
            scores: BTreeMap::new(),
        };
        serde_json::to_vec(&meta).unwrap()
    }

    #[tokio::test]
    async fn test_commit_before_files_is_parked_and_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(dir.path());

        rt.commit_job("job-x").await;
        assert!(rt.has_pending_commit("job-x"), "commit must be parked");

        rt.accept_job(
            "job-x",
            "scene.blend",
            b"blend-bytes",
            &metadata_bytes("job-x", JobStatus::Ready),
        )
        .await
        .unwrap();

        assert!(
            !rt.has_pending_commit("job-x"),
            "pending commit must be consumed by the file arrival"
        );
        // With no frames assigned to this node the job is simply marked
        // in progress.
        let meta = rt.store.load_metadata("job-x").await.unwrap();
        assert_eq!(meta.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_stop_render_cancels_in_progress_job() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(dir.path());
        rt.store
            .save_metadata_bytes("job-y", &metadata_bytes("job-y", JobStatus::InProgress))
            .await
            .unwrap();

        let status = rt.stop_render_local("job-y").await.unwrap();
        assert_eq!(status, JobStatus::Canceled);

        // A second stop is a no-op on the terminal status.
        let again = rt.stop_render_local("job-y").await.unwrap();
        assert_eq!(again, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_all_control_message_deletes_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(dir.path());
        rt.store
            .save_metadata_bytes("a", &metadata_bytes("a", JobStatus::InProgress))
            .await
            .unwrap();
        rt.store
            .save_metadata_bytes("b", &metadata_bytes("b", JobStatus::Created))
            .await
            .unwrap();

        let msg = ControlMessage {
            seq: 1,
            kind: ControlKind::CancelAll,
            payload: serde_json::json!({}),
        };
        rt.apply_control(&msg).await;
        assert!(rt.store.list_job_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_ignored_for_canceled_job() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(dir.path());
        rt.store
            .save_metadata_bytes("job-z", &metadata_bytes("job-z", JobStatus::Canceled))
            .await
            .unwrap();

        rt.commit_job("job-z").await;
        let meta = rt.store.load_metadata("job-z").await.unwrap();
        assert_eq!(meta.status, JobStatus::Canceled, "terminal status must hold");
    }
}

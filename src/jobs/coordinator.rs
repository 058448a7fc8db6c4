//! Leader-side job coordination.
//!
//! Owns the job record for the lifetime of a job: creation, sharding,
//! fan-out to workers, frame intake, finalization (stitch + delivery) and
//! the partial-failure paths (lost worker reassignment, lost client
//! cancellation).

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::HTTP_TIMEOUT;
use crate::discovery::membership::MembershipTable;
use crate::error::{NodeError, Result};
use crate::identity::NodeIdentity;
use crate::jobs::model::{JobMetadata, JobParams, JobStatus};
use crate::jobs::shard::{eligible_workers, shard_range, split_even};
use crate::jobs::store::JobStore;
use crate::sequencer::{job_payload, job_worker_payload, ControlBroadcaster, ControlKind};
use crate::stitch::FfmpegService;

#[derive(Debug, Serialize)]
pub struct WorkerSendResult {
    pub worker: Ipv4Addr,
    pub status: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BroadcastReport {
    pub job_id: String,
    pub broadcast_results: Vec<WorkerSendResult>,
}

#[derive(Debug, Serialize)]
pub struct FrameReceipt {
    pub job_id: String,
    pub saved_as: String,
    pub remaining_frames: u32,
}

#[derive(Debug, Serialize)]
pub struct DisconnectionReport {
    pub ip: Ipv4Addr,
    pub jobs_reset: Vec<String>,
}

pub struct JobCoordinator {
    identity: NodeIdentity,
    membership: Arc<MembershipTable>,
    store: JobStore,
    broadcaster: Arc<ControlBroadcaster>,
    stitcher: FfmpegService,
    http: reqwest::Client,
    http_port: u16,
}

impl JobCoordinator {
    pub fn new(
        identity: NodeIdentity,
        membership: Arc<MembershipTable>,
        store: JobStore,
        broadcaster: Arc<ControlBroadcaster>,
        stitcher: FfmpegService,
        http: reqwest::Client,
        http_port: u16,
    ) -> Arc<Self> {
        Arc::new(JobCoordinator {
            identity,
            membership,
            store,
            broadcaster,
            stitcher,
            http,
            http_port,
        })
    }

    /// Create a job record from an uploaded scene file. Runs on the leader.
    pub async fn create_job(
        &self,
        filename: &str,
        scene_bytes: &[u8],
        params: JobParams,
    ) -> Result<JobMetadata> {
        let ring = self.membership.ring();
        let mut no_of_nodes = ring.len();
        if !params.initiator_is_participant && no_of_nodes > 0 {
            no_of_nodes -= 1;
        }
        if no_of_nodes == 0 {
            return Err(NodeError::InvalidInput("no workers in the ring".into()));
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let meta = JobMetadata {
            job_id: job_id.clone(),
            filename: filename.to_string(),
            created_at: Utc::now(),
            status: JobStatus::Created,
            leader_ip: self.identity.ip,
            no_of_nodes,
            metadata: params,
            jobs: Default::default(),
            total_no_frames: 0,
            remaining_frames: 0,
            scores: self.membership.scores().into_iter().collect(),
        };

        self.store.save_scene(&job_id, filename, scene_bytes).await?;
        self.store.save_metadata(&meta).await?;
        info!(%job_id, filename, frames = meta.metadata.total_frames(), "render job created");

        self.broadcaster
            .broadcast(ControlKind::JobCreated, job_payload(&job_id));
        Ok(meta)
    }

    /// Shard the job (unless assignments already exist, as in a
    /// reassignment job), push the package to every ring member, and emit
    /// the ordered lifecycle markers.
    pub async fn broadcast_job(&self, job_id: &str) -> Result<BroadcastReport> {
        let mut meta = self.store.load_metadata(job_id).await?;
        if meta.status.is_terminal() {
            return Err(NodeError::JobNotAccepting {
                job_id: job_id.to_string(),
            });
        }

        if meta.jobs.is_empty() {
            let ring = self.membership.ring();
            let workers = eligible_workers(
                &ring,
                meta.metadata.initiator_client_ip,
                meta.metadata.initiator_is_participant,
            );
            if workers.is_empty() {
                return Err(NodeError::InvalidInput("no eligible workers".into()));
            }
            meta.jobs = shard_range(meta.metadata.frame_start, meta.metadata.frame_end, &workers);
            meta.total_no_frames = meta.assigned_frames();
            meta.remaining_frames = meta.total_no_frames;
            meta.no_of_nodes = workers.len();
        }
        meta.status = JobStatus::InProgress;
        self.store.save_metadata(&meta).await?;

        let scene_bytes = tokio::fs::read(self.store.scene_path(job_id, &meta.filename)).await?;
        let metadata_bytes = serde_json::to_vec_pretty(&meta)?;

        self.broadcaster
            .broadcast(ControlKind::JobBroadcastBegin, job_payload(job_id));

        let mut results = Vec::new();
        for worker_ip in self.membership.ring() {
            match self
                .send_job_package(worker_ip, job_id, &meta.filename, &scene_bytes, &metadata_bytes)
                .await
            {
                Ok(status) => {
                    self.broadcaster.broadcast(
                        ControlKind::JobSent,
                        job_worker_payload(job_id, worker_ip),
                    );
                    results.push(WorkerSendResult {
                        worker: worker_ip,
                        status: Some(status),
                        error: None,
                    });
                }
                Err(err) => {
                    // No retry: a worker that missed the package is picked
                    // up by the failure monitor when its beacons stop.
                    warn!(%worker_ip, error = %err, "job package send failed");
                    results.push(WorkerSendResult {
                        worker: worker_ip,
                        status: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        self.broadcaster
            .broadcast(ControlKind::JobBroadcastDone, job_payload(job_id));
        self.broadcaster
            .broadcast(ControlKind::JobCommit, job_payload(job_id));

        info!(%job_id, workers = results.len(), "job broadcast complete");
        Ok(BroadcastReport {
            job_id: job_id.to_string(),
            broadcast_results: results,
        })
    }

    async fn send_job_package(
        &self,
        worker_ip: Ipv4Addr,
        job_id: &str,
        filename: &str,
        scene_bytes: &[u8],
        metadata_bytes: &[u8],
    ) -> Result<u16> {
        let url = format!(
            "http://{worker_ip}:{}/api/worker/submit-job",
            self.http_port
        );
        let form = reqwest::multipart::Form::new()
            .text("uuid", job_id.to_string())
            .part(
                "blend_file",
                reqwest::multipart::Part::bytes(scene_bytes.to_vec())
                    .file_name(filename.to_string())
                    .mime_str("application/octet-stream")?,
            )
            .part(
                "metadata",
                reqwest::multipart::Part::bytes(metadata_bytes.to_vec())
                    .file_name("metadata.json")
                    .mime_str("application/json")?,
            );

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::PeerRejected {
                peer: worker_ip,
                detail: format!("submit-job returned {status}"),
            });
        }
        Ok(status.as_u16())
    }

    /// Accept one rendered frame from a worker.
    pub async fn accept_frame(
        self: &Arc<Self>,
        job_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<FrameReceipt> {
        let meta = self.store.load_metadata(job_id).await?;
        if meta.status != JobStatus::InProgress {
            return Err(NodeError::JobNotAccepting {
                job_id: job_id.to_string(),
            });
        }

        self.store.save_frame(job_id, filename, bytes).await?;
        let on_disk = self.store.count_frames(job_id).await?;

        let updated = self
            .store
            .update_metadata(job_id, |m| {
                m.remaining_frames = m.remaining_frames.saturating_sub(1);
                if m.remaining_frames == 0 || on_disk >= m.total_no_frames {
                    m.status = JobStatus::CompletedFrames;
                }
            })
            .await?;

        if updated.status == JobStatus::CompletedFrames {
            info!(%job_id, frames = on_disk, "all frames received");
            let coordinator = self.clone();
            let job = job_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = coordinator.finalize_job(&job).await {
                    error!(job_id = %job, error = %err, "finalization failed");
                }
            });
        }

        Ok(FrameReceipt {
            job_id: job_id.to_string(),
            saved_as: filename.to_string(),
            remaining_frames: updated.remaining_frames,
        })
    }

    /// Stitch the finished frames and deliver the video to the initiating
    /// client. On stitcher failure the job stays at `completed_frames`.
    pub async fn finalize_job(&self, job_id: &str) -> Result<()> {
        let meta = self.store.load_metadata(job_id).await?;
        let renders = self.store.renders_dir(job_id);
        let video = self.store.video_path(job_id);

        self.stitcher
            .stitch(&renders, &video, meta.metadata.fps)
            .await?;

        let meta = self
            .store
            .update_metadata(job_id, |m| m.status = JobStatus::CompletedVideo)
            .await?;

        self.deliver_video(&meta, &video).await?;
        info!(%job_id, client = %meta.metadata.initiator_client_ip, "video delivered");
        Ok(())
    }

    async fn deliver_video(&self, meta: &JobMetadata, video: &std::path::Path) -> Result<()> {
        let client_ip = meta.metadata.initiator_client_ip;
        let url = format!(
            "http://{client_ip}:{}/api/jobs/send-video-to-client",
            self.http_port
        );
        let bytes = tokio::fs::read(video).await?;
        let form = reqwest::multipart::Form::new()
            .text("uuid", meta.job_id.clone())
            .text("client_ip", self.identity.ip.to_string())
            .text("status", "completed_video")
            .part(
                "video",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name("output_video.mp4")
                    .mime_str("video/mp4")?,
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
                peer: client_ip,
                detail: format!("video delivery returned {}", response.status()),
            });
        }
        Ok(())
    }

    /// React to a peer disappearing: cancel jobs it initiated, reassign
    /// frames it was rendering. Runs on the leader.
    pub async fn handle_node_disconnection(
        self: &Arc<Self>,
        ip: Ipv4Addr,
    ) -> Result<DisconnectionReport> {
        self.membership.remove(ip);
        let mut affected = Vec::new();

        for meta in self.store.list_jobs().await? {
            if meta.status != JobStatus::InProgress {
                continue;
            }
            if meta.metadata.initiator_client_ip == ip {
                self.cancel_job_for_lost_client(&meta).await?;
                affected.push(meta.job_id.clone());
            } else if !meta.assignment_for(ip).is_empty() {
                match self.reassign_job(&meta, ip).await {
                    Ok(new_id) => affected.push(new_id),
                    Err(err) => {
                        warn!(job_id = %meta.job_id, error = %err, "reassignment failed")
                    }
                }
            }
        }

        Ok(DisconnectionReport {
            ip,
            jobs_reset: affected,
        })
    }

    /// The initiating client is gone: stop the renders and discard the
    /// job's artifacts everywhere.
    async fn cancel_job_for_lost_client(&self, meta: &JobMetadata) -> Result<()> {
        info!(job_id = %meta.job_id, client = %meta.metadata.initiator_client_ip, "canceling job of lost client");
        self.store
            .update_metadata(&meta.job_id, |m| m.status = JobStatus::Canceled)
            .await?;
        self.broadcaster
            .broadcast(ControlKind::StopRender, job_payload(&meta.job_id));
        self.broadcaster
            .broadcast(ControlKind::CancelJob, job_payload(&meta.job_id));
        Ok(())
    }

    /// Build and broadcast the derived `<job_id>_reassign` job carrying the
    /// lost worker's frames, split across the surviving workers.
    async fn reassign_job(&self, meta: &JobMetadata, lost_ip: Ipv4Addr) -> Result<String> {
        let frames = meta.assignment_for(lost_ip).to_vec();
        let survivors: Vec<Ipv4Addr> = meta
            .jobs
            .keys()
            .copied()
            .filter(|&w| w != lost_ip)
            .collect();
        if survivors.is_empty() {
            warn!(job_id = %meta.job_id, "no surviving workers; canceling job");
            self.store
                .update_metadata(&meta.job_id, |m| m.status = JobStatus::Canceled)
                .await?;
            return Err(NodeError::InvalidInput("no surviving workers".into()));
        }

        let new_job_id = format!("{}_reassign", meta.job_id);
        info!(
            job_id = %meta.job_id,
            %new_job_id,
            lost = %lost_ip,
            frames = frames.len(),
            "reassigning frames of lost worker"
        );

        self.store
            .copy_scene(&meta.job_id, &new_job_id, &meta.filename)
            .await?;

        let mut derived = meta.clone();
        derived.job_id = new_job_id.clone();
        derived.created_at = Utc::now();
        derived.status = JobStatus::InProgress;
        derived.jobs = split_even(&frames, &survivors);
        derived.total_no_frames = frames.len() as u32;
        derived.remaining_frames = frames.len() as u32;
        derived.no_of_nodes = survivors.len();
        self.store.save_metadata(&derived).await?;

        // The original job is superseded.
        self.store
            .update_metadata(&meta.job_id, |m| m.status = JobStatus::Canceled)
            .await?;

        self.broadcast_job(&new_job_id).await?;
        Ok(new_job_id)
    }

    /// Operator action: discard every job on every node.
    pub fn cancel_all(&self) -> Option<u64> {
        self.broadcaster
            .broadcast(ControlKind::CancelAll, serde_json::json!({}))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }
}

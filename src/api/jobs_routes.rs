//! Job API routes.
//!
//! ## Endpoints
//!
//! - `POST /api/jobs/upload` - client submission, forwarded to the leader
//! - `POST /api/jobs/create` - leader-only job creation
//! - `POST /api/jobs/broadcast-to-workers` - leader-only shard + fan-out
//! - `POST /api/jobs/submit-frames` - rendered frame intake at the leader
//! - `POST /api/jobs/send-video-to-client` - final video delivery
//! - `POST /api/jobs/analyze` - extract scene properties from a blend file
//! - `POST /api/jobs/cancel-all` - leader-only, discard all jobs cluster-wide
//! - `GET  /api/jobs` / `GET /api/jobs/:job_id` - job status views

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::api::error_response;
use crate::config::HTTP_TIMEOUT;
use crate::discovery::wire::Role;
use crate::error::NodeError;
use crate::jobs::model::{JobMetadata, JobParams};
use crate::node::Node;

/// Scene files can be large; cap request bodies well above typical sizes.
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

pub fn create_jobs_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/api/jobs/upload", post(upload_job))
        .route("/api/jobs/create", post(create_job))
        .route("/api/jobs/broadcast-to-workers", post(broadcast_to_workers))
        .route("/api/jobs/submit-frames", post(submit_frames))
        .route("/api/jobs/send-video-to-client", post(send_video_to_client))
        .route("/api/jobs/analyze", post(analyze_blend))
        .route("/api/jobs/cancel-all", post(cancel_all))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:job_id", get(get_job))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(node)
}

pub(crate) struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Collect a multipart body into text fields and uploaded files.
pub(crate) async fn collect_multipart(
    mut multipart: Multipart,
) -> Result<(HashMap<String, String>, HashMap<String, UploadedFile>), (StatusCode, String)> {
    let mut fields = HashMap::new();
    let mut files = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("bad multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(filename) = field.file_name() {
            let filename = filename.to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|err| (StatusCode::BAD_REQUEST, format!("bad file field: {err}")))?;
            files.insert(
                name,
                UploadedFile {
                    filename,
                    bytes: bytes.to_vec(),
                },
            );
        } else {
            let text = field
                .text()
                .await
                .map_err(|err| (StatusCode::BAD_REQUEST, format!("bad form field: {err}")))?;
            fields.insert(name, text);
        }
    }
    Ok((fields, files))
}

fn require_blend(file: &UploadedFile) -> Result<(), (StatusCode, String)> {
    if file.filename.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Empty filename".into()));
    }
    if !file.filename.to_lowercase().ends_with(".blend") {
        return Err((StatusCode::BAD_REQUEST, "Invalid file type".into()));
    }
    Ok(())
}

/// The participation flag arrives as free-form text from the UI; anything
/// explicitly negative opts the client out, everything else opts in.
fn parse_participant_flag(raw: Option<&String>) -> bool {
    match raw.map(String::as_str) {
        Some("false") | Some("False") | Some("0") | Some("undefined") => false,
        _ => true,
    }
}

/// POST /api/jobs/upload
///
/// Client-side entrypoint: forward the scene file and metadata to the
/// current leader's create endpoint. Fails fast when no leader is known.
async fn upload_job(
    State(node): State<Arc<Node>>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    let (mut fields, files) = collect_multipart(multipart).await?;
    let file = files
        .get("file")
        .ok_or((StatusCode::BAD_REQUEST, "No file provided".to_string()))?;
    require_blend(file)?;

    let Some(leader) = node.election.current_leader() else {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "No leader found in the network".into(),
        ));
    };

    fields.insert("initiator_client_ip".into(), node.identity.ip.to_string());

    let mut form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(file.bytes.clone())
            .file_name(file.filename.clone())
            .mime_str("application/octet-stream")
            .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?,
    );
    for (key, value) in fields {
        form = form.text(key, value);
    }

    let url = format!("http://{leader}:{}/api/jobs/create", node.config.http_port);
    info!(%leader, "forwarding job to leader");
    let response = node
        .http
        .post(&url)
        .multipart(form)
        .timeout(HTTP_TIMEOUT)
        .send()
        .await
        .map_err(|err| (StatusCode::BAD_GATEWAY, err.to_string()))?;

    if response.status() != reqwest::StatusCode::CREATED {
        let details = response.text().await.unwrap_or_default();
        return Err((
            StatusCode::BAD_GATEWAY,
            format!("Leader rejected job: {details}"),
        ));
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Job successfully forwarded to leader",
            "leader": leader.to_string(),
        })),
    ))
}

/// POST /api/jobs/create
///
/// Leader-only: persist the scene file, build the job record and announce
/// `JOB_CREATED` on the control channel.
async fn create_job(
    State(node): State<Arc<Node>>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    let (fields, files) = collect_multipart(multipart).await?;
    let file = files
        .get("file")
        .ok_or((StatusCode::BAD_REQUEST, "No file provided".to_string()))?;
    require_blend(file)?;

    let params = params_from_fields(&fields)?;
    let meta = node
        .coordinator
        .create_job(&file.filename, &file.bytes, params)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Job created successfully",
            "job_id": meta.job_id,
            "job_dir": node.store.job_dir(&meta.job_id),
        })),
    ))
}

fn params_from_fields(
    fields: &HashMap<String, String>,
) -> Result<JobParams, (StatusCode, String)> {
    fn required<T: std::str::FromStr>(
        fields: &HashMap<String, String>,
        key: &str,
    ) -> Result<T, (StatusCode, String)> {
        fields
            .get(key)
            .and_then(|v| v.parse().ok())
            .ok_or((StatusCode::BAD_REQUEST, format!("missing or invalid {key}")))
    }

    let frame_start: u32 = required(fields, "frame_start")?;
    let frame_end: u32 = required(fields, "frame_end")?;
    if frame_end < frame_start {
        return Err((
            StatusCode::BAD_REQUEST,
            "frame_end must not precede frame_start".into(),
        ));
    }

    let known = [
        "frame_start",
        "frame_end",
        "fps",
        "renderer",
        "initiator_client_ip",
        "initiator_is_participant",
    ];
    let extra: BTreeMap<String, Value> = fields
        .iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    Ok(JobParams {
        frame_start,
        frame_end,
        fps: required(fields, "fps")?,
        renderer: fields.get("renderer").cloned(),
        initiator_client_ip: required(fields, "initiator_client_ip")?,
        initiator_is_participant: parse_participant_flag(fields.get("initiator_is_participant")),
        extra,
    })
}

#[derive(Debug, Deserialize)]
struct JobRef {
    uuid: String,
}

/// POST /api/jobs/broadcast-to-workers
async fn broadcast_to_workers(
    State(node): State<Arc<Node>>,
    Json(body): Json<JobRef>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if body.uuid.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "uuid is required".into()));
    }
    if node.election.my_role() != Role::Leader {
        return Err(error_response(NodeError::NotLeader));
    }
    let report = node
        .coordinator
        .broadcast_job(&body.uuid)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}

/// POST /api/jobs/submit-frames
///
/// Frame intake at the leader. Uploads against a job that is not in
/// progress are rejected with 409.
async fn submit_frames(
    State(node): State<Arc<Node>>,
    multipart: Multipart,
) -> Result<Json<Value>, (StatusCode, String)> {
    let (fields, files) = collect_multipart(multipart).await?;
    let job_id = fields
        .get("uuid")
        .filter(|id| !id.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "uuid is required".to_string()))?;
    let image = files
        .get("image")
        .ok_or((StatusCode::BAD_REQUEST, "image file is required".to_string()))?;

    let filename = if image.filename.is_empty() {
        format!("frame_{}.png", chrono::Utc::now().timestamp_micros())
    } else {
        image.filename.clone()
    };

    let receipt = node
        .coordinator
        .accept_frame(job_id, &filename, &image.bytes)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(receipt).unwrap_or_default()))
}

/// POST /api/jobs/send-video-to-client
///
/// Delivery endpoint on the submitting client: store the stitched video
/// under the job directory.
async fn send_video_to_client(
    State(node): State<Arc<Node>>,
    multipart: Multipart,
) -> Result<Json<Value>, (StatusCode, String)> {
    let (fields, files) = collect_multipart(multipart).await?;
    let job_id = fields
        .get("uuid")
        .filter(|id| !id.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "uuid is required".to_string()))?;
    let video = files
        .get("video")
        .ok_or((StatusCode::BAD_REQUEST, "video file is missing".to_string()))?;

    if !node.store.exists(job_id).await {
        return Err((StatusCode::NOT_FOUND, "Job folder not found".into()));
    }

    let path = node
        .store
        .save_delivered_video(job_id, &video.bytes)
        .await
        .map_err(error_response)?;
    info!(
        %job_id,
        status = fields.get("status").map(String::as_str).unwrap_or("unknown"),
        from = fields.get("client_ip").map(String::as_str).unwrap_or("unknown"),
        "video received"
    );

    Ok(Json(json!({
        "message": "Video received successfully",
        "job_id": job_id,
        "path": path,
    })))
}

/// POST /api/jobs/analyze
async fn analyze_blend(
    State(node): State<Arc<Node>>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    let (_, files) = collect_multipart(multipart).await?;
    let file = files
        .get("file")
        .ok_or((StatusCode::BAD_REQUEST, "No file provided".to_string()))?;
    require_blend(file)?;

    let dir = tempfile::tempdir()
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let scene = dir.path().join(&file.filename);
    tokio::fs::write(&scene, &file.bytes)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let info = node
        .renderer
        .analyze(&scene)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(info).unwrap_or_default()),
    ))
}

/// POST /api/jobs/cancel-all
async fn cancel_all(
    State(node): State<Arc<Node>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if node.election.my_role() != Role::Leader {
        return Err(error_response(NodeError::NotLeader));
    }
    let seq = node.coordinator.cancel_all();
    Ok(Json(json!({
        "message": "Cancel-all issued",
        "seq": seq,
    })))
}

/// GET /api/jobs
async fn list_jobs(
    State(node): State<Arc<Node>>,
) -> Result<Json<Vec<JobMetadata>>, (StatusCode, String)> {
    let jobs = node.store.list_jobs().await.map_err(error_response)?;
    Ok(Json(jobs))
}

/// GET /api/jobs/:job_id
async fn get_job(
    State(node): State<Arc<Node>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobMetadata>, (StatusCode, String)> {
    let meta = node
        .store
        .load_metadata(&job_id)
        .await
        .map_err(error_response)?;
    Ok(Json(meta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_flag_parsing() {
        assert!(parse_participant_flag(None), "absent flag defaults to participating");
        assert!(parse_participant_flag(Some(&"true".to_string())));
        assert!(parse_participant_flag(Some(&"yes".to_string())));
        assert!(!parse_participant_flag(Some(&"false".to_string())));
        assert!(!parse_participant_flag(Some(&"undefined".to_string())));
        assert!(!parse_participant_flag(Some(&"0".to_string())));
    }

    #[test]
    fn test_params_require_frame_range_and_fps() {
        let mut fields = HashMap::new();
        fields.insert("frame_start".to_string(), "1".to_string());
        fields.insert("frame_end".to_string(), "10".to_string());
        assert!(params_from_fields(&fields).is_err(), "fps is required");

        fields.insert("fps".to_string(), "24".to_string());
        fields.insert("initiator_client_ip".to_string(), "10.0.0.1".to_string());
        fields.insert("samples".to_string(), "64".to_string());
        let params = params_from_fields(&fields).unwrap();
        assert_eq!(params.fps, 24);
        assert!(params.initiator_is_participant);
        assert_eq!(params.extra["samples"], Value::String("64".into()));
    }

    #[test]
    fn test_params_reject_inverted_frame_range() {
        let mut fields = HashMap::new();
        fields.insert("frame_start".to_string(), "10".to_string());
        fields.insert("frame_end".to_string(), "1".to_string());
        fields.insert("fps".to_string(), "24".to_string());
        fields.insert("initiator_client_ip".to_string(), "10.0.0.1".to_string());
        let err = params_from_fields(&fields).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}

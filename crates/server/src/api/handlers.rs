//! Request handlers.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use nemorosa_core::metainfo::InfoHash;
use nemorosa_core::orchestrator::{AnnounceRequest, OrchestratorError};
use nemorosa_core::pipeline::JobEntry;
use nemorosa_core::RunOutcome;

use crate::metrics::{self, PIPELINE_OUTCOMES_TOTAL};
use crate::state::AppState;

/// Server banner with the endpoint list.
pub async fn root() -> impl IntoResponse {
    Json(json!({
        "name": "nemorosa",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "webhook": "/api/webhook",
            "jobs": "/jobs",
            "metrics": "/metrics",
        },
    }))
}

/// Prometheus text exposition.
pub async fn metrics() -> impl IntoResponse {
    metrics::gather()
}

#[derive(Debug, Deserialize)]
pub struct WebhookParams {
    #[serde(rename = "infoHash")]
    pub info_hash: Option<String>,
    pub name: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub status: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping_summary: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CandidateSummary {
    pub site_id: String,
    pub remote_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infohash: Option<InfoHash>,
}

/// Announce-triggered processing. Resolution and the pipeline run happen
/// within the orchestrator's announce deadline.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WebhookParams>,
) -> impl IntoResponse {
    let info_hash = match &params.info_hash {
        Some(raw) => match raw.parse::<InfoHash>() {
            Ok(hash) => Some(hash),
            Err(_) => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(ProcessResponse {
                        status: "error".into(),
                        result: "invalid_infohash".into(),
                        candidate: None,
                        mapping_summary: None,
                    }),
                );
            }
        },
        None => None,
    };

    let request = AnnounceRequest {
        info_hash,
        name: params.name,
        size: params.size,
    };

    match state.orchestrator().process_announce(request).await {
        Ok(result) => {
            let tag = format!("{:?}", result.outcome.state()).to_lowercase();
            PIPELINE_OUTCOMES_TOTAL
                .with_label_values(&[tag.as_str()])
                .inc();
            match result.outcome {
                RunOutcome::Matched {
                    site_id,
                    remote_id,
                    candidate_infohash,
                    mapping_summary,
                } => (
                    StatusCode::OK,
                    Json(ProcessResponse {
                        status: "matched".into(),
                        result: "matched".into(),
                        candidate: Some(CandidateSummary {
                            site_id,
                            remote_id,
                            infohash: candidate_infohash,
                        }),
                        mapping_summary: Some(mapping_summary),
                    }),
                ),
                RunOutcome::Skipped { reason } => (
                    StatusCode::ACCEPTED,
                    Json(ProcessResponse {
                        status: "accepted".into(),
                        result: "skipped".into(),
                        candidate: None,
                        mapping_summary: Some(reason),
                    }),
                ),
                RunOutcome::NoMatch { .. } => (
                    StatusCode::ACCEPTED,
                    Json(ProcessResponse {
                        status: "accepted".into(),
                        result: "no_match".into(),
                        candidate: None,
                        mapping_summary: None,
                    }),
                ),
                RunOutcome::DownloadFailed { site_id, remote_id } => (
                    StatusCode::ACCEPTED,
                    Json(ProcessResponse {
                        status: "accepted".into(),
                        result: "download_failed".into(),
                        candidate: Some(CandidateSummary {
                            site_id,
                            remote_id,
                            infohash: None,
                        }),
                        mapping_summary: None,
                    }),
                ),
                RunOutcome::InjectFailed { detail } => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ProcessResponse {
                        status: "error".into(),
                        result: "inject_failed".into(),
                        candidate: None,
                        mapping_summary: Some(detail),
                    }),
                ),
                RunOutcome::VerifyFailed { site_id, remote_id } => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ProcessResponse {
                        status: "error".into(),
                        result: "verify_failed".into(),
                        candidate: Some(CandidateSummary {
                            site_id,
                            remote_id,
                            infohash: None,
                        }),
                        mapping_summary: None,
                    }),
                ),
            }
        }
        Err(OrchestratorError::UnknownHash(_)) | Err(OrchestratorError::Unresolvable) => (
            StatusCode::NOT_FOUND,
            Json(ProcessResponse {
                status: "error".into(),
                result: "unknown_torrent".into(),
                candidate: None,
                mapping_summary: None,
            }),
        ),
        Err(OrchestratorError::Timeout) => (
            StatusCode::REQUEST_TIMEOUT,
            Json(ProcessResponse {
                status: "error".into(),
                result: "timeout".into(),
                candidate: None,
                mapping_summary: None,
            }),
        ),
        Err(OrchestratorError::Busy(_)) => (
            StatusCode::ACCEPTED,
            Json(ProcessResponse {
                status: "accepted".into(),
                result: "in_progress".into(),
                candidate: None,
                mapping_summary: None,
            }),
        ),
        Err(e) => {
            warn!("webhook processing failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ProcessResponse {
                    status: "error".into(),
                    result: "internal_error".into(),
                    candidate: None,
                    mapping_summary: None,
                }),
            )
        }
    }
}

/// Running and recently finished pipeline jobs.
pub async fn jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobEntry>> {
    Json(state.jobs().snapshot().await)
}

use crate::AppState;
use crate::cache::{RefreshRefused, Status, ThumbnailState};
use crate::error::ErrorKind;
use crate::video::{VideoRef, is_valid_video_id};
use axum::extract::{Extension, Path};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Serialize, Deserialize, Debug)]
pub struct SubmitResponse {
    pub accepted: Vec<String>,
    pub skipped: Vec<String>,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ThumbnailsResponse {
    pub thumbnails: BTreeMap<String, Status>,
    pub pending: usize,
    pub ready: usize,
    pub failed: usize,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ThumbnailStatusResponse {
    pub id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ThumbnailStatusResponse {
    fn new(id: String, status: Status) -> Self {
        Self {
            id,
            status,
            error: None,
            message: None,
        }
    }
}

/// Reason a submitted video is refused, if any. Locators are judged after
/// resolving against `base`.
fn rejection(video: &VideoRef, base: Option<&str>) -> Option<String> {
    if !is_valid_video_id(video.id()) {
        return Some(format!("Invalid video id: {:?}", video.id()));
    }
    if video.locator().trim().is_empty() {
        return Some(format!("Video {} has an empty url", video.id()));
    }
    if !video.clone().resolved(base).is_network() {
        return Some(format!(
            "Video {} must resolve to an http(s) url, got {:?}",
            video.id(),
            video.locator()
        ));
    }
    None
}

/// Queues a batch of videos. The whole batch is refused if any entry is
/// malformed; already known ids are reported as skipped.
#[axum::debug_handler]
pub async fn submit_thumbnails(
    Extension(state): Extension<AppState>,
    Json(videos): Json<Vec<VideoRef>>,
) -> impl IntoResponse {
    let base = state.media_base_url.as_deref();
    if let Some(message) = videos.iter().find_map(|video| rejection(video, base)) {
        return (
            StatusCode::BAD_REQUEST,
            Json(SubmitResponse {
                accepted: Vec::new(),
                skipped: Vec::new(),
                message,
            }),
        );
    }

    let mut accepted = Vec::new();
    let mut skipped = Vec::new();
    for video in videos {
        let id = video.id().to_string();
        if state.submit(video) {
            accepted.push(id);
        } else {
            skipped.push(id);
        }
    }

    info!(
        accepted = accepted.len(),
        skipped = skipped.len(),
        "Thumbnail batch submitted"
    );

    (
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            message: format!("{} queued, {} skipped", accepted.len(), skipped.len()),
            accepted,
            skipped,
        }),
    )
}

#[axum::debug_handler]
pub async fn list_thumbnails(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let thumbnails: BTreeMap<_, _> = state.cache.snapshot().into_iter().collect();
    let count = |status: Status| thumbnails.values().filter(|&&s| s == status).count();

    let response = ThumbnailsResponse {
        pending: count(Status::Pending),
        ready: count(Status::Ready),
        failed: count(Status::Failed),
        thumbnails,
    };

    (StatusCode::OK, Json(response))
}

#[axum::debug_handler]
pub async fn get_thumbnail(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.thumbnail(&id) {
        ThumbnailState::Ready(thumbnail) => {
            debug!(%id, bytes = thumbnail.image.len(), "Serving thumbnail");
            (
                [
                    (header::CONTENT_TYPE, "image/png"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                thumbnail.image,
            )
                .into_response()
        }
        ThumbnailState::Pending => (
            StatusCode::ACCEPTED,
            Json(ThumbnailStatusResponse::new(id, Status::Pending)),
        )
            .into_response(),
        ThumbnailState::Absent => (
            StatusCode::NOT_FOUND,
            Json(ThumbnailStatusResponse::new(id, Status::Absent)),
        )
            .into_response(),
        ThumbnailState::Failed(error) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ThumbnailStatusResponse {
                error: Some(error.kind()),
                message: Some(error.to_string()),
                ..ThumbnailStatusResponse::new(id, Status::Failed)
            }),
        )
            .into_response(),
    }
}

#[axum::debug_handler]
pub async fn refresh_thumbnail(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (code, status) = match state.refresh(&id) {
        Ok(()) => (StatusCode::ACCEPTED, Status::Pending),
        Err(RefreshRefused::Unknown) => (StatusCode::NOT_FOUND, Status::Absent),
        Err(RefreshRefused::InFlight) => (StatusCode::CONFLICT, Status::Pending),
    };

    (code, Json(ThumbnailStatusResponse::new(id, status)))
}

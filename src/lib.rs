pub mod api;
pub mod app_state;
pub mod cache;
pub mod config;
pub mod error;
pub mod extractor;
pub mod video;

use axum::Router;
use axum::extract::Extension;
use axum::routing::{get, post};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

//
// Re-export
//
pub use api::{
    SubmitResponse, ThumbnailStatusResponse, ThumbnailsResponse, get_thumbnail, list_thumbnails,
    log_request_errors, refresh_thumbnail, submit_thumbnails,
};
pub use app_state::{AppState, ThumbnailOutcome};
pub use cache::{RefreshRefused, Status, ThumbnailCache, ThumbnailState};
pub use config::Config;
pub use error::{ErrorKind, ThumbnailError};
pub use extractor::ffmpeg::FfmpegBackend;
pub use extractor::{
    CancelFlag, DecodingHandle, Extractor, MediaBackend, RgbFrame, Thumbnail, Thumbnailer,
    VideoMetadata,
};
pub use video::{VideoRef, is_valid_video_id};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/thumbnails", post(submit_thumbnails).get(list_thumbnails))
        .route("/thumbnails/{id}", get(get_thumbnail))
        .route("/thumbnails/{id}/refresh", post(refresh_thumbnail))
        .layer(axum::middleware::from_fn(log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}

/// Serves the HTTP surface on `config.listen_on_port` with any [`Thumbnailer`].
pub async fn serve(config: Config, thumbnailer: Arc<dyn Thumbnailer>) -> anyhow::Result<()> {
    let state = AppState::new(thumbnailer, config.permits, config.media_base_url.clone());
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.listen_on_port);
    info!("Thumbnail API listening on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Serves thumbnails decoded with FFmpeg. `ffmpeg_next::init` must have run.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let backend = FfmpegBackend::new(config.metadata_timeout());
    let extractor =
        Extractor::new(backend).with_timeouts(config.metadata_timeout(), config.seek_timeout());
    info!(
        metadata_timeout = ?config.metadata_timeout(),
        seek_timeout = ?config.seek_timeout(),
        "Using FFmpeg backend"
    );

    serve(config, Arc::new(extractor)).await
}

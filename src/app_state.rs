use crate::cache::{RefreshRefused, ThumbnailCache, ThumbnailState};
use crate::error::ThumbnailError;
use crate::extractor::{Thumbnail, Thumbnailer};
use crate::video::VideoRef;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::stream::FuturesUnordered;
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, error, info, warn};

const OUTCOME_CAPACITY: usize = 256;

/// Result of one extraction, keyed by video id.
#[derive(Clone, Debug)]
pub struct ThumbnailOutcome {
    pub id: String,
    pub result: Result<Thumbnail, Arc<ThumbnailError>>,
}

#[derive(Clone)]
pub struct AppState {
    pub job_tx: UnboundedSender<VideoRef>,
    pub cache: ThumbnailCache,
    pub media_base_url: Option<String>,
    outcomes: broadcast::Sender<ThumbnailOutcome>,
}

impl AppState {
    /// Must be called inside a tokio runtime: the dispatcher loop is spawned
    /// right away.
    pub fn new(
        thumbnailer: Arc<dyn Thumbnailer>,
        permits: usize,
        media_base_url: Option<String>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);

        let this = Self {
            job_tx: tx,
            cache: ThumbnailCache::new(),
            media_base_url,
            outcomes,
        };

        this.handle_jobs(rx, thumbnailer, permits);
        this
    }

    /// Queues an extraction unless one is in flight or already resolved for
    /// this id and locator. Returns whether a decode was started.
    pub fn submit(&self, video: VideoRef) -> bool {
        let video = video.resolved(self.media_base_url.as_deref());
        if !self.cache.begin(&video) {
            debug!(id = video.id(), "Skipping duplicate thumbnail request");
            return false;
        }
        self.enqueue(video);
        true
    }

    /// Re-extracts a finished thumbnail with the locator it was produced from.
    pub fn refresh(&self, id: &str) -> Result<(), RefreshRefused> {
        let video = self.cache.refresh(id)?;
        info!(id, "Thumbnail refresh requested");
        self.enqueue(video);
        Ok(())
    }

    pub fn thumbnail(&self, id: &str) -> ThumbnailState {
        self.cache.get(id)
    }

    /// Outcomes published after subscribing; completion order is arbitrary.
    pub fn subscribe(&self) -> broadcast::Receiver<ThumbnailOutcome> {
        self.outcomes.subscribe()
    }

    fn enqueue(&self, video: VideoRef) {
        let id = video.id().to_string();
        if let Err(err) = self.job_tx.unbounded_send(video) {
            error!(%id, ?err, "Thumbnail dispatcher is gone");
            self.cache.complete(
                &id,
                Err(Arc::new(ThumbnailError::load("dispatcher stopped"))),
            );
        }
    }

    fn finish(&self, video: VideoRef, result: Result<Thumbnail, ThumbnailError>) {
        let VideoRef {
            id,
            resource_locator,
        } = video;
        let result = result.map_err(Arc::new);

        match &result {
            Ok(thumbnail) => info!(
                %id,
                width = thumbnail.width,
                height = thumbnail.height,
                bytes = thumbnail.image.len(),
                "Thumbnail ready"
            ),
            Err(error) => warn!(
                %id,
                locator = %resource_locator,
                kind = %error.kind(),
                %error,
                "Thumbnail extraction failed"
            ),
        }

        self.cache.complete(&id, result.clone());
        // nobody listening is fine, the cache holds the result
        _ = self.outcomes.send(ThumbnailOutcome { id, result });
    }

    fn handle_jobs(
        &self,
        rx: UnboundedReceiver<VideoRef>,
        thumbnailer: Arc<dyn Thumbnailer>,
        permits: usize,
    ) {
        info!(permits, "Thumbnail dispatcher started");
        let this = self.clone();
        let semaphore = Arc::new(Semaphore::new(permits));

        tokio::spawn(async move {
            let mut rx = rx.fuse();
            let mut tasks = FuturesUnordered::new();

            loop {
                futures::select! {
                    maybe_video = rx.next() => {
                        let Some(video) = maybe_video else {
                            debug!("Thumbnail queue closed");
                            break;
                        };

                        info!(id = video.id(), locator = video.locator(), "Extraction queued");
                        let thumbnailer = thumbnailer.clone();
                        let semaphore = semaphore.clone();
                        tasks.push(async move {
                            let _permit = semaphore.acquire_owned().await;
                            let result = thumbnailer.extract_thumbnail(video.locator()).await;
                            (video, result)
                        });
                    }
                    (video, result) = tasks.select_next_some() => {
                        this.finish(video, result);
                    }
                }
            }

            debug!("Thumbnail dispatcher finished");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Status;
    use crate::error::ErrorKind;
    use crate::extractor::Extractor;
    use crate::extractor::testing::{Behavior, Clip, ScriptedBackend};
    use std::time::Duration;

    fn build_state(backend: ScriptedBackend) -> (AppState, Arc<Extractor<ScriptedBackend>>) {
        let extractor = Arc::new(Extractor::new(backend));
        let state = AppState::new(extractor.clone(), 4, Some("https://host/uploads".into()));
        (state, extractor)
    }

    async fn next_outcome(rx: &mut broadcast::Receiver<ThumbnailOutcome>) -> ThumbnailOutcome {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("outcome within 5s")
            .expect("outcome channel open")
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let backend = ScriptedBackend::default()
            .with_clip("https://host/v.mp4", Clip::playable(12.0, 640, 360));
        let (state, extractor) = build_state(backend);
        let mut rx = state.subscribe();

        assert!(state.submit(VideoRef::new("a", "https://host/v.mp4")));
        let outcome = next_outcome(&mut rx).await;

        assert_eq!(outcome.id, "a");
        let thumbnail = outcome.result.unwrap();
        let decoded = image::load_from_memory(&thumbnail.image).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 360));
        assert_eq!(
            *extractor.backend().seeks.lock(),
            vec![Duration::from_secs(5)]
        );
        assert_eq!(state.thumbnail("a").status(), Status::Ready);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_id() {
        let backend = ScriptedBackend::default()
            .with_clip("https://host/good.mp4", Clip::playable(8.0, 64, 36));
        let (state, _extractor) = build_state(backend);
        let mut rx = state.subscribe();

        assert!(state.submit(VideoRef::new("bad", "https://unreachable/v.mp4")));
        assert!(state.submit(VideoRef::new("good", "https://host/good.mp4")));

        let mut outcomes = vec![next_outcome(&mut rx).await, next_outcome(&mut rx).await];
        outcomes.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(outcomes[0].id, "bad");
        assert_eq!(
            outcomes[0].result.as_ref().unwrap_err().kind(),
            ErrorKind::Load
        );
        assert_eq!(outcomes[1].id, "good");
        assert!(outcomes[1].result.is_ok());

        assert_eq!(state.thumbnail("bad").status(), Status::Failed);
        assert_eq!(state.thumbnail("good").status(), Status::Ready);
    }

    #[tokio::test]
    async fn test_duplicate_requests_decode_once() {
        let backend = ScriptedBackend::default()
            .with_clip("https://host/x.mp4", Clip::playable(8.0, 64, 36));
        let (state, extractor) = build_state(backend);
        let mut rx = state.subscribe();

        assert!(state.submit(VideoRef::new("x", "https://host/x.mp4")));
        assert!(!state.submit(VideoRef::new("x", "https://host/x.mp4")));
        next_outcome(&mut rx).await;

        assert!(!state.submit(VideoRef::new("x", "https://host/x.mp4")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(extractor.backend().opens(), 1);

        state.refresh("x").unwrap();
        next_outcome(&mut rx).await;
        assert_eq!(extractor.backend().opens(), 2);
        assert_eq!(extractor.backend().released(), 2);
    }

    #[tokio::test]
    async fn test_results_arrive_out_of_submission_order() {
        let backend = ScriptedBackend::default()
            .with_clip(
                "https://host/slow.mp4",
                Clip::playable(8.0, 64, 36).with(Behavior::StallSeek(Duration::from_millis(300))),
            )
            .with_clip("https://host/fast.mp4", Clip::playable(8.0, 64, 36));
        let (state, _extractor) = build_state(backend);
        let mut rx = state.subscribe();

        assert!(state.submit(VideoRef::new("slow", "https://host/slow.mp4")));
        assert!(state.submit(VideoRef::new("fast", "https://host/fast.mp4")));

        assert_eq!(next_outcome(&mut rx).await.id, "fast");
        assert_eq!(state.thumbnail("slow").status(), Status::Pending);
        assert_eq!(next_outcome(&mut rx).await.id, "slow");
    }

    #[tokio::test]
    async fn test_bare_filename_resolves_against_base_url() {
        let backend = ScriptedBackend::default()
            .with_clip("https://host/uploads/reel.mp4", Clip::playable(2.0, 64, 36));
        let (state, extractor) = build_state(backend);
        let mut rx = state.subscribe();

        assert!(state.submit(VideoRef::new("reel", "reel.mp4")));
        assert!(next_outcome(&mut rx).await.result.is_ok());
        assert_eq!(
            *extractor.backend().seeks.lock(),
            vec![Duration::from_secs(1)]
        );
    }

    #[tokio::test]
    async fn test_refresh_refusals() {
        let backend = ScriptedBackend::default();
        let (state, _extractor) = build_state(backend);

        assert_eq!(state.refresh("nope").unwrap_err(), RefreshRefused::Unknown);
    }

    #[tokio::test]
    async fn test_timed_out_decodes_stay_within_permits() {
        let stalled =
            Clip::playable(12.0, 64, 36).with(Behavior::StallSeek(Duration::from_millis(1500)));
        let backend = ScriptedBackend::default()
            .with_clip("https://host/1.mp4", stalled)
            .with_clip("https://host/2.mp4", stalled)
            .with_clip("https://host/3.mp4", stalled);
        let extractor = Arc::new(
            Extractor::new(backend).with_timeouts(Duration::from_secs(5), Duration::from_millis(50)),
        );
        let state = AppState::new(extractor.clone(), 1, None);
        let mut rx = state.subscribe();

        for id in ["1", "2", "3"] {
            assert!(state.submit(VideoRef::new(id, format!("https://host/{id}.mp4"))));
        }
        for _ in 0..3 {
            let outcome = next_outcome(&mut rx).await;
            assert_eq!(
                outcome.result.as_ref().unwrap_err().kind(),
                ErrorKind::Seek
            );
        }

        let backend = extractor.backend();
        assert_eq!(backend.opens(), 3);
        assert_eq!(backend.released(), 3);
        assert_eq!(backend.live(), 0);
        assert_eq!(backend.max_live(), 1);
    }
}

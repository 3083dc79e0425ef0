//! Thumbnail extraction.
//!
//! An extraction opens a video, waits for its metadata, seeks to a
//! representative timestamp, renders the settled frame and encodes it as PNG.
//! The decoding work itself is blocking, so each step runs on tokio's blocking
//! pool under its own timeout while the calling task stays suspended. A step
//! that runs out of time is cancelled through its [`CancelFlag`], and the
//! extraction only returns once the step has stopped and dropped its handle.

pub mod encode;
pub mod ffmpeg;

use crate::error::{Cause, StepTimeout, ThumbnailError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::spawn_blocking;
use tracing::{debug, trace, warn};

/// Frames before this point are often black or still fading in.
pub const MAX_SEEK_SECS: f64 = 5.0;
/// Width used when the decoder cannot report one.
pub const FALLBACK_WIDTH: u32 = 320;

pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SEEK_TIMEOUT: Duration = Duration::from_secs(15);

/// What the decoder knows once the resource is open.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VideoMetadata {
    pub duration: Duration,
    /// Natural width, 0 when unknown.
    pub width: u32,
    /// Natural height, 0 when unknown.
    pub height: u32,
}

/// Tightly packed RGB24 pixels.
#[derive(Clone, Debug)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbFrame {
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            width,
            height,
            data,
        }
    }
}

/// An encoded thumbnail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thumbnail {
    pub image: Bytes,
    pub width: u32,
    pub height: u32,
}

/// Raised once an extraction step has run out of time. Backends poll it
/// while blocked and give up as soon as it is set.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Stable address of the flag, valid while any clone is alive.
    pub fn as_ptr(&self) -> *const AtomicBool {
        Arc::as_ptr(&self.0)
    }
}

/// Something that can open a video resource for decoding.
pub trait MediaBackend: Send + Sync + 'static {
    type Handle: DecodingHandle;

    /// Opens `locator` muted and without credentials, blocking until the
    /// duration and natural dimensions are known. The returned handle keeps
    /// watching `cancel` for the rest of its life.
    fn open(&self, locator: &str, cancel: &CancelFlag) -> Result<Self::Handle, ThumbnailError>;
}

/// An open, seekable video stream. Dropping it releases the resource.
pub trait DecodingHandle: Send + 'static {
    fn metadata(&self) -> VideoMetadata;

    /// Blocks until the decoder has settled on a frame at or near `target`.
    fn seek(&mut self, target: Duration) -> Result<(), ThumbnailError>;

    /// Renders the settled frame into a `width` x `height` RGB buffer.
    fn render(&mut self, width: u32, height: u32) -> Result<RgbFrame, ThumbnailError>;
}

/// Object-safe entry point used by the dispatcher.
#[async_trait]
pub trait Thumbnailer: Send + Sync {
    async fn extract_thumbnail(&self, locator: &str) -> Result<Thumbnail, ThumbnailError>;
}

/// `min(5s, duration / 2)`.
pub fn seek_target(duration: Duration) -> Duration {
    Duration::from_secs_f64(MAX_SEEK_SECS).min(duration / 2)
}

/// Natural size, or 320 wide and a 16:9 height when the decoder has none.
pub fn frame_dimensions(width: u32, height: u32) -> (u32, u32) {
    let width = if width == 0 { FALLBACK_WIDTH } else { width };
    let height = if height == 0 { width * 9 / 16 } else { height };
    (width, height)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractionState {
    Idle,
    Opening,
    MetadataReady,
    Seeking,
    FrameReady,
    Encoded,
    Failed,
}

impl ExtractionState {
    fn step(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Opening => 1,
            Self::MetadataReady => 2,
            Self::Seeking => 3,
            Self::FrameReady => 4,
            Self::Encoded => 5,
            Self::Failed => u8::MAX,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Encoded | Self::Failed)
    }

    /// Forward by exactly one step, or to `Failed` from any live state.
    pub fn can_advance_to(self, next: Self) -> bool {
        !self.is_terminal() && (next == Self::Failed || next.step() == self.step() + 1)
    }
}

/// Bookkeeping for one extraction; lives only as long as the call.
#[derive(Debug)]
struct ExtractionJob<'a> {
    locator: &'a str,
    state: ExtractionState,
    target: Option<Duration>,
    started: Instant,
}

impl<'a> ExtractionJob<'a> {
    fn new(locator: &'a str) -> Self {
        Self {
            locator,
            state: ExtractionState::Idle,
            target: None,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: ExtractionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        trace!(locator = self.locator, from = ?self.state, to = ?next, "Extraction state");
        self.state = next;
    }
}

/// Runs a blocking step on the blocking pool, bounded by `limit`.
///
/// On timeout `cancel` is raised and the step is awaited until it returns, so
/// whatever it owns (the decoding handle) is dropped before this does.
async fn blocking_step<T, F>(
    step: &'static str,
    limit: Duration,
    cancel: &CancelFlag,
    failure: fn(Cause) -> ThumbnailError,
    f: F,
) -> Result<T, ThumbnailError>
where
    F: FnOnce() -> Result<T, ThumbnailError> + Send + 'static,
    T: Send + 'static,
{
    let mut task = spawn_blocking(f);
    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(failure(Box::new(join_error))),
        Err(_) => {
            warn!(step, ?limit, "Extraction step timed out, cancelling");
            cancel.cancel();
            let waited = Instant::now();
            // the late result (handle included) is dropped here
            _ = task.await;
            debug!(step, waited = ?waited.elapsed(), "Cancelled step stopped");
            Err(failure(Box::new(StepTimeout { step, limit })))
        }
    }
}

/// Extracts thumbnails through a [`MediaBackend`].
///
/// Holds no per-video state: every call opens its own handle and nothing is
/// cached between calls.
#[derive(Debug)]
pub struct Extractor<B> {
    backend: Arc<B>,
    metadata_timeout: Duration,
    seek_timeout: Duration,
}

impl<B: MediaBackend> Extractor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            seek_timeout: DEFAULT_SEEK_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, metadata_timeout: Duration, seek_timeout: Duration) -> Self {
        self.metadata_timeout = metadata_timeout;
        self.seek_timeout = seek_timeout;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn extract(&self, locator: &str) -> Result<Thumbnail, ThumbnailError> {
        let mut job = ExtractionJob::new(locator);
        let result = self.run(&mut job).await;

        match &result {
            Ok(thumbnail) => {
                job.advance(ExtractionState::Encoded);
                debug!(
                    locator,
                    target = ?job.target,
                    width = thumbnail.width,
                    height = thumbnail.height,
                    bytes = thumbnail.image.len(),
                    elapsed = ?job.started.elapsed(),
                    "Thumbnail extracted"
                );
            }
            Err(error) => {
                job.advance(ExtractionState::Failed);
                debug!(locator, kind = %error.kind(), %error, "Thumbnail extraction failed");
            }
        }

        result
    }

    async fn run(&self, job: &mut ExtractionJob<'_>) -> Result<Thumbnail, ThumbnailError> {
        job.advance(ExtractionState::Opening);
        let cancel = CancelFlag::new();
        let backend = self.backend.clone();
        let locator = job.locator.to_string();
        let open_cancel = cancel.clone();
        let handle = blocking_step(
            "metadata",
            self.metadata_timeout,
            &cancel,
            ThumbnailError::Load,
            move || backend.open(&locator, &open_cancel),
        )
        .await?;

        let metadata = handle.metadata();
        job.advance(ExtractionState::MetadataReady);

        let target = seek_target(metadata.duration);
        let (width, height) = frame_dimensions(metadata.width, metadata.height);
        job.target = Some(target);
        trace!(locator = job.locator, ?metadata, ?target, "Metadata ready");

        job.advance(ExtractionState::Seeking);
        let frame = blocking_step(
            "seek",
            self.seek_timeout,
            &cancel,
            ThumbnailError::Seek,
            move || {
                let mut handle = handle;
                handle.seek(target)?;
                handle.render(width, height)
            },
        )
        .await?;
        job.advance(ExtractionState::FrameReady);

        let (width, height) = (frame.width, frame.height);
        let image = spawn_blocking(move || encode::encode_png(&frame))
            .await
            .map_err(ThumbnailError::encode)??;

        Ok(Thumbnail {
            image,
            width,
            height,
        })
    }
}

#[async_trait]
impl<B: MediaBackend> Thumbnailer for Extractor<B> {
    async fn extract_thumbnail(&self, locator: &str) -> Result<Thumbnail, ThumbnailError> {
        self.extract(locator).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// Sleeps for `delay` in short slices, giving up once `cancel` is raised.
    fn stall(delay: Duration, cancel: &CancelFlag) -> bool {
        let until = Instant::now() + delay;
        while Instant::now() < until {
            if cancel.is_cancelled() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    #[derive(Clone, Copy, Debug)]
    pub(crate) enum Behavior {
        Playable,
        Unreachable,
        SeekFails,
        BlankFrame,
        StallOpen(Duration),
        StallSeek(Duration),
    }

    #[derive(Clone, Copy, Debug)]
    pub(crate) struct Clip {
        pub metadata: VideoMetadata,
        pub behavior: Behavior,
    }

    impl Clip {
        pub(crate) fn playable(secs: f64, width: u32, height: u32) -> Self {
            Self {
                metadata: VideoMetadata {
                    duration: Duration::from_secs_f64(secs),
                    width,
                    height,
                },
                behavior: Behavior::Playable,
            }
        }

        pub(crate) fn with(mut self, behavior: Behavior) -> Self {
            self.behavior = behavior;
            self
        }
    }

    /// In-memory backend that plays back scripted clips by locator.
    #[derive(Default)]
    pub(crate) struct ScriptedBackend {
        clips: HashMap<String, Clip>,
        pub opens: AtomicUsize,
        pub released: Arc<AtomicUsize>,
        pub live: Arc<AtomicUsize>,
        pub max_live: Arc<AtomicUsize>,
        pub seeks: Arc<Mutex<Vec<Duration>>>,
    }

    impl ScriptedBackend {
        pub(crate) fn with_clip(mut self, locator: &str, clip: Clip) -> Self {
            self.clips.insert(locator.to_string(), clip);
            self
        }

        pub(crate) fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        pub(crate) fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }

        /// Handles opened and not yet dropped.
        pub(crate) fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }

        /// Most handles ever open at the same time.
        pub(crate) fn max_live(&self) -> usize {
            self.max_live.load(Ordering::SeqCst)
        }
    }

    pub(crate) struct ScriptedHandle {
        clip: Clip,
        settled: bool,
        cancel: CancelFlag,
        released: Arc<AtomicUsize>,
        live: Arc<AtomicUsize>,
        seeks: Arc<Mutex<Vec<Duration>>>,
    }

    impl MediaBackend for ScriptedBackend {
        type Handle = ScriptedHandle;

        fn open(&self, locator: &str, cancel: &CancelFlag) -> Result<ScriptedHandle, ThumbnailError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let clip = self
                .clips
                .get(locator)
                .copied()
                .unwrap_or(Clip::playable(0.0, 0, 0).with(Behavior::Unreachable));

            match clip.behavior {
                Behavior::Unreachable => {
                    return Err(ThumbnailError::load(format!("{locator} is unreachable")));
                }
                Behavior::StallOpen(delay) if !stall(delay, cancel) => {
                    return Err(ThumbnailError::load("open interrupted"));
                }
                _ => {}
            }

            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(ScriptedHandle {
                clip,
                settled: false,
                cancel: cancel.clone(),
                released: self.released.clone(),
                live: self.live.clone(),
                seeks: self.seeks.clone(),
            })
        }
    }

    impl DecodingHandle for ScriptedHandle {
        fn metadata(&self) -> VideoMetadata {
            self.clip.metadata
        }

        fn seek(&mut self, target: Duration) -> Result<(), ThumbnailError> {
            self.seeks.lock().push(target);
            match self.clip.behavior {
                Behavior::SeekFails => return Err(ThumbnailError::seek("resource removed")),
                Behavior::StallSeek(delay) if !stall(delay, &self.cancel) => {
                    return Err(ThumbnailError::seek("seek interrupted"));
                }
                _ => {}
            }
            self.settled = true;
            Ok(())
        }

        fn render(&mut self, width: u32, height: u32) -> Result<RgbFrame, ThumbnailError> {
            if !self.settled {
                return Err(ThumbnailError::seek("no settled frame"));
            }
            if let Behavior::BlankFrame = self.clip.behavior {
                return Ok(RgbFrame::filled(0, 0, [0, 0, 0]));
            }
            Ok(RgbFrame::filled(width, height, [40, 80, 120]))
        }
    }

    impl Drop for ScriptedHandle {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

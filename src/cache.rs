use crate::error::ThumbnailError;
use crate::extractor::Thumbnail;
use crate::video::VideoRef;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// What the rendering layer sees for one id.
#[derive(Clone, Debug)]
pub enum ThumbnailState {
    Absent,
    Pending,
    Ready(Thumbnail),
    Failed(Arc<ThumbnailError>),
}

impl ThumbnailState {
    pub fn status(&self) -> Status {
        match self {
            Self::Absent => Status::Absent,
            Self::Pending => Status::Pending,
            Self::Ready(_) => Status::Ready,
            Self::Failed(_) => Status::Failed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Absent,
    Pending,
    Ready,
    Failed,
}

#[derive(Debug)]
struct Entry {
    locator: String,
    state: ThumbnailState,
}

/// Why [`ThumbnailCache::refresh`] did not restart an extraction.
#[derive(Debug, PartialEq, Eq)]
pub enum RefreshRefused {
    Unknown,
    InFlight,
}

/// Keyed thumbnail results. Every check-and-register happens under one lock,
/// so two submissions for the same id can never both start a decode.
#[derive(Clone, Debug, Default)]
pub struct ThumbnailCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ThumbnailCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `video` as pending and returns true if an extraction should
    /// start. Pending entries are never restarted; finished entries only when
    /// the locator changed.
    pub fn begin(&self, video: &VideoRef) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(video.id()) {
            Some(Entry {
                state: ThumbnailState::Pending,
                ..
            }) => {
                trace!(id = video.id(), "Extraction already in flight");
                false
            }
            Some(entry) if entry.locator == video.locator() => {
                trace!(id = video.id(), "Thumbnail already resolved");
                false
            }
            Some(entry) => {
                debug!(id = video.id(), old = %entry.locator, new = video.locator(), "Locator changed");
                entry.locator = video.locator().to_string();
                entry.state = ThumbnailState::Pending;
                true
            }
            None => {
                entries.insert(
                    video.id().to_string(),
                    Entry {
                        locator: video.locator().to_string(),
                        state: ThumbnailState::Pending,
                    },
                );
                true
            }
        }
    }

    /// Explicit re-extraction of a finished entry; returns the video to run.
    pub fn refresh(&self, id: &str) -> Result<VideoRef, RefreshRefused> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id).ok_or(RefreshRefused::Unknown)?;
        if let ThumbnailState::Pending = entry.state {
            return Err(RefreshRefused::InFlight);
        }
        entry.state = ThumbnailState::Pending;
        Ok(VideoRef::new(id, entry.locator.clone()))
    }

    /// Stores the outcome of an extraction started by [`begin`](Self::begin)
    /// or [`refresh`](Self::refresh).
    pub fn complete(&self, id: &str, result: Result<Thumbnail, Arc<ThumbnailError>>) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            debug!(id, "Dropping result for unknown id");
            return;
        };
        entry.state = match result {
            Ok(thumbnail) => ThumbnailState::Ready(thumbnail),
            Err(error) => ThumbnailState::Failed(error),
        };
    }

    pub fn get(&self, id: &str) -> ThumbnailState {
        self.entries
            .lock()
            .get(id)
            .map(|entry| entry.state.clone())
            .unwrap_or(ThumbnailState::Absent)
    }

    /// Status of every known id.
    pub fn snapshot(&self) -> HashMap<String, Status> {
        self.entries
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state.status()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

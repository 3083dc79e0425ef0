use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Underlying cause carried by every [`ThumbnailError`].
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a single thumbnail extraction.
///
/// Every variant keeps the error that triggered it so callers can log the
/// full chain. None of them is retried automatically.
#[derive(Error, Debug)]
pub enum ThumbnailError {
    /// The resource could not be opened or decoded at all (network failure,
    /// unsupported codec, access denied, metadata timeout).
    #[error("Failed to load video: {0}")]
    Load(#[source] Cause),
    /// The decoder never settled on a frame near the seek target.
    #[error("Failed to seek video: {0}")]
    Seek(#[source] Cause),
    /// The captured frame could not be serialized.
    #[error("Failed to encode thumbnail: {0}")]
    Encode(#[source] Cause),
}

impl ThumbnailError {
    pub fn load(cause: impl Into<Cause>) -> Self {
        Self::Load(cause.into())
    }

    pub fn seek(cause: impl Into<Cause>) -> Self {
        Self::Seek(cause.into())
    }

    pub fn encode(cause: impl Into<Cause>) -> Self {
        Self::Encode(cause.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Load(_) => ErrorKind::Load,
            Self::Seek(_) => ErrorKind::Seek,
            Self::Encode(_) => ErrorKind::Encode,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Load,
    Seek,
    Encode,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Load => "load_error",
            ErrorKind::Seek => "seek_error",
            ErrorKind::Encode => "encode_error",
        };
        f.write_str(name)
    }
}

/// A blocking step outlived its time budget.
#[derive(Error, Debug)]
#[error("{step} did not complete within {limit:?}")]
pub struct StepTimeout {
    pub step: &'static str,
    pub limit: Duration,
}

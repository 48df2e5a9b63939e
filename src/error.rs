/// Error taxonomy for the crop pipeline
///
/// Every failure kind is reported distinctly so callers can decide what to
/// show (a "no image" placeholder, a prompt to change the data root, ...).
/// The enum is `Clone` because a single in-flight computation hands the same
/// outcome to every requester waiting on that key.
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Malformed dataset input. Fatal for that dataset load only.
    #[error("dataset schema error: {0}")]
    Schema(String),

    /// A box that violates `xmax > xmin`, `ymax > ymin` or has a bad score.
    #[error("invalid bounding box [{xmin}, {ymin}, {xmax}, {ymax}]: {reason}")]
    InvalidBox {
        xmin: i64,
        ymin: i64,
        xmax: i64,
        ymax: i64,
        reason: String,
    },

    /// The declared image reference matched nothing under the data root.
    #[error("image not found: {reference} (data root: {})", data_root.display())]
    ImageNotFound {
        reference: String,
        data_root: PathBuf,
    },

    /// Every decoder in the fallback chain failed.
    #[error("failed to decode {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    /// Disk tier read/write failure. The cache degrades instead of surfacing it.
    #[error("cache I/O error at {}: {reason}", path.display())]
    CacheIo { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking worker panicked or was cancelled before producing a result.
    #[error("task join error: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn cache_io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Error::CacheIo {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// True for failures the user can fix by pointing at another data root.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ImageNotFound { .. })
    }
}

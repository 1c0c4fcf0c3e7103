use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[error("Invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    #[error("Invalid tile coordinate: {0}")]
    InvalidTileCoordinate(String),

    #[error("Unable to derive a file name from: {0}")]
    InvalidAssetUrl(String),

    #[error("Download already in progress: {0}")]
    DownloadInProgress(PathBuf),

    #[error("Search did not terminate after {0} pages")]
    PageLimitExceeded(usize),

    #[error("Search cursor did not advance: {0}")]
    StalledCursor(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("No source rasters found in {0}")]
    NoSourceRasters(PathBuf),

    #[error("Missing input artifact: {0}")]
    MissingArtifact(PathBuf),

    #[error("Failed to start {tool}: {source}")]
    ToolSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}")]
    ToolFailed { tool: String, status: String },

    #[error("{tool} did not finish within {after:?}")]
    ToolTimeout { tool: String, after: Duration },

    #[error("{0} did not finish within {1:?}")]
    Timeout(&'static str, Duration),

    #[error("A run is already in progress for {0}")]
    RunInProgress(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid settings: {0}")]
    Settings(String),
}

impl Error {
    /// Errors caused by the caller's input rather than by the system.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidBoundingBox(_) | Self::InvalidTileCoordinate(_)
        )
    }
}

//! Working directory of one provider.
//!
//! ```text
//! <base>/00_links.json        asset links of the last search
//! <base>/01_tiff/             downloaded source rasters
//! <base>/02_merged.tif
//! <base>/03_reprojected.tif
//! <base>/04_byte.vrt
//! <base>/05_tiles/{z}/{x}/{y}.png
//! ```
use crate::download::is_partial;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How far the raster pipeline has progressed. Each stage implies the ones
/// before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageProgress {
    NotStarted,
    Merged,
    Reprojected,
    Converted,
    Tiled,
}

#[derive(Debug, Clone)]
pub struct ProviderLayout {
    base: PathBuf,
}

impl ProviderLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn links_json(&self) -> PathBuf {
        self.base.join("00_links.json")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.base.join("01_tiff")
    }

    pub fn merged(&self) -> PathBuf {
        self.base.join("02_merged.tif")
    }

    pub fn reprojected(&self) -> PathBuf {
        self.base.join("03_reprojected.tif")
    }

    pub fn byte_vrt(&self) -> PathBuf {
        self.base.join("04_byte.vrt")
    }

    pub fn tiles_dir(&self) -> PathBuf {
        self.base.join("05_tiles")
    }

    /// Tiles are generated here and renamed into place when complete.
    pub fn tiles_partial(&self) -> PathBuf {
        self.base.join("05_tiles.partial")
    }

    /// The latest stage whose output exists. A stage's artifact counts even
    /// when earlier intermediates have been cleaned up.
    pub fn probe(&self) -> StageProgress {
        if self.tiles_dir().is_dir() {
            StageProgress::Tiled
        } else if self.byte_vrt().is_file() {
            StageProgress::Converted
        } else if self.reprojected().is_file() {
            StageProgress::Reprojected
        } else if self.merged().is_file() {
            StageProgress::Merged
        } else {
            StageProgress::NotStarted
        }
    }

    /// Completed downloads in the sources directory, sorted by name.
    pub fn source_rasters(&self) -> Result<Vec<PathBuf>> {
        let dir = self.sources_dir();
        if !dir.is_dir() {
            return Ok(vec![]);
        }
        let mut files = vec![];
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_file() && !is_partial(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

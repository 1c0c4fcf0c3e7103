use crate::search::AssetLink;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// The asset links selected by a search and where they are downloaded to.
/// Written before downloading so a run can be audited; never holds tokens.
#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct DownloadPlan {
    pub destination: PathBuf,
    pub links: Vec<AssetLink>,
}

impl DownloadPlan {
    pub fn new(destination: PathBuf, links: Vec<AssetLink>) -> Self {
        Self { destination, links }
    }

    pub fn read<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let plan: Self = serde_json::from_str(&content)?;
        Ok(plan)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

mod throttle;

pub use throttle::RateLimiter;

use crate::error::{Error, Result};
use crate::signing::SignedLink;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};
use url::Url;

const PARTIAL_SUFFIX: &str = ".partial";

/// Transport seam for asset downloads.
pub trait Fetcher: Send + Sync {
    /// Streams `url` into a file at `destination`, returning the byte count.
    fn fetch_to(
        &self,
        url: &str,
        destination: &Path,
    ) -> impl Future<Output = anyhow::Result<u64>> + Send;
}

/// Local file name for an asset: the last path segment of its URL. The query
/// string, and with it any signing token, never takes part.
pub fn file_name(href: &str) -> Result<String> {
    let url = Url::parse(href).map_err(|_| Error::InvalidAssetUrl(href.to_string()))?;
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidAssetUrl(href.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Fetched { bytes: u64 },
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedFile {
    pub name: String,
    pub path: PathBuf,
    pub status: DownloadStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDownload {
    pub href: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadReport {
    pub files: Vec<DownloadedFile>,
    pub failed: Vec<FailedDownload>,
    /// Links dropped because an earlier link maps to the same file.
    pub duplicates: usize,
}

impl DownloadReport {
    pub fn paths(&self) -> Vec<&Path> {
        self.files.iter().map(|f| f.path.as_path()).collect()
    }

    pub fn fetched(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.status, DownloadStatus::Fetched { .. }))
            .count()
    }

    pub fn already_present(&self) -> usize {
        self.files.len() - self.fetched()
    }
}

/// Reservation of a destination path for the duration of one transfer.
struct Claim<'a> {
    claims: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl<'a> Claim<'a> {
    fn acquire(claims: &'a Mutex<HashSet<PathBuf>>, path: &Path) -> Option<Self> {
        let inserted = claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf());
        inserted.then(|| Self {
            claims,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

pub struct DownloadCoordinator<F> {
    fetcher: F,
    concurrency: usize,
    throttle: Option<RateLimiter>,
    claims: Mutex<HashSet<PathBuf>>,
}

impl<F: Fetcher> DownloadCoordinator<F> {
    pub fn new(fetcher: F, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
            throttle: None,
            claims: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_throttle(mut self, throttle: RateLimiter) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Downloads every link into `destination`, at most `concurrency` at a
    /// time, and waits for all of them. Individual failures are reported, not
    /// returned.
    pub async fn download_all(
        &self,
        links: &[SignedLink],
        destination: &Path,
    ) -> Result<DownloadReport> {
        tokio::fs::create_dir_all(destination).await?;

        let mut report = DownloadReport::default();
        let mut seen = HashSet::new();
        let mut unique = vec![];
        for link in links {
            match file_name(&link.link.href) {
                Ok(name) if seen.insert(name.clone()) => unique.push((link.clone(), name)),
                Ok(name) => {
                    debug!("Skipping duplicate link for {name}");
                    report.duplicates += 1;
                }
                Err(e) => report.failed.push(FailedDownload {
                    href: link.link.href.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        let outcomes: Vec<_> = stream::iter(unique)
            .map(|(link, name)| async move {
                let outcome = self.download_one(&link, destination, &name).await;
                (link, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (link, outcome) in outcomes {
            match outcome {
                Ok(file) => report.files.push(file),
                Err(e) => {
                    warn!("Failed to download {}: {e}", link.link.href);
                    report.failed.push(FailedDownload {
                        href: link.link.href.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        report.files.sort_by(|a, b| a.name.cmp(&b.name));

        info!(
            "Downloaded {} files ({} already present, {} failed)",
            report.fetched(),
            report.already_present(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn download_one(
        &self,
        link: &SignedLink,
        destination: &Path,
        name: &str,
    ) -> Result<DownloadedFile> {
        let path = destination.join(name);
        let present = |path: PathBuf| DownloadedFile {
            name: name.to_string(),
            path,
            status: DownloadStatus::AlreadyPresent,
        };

        if tokio::fs::try_exists(&path).await? {
            debug!("Output file already exists: {}", path.display());
            return Ok(present(path));
        }

        let Some(_claim) = Claim::acquire(&self.claims, &path) else {
            return Err(Error::DownloadInProgress(path));
        };
        // Another call may have finished this file between the check and the claim.
        if tokio::fs::try_exists(&path).await? {
            return Ok(present(path));
        }

        if let Some(throttle) = &self.throttle {
            throttle.acquire().await;
        }

        let partial = destination.join(format!("{name}{PARTIAL_SUFFIX}"));
        match self.fetcher.fetch_to(&link.url(), &partial).await {
            Ok(bytes) => {
                tokio::fs::rename(&partial, &path).await?;
                Ok(DownloadedFile {
                    name: name.to_string(),
                    path,
                    status: DownloadStatus::Fetched { bytes },
                })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e.into())
            }
        }
    }
}

/// Whether `path` is an unfinished transfer rather than a downloaded asset.
pub fn is_partial(path: &Path) -> bool {
    path.to_string_lossy().ends_with(PARTIAL_SUFFIX)
}

//! One provider's end-to-end pipeline: search, sign, download, process, serve.
use crate::download::{DownloadCoordinator, DownloadReport, Fetcher, RateLimiter};
use crate::download_plan::DownloadPlan;
use crate::error::{Error, Result};
use crate::layout::{ProviderLayout, StageProgress};
use crate::planetary;
use crate::raster::{ProcessRunner, RasterPipeline, RasterReport, ToolRunner};
use crate::search::{BoundingBox, CatalogApi, CatalogSearchClient, SearchQuery, SearchResults};
use crate::settings::ProviderSettings;
use crate::signing::{SignedBatch, SignedLink, Signer, TokenCache};
use crate::tiles::TileStore;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct AcquireReport {
    pub links_found: usize,
    pub pages: usize,
    pub search_complete: bool,
    /// Signing was configured but failed, so downloads went out without a token.
    pub unsigned: bool,
    pub downloads: DownloadReport,
}

impl AcquireReport {
    pub fn is_partial(&self) -> bool {
        !self.search_complete || self.unsigned || !self.downloads.failed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub acquire: AcquireReport,
    pub raster: RasterReport,
}

impl RunReport {
    pub fn is_partial(&self) -> bool {
        self.acquire.is_partial()
    }
}

/// Everything a pipeline needs from the remote side.
pub trait Remote: CatalogApi + Signer + Fetcher + Clone + 'static {}

impl<T: CatalogApi + Signer + Fetcher + Clone + 'static> Remote for T {}

pub type PlanetaryPipeline = ProviderPipeline<planetary::Provider, ProcessRunner>;

impl PlanetaryPipeline {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let remote = planetary::Provider::with_timeout(
            Duration::from_secs(settings.download.request_timeout_secs),
            settings.signing.as_ref().map(|s| s.url.clone()),
        )?;
        let runner = ProcessRunner::new(Duration::from_secs(settings.raster.tool_timeout_secs));
        Self::new(remote, runner, settings.clone())
    }
}

pub struct ProviderPipeline<P, R> {
    settings: ProviderSettings,
    query: SearchQuery,
    search: CatalogSearchClient<P>,
    signing: Option<TokenCache<P>>,
    downloads: DownloadCoordinator<P>,
    raster: RasterPipeline<R>,
    tiles: TileStore,
    run_lock: Mutex<()>,
}

impl<P: Remote, R: ToolRunner> ProviderPipeline<P, R> {
    pub fn new(remote: P, runner: R, settings: ProviderSettings) -> Result<Self> {
        let query = SearchQuery::from_settings(&settings.search)?;
        let layout = ProviderLayout::new(&settings.base_dir);
        let search = CatalogSearchClient::new(
            remote.clone(),
            settings.search.url.clone(),
            settings.search.max_pages,
        );
        let signing = settings
            .signing
            .as_ref()
            .map(|s| TokenCache::new(remote.clone(), Duration::from_secs(s.ttl_secs)));
        let mut downloads = DownloadCoordinator::new(remote, settings.download.concurrency);
        if let Some(throttle) = &settings.download.throttle {
            downloads = downloads.with_throttle(RateLimiter::new(
                throttle.burst,
                Duration::from_secs(throttle.period_secs),
            ));
        }
        let tiles = TileStore::new(layout.tiles_dir());
        let raster = RasterPipeline::new(runner, layout, settings.raster.clone());

        Ok(Self {
            settings,
            query,
            search,
            signing,
            downloads,
            raster,
            tiles,
            run_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn layout(&self) -> &ProviderLayout {
        self.raster.layout()
    }

    pub fn tiles(&self) -> &TileStore {
        &self.tiles
    }

    /// Asset links for the configured query, optionally restricted to `bbox`.
    pub async fn links(&self, bbox: Option<BoundingBox>) -> Result<SearchResults> {
        let query = match bbox {
            Some(bbox) => self.query.with_bbox(bbox),
            None => self.query.clone(),
        };
        self.search.search(&query).await
    }

    /// Search, sign and download.
    pub async fn acquire(&self) -> Result<AcquireReport> {
        let _guard = self.lock()?;
        self.within("acquire", self.acquire_locked()).await
    }

    pub async fn process(&self, until: StageProgress) -> Result<RasterReport> {
        let _guard = self.lock()?;
        self.within("process", self.raster.run_until(until)).await
    }

    /// Full pipeline. Processing continues after a partial download; the
    /// report says so.
    pub async fn run(&self) -> Result<RunReport> {
        let _guard = self.lock()?;
        self.within("run", async {
            let acquire = self.acquire_locked().await?;
            let raster = self.raster.run_until(StageProgress::Tiled).await?;
            Ok(RunReport { acquire, raster })
        })
        .await
    }

    async fn acquire_locked(&self) -> Result<AcquireReport> {
        let layout = self.layout();
        let results = self.search.search(&self.query).await?;

        let plan = DownloadPlan::new(layout.sources_dir(), results.links.clone());
        plan.write(layout.links_json())?;

        let batch = match &self.signing {
            Some(cache) => cache.sign_all(results.links).await,
            None => SignedBatch {
                links: results.links.into_iter().map(SignedLink::unsigned).collect(),
                unsigned: false,
            },
        };

        let downloads = self
            .downloads
            .download_all(&batch.links, &layout.sources_dir())
            .await?;

        let report = AcquireReport {
            links_found: batch.links.len(),
            pages: results.pages,
            search_complete: results.complete,
            unsigned: batch.unsigned,
            downloads,
        };
        if report.is_partial() {
            warn!("{}: acquisition was only partially successful", self.name());
        } else {
            info!("{}: acquired {} assets", self.name(), report.links_found);
        }
        Ok(report)
    }

    pub(crate) fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.run_lock
            .try_lock()
            .map_err(|_| Error::RunInProgress(self.name().to_string()))
    }

    async fn within<T>(
        &self,
        what: &'static str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = self.settings.pipeline_timeout();
        tokio::time::timeout(limit, work)
            .await
            .map_err(|_| Error::Timeout(what, limit))?
    }
}

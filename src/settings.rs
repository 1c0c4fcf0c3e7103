use crate::error::{Error, Result};
use crate::search::{BoundingBox, SortBy};
use crate::signing::DEFAULT_TOKEN_TTL;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml;

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub providers: Vec<ProviderSettings>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ProviderSettings {
    pub name: String,
    pub base_dir: PathBuf,
    /// Run the whole pipeline once when the server starts.
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default = "default_pipeline_timeout_secs")]
    pub pipeline_timeout_secs: u64,
    pub search: SearchSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing: Option<SigningSettings>,
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub raster: RasterSettings,
}

impl ProviderSettings {
    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline_timeout_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SearchSettings {
    pub url: String,
    pub collections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intersects: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,
    pub assets: Vec<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub sortby: Vec<SortBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SigningSettings {
    pub url: String,
    #[serde(default = "default_token_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DownloadSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleSettings>,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            throttle: None,
        }
    }
}

/// Allow at most `burst` transfers to start per `period_secs`.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ThrottleSettings {
    pub burst: u32,
    pub period_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct RasterSettings {
    #[serde(default = "default_target_srs")]
    pub target_srs: String,
    #[serde(default = "default_max_tiles")]
    pub max_tiles: u64,
    #[serde(default = "default_processes")]
    pub processes: u32,
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Emit XYZ (top-left origin) tiles instead of TMS.
    #[serde(default)]
    pub xyz: bool,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Delete the raw downloads once tiles are generated.
    #[serde(default)]
    pub purge_sources: bool,
    #[serde(default)]
    pub tools: ToolSettings,
}

impl Default for RasterSettings {
    fn default() -> Self {
        Self {
            target_srs: default_target_srs(),
            max_tiles: default_max_tiles(),
            processes: default_processes(),
            profile: default_profile(),
            xyz: false,
            tool_timeout_secs: default_tool_timeout_secs(),
            purge_sources: false,
            tools: ToolSettings::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ToolSettings {
    pub merge: String,
    pub warp: String,
    pub translate: String,
    pub tile: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            merge: "gdal_merge.py".to_string(),
            warp: "gdalwarp".to_string(),
            translate: "gdal_translate".to_string(),
            tile: "gdal2tiles.py".to_string(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_pipeline_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_limit() -> u32 {
    500
}

fn default_max_pages() -> usize {
    1000
}

fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL.as_secs()
}

fn default_concurrency() -> usize {
    50
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_target_srs() -> String {
    "EPSG:3857".to_string()
}

fn default_max_tiles() -> u64 {
    294
}

fn default_processes() -> u32 {
    3
}

fn default_profile() -> String {
    "mercator".to_string()
}

fn default_tool_timeout_secs() -> u64 {
    60 * 60
}

/// Built-in settings: MODIS 16-day NDVI from the Planetary Computer.
fn settings_toml() -> toml::Table {
    toml::toml! {
        [server]
        bind = "127.0.0.1:8080"

        [[providers]]
        name = "msplanetary"
        base_dir = "data/msplanetary"
        bootstrap = false
        pipeline_timeout_secs = 21600

        [providers.search]
        url = "https://planetarycomputer.microsoft.com/api/stac/v1/search"
        collections = ["modis-13A1-061"]
        datetime = "2023-06-01T00:00:00Z/2023-06-01T23:59:59Z"
        assets = ["500m_16_days_NDVI"]
        limit = 500
        max_pages = 1000
        sortby = [{ field = "datetime", direction = "asc" }]
        query = { platform = { eq = "terra" } }

        [providers.signing]
        url = "https://planetarycomputer.microsoft.com/api/sas/v1/sign"
        ttl_secs = 3600

        [providers.download]
        concurrency = 50
        request_timeout_secs = 300

        [providers.raster]
        target_srs = "EPSG:3857"
        max_tiles = 294
        processes = 3
        profile = "mercator"
        xyz = false
        tool_timeout_secs = 3600
        purge_sources = false
    }
}

impl Settings {
    pub fn read<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn template() -> anyhow::Result<Self> {
        let settings: Self = toml::from_str(&settings_toml().to_string())?;
        Ok(settings)
    }

    pub fn provider(&self, name: &str) -> Result<&ProviderSettings> {
        self.providers
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(Error::Settings(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
            if provider.search.assets.is_empty() {
                return Err(Error::Settings(format!(
                    "{}: search.assets must not be empty",
                    provider.name
                )));
            }
            if provider.search.limit == 0 {
                return Err(Error::Settings(format!(
                    "{}: search.limit must be > 0",
                    provider.name
                )));
            }
            if provider.search.max_pages == 0 {
                return Err(Error::Settings(format!(
                    "{}: search.max_pages must be > 0",
                    provider.name
                )));
            }
            if provider.download.concurrency == 0 {
                return Err(Error::Settings(format!(
                    "{}: download.concurrency must be > 0",
                    provider.name
                )));
            }
            if let Some(throttle) = &provider.download.throttle {
                if throttle.burst == 0 {
                    return Err(Error::Settings(format!(
                        "{}: download.throttle.burst must be > 0",
                        provider.name
                    )));
                }
            }
            if let Some(bbox) = &provider.search.bbox {
                BoundingBox::from_slice(bbox)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS_PATH: &str = "/tmp/stac_tiles_settings.toml";

    #[test]
    fn test_template() {
        let settings = Settings::template().unwrap();
        assert_eq!(settings.providers.len(), 1);
        let provider = &settings.providers[0];
        assert_eq!(provider.name, "msplanetary");
        assert_eq!(provider.search.collections, vec!["modis-13A1-061"]);
        assert_eq!(provider.search.assets, vec!["500m_16_days_NDVI"]);
        assert_eq!(provider.download.concurrency, 50);
        assert_eq!(provider.raster.max_tiles, 294);
        assert_eq!(provider.raster.tools.tile, "gdal2tiles.py");
        assert_eq!(
            provider.search.query,
            Some(serde_json::json!({"platform": {"eq": "terra"}}))
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let content = r#"
            [[providers]]
            name = "minimal"
            base_dir = "/tmp/minimal"

            [providers.search]
            url = "http://localhost/search"
            collections = ["c"]
            assets = ["a"]
        "#;
        let settings: Settings = toml::from_str(content).unwrap();
        let provider = settings.provider("minimal").unwrap();
        assert_eq!(settings.server.bind, "127.0.0.1:8080");
        assert_eq!(provider.search.limit, 500);
        assert_eq!(provider.raster.target_srs, "EPSG:3857");
        assert!(provider.signing.is_none());
        assert!(provider.download.throttle.is_none());
    }

    #[test]
    fn test_write_and_read_toml() {
        let settings = Settings::template().unwrap();
        settings.write(SETTINGS_PATH).unwrap();

        let settings = Settings::read(SETTINGS_PATH).unwrap();
        assert_eq!(settings.providers[0].name, "msplanetary");
        assert_eq!(settings.providers[0].search.sortby.len(), 1);
    }

    #[test]
    fn test_rejects_duplicate_providers() {
        let mut settings = Settings::template().unwrap();
        settings.providers.push(settings.providers[0].clone());
        assert!(matches!(settings.validate(), Err(Error::Settings(_))));
    }

    #[test]
    fn test_rejects_zero_search_bounds() {
        let mut settings = Settings::template().unwrap();
        settings.providers[0].search.limit = 0;
        assert!(matches!(settings.validate(), Err(Error::Settings(_))));

        let mut settings = Settings::template().unwrap();
        settings.providers[0].search.max_pages = 0;
        assert!(matches!(settings.validate(), Err(Error::Settings(_))));

        let mut settings = Settings::template().unwrap();
        settings.providers[0].download.concurrency = 0;
        assert!(matches!(settings.validate(), Err(Error::Settings(_))));
    }

    #[test]
    fn test_rejects_bad_bbox() {
        let mut settings = Settings::template().unwrap();
        settings.providers[0].search.bbox = Some(vec![10.0, 0.0, 5.0]);
        assert!(matches!(
            settings.validate(),
            Err(Error::InvalidBoundingBox(_))
        ));
    }

    #[test]
    fn test_unknown_provider() {
        let settings = Settings::template().unwrap();
        assert!(matches!(
            settings.provider("nasa"),
            Err(Error::UnknownProvider(_))
        ));
    }
}

//! Cursor-paginated STAC item search.
//!
//! A search POSTs a JSON body to the catalog, collects the hrefs of the
//! allow-listed assets of every returned feature, and follows the `next`
//! link until the catalog stops returning one.
use crate::error::{Error, Result};
use crate::settings::SearchSettings;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stac::Item;
use std::future::Future;
use tracing::{debug, info, warn};

const NEXT_REL: &str = "next";
const TOKEN_KEY: &str = "token";

/// Transport seam for the catalog search endpoint.
pub trait CatalogApi: Send + Sync {
    /// POSTs `body` to `url` and returns the raw response text.
    fn post_search(
        &self,
        url: &str,
        body: &Value,
    ) -> impl Future<Output = anyhow::Result<String>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        let [min_lon, min_lat, max_lon, max_lat] = values else {
            return Err(Error::InvalidBoundingBox(format!(
                "expected 4 values [minLon, minLat, maxLon, maxLat], got {}",
                values.len()
            )));
        };
        let bbox = Self {
            min_lon: *min_lon,
            min_lat: *min_lat,
            max_lon: *max_lon,
            max_lat: *max_lat,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    /// Parses `minLon,minLat,maxLon,maxLat`.
    pub fn parse(text: &str) -> Result<Self> {
        let values = text
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidBoundingBox(format!("{text}: {e}")))?;
        Self::from_slice(&values)
    }

    fn validate(&self) -> Result<()> {
        let values = [self.min_lon, self.min_lat, self.max_lon, self.max_lat];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidBoundingBox("values must be finite".into()));
        }
        let lon_ok = |v: f64| (-180.0..=180.0).contains(&v);
        let lat_ok = |v: f64| (-90.0..=90.0).contains(&v);
        if !lon_ok(self.min_lon) || !lon_ok(self.max_lon) {
            return Err(Error::InvalidBoundingBox(
                "longitude must be within [-180, 180]".into(),
            ));
        }
        if !lat_ok(self.min_lat) || !lat_ok(self.max_lat) {
            return Err(Error::InvalidBoundingBox(
                "latitude must be within [-90, 90]".into(),
            ));
        }
        if self.min_lon > self.max_lon || self.min_lat > self.max_lat {
            return Err(Error::InvalidBoundingBox(
                "minimum must not exceed maximum".into(),
            ));
        }
        Ok(())
    }

    fn to_json(self) -> Value {
        serde_json::json!([self.min_lon, self.min_lat, self.max_lon, self.max_lat])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub collections: Vec<String>,
    pub bbox: Option<BoundingBox>,
    pub intersects: Option<Value>,
    pub datetime: Option<String>,
    pub assets: Vec<String>,
    pub limit: u32,
    pub sortby: Vec<SortBy>,
    pub query: Option<Value>,
}

impl SearchQuery {
    pub fn from_settings(settings: &SearchSettings) -> Result<Self> {
        let bbox = settings
            .bbox
            .as_deref()
            .map(BoundingBox::from_slice)
            .transpose()?;
        Ok(Self {
            collections: settings.collections.clone(),
            bbox,
            intersects: settings.intersects.clone(),
            datetime: settings.datetime.clone(),
            assets: settings.assets.clone(),
            limit: settings.limit,
            sortby: settings.sortby.clone(),
            query: settings.query.clone(),
        })
    }

    /// Same query restricted to `bbox`; a configured geometry is dropped.
    pub fn with_bbox(&self, bbox: BoundingBox) -> Self {
        Self {
            bbox: Some(bbox),
            intersects: None,
            ..self.clone()
        }
    }

    pub fn body(&self, token: Option<&str>) -> Value {
        let mut body = Map::new();
        body.insert("collections".into(), serde_json::json!(self.collections));
        if let Some(bbox) = self.bbox {
            body.insert("bbox".into(), bbox.to_json());
        } else if let Some(geometry) = &self.intersects {
            body.insert("intersects".into(), geometry.clone());
        }
        if let Some(datetime) = &self.datetime {
            body.insert("datetime".into(), Value::String(datetime.clone()));
        }
        body.insert("limit".into(), serde_json::json!(self.limit));
        if !self.sortby.is_empty() {
            body.insert("sortby".into(), serde_json::json!(self.sortby));
        }
        if let Some(query) = &self.query {
            body.insert("query".into(), query.clone());
        }
        if let Some(token) = token {
            body.insert(TOKEN_KEY.into(), Value::String(token.to_string()));
        }
        Value::Object(body)
    }
}

/// A remote asset selected from a search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetLink {
    pub item_id: String,
    pub asset: String,
    pub href: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResults {
    pub links: Vec<AssetLink>,
    pub pages: usize,
    /// False when a page failed and the links are only a prefix.
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    Token(String),
    Url(String),
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    features: Vec<Value>,
    #[serde(default)]
    links: Vec<PageLink>,
}

#[derive(Debug, Deserialize)]
struct PageLink {
    rel: String,
    #[serde(default)]
    href: Option<String>,
    #[serde(default)]
    body: Option<Map<String, Value>>,
}

impl SearchPage {
    fn next_cursor(&self) -> Option<Cursor> {
        let next = self.links.iter().find(|l| l.rel == NEXT_REL)?;
        let token = next
            .body
            .as_ref()
            .and_then(|b| b.get(TOKEN_KEY))
            .and_then(Value::as_str);
        match (token, &next.href) {
            (Some(token), _) => Some(Cursor::Token(token.to_string())),
            (None, Some(href)) => Some(Cursor::Url(href.clone())),
            (None, None) => None,
        }
    }
}

fn extract_links(feature: Value, assets: &[String]) -> Vec<AssetLink> {
    let item: Item = match serde_json::from_value(feature) {
        Ok(item) => item,
        Err(e) => {
            debug!("Skipping unparsable feature: {e}");
            return vec![];
        }
    };
    assets
        .iter()
        .filter_map(|name| {
            let asset = item.assets.get(name.as_str())?;
            Some(AssetLink {
                item_id: item.id.clone(),
                asset: name.clone(),
                href: asset.href.to_owned(),
            })
        })
        .collect()
}

pub struct CatalogSearchClient<A> {
    api: A,
    url: String,
    max_pages: usize,
}

impl<A: CatalogApi> CatalogSearchClient<A> {
    pub fn new(api: A, url: impl Into<String>, max_pages: usize) -> Self {
        Self {
            api,
            url: url.into(),
            max_pages,
        }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResults> {
        let mut results = SearchResults::default();
        let mut cursor: Option<Cursor> = None;

        loop {
            if results.pages == self.max_pages {
                return Err(Error::PageLimitExceeded(self.max_pages));
            }
            let (url, token) = match &cursor {
                None => (self.url.as_str(), None),
                Some(Cursor::Token(token)) => (self.url.as_str(), Some(token.as_str())),
                Some(Cursor::Url(url)) => (url.as_str(), None),
            };
            let body = query.body(token);

            let page = match self.fetch_page(url, &body).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(
                        "Search stopped at page {} with {} links: {e}",
                        results.pages + 1,
                        results.links.len()
                    );
                    return Ok(results);
                }
            };
            results.pages += 1;

            let next = page.next_cursor();
            for feature in page.features {
                results.links.extend(extract_links(feature, &query.assets));
            }

            match next {
                None => break,
                Some(next) if cursor.as_ref() == Some(&next) => {
                    return Err(Error::StalledCursor(format!("{next:?}")));
                }
                Some(next) => cursor = Some(next),
            }
        }

        results.complete = true;
        info!(
            "Fetched {} asset links over {} pages",
            results.links.len(),
            results.pages
        );
        Ok(results)
    }

    async fn fetch_page(&self, url: &str, body: &Value) -> Result<SearchPage> {
        let text = self.api.post_search(url, body).await?;
        let page: SearchPage = serde_json::from_str(&text)?;
        Ok(page)
    }
}

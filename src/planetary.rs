use crate::download::Fetcher;
use crate::search::CatalogApi;
use crate::signing::Signer;
use anyhow::anyhow;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

/// HTTP client for a STAC API with an optional SAS signing endpoint, such as
/// the Microsoft Planetary Computer.
#[derive(Clone)]
pub struct Provider {
    client: reqwest::Client,
    sign_url: Option<String>,
}

#[derive(Deserialize)]
struct SignResponse {
    href: String,
}

impl Provider {
    pub fn new(client: reqwest::Client, sign_url: Option<String>) -> Self {
        Self { client, sign_url }
    }

    pub fn with_timeout(timeout: Duration, sign_url: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::new(client, sign_url))
    }
}

impl CatalogApi for Provider {
    async fn post_search(&self, url: &str, body: &Value) -> anyhow::Result<String> {
        let text = self
            .client
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(text)
    }
}

impl Signer for Provider {
    async fn sign(&self, href: &str) -> anyhow::Result<String> {
        let sign_url = self
            .sign_url
            .as_deref()
            .ok_or(anyhow!("No signing endpoint configured"))?;
        let url = Url::parse_with_params(sign_url, &[("href", href)])?;
        let signed: SignResponse = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(signed.href)
    }
}

/// The URL without its query string, which may carry a SAS token.
fn redacted(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

impl Fetcher for Provider {
    async fn fetch_to(&self, url: &str, destination: &Path) -> anyhow::Result<u64> {
        // reqwest errors embed the full request URL, token included.
        let transfer_error =
            |e: reqwest::Error| anyhow!("GET {} failed: {}", redacted(url), e.without_url());
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(transfer_error)?;
        let mut file = tokio::fs::File::create(destination).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(transfer_error)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::tests::test_dir;
    use crate::download::DownloadCoordinator;
    use crate::search::AssetLink;
    use crate::signing::SignedLink;

    #[tokio::test]
    async fn test_failed_download_does_not_expose_token() {
        let provider = Provider::with_timeout(Duration::from_secs(5), None).unwrap();
        let coordinator = DownloadCoordinator::new(provider, 1);
        let link = SignedLink {
            link: AssetLink {
                item_id: "a".to_string(),
                asset: "500m_16_days_NDVI".to_string(),
                href: "http://127.0.0.1:1/modis/a.tif".to_string(),
            },
            token: Some("st=2023&sig=SECRETSIG".to_string()),
        };

        let report = coordinator
            .download_all(&[link], &test_dir("planetary_redacted"))
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        let reason = &report.failed[0].reason;
        assert!(reason.contains("http://127.0.0.1:1/modis/a.tif"), "{reason}");
        assert!(!reason.contains("SECRETSIG"), "{reason}");
        assert!(!serde_json::to_string(&report).unwrap().contains("SECRETSIG"));
    }

    #[test]
    fn test_redacted() {
        assert_eq!(redacted("https://a/b.tif?sig=x"), "https://a/b.tif");
        assert_eq!(redacted("https://a/b.tif"), "https://a/b.tif");
    }

    #[tokio::test]
    async fn test_sign_without_endpoint() {
        let provider = Provider::new(reqwest::Client::new(), None);
        let err = provider.sign("https://a/b.tif").await.unwrap_err();
        assert!(err.to_string().contains("No signing endpoint"));
    }

    #[test]
    fn test_sign_url_encodes_href() {
        let url = Url::parse_with_params(
            "https://planetarycomputer.microsoft.com/api/sas/v1/sign",
            &[("href", "https://a.blob/x y.tif")],
        )
        .unwrap();
        assert_eq!(url.query(), Some("href=https%3A%2F%2Fa.blob%2Fx+y.tif"));
    }
}

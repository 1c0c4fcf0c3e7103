//! Short-lived SAS token cache.
//!
//! The signing endpoint signs one href at a time, but the token it appends is
//! valid for every asset of the same storage family. One signing call is
//! therefore enough for a whole batch, and the token is reused until its TTL
//! runs out.
use crate::error::{Error, Result};
use crate::search::AssetLink;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Transport seam for the signing endpoint.
pub trait Signer: Send + Sync {
    /// Returns the signed form of `href`, i.e. `href?<token>`.
    fn sign(&self, href: &str) -> impl Future<Output = anyhow::Result<String>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub issued_at: Instant,
}

/// An asset link with the batch token appended, if one could be obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedLink {
    pub link: AssetLink,
    pub token: Option<String>,
}

impl SignedLink {
    pub fn unsigned(link: AssetLink) -> Self {
        Self { link, token: None }
    }

    pub fn url(&self) -> String {
        match &self.token {
            Some(token) if self.link.href.contains('?') => {
                format!("{}&{}", self.link.href, token)
            }
            Some(token) => format!("{}?{}", self.link.href, token),
            None => self.link.href.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignedBatch {
    pub links: Vec<SignedLink>,
    /// Set when signing failed and the links went out without a token.
    pub unsigned: bool,
}

fn extract_token(signed_href: &str) -> Option<&str> {
    let (_, token) = signed_href.split_once('?')?;
    (!token.is_empty()).then_some(token)
}

pub struct TokenCache<S> {
    signer: S,
    ttl: Duration,
    // Held across the signing call so concurrent callers wait for one refresh.
    token: Mutex<Option<Token>>,
}

impl<S: Signer> TokenCache<S> {
    pub fn new(signer: S, ttl: Duration) -> Self {
        Self {
            signer,
            ttl,
            token: Mutex::new(None),
        }
    }

    pub async fn get_token(&self, sample: &AssetLink) -> Result<Token> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.issued_at.elapsed() < self.ttl {
                debug!("Reusing cached token");
                return Ok(token.clone());
            }
        }
        *cached = None;

        let issued_at = Instant::now();
        let signed = self
            .signer
            .sign(&sample.href)
            .await
            .map_err(|e| Error::Signing(e.to_string()))?;
        let value = extract_token(&signed)
            .ok_or_else(|| Error::Signing(format!("no token in signed href: {signed}")))?
            .to_string();

        info!("Refreshed signing token");
        let token = Token { value, issued_at };
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Signs every link of the batch with a single token.
    pub async fn sign_all(&self, links: Vec<AssetLink>) -> SignedBatch {
        let Some(sample) = links.first() else {
            return SignedBatch::default();
        };
        match self.get_token(sample).await {
            Ok(token) => SignedBatch {
                links: links
                    .into_iter()
                    .map(|link| SignedLink {
                        link,
                        token: Some(token.value.clone()),
                    })
                    .collect(),
                unsigned: false,
            },
            Err(e) => {
                warn!("Proceeding with {} unsigned links: {e}", links.len());
                SignedBatch {
                    links: links.into_iter().map(SignedLink::unsigned).collect(),
                    unsigned: true,
                }
            }
        }
    }

    pub async fn invalidate(&self) {
        *self.token.lock().await = None;
    }
}

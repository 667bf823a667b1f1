use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ConvertError;

/// Remote source of glyph images, addressed by canonical file name.
#[async_trait]
pub trait GlyphFetcher: Send + Sync {
    async fn fetch(&self, file_name: &str) -> Result<Vec<u8>, ConvertError>;
}

pub struct HttpGlyphFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGlyphFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl GlyphFetcher for HttpGlyphFetcher {
    async fn fetch(&self, file_name: &str) -> Result<Vec<u8>, ConvertError> {
        let url = format!("{}/{file_name}", self.base_url);
        let network = |reason: String| ConvertError::Network {
            url: url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(network(format!("HTTP {}", response.status())));
        }
        let bytes = response.bytes().await.map_err(|e| network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Process-wide, append-only map from glyph token to a local image file.
///
/// Entries are keyed on disk by canonical file name and never invalidated.
/// Concurrent misses for the same token may both download; the final rename
/// makes the duplicate write harmless.
#[derive(Clone)]
pub struct GlyphCache {
    dir: PathBuf,
    fetcher: Arc<dyn GlyphFetcher>,
}

impl GlyphCache {
    pub fn new(dir: impl Into<PathBuf>, fetcher: Arc<dyn GlyphFetcher>) -> Self {
        Self {
            dir: dir.into(),
            fetcher,
        }
    }

    pub async fn resolve(&self, token: &str) -> Result<PathBuf, ConvertError> {
        let file_name = canonical_file_name(token);
        let path = self.dir.join(&file_name);
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(glyph = %file_name, "Glyph cache hit");
            return Ok(path);
        }

        let bytes = self.fetcher.fetch(&file_name).await?;
        if bytes.is_empty() {
            return Err(ConvertError::Network {
                url: file_name,
                reason: "empty response body".to_string(),
            });
        }

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ConvertError::Internal(format!("Failed to create glyph cache: {e}")))?;
        let staging = self.dir.join(format!(".{file_name}.{}.part", Uuid::new_v4()));
        fs::write(&staging, &bytes)
            .await
            .map_err(|e| ConvertError::Internal(format!("Failed to write glyph: {e}")))?;
        if let Err(err) = fs::rename(&staging, &path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(ConvertError::Internal(format!("Failed to store glyph: {err}")));
        }

        info!(glyph = %file_name, bytes = bytes.len(), "Glyph cached");
        Ok(path)
    }
}

/// Twemoji-style asset name: lowercase hex codepoints joined by `-`.
/// Variation selector 16 is dropped unless the sequence is a ZWJ sequence.
pub fn canonical_file_name(token: &str) -> String {
    let keep_vs16 = token.contains('\u{200D}');
    let code = token
        .chars()
        .filter(|c| keep_vs16 || *c != '\u{FE0F}')
        .map(|c| format!("{:x}", c as u32))
        .collect::<Vec<_>>()
        .join("-");
    format!("{code}.png")
}

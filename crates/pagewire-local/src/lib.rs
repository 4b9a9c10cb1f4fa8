use futures_util::StreamExt;
use pagewire_core::{Error, RawFetcher, Result};

pub mod config;
pub mod fetch;
pub mod normalize;
pub mod notes;
pub mod render;
pub mod search;

pub use config::Settings;

/// Stream a response body, keeping at most `max_bytes`. Reading stops at the cap; the flag
/// reports whether anything was cut off.
pub(crate) async fn read_body_capped(
    resp: reqwest::Response,
    max_bytes: usize,
) -> reqwest::Result<(Vec<u8>, bool)> {
    let mut bytes = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > max_bytes {
            let can_take = max_bytes.saturating_sub(bytes.len());
            bytes.extend_from_slice(&chunk[..can_take]);
            return Ok((bytes, true));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok((bytes, false))
}

/// Direct retrieval: one GET, no retries, transport-default redirects.
#[derive(Debug, Clone)]
pub struct DirectFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl DirectFetcher {
    pub fn new(client: reqwest::Client, max_body_bytes: usize) -> Self {
        Self {
            client,
            max_body_bytes,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(settings.http_client()?, settings.max_body_bytes))
    }
}

#[async_trait::async_trait]
impl RawFetcher for DirectFetcher {
    async fn fetch_raw(&self, url: &str) -> Result<String> {
        let url = url::Url::parse(url).map_err(|e| Error::Validation(e.to_string()))?;
        let t0 = std::time::Instant::now();
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("HTTP {status}")));
        }

        let (bytes, truncated) = read_body_capped(resp, self.max_body_bytes)
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;
        tracing::debug!(
            %url,
            status = status.as_u16(),
            bytes = bytes.len(),
            truncated,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "direct retrieval done"
        );
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

//! Product image fetching
//!
//! Downloads remote product images and returns them base64 encoded.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::time::Duration;
use thiserror::Error;

/// Errors while downloading a product image
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
}

/// Source of embedded product images
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch the image at `url` as base64
    async fn fetch_base64(&self, url: &str) -> Result<String, FetchError>;
}

/// Fetches images over HTTP with a bounded timeout
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch_base64(&self, url: &str) -> Result<String, FetchError> {
        let to_error = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Http {
                    url: url.to_string(),
                    source: e,
                }
            }
        };

        let response = self.client.get(url).send().await.map_err(to_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(to_error)?;
        Ok(STANDARD.encode(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_host_is_an_error() {
        let fetcher = HttpImageFetcher::new(Duration::from_secs(2)).unwrap();
        let result = fetcher.fetch_base64("http://127.0.0.1:9/missing.jpg").await;

        assert!(matches!(
            result,
            Err(FetchError::Http { .. }) | Err(FetchError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept connections and hold them open without ever answering
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let fetcher = HttpImageFetcher::new(Duration::from_millis(200)).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            fetcher.fetch_base64(&format!("http://{addr}/slow.jpg")),
        )
        .await
        .expect("fetch did not honor its timeout");

        assert!(matches!(result, Err(FetchError::Timeout { .. })));
        server.abort();
    }

    #[tokio::test]
    async fn test_invalid_url_is_an_error() {
        let fetcher = HttpImageFetcher::new(Duration::from_secs(2)).unwrap();
        assert!(fetcher.fetch_base64("not a url").await.is_err());
    }
}

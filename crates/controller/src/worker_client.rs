//! HTTP client for talking to workers
//!
//! Used by the controller to refresh worker status, and by anything that
//! wants to consume a worker's frame stream directly.

use chatserve_common::{Result, ServeError};
use chatserve_proto::{FrameDecoder, GenerateStreamParams, StreamFrame, WorkerStatus};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::time::Duration;
use tracing::debug;

/// Worker client
///
/// Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    client: reqwest::Client,
    /// Applied to status calls; streams run as long as the worker streams
    status_timeout: Duration,
}

impl WorkerClient {
    pub fn new(status_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(status_timeout)
            .build()?;
        Ok(Self {
            client,
            status_timeout,
        })
    }

    fn url(address: &str, path: &str) -> String {
        format!("{}/{}", address.trim_end_matches('/'), path)
    }

    /// Fetch `{model_names, speed, queue_length}` from a worker
    pub async fn get_status(&self, address: &str) -> Result<WorkerStatus> {
        let url = Self::url(address, "worker_get_status");
        debug!("POST {}", url);

        let status = self
            .client
            .post(&url)
            .timeout(self.status_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status)
    }

    /// Start a generation and decode the worker's frames as they arrive
    pub async fn generate_stream(
        &self,
        address: &str,
        params: &GenerateStreamParams,
    ) -> Result<BoxStream<'static, Result<StreamFrame>>> {
        let url = Self::url(address, "worker_generate_stream");
        debug!("POST {}", url);

        let response = self.client.post(&url).json(params).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ServeError::worker_unavailable(format!(
                "{} returned {}: {}",
                url, status, body
            )));
        }

        let mut decoder = FrameDecoder::new();
        let frames = response
            .bytes_stream()
            .map(move |chunk| -> Result<Vec<StreamFrame>> { Ok(decoder.push(&chunk?)?) })
            .map_ok(|frames| stream::iter(frames.into_iter().map(Ok)))
            .try_flatten()
            .boxed();
        Ok(frames)
    }

    /// Run a generation to completion and return every frame
    pub async fn generate(&self, address: &str, params: &GenerateStreamParams) -> Result<Vec<StreamFrame>> {
        self.generate_stream(address, params).await?.try_collect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_cleanly() {
        assert_eq!(
            WorkerClient::url("http://localhost:21002/", "worker_get_status"),
            "http://localhost:21002/worker_get_status"
        );
    }

    #[tokio::test]
    async fn test_unreachable_worker() {
        let client = WorkerClient::new(Duration::from_millis(200)).unwrap();
        assert!(client.get_status("http://127.0.0.1:1").await.is_err());
    }
}

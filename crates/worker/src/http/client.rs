//! Worker-to-controller HTTP client

use crate::heartbeat::ControllerClient;
use async_trait::async_trait;
use chatserve_common::{Result, ServeError};
use chatserve_proto::{HeartbeatRequest, HeartbeatResponse, RegisterWorkerRequest};
use std::time::Duration;
use tracing::debug;

/// Calls `/register_worker` and `/receive_heart_beat` on the controller
#[derive(Debug, Clone)]
pub struct HttpControllerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControllerClient {
    /// Every call made through this client gives up after `timeout`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn register_worker(&self, request: &RegisterWorkerRequest) -> Result<()> {
        let url = self.url("register_worker");
        debug!("POST {}", url);

        let response = self.client.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            return Err(ServeError::controller(format!(
                "register_worker returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn send_heart_beat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let url = self.url("receive_heart_beat");
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = HttpControllerClient::new("http://localhost:21001/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:21001");
        assert_eq!(client.url("register_worker"), "http://localhost:21001/register_worker");
    }

    #[tokio::test]
    async fn test_unreachable_controller_is_an_error() {
        let client = HttpControllerClient::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        let request = HeartbeatRequest {
            worker_name: "http://127.0.0.1:21002".to_string(),
            queue_length: 0,
        };
        assert!(client.send_heart_beat(&request).await.is_err());
    }
}

//! HTTP capability used for remote includes.
//!
//! Retries and backoff belong to callers; a client performs exactly one
//! request per call.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// Response of a single GET request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Minimal HTTP client capability.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &Url, timeout: Duration) -> Result<HttpResponse>;
}

/// `HttpClient` backed by reqwest.
#[derive(Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &Url, timeout: Duration) -> Result<HttpResponse> {
        debug!(%url, ?timeout, "Fetching remote document");

        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("{} after {:?}", url, timeout))
                } else {
                    Error::Request(format!("{}: {}", url, e))
                }
            })?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("{} after {:?}", url, timeout))
            } else {
                Error::Request(format!("{}: {}", url, e))
            }
        })?;

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_get_returns_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ci/shared.yml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("lint:\n  script: make lint\n"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/ci/shared.yml", server.uri())).unwrap();
        let response = ReqwestClient::new()
            .get(&url, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(response.is_success());
        assert!(response.text().contains("make lint"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/missing.yml", server.uri())).unwrap();
        let response = ReqwestClient::new()
            .get(&url, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/slow.yml", server.uri())).unwrap();
        let result = ReqwestClient::new()
            .get(&url, Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}

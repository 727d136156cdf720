//! The HTTP leg of every provider call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PaySignError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one request. Non-2xx responses come back as
/// [`PaySignError::HttpStatus`] with the body attached; nothing is retried.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse>;
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_body_mib() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TransportOptions {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_body_mib")]
    pub max_body_mib: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_body_mib: default_max_body_mib(),
        }
    }
}

/// `reqwest` over rustls.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    max_body_bytes: usize,
}

impl ReqwestTransport {
    pub fn new(options: &TransportOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_secs))
            .user_agent(concat!("paysign/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            max_body_bytes: options.max_body_mib * 1024 * 1024,
        })
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| PaySignError::Transport(format!("invalid method {:?}: {e}", request.method)))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let mut response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(PaySignError::Transport(format!(
                    "response body exceeds {} bytes",
                    self.max_body_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(status, bytes = body.len(), url = %request.url, "provider response");
        let response = HttpResponse { status, headers, body };
        if !(200..300).contains(&status) {
            return Err(PaySignError::HttpStatus {
                status,
                body: response.text(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse> {
        debug!(method = %request.method, url = %request.url, "provider request");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PaySignError::Cancelled),
            response = self.execute(request) => response,
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn transport() -> ReqwestTransport {
        ReqwestTransport::new(&TransportOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn sends_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/pay"))
            .and(header("Authorization", "token"))
            .and(body_string("{}"))
            .respond_with(ResponseTemplate::new(200).insert_header("Request-ID", "abc").set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let request = HttpRequest::new("POST", format!("{}/v3/pay", server.uri()))
            .header("Authorization", "token")
            .body("{}");
        let response = transport().send(request, &CancellationToken::new()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("request-id"), Some("abc"));
        assert_eq!(response.header("Request-ID"), Some("abc"));
        assert_eq!(response.text(), "ok");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string(r#"{"code":"NOT_FOUND"}"#))
            .mount(&server)
            .await;

        let request = HttpRequest::new("GET", server.uri());
        let err = transport().send(request, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(matches!(err, PaySignError::HttpStatus { body, .. } if body.contains("NOT_FOUND")));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 2 * 1024 * 1024]))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&TransportOptions {
            timeout_secs: 5,
            max_body_mib: 1,
        })
        .unwrap();
        let err = transport
            .send(HttpRequest::new("GET", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PaySignError::Transport(_)));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = transport()
            .send(HttpRequest::new("GET", server.uri()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PaySignError::Cancelled));
    }
}

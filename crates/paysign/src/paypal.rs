//! PayPal OAuth2 client-credentials token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PaypalConfig;
use crate::error::Result;
use crate::transport::{HttpRequest, HttpTransport};

pub const TOKEN_PATH: &str = "/v1/oauth2/token";

/// Tokens this close to expiry are fetched again.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    #[serde(default)]
    pub scope: String,
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub app_id: String,
    pub expires_in: u64,
    #[serde(default)]
    pub nonce: String,
}

#[derive(Debug)]
struct CachedToken {
    token: AccessToken,
    fetched_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        let lifetime = Duration::from_secs(self.token.expires_in);
        self.fetched_at.elapsed() + EXPIRY_MARGIN < lifetime
    }
}

pub struct PaypalClient {
    host: String,
    basic: String,
    transport: Arc<dyn HttpTransport>,
    token: Mutex<Option<CachedToken>>,
}

impl PaypalClient {
    pub fn new(config: PaypalConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        config.validate()?;
        let credentials = STANDARD.encode(format!("{}:{}", config.client_id, config.secret));
        Ok(Self {
            host: config.host().to_string(),
            basic: format!("Basic {credentials}"),
            transport,
            token: Mutex::new(None),
        })
    }

    /// Current token, fetched on first use and again near expiry. Concurrent
    /// callers wait on the same fetch.
    pub async fn access_token(&self, cancel: &CancellationToken) -> Result<AccessToken> {
        let mut cached = self.token.lock().await;
        if let Some(current) = cached.as_ref().filter(|c| c.is_fresh()) {
            return Ok(current.token.clone());
        }

        let request = HttpRequest::new("POST", format!("{}{TOKEN_PATH}", self.host))
            .header("Authorization", self.basic.as_str())
            .header("Accept", "*/*")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials");
        let response = self.transport.send(request, cancel).await?;
        let token: AccessToken = serde_json::from_slice(&response.body)?;
        debug!(app_id = %token.app_id, expires_in = token.expires_in, "paypal token fetched");

        *cached = Some(CachedToken {
            token: token.clone(),
            fetched_at: Instant::now(),
        });
        Ok(token)
    }

    /// `Authorization` header value for API calls.
    pub async fn bearer(&self, cancel: &CancellationToken) -> Result<String> {
        Ok(format!("Bearer {}", self.access_token(cancel).await?.access_token))
    }

    /// Drop the cached token, e.g. after a 401.
    pub async fn invalidate(&self) {
        *self.token.lock().await = None;
    }
}

impl std::fmt::Debug for PaypalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaypalClient")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

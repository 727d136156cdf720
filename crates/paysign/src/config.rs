//! Client configuration, deserialized from JSON.

use serde::Deserialize;

use crate::error::{PaySignError, Result};
use crate::transport::TransportOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Sandbox,
    #[default]
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

fn enabled() -> bool {
    true
}

fn require(value: &str, field: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PaySignError::MissingConfig(field));
    }
    Ok(())
}

pub const WECHAT_BASE_URL: &str = "https://api.mch.weixin.qq.com";

/// WeChat Pay merchant credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct WechatConfig {
    pub mch_id: String,
    /// Serial number of the merchant API certificate.
    pub serial_no: String,
    /// APIv3 key, 32 bytes, decrypts downloaded platform certificates.
    pub api_v3_key: String,
    /// Merchant private key, PEM or bare base64 DER.
    pub private_key: String,
    /// APIv2 key for the legacy MD5 / HMAC-SHA256 signatures.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "enabled")]
    pub auto_verify: bool,
    /// Overrides the API host, mainly for tests.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub transport: TransportOptions,
}

impl WechatConfig {
    pub fn validate(&self) -> Result<()> {
        require(&self.mch_id, "mch_id")?;
        require(&self.serial_no, "serial_no")?;
        require(&self.api_v3_key, "api_v3_key")?;
        require(&self.private_key, "private_key")?;
        if self.api_v3_key.len() != 32 {
            return Err(PaySignError::MissingConfig("api_v3_key (32 bytes)"));
        }
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or(WECHAT_BASE_URL)
            .trim_end_matches('/')
    }
}

fn default_alipay_sign_type() -> String {
    "RSA2".to_string()
}

pub const ALIPAY_GATEWAY: &str = "https://openapi.alipay.com/gateway.do";
pub const ALIPAY_SANDBOX_GATEWAY: &str = "https://openapi-sandbox.dl.alipaydev.com/gateway.do";

/// Alipay application credentials.
///
/// Either `alipay_public_key` (public-key mode) or the three certificates
/// (certificate mode) must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct AlipayConfig {
    pub app_id: String,
    pub private_key: String,
    /// `RSA2` (SHA-256) or `RSA` (SHA-1).
    #[serde(default = "default_alipay_sign_type")]
    pub sign_type: String,
    #[serde(default)]
    pub alipay_public_key: Option<String>,
    /// Application public-key certificate, PEM.
    #[serde(default)]
    pub app_cert: Option<String>,
    /// Alipay public-key certificate, PEM.
    #[serde(default)]
    pub alipay_cert: Option<String>,
    /// Alipay root certificate bundle, PEM.
    #[serde(default)]
    pub alipay_root_cert: Option<String>,
    #[serde(default)]
    pub notify_url: Option<String>,
    #[serde(default)]
    pub return_url: Option<String>,
    #[serde(default)]
    pub app_auth_token: Option<String>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "enabled")]
    pub auto_verify: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub transport: TransportOptions,
}

impl AlipayConfig {
    pub fn validate(&self) -> Result<()> {
        require(&self.app_id, "app_id")?;
        require(&self.private_key, "private_key")?;
        if self.auto_verify && self.alipay_public_key.is_none() && !self.cert_mode() {
            return Err(PaySignError::MissingConfig("alipay_public_key"));
        }
        Ok(())
    }

    /// All three certificates are configured.
    pub fn cert_mode(&self) -> bool {
        self.app_cert.is_some() && self.alipay_cert.is_some() && self.alipay_root_cert.is_some()
    }

    pub fn gateway(&self) -> &str {
        match (&self.base_url, self.environment) {
            (Some(url), _) => url.as_str(),
            (None, Environment::Production) => ALIPAY_GATEWAY,
            (None, Environment::Sandbox) => ALIPAY_SANDBOX_GATEWAY,
        }
    }
}

pub const APPLE_HOST: &str = "https://api.storekit.itunes.apple.com";
pub const APPLE_SANDBOX_HOST: &str = "https://api.storekit-sandbox.itunes.apple.com";

/// App Store Connect in-app purchase key.
#[derive(Debug, Clone, Deserialize)]
pub struct AppleConfig {
    pub issuer_id: String,
    pub key_id: String,
    pub bundle_id: String,
    /// The `.p8` ES256 private key.
    pub private_key: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub transport: TransportOptions,
}

impl AppleConfig {
    pub fn validate(&self) -> Result<()> {
        require(&self.issuer_id, "issuer_id")?;
        require(&self.key_id, "key_id")?;
        require(&self.bundle_id, "bundle_id")?;
        require(&self.private_key, "private_key")
    }

    pub fn host(&self) -> &str {
        match (&self.base_url, self.environment) {
            (Some(url), _) => url.trim_end_matches('/'),
            (None, Environment::Production) => APPLE_HOST,
            (None, Environment::Sandbox) => APPLE_SANDBOX_HOST,
        }
    }
}

pub const PAYPAL_HOST: &str = "https://api-m.paypal.com";
pub const PAYPAL_SANDBOX_HOST: &str = "https://api-m.sandbox.paypal.com";

#[derive(Debug, Clone, Deserialize)]
pub struct PaypalConfig {
    pub client_id: String,
    pub secret: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub transport: TransportOptions,
}

impl PaypalConfig {
    pub fn validate(&self) -> Result<()> {
        require(&self.client_id, "client_id")?;
        require(&self.secret, "secret")
    }

    pub fn host(&self) -> &str {
        match (&self.base_url, self.environment) {
            (Some(url), _) => url.trim_end_matches('/'),
            (None, Environment::Production) => PAYPAL_HOST,
            (None, Environment::Sandbox) => PAYPAL_SANDBOX_HOST,
        }
    }
}

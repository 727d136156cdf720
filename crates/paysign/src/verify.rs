//! WeChat Pay V3 response and callback signature checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cert::CertificateCache;
use crate::error::{PaySignError, Result};
use crate::signing::{MethodRegistry, RSA2};

pub const HEADER_TIMESTAMP: &str = "Wechatpay-Timestamp";
pub const HEADER_NONCE: &str = "Wechatpay-Nonce";
pub const HEADER_SIGNATURE: &str = "Wechatpay-Signature";
pub const HEADER_SERIAL: &str = "Wechatpay-Serial";
pub const HEADER_REQUEST_ID: &str = "Request-ID";

/// Outcome of the signature step on a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Checked against the certificate with this serial.
    Verified { serial: String },
    /// Auto-verify is off; the body is untrusted.
    Skipped,
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

/// Signature material carried by one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInfo {
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
    pub serial: String,
    pub body: String,
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
        .ok_or_else(|| PaySignError::SignData(format!("missing header {name}")))
}

impl SignInfo {
    pub fn from_headers(headers: &HashMap<String, String>, body: &str) -> Result<Self> {
        Ok(Self {
            timestamp: header(headers, HEADER_TIMESTAMP)?.to_string(),
            nonce: header(headers, HEADER_NONCE)?.to_string(),
            signature: header(headers, HEADER_SIGNATURE)?.to_string(),
            serial: header(headers, HEADER_SERIAL)?.to_string(),
            body: body.to_string(),
        })
    }

    /// `TIMESTAMP\nNONCE\nBODY\n`
    pub fn signing_string(&self) -> String {
        format!("{}\n{}\n{}\n", self.timestamp, self.nonce, self.body)
    }
}

/// Checks response signatures against the platform certificate cache.
#[derive(Debug)]
pub struct ResponseVerifier {
    cache: Arc<CertificateCache>,
    registry: Arc<MethodRegistry>,
    auto_verify: AtomicBool,
}

impl ResponseVerifier {
    pub fn new(cache: Arc<CertificateCache>, registry: Arc<MethodRegistry>) -> Self {
        Self {
            cache,
            registry,
            auto_verify: AtomicBool::new(true),
        }
    }

    pub fn set_auto_verify(&self, enabled: bool) {
        self.auto_verify.store(enabled, Ordering::Relaxed);
    }

    pub fn auto_verify(&self) -> bool {
        self.auto_verify.load(Ordering::Relaxed)
    }

    pub fn cache(&self) -> &Arc<CertificateCache> {
        &self.cache
    }

    /// Verify when auto-verify is on, otherwise report [`Verification::Skipped`].
    pub async fn verify_response(&self, info: &SignInfo, cancel: &CancellationToken) -> Result<Verification> {
        if !self.auto_verify() {
            debug!(serial = %info.serial, "auto-verify disabled, response left unverified");
            return Ok(Verification::Skipped);
        }
        self.verify(info, cancel).await
    }

    /// Unconditional check, used for callbacks.
    pub async fn verify(&self, info: &SignInfo, cancel: &CancellationToken) -> Result<Verification> {
        let key = self.cache.resolve(&info.serial, cancel).await?;
        self.registry
            .verify(RSA2, &info.signing_string(), &info.signature, &key)?;
        Ok(Verification::Verified {
            serial: info.serial.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{PemSource, SerialScheme};
    use crate::pem;

    const PLATFORM_KEY: &str = include_str!("../testdata/platform_key.pem");
    const PLATFORM_CERT: &str = include_str!("../testdata/platform_cert.pem");
    const SERIAL: &str = "5157F09EFDC096DE63B4E3A7D2C8B1F9A1B2C3D4";

    fn signed(body: &str) -> SignInfo {
        let mut info = SignInfo {
            timestamp: "1700000000".into(),
            nonce: "bF6kT2cX".into(),
            signature: String::new(),
            serial: SERIAL.into(),
            body: body.into(),
        };
        let key = pem::decode_private_key(PLATFORM_KEY).unwrap();
        info.signature = MethodRegistry::standard()
            .sign(RSA2, &info.signing_string(), &key)
            .unwrap();
        info
    }

    fn verifier() -> ResponseVerifier {
        let source = PemSource::new(SerialScheme::Hex)
            .certificate(PLATFORM_CERT)
            .unwrap();
        ResponseVerifier::new(
            Arc::new(CertificateCache::new(Arc::new(source))),
            Arc::new(MethodRegistry::standard()),
        )
    }

    #[test]
    fn headers_are_matched_case_insensitively() {
        let headers: HashMap<String, String> = [
            ("wechatpay-timestamp", "1"),
            ("WECHATPAY-NONCE", "n"),
            ("Wechatpay-Signature", "s"),
            ("wechatpay-serial", "AB"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let info = SignInfo::from_headers(&headers, "{}").unwrap();
        assert_eq!(info.signing_string(), "1\nn\n{}\n");
    }

    #[test]
    fn missing_header_is_sign_data_error() {
        let err = SignInfo::from_headers(&HashMap::new(), "").unwrap_err();
        assert!(matches!(err, PaySignError::SignData(msg) if msg.contains(HEADER_TIMESTAMP)));
    }

    #[tokio::test]
    async fn valid_response_is_verified() {
        let outcome = verifier()
            .verify_response(&signed(r#"{"code_url":"weixin://x"}"#), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Verification::Verified { serial: SERIAL.into() });
    }

    #[tokio::test]
    async fn tampered_body_fails() {
        let mut info = signed(r#"{"amount":1}"#);
        info.body = r#"{"amount":100}"#.into();
        let err = verifier()
            .verify_response(&info, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_signature());
    }

    #[tokio::test]
    async fn disabled_auto_verify_skips() {
        let verifier = verifier();
        verifier.set_auto_verify(false);
        let mut info = signed("{}");
        info.signature = "garbage".into();
        let outcome = verifier
            .verify_response(&info, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Verification::Skipped);
        assert!(!outcome.is_verified());
    }

    #[tokio::test]
    async fn unknown_serial_is_not_found() {
        let mut info = signed("{}");
        info.serial = "00".into();
        let err = verifier()
            .verify_response(&info, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PaySignError::PublicKeyNotFound(_)));
    }
}

//! WeChat Pay V3 `Authorization` header.

use std::sync::Arc;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::debug;

use crate::error::{PaySignError, Result};
use crate::signing::{MethodRegistry, RSA2, SigningKey};

pub const AUTHORIZATION_SCHEMA: &str = "WECHATPAY2-SHA256-RSA2048";

const NONCE_LEN: usize = 32;

/// 32 alphanumeric characters from the thread-local CSPRNG.
pub fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

/// `METHOD\nPATH\nTIMESTAMP\nNONCE\nBODY\n`. A dangling `?` on the path is
/// dropped.
pub fn signing_string(method: &str, path: &str, timestamp: i64, nonce: &str, body: &str) -> String {
    let path = path.strip_suffix('?').unwrap_or(path);
    format!(
        "{}\n{path}\n{timestamp}\n{nonce}\n{body}\n",
        method.to_ascii_uppercase()
    )
}

/// Signs outbound requests with the merchant's API certificate key.
pub struct RequestSigner {
    mch_id: String,
    serial_no: String,
    key: SigningKey,
    registry: Arc<MethodRegistry>,
}

impl RequestSigner {
    pub fn new(
        mch_id: impl Into<String>,
        serial_no: impl Into<String>,
        key: SigningKey,
        registry: Arc<MethodRegistry>,
    ) -> Result<Self> {
        let mch_id = mch_id.into();
        let serial_no = serial_no.into();
        if mch_id.is_empty() {
            return Err(PaySignError::MissingConfig("mch_id"));
        }
        if serial_no.is_empty() {
            return Err(PaySignError::MissingConfig("serial_no"));
        }
        Ok(Self {
            mch_id,
            serial_no,
            key,
            registry,
        })
    }

    pub fn mch_id(&self) -> &str {
        &self.mch_id
    }

    pub fn serial_no(&self) -> &str {
        &self.serial_no
    }

    /// RSA-SHA256 over `message`, standard base64.
    pub fn sign(&self, message: &str) -> Result<String> {
        self.registry.sign(RSA2, message, &self.key).map_err(|e| {
            if e.is_signature() {
                e
            } else {
                PaySignError::Signature(e.to_string())
            }
        })
    }

    /// Header value for a request made now with a fresh nonce.
    pub fn authorization(&self, method: &str, path: &str, body: &str) -> Result<String> {
        let timestamp = chrono::Utc::now().timestamp();
        self.authorization_at(method, path, body, timestamp, &nonce())
    }

    pub fn authorization_at(
        &self,
        method: &str,
        path: &str,
        body: &str,
        timestamp: i64,
        nonce: &str,
    ) -> Result<String> {
        let message = signing_string(method, path, timestamp, nonce, body);
        debug!(mch_id = %self.mch_id, message = %message.escape_debug(), "request signing string");
        let signature = self.sign(&message)?;
        Ok(format!(
            r#"{AUTHORIZATION_SCHEMA} mchid="{}",nonce_str="{nonce}",timestamp="{timestamp}",serial_no="{}",signature="{signature}""#,
            self.mch_id, self.serial_no
        ))
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("mch_id", &self.mch_id)
            .field("serial_no", &self.serial_no)
            .finish_non_exhaustive()
    }
}

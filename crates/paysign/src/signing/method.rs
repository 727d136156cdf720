use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

use super::key::{SigningKey, VerifyingKey};
use crate::error::{PaySignError, Result};

/// A named signature algorithm.
///
/// Implementations are sync and immutable once registered; signing is
/// CPU-bound and never touches the network.
pub trait SigningMethod: Send + Sync {
    /// Registry identifier (e.g. "RSA2", "ES256").
    fn alg(&self) -> &str;

    /// Sign `input` and return the encoded signature.
    fn sign(&self, input: &str, key: &SigningKey) -> Result<String>;

    /// Check an encoded signature over `input`.
    fn verify(&self, input: &str, signature: &str, key: &VerifyingKey) -> Result<()>;
}

/// Text encoding of signature bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEncoding {
    /// Standard base64 with padding, used by the payment gateways.
    Standard,
    /// Unpadded base64url, used by JWS.
    UrlSafe,
}

impl SignatureEncoding {
    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Standard => STANDARD.encode(bytes),
            Self::UrlSafe => URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    pub fn decode(self, text: &str) -> Result<Vec<u8>> {
        let decoded = match self {
            Self::Standard => STANDARD.decode(text),
            Self::UrlSafe => URL_SAFE_NO_PAD.decode(text.trim_end_matches('=')),
        };
        decoded.map_err(|e| PaySignError::Verification(format!("malformed signature encoding: {e}")))
    }
}

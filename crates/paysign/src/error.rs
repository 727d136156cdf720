use std::fmt;

use serde::{Deserialize, Serialize};

pub type Result<T, E = PaySignError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum PaySignError {
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),
    #[error("missing required parameter: {0}")]
    MissingParam(String),
    #[error("unknown signing method: {0}")]
    UnknownMethod(String),
    #[error("key type is not valid for signing method {0}")]
    InvalidKeyType(String),
    #[error("hash {hash} is unavailable for signing method {method}")]
    HashUnavailable { method: String, hash: &'static str },
    #[error("signature error: {0}")]
    Signature(String),
    #[error("signature is invalid")]
    SignatureInvalid,
    #[error("verify signature error: {0}")]
    Verification(String),
    #[error("public key not found for serial {0:?}")]
    PublicKeyNotFound(String),
    #[error("failed to decode key material: {0}")]
    KeyDecode(String),
    #[error("failed to decrypt certificate: {0}")]
    Decrypt(String),
    #[error("failed to encrypt sensitive field: {0}")]
    Encrypt(String),
    #[error("missing signature data in response: {0}")]
    SignData(String),
    #[error("HTTP request error, status = {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("unmarshal error: {0}")]
    Unmarshal(#[from] serde_json::Error),
}

impl PaySignError {
    /// Missing or malformed client configuration. Never retryable.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingConfig(_) | Self::KeyDecode(_) | Self::UnknownMethod(_)
        )
    }

    pub fn is_signature(&self) -> bool {
        matches!(
            self,
            Self::InvalidKeyType(_)
                | Self::HashUnavailable { .. }
                | Self::Signature(_)
                | Self::SignatureInvalid
                | Self::Verification(_)
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::HttpStatus { .. } | Self::Transport(_) | Self::Cancelled
        )
    }

    /// HTTP status attached to a transport failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for PaySignError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::HttpStatus {
                status: status.as_u16(),
                body: error.to_string(),
            },
            None => Self::Transport(error.to_string()),
        }
    }
}

/// Application-level failure reported inside a well-formed provider response.
///
/// Carried next to the verification outcome, never returned as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessError {
    pub code: String,
    pub msg: String,
    #[serde(default)]
    pub sub_code: String,
    #[serde(default)]
    pub sub_msg: String,
}

impl fmt::Display for BusinessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"{{"code":"{}","msg":"{}","sub_code":"{}","sub_msg":"{}"}}"#,
            self.code, self.msg, self.sub_code, self.sub_msg
        )
    }
}

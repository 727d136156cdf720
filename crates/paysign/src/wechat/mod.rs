//! WeChat Pay.

mod certificates;
pub mod v3;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

pub use certificates::PlatformCertificateSource;
pub use v3::{ApiError, AppPayParams, JsapiPayParams, Notification, V3Client, V3Response};

use crate::error::{PaySignError, Result};

pub const AEAD_AES_256_GCM: &str = "AEAD_AES_256_GCM";

const GCM_NONCE_LEN: usize = 12;

/// Encrypted payload of a downloaded certificate or a callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedResource {
    pub algorithm: String,
    pub ciphertext: String,
    #[serde(default)]
    pub associated_data: String,
    pub nonce: String,
    #[serde(default)]
    pub original_type: Option<String>,
}

/// Open an `AEAD_AES_256_GCM` resource with the APIv3 key.
pub fn decrypt_resource(api_v3_key: &[u8], resource: &EncryptedResource) -> Result<String> {
    if resource.algorithm != AEAD_AES_256_GCM {
        return Err(PaySignError::Decrypt(format!(
            "unsupported algorithm {}",
            resource.algorithm
        )));
    }
    if resource.nonce.len() != GCM_NONCE_LEN {
        return Err(PaySignError::Decrypt(format!(
            "nonce must be {GCM_NONCE_LEN} bytes, got {}",
            resource.nonce.len()
        )));
    }
    let cipher = Aes256Gcm::new_from_slice(api_v3_key)
        .map_err(|_| PaySignError::Decrypt("APIv3 key must be 32 bytes".into()))?;
    let ciphertext = STANDARD
        .decode(&resource.ciphertext)
        .map_err(|e| PaySignError::Decrypt(format!("ciphertext: {e}")))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(resource.nonce.as_bytes()),
            Payload {
                msg: &ciphertext,
                aad: resource.associated_data.as_bytes(),
            },
        )
        .map_err(|_| PaySignError::Decrypt("authentication tag mismatch".into()))?;
    String::from_utf8(plaintext).map_err(|e| PaySignError::Decrypt(e.to_string()))
}

/// Seal `plaintext` the way the platform does. Mirrors [`decrypt_resource`].
pub fn encrypt_resource(
    api_v3_key: &[u8],
    nonce: &str,
    associated_data: &str,
    plaintext: &str,
) -> Result<EncryptedResource> {
    if nonce.len() != GCM_NONCE_LEN {
        return Err(PaySignError::Decrypt(format!("nonce must be {GCM_NONCE_LEN} bytes")));
    }
    let cipher = Aes256Gcm::new_from_slice(api_v3_key)
        .map_err(|_| PaySignError::Decrypt("APIv3 key must be 32 bytes".into()))?;
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(nonce.as_bytes()),
            Payload {
                msg: plaintext.as_bytes(),
                aad: associated_data.as_bytes(),
            },
        )
        .map_err(|_| PaySignError::Decrypt("encryption failed".into()))?;
    Ok(EncryptedResource {
        algorithm: AEAD_AES_256_GCM.to_string(),
        ciphertext: STANDARD.encode(sealed),
        associated_data: associated_data.to_string(),
        nonce: nonce.to_string(),
        original_type: None,
    })
}

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{EncryptedResource, decrypt_resource};
use crate::auth::RequestSigner;
use crate::cert::{CertificateEntry, CertificateSource, SerialScheme};
use crate::error::{PaySignError, Result};
use crate::pem;
use crate::signing::{MethodRegistry, RSA2};
use crate::transport::{HttpRequest, HttpTransport};
use crate::verify::SignInfo;

pub const CERTIFICATES_PATH: &str = "/v3/certificates";

#[derive(Debug, Deserialize)]
struct CertificateList {
    data: Vec<PlatformCertificate>,
}

#[derive(Debug, Deserialize)]
struct PlatformCertificate {
    serial_no: String,
    encrypt_certificate: EncryptedResource,
}

/// Downloads the platform certificates with a signed `GET /v3/certificates`.
///
/// The download itself is verified against the set it returned; a response
/// signed by a serial outside that set is rejected. The first fetch is
/// therefore trust-on-first-use: it proves the listing is self-consistent,
/// not that it came from WeChat. Pin a certificate with
/// [`PemSource`](crate::cert::PemSource) when that matters.
pub struct PlatformCertificateSource {
    signer: Arc<RequestSigner>,
    transport: Arc<dyn HttpTransport>,
    registry: Arc<MethodRegistry>,
    base_url: String,
    api_v3_key: Vec<u8>,
}

impl PlatformCertificateSource {
    pub fn new(
        signer: Arc<RequestSigner>,
        transport: Arc<dyn HttpTransport>,
        registry: Arc<MethodRegistry>,
        base_url: impl Into<String>,
        api_v3_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            signer,
            transport,
            registry,
            base_url: base_url.into(),
            api_v3_key: api_v3_key.into(),
        }
    }

    fn decode(&self, body: &str) -> Result<Vec<CertificateEntry>> {
        let list: CertificateList = serde_json::from_str(body)?;
        list.data
            .into_iter()
            .map(|item| {
                let pem_text = decrypt_resource(&self.api_v3_key, &item.encrypt_certificate)?;
                let info = pem::parse_certificate(pem_text.as_bytes())?;
                if !info.serial.eq_ignore_ascii_case(&item.serial_no) {
                    return Err(PaySignError::KeyDecode(format!(
                        "certificate serial {} does not match listed serial {}",
                        info.serial, item.serial_no
                    )));
                }
                Ok(SerialScheme::Hex.entry(info))
            })
            .collect()
    }
}

#[async_trait]
impl CertificateSource for PlatformCertificateSource {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<CertificateEntry>> {
        let authorization = self.signer.authorization("GET", CERTIFICATES_PATH, "")?;
        let request = HttpRequest::new("GET", format!("{}{CERTIFICATES_PATH}", self.base_url))
            .header("Authorization", authorization)
            .header("Accept", "application/json");
        let response = self.transport.send(request, cancel).await?;
        let body = response.text();
        let entries = self.decode(&body)?;

        let info = SignInfo::from_headers(&response.headers, &body)?;
        let signer_key = entries
            .iter()
            .find(|entry| entry.serial == info.serial)
            .ok_or_else(|| PaySignError::PublicKeyNotFound(info.serial.clone()))?;
        self.registry
            .verify(RSA2, &info.signing_string(), &info.signature, &signer_key.public_key)?;

        debug!(
            count = entries.len(),
            signed_by = %info.serial,
            "downloaded platform certificates"
        );
        Ok(entries)
    }
}

impl std::fmt::Debug for PlatformCertificateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformCertificateSource")
            .field("base_url", &self.base_url)
            .field("mch_id", &self.signer.mch_id())
            .finish_non_exhaustive()
    }
}

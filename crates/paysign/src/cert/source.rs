use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::CertificateEntry;
use crate::error::{PaySignError, Result};
use crate::pem::{self, CertificateInfo};
use crate::signing::VerifyingKey;

/// Where a [`CertificateCache`](super::CertificateCache) gets its keys on a
/// refresh.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// The provider's current certificate set.
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<CertificateEntry>>;
}

/// Which identifier a certificate is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerialScheme {
    /// Upper-case hex serial number (WeChat Pay).
    #[default]
    Hex,
    /// MD5 of issuer and decimal serial (Alipay).
    AlipaySn,
}

impl SerialScheme {
    pub fn entry(self, info: CertificateInfo) -> CertificateEntry {
        let serial = match self {
            Self::Hex => info.serial,
            Self::AlipaySn => info.alipay_sn,
        };
        CertificateEntry::new(serial, info.public_key, Some(info.not_after))
    }
}

/// Certificates and public keys held in memory.
#[derive(Debug, Clone, Default)]
pub struct PemSource {
    scheme: SerialScheme,
    entries: Vec<CertificateEntry>,
}

impl PemSource {
    pub fn new(scheme: SerialScheme) -> Self {
        Self {
            scheme,
            entries: Vec::new(),
        }
    }

    /// Add every certificate of a PEM bundle.
    pub fn certificate(mut self, pem: &str) -> Result<Self> {
        for info in pem::parse_certificates(pem)? {
            self.entries.push(self.scheme.entry(info));
        }
        Ok(self)
    }

    /// Register a bare public key under `id`.
    pub fn public_key(mut self, id: impl Into<String>, pem: &str) -> Result<Self> {
        let key = pem::decode_public_key(pem)?;
        self.entries.push(CertificateEntry::new(id, key, None));
        Ok(self)
    }

    pub fn key(mut self, id: impl Into<String>, key: VerifyingKey) -> Self {
        self.entries.push(CertificateEntry::new(id, key, None));
        self
    }
}

#[async_trait]
impl CertificateSource for PemSource {
    async fn fetch(&self, _cancel: &CancellationToken) -> Result<Vec<CertificateEntry>> {
        Ok(self.entries.clone())
    }
}

/// Certificate bundles read from disk on every refresh, so replacing the
/// files rotates the keys.
#[derive(Debug, Clone)]
pub struct PemFileSource {
    scheme: SerialScheme,
    paths: Vec<PathBuf>,
}

impl PemFileSource {
    pub fn new(scheme: SerialScheme, paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            scheme,
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl CertificateSource for PemFileSource {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<CertificateEntry>> {
        let mut entries = Vec::new();
        for path in &self.paths {
            let text = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PaySignError::Cancelled),
                read = tokio::fs::read_to_string(path) => read.map_err(|e| {
                    PaySignError::KeyDecode(format!("{}: {e}", path.display()))
                })?,
            };
            for info in pem::parse_certificates(&text)? {
                entries.push(self.scheme.entry(info));
            }
        }
        Ok(entries)
    }
}

//! Key and certificate decoding.
//!
//! PEM armour is read with `x509_parser::pem`; inputs without armour are
//! treated as the base64 body of a DER document, which is how gateway
//! consoles usually hand out keys.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, X509Name};

use crate::error::{PaySignError, Result};
use crate::signing::{SigningKey, VerifyingKey};

const SHA1_WITH_RSA: &str = "1.2.840.113549.1.1.5";
const SHA256_WITH_RSA: &str = "1.2.840.113549.1.1.11";

/// Fields of an X.509 certificate this crate cares about.
#[derive(Debug)]
pub struct CertificateInfo {
    /// Serial number as upper-case hex, the WeChat Pay serial format.
    pub serial: String,
    /// MD5 of issuer DN and decimal serial, the Alipay serial format.
    pub alipay_sn: String,
    pub not_after: DateTime<Utc>,
    pub public_key: VerifyingKey,
    /// Dotted OID of the certificate's signature algorithm.
    pub signature_algorithm: String,
}

impl CertificateInfo {
    fn is_rsa_signed(&self) -> bool {
        self.signature_algorithm == SHA1_WITH_RSA || self.signature_algorithm == SHA256_WITH_RSA
    }
}

fn key_error(what: &str, e: impl std::fmt::Display) -> PaySignError {
    PaySignError::KeyDecode(format!("{what}: {e}"))
}

/// `(label, der)` for every PEM block in `input`. A bare base64 body is
/// returned as a single unlabelled block.
fn blocks(input: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let trimmed = input.trim();
    if !trimmed.starts_with("-----BEGIN") {
        let compact: String = trimmed.split_whitespace().collect();
        let der = STANDARD
            .decode(compact)
            .map_err(|e| key_error("base64 body", e))?;
        return Ok(vec![(String::new(), der)]);
    }
    let mut out = Vec::new();
    for block in Pem::iter_from_buffer(trimmed.as_bytes()) {
        let Pem { label, contents } = block.map_err(|e| key_error("PEM block", e))?;
        out.push((label, contents));
    }
    if out.is_empty() {
        return Err(PaySignError::KeyDecode("no PEM block found".into()));
    }
    Ok(out)
}

fn first_block(input: &str) -> Result<(String, Vec<u8>)> {
    blocks(input)?
        .into_iter()
        .next()
        .ok_or_else(|| PaySignError::KeyDecode("empty key material".into()))
}

/// Private key in PKCS#1, PKCS#8 or SEC1 form.
pub fn decode_private_key(input: &str) -> Result<SigningKey> {
    let (label, der) = first_block(input)?;
    match label.as_str() {
        "RSA PRIVATE KEY" => RsaPrivateKey::from_pkcs1_der(&der)
            .map(SigningKey::Rsa)
            .map_err(|e| key_error("PKCS#1 private key", e)),
        "EC PRIVATE KEY" => decode_sec1(&der),
        "PRIVATE KEY" => decode_pkcs8(&der),
        "" => RsaPrivateKey::from_pkcs1_der(&der)
            .map(SigningKey::Rsa)
            .or_else(|_| decode_pkcs8(&der)),
        other => Err(PaySignError::KeyDecode(format!(
            "unsupported private key block {other:?}"
        ))),
    }
}

fn decode_pkcs8(der: &[u8]) -> Result<SigningKey> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
        return Ok(SigningKey::Rsa(key));
    }
    if let Ok(secret) = p256::SecretKey::from_pkcs8_der(der) {
        return Ok(SigningKey::P256(secret.into()));
    }
    if let Ok(secret) = p384::SecretKey::from_pkcs8_der(der) {
        return Ok(SigningKey::P384(secret.into()));
    }
    let secret = p521::SecretKey::from_pkcs8_der(der)
        .map_err(|e| key_error("PKCS#8 private key", e))?;
    p521_signing_key(&secret)
}

fn decode_sec1(der: &[u8]) -> Result<SigningKey> {
    if let Ok(secret) = p256::SecretKey::from_sec1_der(der) {
        return Ok(SigningKey::P256(secret.into()));
    }
    if let Ok(secret) = p384::SecretKey::from_sec1_der(der) {
        return Ok(SigningKey::P384(secret.into()));
    }
    let secret = p521::SecretKey::from_sec1_der(der)
        .map_err(|e| key_error("SEC1 private key", e))?;
    p521_signing_key(&secret)
}

fn p521_signing_key(secret: &p521::SecretKey) -> Result<SigningKey> {
    p521::ecdsa::SigningKey::from_bytes(&secret.to_bytes())
        .map(SigningKey::P521)
        .map_err(|e| key_error("P-521 scalar", e))
}

/// Public key from a `CERTIFICATE`, `PUBLIC KEY` or `RSA PUBLIC KEY` block.
pub fn decode_public_key(input: &str) -> Result<VerifyingKey> {
    let (label, der) = first_block(input)?;
    match label.as_str() {
        "CERTIFICATE" => Ok(certificate_from_der(&der)?.public_key),
        "RSA PUBLIC KEY" => RsaPublicKey::from_pkcs1_der(&der)
            .map(VerifyingKey::Rsa)
            .map_err(|e| key_error("PKCS#1 public key", e)),
        "PUBLIC KEY" => decode_spki(&der),
        "" => decode_spki(&der).or_else(|_| {
            RsaPublicKey::from_pkcs1_der(&der)
                .map(VerifyingKey::Rsa)
                .map_err(|e| key_error("public key", e))
        }),
        other => Err(PaySignError::KeyDecode(format!(
            "unsupported public key block {other:?}"
        ))),
    }
}

/// DER `SubjectPublicKeyInfo` holding an RSA or NIST-curve key.
pub fn decode_spki(der: &[u8]) -> Result<VerifyingKey> {
    if let Ok(key) = RsaPublicKey::from_public_key_der(der) {
        return Ok(VerifyingKey::Rsa(key));
    }
    if let Ok(key) = p256::PublicKey::from_public_key_der(der) {
        return Ok(VerifyingKey::P256(key.into()));
    }
    if let Ok(key) = p384::PublicKey::from_public_key_der(der) {
        return Ok(VerifyingKey::P384(key.into()));
    }
    let key = p521::PublicKey::from_public_key_der(der)
        .map_err(|e| key_error("SubjectPublicKeyInfo", e))?;
    p521::ecdsa::VerifyingKey::from_encoded_point(&p521::EncodedPoint::from(&key))
        .map(VerifyingKey::P521)
        .map_err(|e| key_error("P-521 point", e))
}

/// First certificate in `input` (PEM, bare base64 or raw DER).
pub fn parse_certificate(input: &[u8]) -> Result<CertificateInfo> {
    match std::str::from_utf8(input) {
        Ok(text) => {
            let (_, der) = first_block(text)?;
            certificate_from_der(&der)
        }
        Err(_) => certificate_from_der(input),
    }
}

/// Every `CERTIFICATE` block of a PEM bundle.
pub fn parse_certificates(bundle: &str) -> Result<Vec<CertificateInfo>> {
    blocks(bundle)?
        .into_iter()
        .filter(|(label, _)| label == "CERTIFICATE")
        .map(|(_, der)| certificate_from_der(&der))
        .collect()
}

pub fn certificate_from_der(der: &[u8]) -> Result<CertificateInfo> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| key_error("X.509 certificate", e))?;

    let tbs = &cert.tbs_certificate;
    let issuer = issuer_string(cert.issuer());
    let decimal_serial = tbs.serial.to_string();
    let alipay_sn = format!("{:x}", md5::compute(format!("{issuer}{decimal_serial}")));
    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| PaySignError::KeyDecode("certificate not-after out of range".into()))?;

    Ok(CertificateInfo {
        serial: format!("{:X}", tbs.serial),
        alipay_sn,
        not_after,
        public_key: decode_spki(cert.public_key().raw)?,
        signature_algorithm: cert.signature_algorithm.algorithm.to_id_string(),
    })
}

fn attribute_name(oid: &str) -> Option<&'static str> {
    Some(match oid {
        "2.5.4.3" => "CN",
        "2.5.4.5" => "SERIALNUMBER",
        "2.5.4.6" => "C",
        "2.5.4.7" => "L",
        "2.5.4.8" => "ST",
        "2.5.4.9" => "STREET",
        "2.5.4.10" => "O",
        "2.5.4.11" => "OU",
        "2.5.4.17" => "POSTALCODE",
        _ => return None,
    })
}

/// Issuer DN with RDNs in reverse order, `CN=…,OU=…,O=…,C=…`.
fn issuer_string(name: &X509Name<'_>) -> String {
    let rdns: Vec<String> = name
        .iter_rdn()
        .map(|rdn| {
            rdn.iter()
                .map(|atv| {
                    let oid = atv.attr_type().to_id_string();
                    let key = attribute_name(&oid).map(str::to_string).unwrap_or(oid);
                    let value = atv.as_str().unwrap_or_default();
                    format!("{key}={value}")
                })
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect();
    rdns.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Alipay serial of the application or gateway public-key certificate.
pub fn alipay_cert_sn(pem: &str) -> Result<String> {
    Ok(parse_certificate(pem.as_bytes())?.alipay_sn)
}

/// Alipay root serial: `_`-joined serials of the RSA-signed certificates in
/// the root bundle. Certificates signed with other algorithms are skipped.
pub fn alipay_root_cert_sn(bundle: &str) -> Result<String> {
    let serials: Vec<String> = parse_certificates(bundle)?
        .into_iter()
        .filter(CertificateInfo::is_rsa_signed)
        .map(|info| info.alipay_sn)
        .collect();
    Ok(serials.join("_"))
}

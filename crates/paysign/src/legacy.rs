//! API-key signatures of WeChat Pay v2 and QQ Wallet.
//!
//! The signing input is the canonical string followed by `&key=API_KEY`;
//! the signature is upper-case hex. Unlike the V3 and Alipay notification
//! strings, `sign_type` is part of the signed input; only `sign` is left out.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{PaySignError, Result};
use crate::params::ParameterBag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LegacySignType {
    #[default]
    Md5,
    HmacSha256,
}

impl LegacySignType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::HmacSha256 => "HMAC-SHA256",
        }
    }
}

impl fmt::Display for LegacySignType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LegacySignType {
    type Err = PaySignError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MD5" | "" => Ok(Self::Md5),
            "HMAC-SHA256" => Ok(Self::HmacSha256),
            other => Err(PaySignError::UnknownMethod(other.to_string())),
        }
    }
}

fn signing_input(bag: &ParameterBag, api_key: &str) -> String {
    format!("{}&key={api_key}", bag.canonical_string_without(&["sign"]))
}

fn hmac_sha256(api_key: &str, input: &str) -> Result<Hmac<Sha256>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(api_key.as_bytes())
        .map_err(|e| PaySignError::Signature(e.to_string()))?;
    mac.update(input.as_bytes());
    Ok(mac)
}

pub fn sign(bag: &ParameterBag, api_key: &str, sign_type: LegacySignType) -> Result<String> {
    if api_key.is_empty() {
        return Err(PaySignError::MissingConfig("api_key"));
    }
    let input = signing_input(bag, api_key);
    let digest = match sign_type {
        LegacySignType::Md5 => format!("{:x}", md5::compute(input.as_bytes())),
        LegacySignType::HmacSha256 => hex::encode(hmac_sha256(api_key, &input)?.finalize().into_bytes()),
    };
    Ok(digest.to_ascii_uppercase())
}

/// Check the bag's own `sign` field.
pub fn verify(bag: &ParameterBag, api_key: &str, sign_type: LegacySignType) -> Result<()> {
    let claimed = bag
        .get_str("sign")
        .ok_or_else(|| PaySignError::SignData("sign".into()))?;
    if api_key.is_empty() {
        return Err(PaySignError::MissingConfig("api_key"));
    }
    match sign_type {
        LegacySignType::Md5 => {
            let expected = sign(bag, api_key, sign_type)?;
            if expected.eq_ignore_ascii_case(claimed) {
                Ok(())
            } else {
                Err(PaySignError::SignatureInvalid)
            }
        }
        LegacySignType::HmacSha256 => {
            let claimed = hex::decode(claimed).map_err(|_| PaySignError::SignatureInvalid)?;
            hmac_sha256(api_key, &signing_input(bag, api_key))?
                .verify_slice(&claimed)
                .map_err(|_| PaySignError::SignatureInvalid)
        }
    }
}

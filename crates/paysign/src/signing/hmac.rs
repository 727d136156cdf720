use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};

use super::key::{HashAlg, SigningKey, VerifyingKey};
use super::method::{SignatureEncoding, SigningMethod};
use crate::error::{PaySignError, Result};

/// Keyed-hash signatures (HS256/HS384/HS512). Deterministic.
#[derive(Debug, Clone)]
pub struct HmacMethod {
    name: String,
    hash: HashAlg,
}

macro_rules! with_mac {
    ($hash:expr, $secret:expr, $name:expr, |$mac:ident| $body:expr) => {
        match $hash {
            HashAlg::Sha256 => {
                let mut $mac = <Hmac<Sha256> as Mac>::new_from_slice($secret)
                    .map_err(|e| PaySignError::Signature(format!("{}: {e}", $name)))?;
                $body
            }
            HashAlg::Sha384 => {
                let mut $mac = <Hmac<Sha384> as Mac>::new_from_slice($secret)
                    .map_err(|e| PaySignError::Signature(format!("{}: {e}", $name)))?;
                $body
            }
            HashAlg::Sha512 => {
                let mut $mac = <Hmac<Sha512> as Mac>::new_from_slice($secret)
                    .map_err(|e| PaySignError::Signature(format!("{}: {e}", $name)))?;
                $body
            }
            HashAlg::Sha1 => {
                return Err(PaySignError::HashUnavailable {
                    method: $name.clone(),
                    hash: HashAlg::Sha1.name(),
                })
            }
        }
    };
}

impl HmacMethod {
    pub fn new(name: &str, hash: HashAlg) -> Self {
        Self {
            name: name.to_string(),
            hash,
        }
    }

    fn mac(&self, input: &str, secret: &[u8]) -> Result<Vec<u8>> {
        Ok(with_mac!(self.hash, secret, self.name, |mac| {
            mac.update(input.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }))
    }
}

impl SigningMethod for HmacMethod {
    fn alg(&self) -> &str {
        &self.name
    }

    fn sign(&self, input: &str, key: &SigningKey) -> Result<String> {
        let SigningKey::Hmac(secret) = key else {
            return Err(PaySignError::InvalidKeyType(self.name.clone()));
        };
        let tag = self.mac(input, secret)?;
        Ok(SignatureEncoding::UrlSafe.encode(&tag))
    }

    fn verify(&self, input: &str, signature: &str, key: &VerifyingKey) -> Result<()> {
        let VerifyingKey::Hmac(secret) = key else {
            return Err(PaySignError::InvalidKeyType(self.name.clone()));
        };
        let expected = SignatureEncoding::UrlSafe.decode(signature)?;
        with_mac!(self.hash, secret, self.name, |mac| {
            mac.update(input.as_bytes());
            mac.verify_slice(&expected)
                .map_err(|_| PaySignError::SignatureInvalid)
        })
    }
}

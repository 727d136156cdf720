use p256::ecdsa::signature::{Signer, Verifier};

use super::key::{EcCurve, SigningKey, VerifyingKey};
use super::method::{SignatureEncoding, SigningMethod};
use crate::error::{PaySignError, Result};

/// ECDSA over a NIST curve, JWS encoding: fixed-width `r || s`.
///
/// The digest follows the curve (SHA-256 for P-256, SHA-384 for P-384,
/// SHA-512 for P-521).
#[derive(Debug, Clone)]
pub struct EcdsaMethod {
    name: String,
    curve: EcCurve,
}

impl EcdsaMethod {
    pub fn new(name: &str, curve: EcCurve) -> Self {
        Self {
            name: name.to_string(),
            curve,
        }
    }

    pub fn curve(&self) -> EcCurve {
        self.curve
    }

    fn key_matches(&self, kind: &str) -> bool {
        matches!(
            (self.curve, kind),
            (EcCurve::P256, "ecdsa-p256") | (EcCurve::P384, "ecdsa-p384") | (EcCurve::P521, "ecdsa-p521")
        )
    }

    fn verification_error(&self) -> PaySignError {
        PaySignError::Verification(format!("{}: ECDSA verification failed", self.name))
    }
}

impl SigningMethod for EcdsaMethod {
    fn alg(&self) -> &str {
        &self.name
    }

    fn sign(&self, input: &str, key: &SigningKey) -> Result<String> {
        if !self.key_matches(key.kind()) {
            return Err(PaySignError::InvalidKeyType(self.name.clone()));
        }
        let raw = match key {
            SigningKey::P256(key) => {
                let signature: p256::ecdsa::Signature = key.sign(input.as_bytes());
                signature.to_bytes().to_vec()
            }
            SigningKey::P384(key) => {
                let signature: p384::ecdsa::Signature = key.sign(input.as_bytes());
                signature.to_bytes().to_vec()
            }
            SigningKey::P521(key) => {
                let signature: p521::ecdsa::Signature = key
                    .try_sign(input.as_bytes())
                    .map_err(|e| PaySignError::Signature(format!("{}: {e}", self.name)))?;
                signature.to_bytes().to_vec()
            }
            _ => return Err(PaySignError::InvalidKeyType(self.name.clone())),
        };
        Ok(SignatureEncoding::UrlSafe.encode(&raw))
    }

    /// Malformed signatures and mismatches both surface as `Verification`.
    fn verify(&self, input: &str, signature: &str, key: &VerifyingKey) -> Result<()> {
        if !self.key_matches(key.kind()) {
            return Err(PaySignError::InvalidKeyType(self.name.clone()));
        }
        let raw = SignatureEncoding::UrlSafe
            .decode(signature)
            .map_err(|_| self.verification_error())?;
        if raw.len() != 2 * self.curve.key_size() {
            return Err(self.verification_error());
        }

        let message = input.as_bytes();
        let outcome = match key {
            VerifyingKey::P256(key) => p256::ecdsa::Signature::from_slice(&raw)
                .and_then(|signature| key.verify(message, &signature)),
            VerifyingKey::P384(key) => p384::ecdsa::Signature::from_slice(&raw)
                .and_then(|signature| key.verify(message, &signature)),
            VerifyingKey::P521(key) => p521::ecdsa::Signature::from_slice(&raw)
                .and_then(|signature| key.verify(message, &signature)),
            _ => return Err(PaySignError::InvalidKeyType(self.name.clone())),
        };
        outcome.map_err(|_| self.verification_error())
    }
}

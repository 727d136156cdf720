use std::collections::HashMap;
use std::fmt;

use super::ecdsa::EcdsaMethod;
use super::hmac::HmacMethod;
use super::key::{EcCurve, HashAlg, SigningKey, VerifyingKey};
use super::method::{SignatureEncoding, SigningMethod};
use super::rsa::RsaMethod;
use crate::error::{PaySignError, Result};

pub const RSA: &str = "RSA";
pub const RSA2: &str = "RSA2";
pub const RS256: &str = "RS256";
pub const RS384: &str = "RS384";
pub const RS512: &str = "RS512";
pub const PS256: &str = "PS256";
pub const PS384: &str = "PS384";
pub const PS512: &str = "PS512";
pub const HS256: &str = "HS256";
pub const HS384: &str = "HS384";
pub const HS512: &str = "HS512";
pub const ES256: &str = "ES256";
pub const ES384: &str = "ES384";
pub const ES512: &str = "ES512";

/// Named signing methods, assembled once and shared read-only (usually
/// behind an `Arc`).
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Box<dyn SigningMethod>>,
}

impl MethodRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every built-in method: RSA/RSA2 for the gateways plus the JWS set.
    pub fn standard() -> Self {
        use SignatureEncoding::{Standard, UrlSafe};

        Self::empty()
            .with_method(RsaMethod::pkcs1v15(RSA, HashAlg::Sha1, Standard))
            .with_method(RsaMethod::pkcs1v15(RSA2, HashAlg::Sha256, Standard))
            .with_method(RsaMethod::pkcs1v15(RS256, HashAlg::Sha256, UrlSafe))
            .with_method(RsaMethod::pkcs1v15(RS384, HashAlg::Sha384, UrlSafe))
            .with_method(RsaMethod::pkcs1v15(RS512, HashAlg::Sha512, UrlSafe))
            .with_method(RsaMethod::pss(PS256, HashAlg::Sha256))
            .with_method(RsaMethod::pss(PS384, HashAlg::Sha384))
            .with_method(RsaMethod::pss(PS512, HashAlg::Sha512))
            .with_method(HmacMethod::new(HS256, HashAlg::Sha256))
            .with_method(HmacMethod::new(HS384, HashAlg::Sha384))
            .with_method(HmacMethod::new(HS512, HashAlg::Sha512))
            .with_method(EcdsaMethod::new(ES256, EcCurve::P256))
            .with_method(EcdsaMethod::new(ES384, EcCurve::P384))
            .with_method(EcdsaMethod::new(ES512, EcCurve::P521))
    }

    /// Register `method` under its own `alg()`, replacing any previous entry.
    pub fn with_method(mut self, method: impl SigningMethod + 'static) -> Self {
        self.methods.insert(method.alg().to_string(), Box::new(method));
        self
    }

    pub fn get(&self, alg: &str) -> Result<&dyn SigningMethod> {
        self.methods
            .get(alg)
            .map(|method| method.as_ref())
            .ok_or_else(|| PaySignError::UnknownMethod(alg.to_string()))
    }

    pub fn contains(&self, alg: &str) -> bool {
        self.methods.contains_key(alg)
    }

    pub fn sign(&self, alg: &str, input: &str, key: &SigningKey) -> Result<String> {
        self.get(alg)?.sign(input, key)
    }

    pub fn verify(&self, alg: &str, input: &str, signature: &str, key: &VerifyingKey) -> Result<()> {
        self.get(alg)?.verify(input, signature, key)
    }

    /// Registered identifiers, sorted.
    pub fn algorithms(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.algorithms())
            .finish()
    }
}

use rsa::{Pkcs1v15Sign, Pss};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

use super::key::{HashAlg, SigningKey, VerifyingKey};
use super::method::{SignatureEncoding, SigningMethod};
use crate::error::{PaySignError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaPadding {
    Pkcs1v15,
    /// PSS with a salt as long as the digest.
    Pss,
}

/// RSA signatures over a pre-hashed input.
#[derive(Debug, Clone)]
pub struct RsaMethod {
    name: String,
    hash: HashAlg,
    padding: RsaPadding,
    encoding: SignatureEncoding,
}

impl RsaMethod {
    pub fn pkcs1v15(name: &str, hash: HashAlg, encoding: SignatureEncoding) -> Self {
        Self {
            name: name.to_string(),
            hash,
            padding: RsaPadding::Pkcs1v15,
            encoding,
        }
    }

    pub fn pss(name: &str, hash: HashAlg) -> Self {
        Self {
            name: name.to_string(),
            hash,
            padding: RsaPadding::Pss,
            encoding: SignatureEncoding::UrlSafe,
        }
    }

    pub fn hash(&self) -> HashAlg {
        self.hash
    }

    fn pkcs1v15_scheme(&self) -> Pkcs1v15Sign {
        match self.hash {
            HashAlg::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
            HashAlg::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            HashAlg::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
            HashAlg::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
        }
    }

    fn pss_scheme(&self) -> Result<Pss> {
        match self.hash {
            HashAlg::Sha1 => Err(PaySignError::HashUnavailable {
                method: self.name.clone(),
                hash: self.hash.name(),
            }),
            HashAlg::Sha256 => Ok(Pss::new::<Sha256>()),
            HashAlg::Sha384 => Ok(Pss::new::<Sha384>()),
            HashAlg::Sha512 => Ok(Pss::new::<Sha512>()),
        }
    }
}

impl SigningMethod for RsaMethod {
    fn alg(&self) -> &str {
        &self.name
    }

    fn sign(&self, input: &str, key: &SigningKey) -> Result<String> {
        let SigningKey::Rsa(private_key) = key else {
            return Err(PaySignError::InvalidKeyType(self.name.clone()));
        };
        let digest = self.hash.digest(input.as_bytes());
        let signature = match self.padding {
            RsaPadding::Pkcs1v15 => private_key.sign(self.pkcs1v15_scheme(), &digest),
            RsaPadding::Pss => {
                let scheme = self.pss_scheme()?;
                private_key.sign_with_rng(&mut rand::thread_rng(), scheme, &digest)
            }
        }
        .map_err(|e| PaySignError::Signature(format!("{}: {e}", self.name)))?;
        Ok(self.encoding.encode(&signature))
    }

    fn verify(&self, input: &str, signature: &str, key: &VerifyingKey) -> Result<()> {
        let VerifyingKey::Rsa(public_key) = key else {
            return Err(PaySignError::InvalidKeyType(self.name.clone()));
        };
        let signature = self.encoding.decode(signature)?;
        let digest = self.hash.digest(input.as_bytes());
        let outcome = match self.padding {
            RsaPadding::Pkcs1v15 => public_key.verify(self.pkcs1v15_scheme(), &digest, &signature),
            RsaPadding::Pss => public_key.verify(self.pss_scheme()?, &digest, &signature),
        };
        outcome.map_err(|e| PaySignError::Verification(format!("{}: {e}", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use rand_chacha::ChaCha20Rng;
    use rand_chacha::rand_core::SeedableRng;
    use rsa::RsaPrivateKey;
    use sha2::Digest;

    use super::*;

    fn test_key() -> &'static SigningKey {
        static KEY: OnceLock<SigningKey> = OnceLock::new();
        KEY.get_or_init(|| {
            let seed = Sha256::digest(b"rsa-method-tests");
            let mut rng = ChaCha20Rng::from_seed(seed.into());
            SigningKey::Rsa(RsaPrivateKey::new(&mut rng, 2048).unwrap())
        })
    }

    #[test]
    fn rsa2_round_trip_uses_standard_base64() {
        let method = RsaMethod::pkcs1v15("RSA2", HashAlg::Sha256, SignatureEncoding::Standard);
        let sig = method.sign("a=1&b=2", test_key()).unwrap();
        assert_eq!(sig.len(), 344);
        assert!(sig.ends_with('='));
        method.verify("a=1&b=2", &sig, &test_key().verifying_key()).unwrap();
    }

    #[test]
    fn pkcs1v15_is_deterministic() {
        let method = RsaMethod::pkcs1v15("RS256", HashAlg::Sha256, SignatureEncoding::UrlSafe);
        let a = method.sign("payload", test_key()).unwrap();
        let b = method.sign("payload", test_key()).unwrap();
        assert_eq!(a, b);
        assert!(!a.contains('='));
    }

    #[test]
    fn pss_is_randomized_but_verifies() {
        let method = RsaMethod::pss("PS256", HashAlg::Sha256);
        let public = test_key().verifying_key();
        let a = method.sign("payload", test_key()).unwrap();
        let b = method.sign("payload", test_key()).unwrap();
        assert_ne!(a, b);
        method.verify("payload", &a, &public).unwrap();
        method.verify("payload", &b, &public).unwrap();
    }

    #[test]
    fn pss_with_sha1_is_unavailable() {
        let method = RsaMethod::pss("PS1", HashAlg::Sha1);
        let err = method.sign("payload", test_key()).unwrap_err();
        assert!(matches!(err, PaySignError::HashUnavailable { hash: "SHA-1", .. }));
    }

    #[test]
    fn tampered_input_fails() {
        let method = RsaMethod::pkcs1v15("RSA", HashAlg::Sha1, SignatureEncoding::Standard);
        let sig = method.sign("amount=100", test_key()).unwrap();
        let err = method
            .verify("amount=900", &sig, &test_key().verifying_key())
            .unwrap_err();
        assert!(matches!(err, PaySignError::Verification(_)));
    }

    #[test]
    fn hmac_key_is_rejected() {
        let method = RsaMethod::pkcs1v15("RSA2", HashAlg::Sha256, SignatureEncoding::Standard);
        let err = method.sign("x", &SigningKey::Hmac(b"secret".to_vec())).unwrap_err();
        assert!(matches!(err, PaySignError::InvalidKeyType(name) if name == "RSA2"));
    }
}

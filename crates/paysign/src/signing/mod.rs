mod ecdsa;
mod hmac;
mod key;
mod method;
mod registry;
mod rsa;

pub use self::ecdsa::EcdsaMethod;
pub use self::hmac::HmacMethod;
pub use self::rsa::{RsaMethod, RsaPadding};
pub use key::{EcCurve, HashAlg, SigningKey, VerifyingKey};
pub use method::{SignatureEncoding, SigningMethod};
pub use registry::*;

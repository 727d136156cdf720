pub mod alipay;
pub mod apple;
pub mod auth;
pub mod cert;
pub mod config;
pub mod error;
pub mod legacy;
pub mod params;
pub mod paypal;
pub mod pem;
pub mod signing;
pub mod transport;
pub mod verify;
pub mod wechat;

pub use alipay::{AlipayClient, AlipayResponse};
pub use apple::{AppStoreClient, AppStoreSigner, decode_signed_payload};
pub use auth::RequestSigner;
pub use cert::{CertificateCache, CertificateEntry, CertificateSource};
pub use error::{BusinessError, PaySignError, Result};
pub use params::{ParamValue, ParameterBag};
pub use paypal::PaypalClient;
pub use signing::{MethodRegistry, SigningKey, SigningMethod, VerifyingKey};
pub use transport::{HttpTransport, ReqwestTransport};
pub use verify::{ResponseVerifier, SignInfo, Verification};
pub use wechat::V3Client;

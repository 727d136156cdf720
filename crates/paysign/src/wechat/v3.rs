//! WeChat Pay API v3 client.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::Oaep;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{EncryptedResource, PlatformCertificateSource, decrypt_resource};
use crate::auth::{self, RequestSigner};
use crate::cert::CertificateCache;
use crate::config::WechatConfig;
use crate::error::{PaySignError, Result};
use crate::params::ParameterBag;
use crate::pem;
use crate::signing::{MethodRegistry, VerifyingKey};
use crate::transport::{HttpRequest, HttpTransport};
use crate::verify::{HEADER_REQUEST_ID, HEADER_SERIAL, ResponseVerifier, SignInfo, Verification};

/// A successful, signature-checked API response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V3Response {
    pub status: u16,
    pub request_id: Option<String>,
    pub body: String,
    pub verification: Verification,
}

impl V3Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Error body returned with non-2xx statuses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    /// WeChat's `{code, message}` from an [`PaySignError::HttpStatus`] body.
    pub fn from_error(error: &PaySignError) -> Option<Self> {
        match error {
            PaySignError::HttpStatus { body, .. } => serde_json::from_str(body).ok(),
            _ => None,
        }
    }
}

/// Parameters for `WeixinJSBridge.invoke('getBrandWCPayRequest', …)` and
/// `wx.requestPayment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsapiPayParams {
    pub app_id: String,
    pub time_stamp: String,
    pub nonce_str: String,
    pub package: String,
    pub sign_type: String,
    pub pay_sign: String,
}

/// Parameters for the in-app `PayReq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPayParams {
    pub appid: String,
    pub partnerid: String,
    pub prepayid: String,
    pub package: String,
    pub noncestr: String,
    pub timestamp: String,
    pub sign: String,
}

/// Callback envelope; `resource` is decrypted with the APIv3 key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Notification {
    pub id: String,
    pub create_time: String,
    pub event_type: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub summary: String,
    pub resource: EncryptedResource,
}

pub struct V3Client {
    base_url: String,
    api_v3_key: Vec<u8>,
    signer: Arc<RequestSigner>,
    verifier: ResponseVerifier,
    transport: Arc<dyn HttpTransport>,
}

impl V3Client {
    /// Decodes the merchant key and wires the platform-certificate cache to
    /// the download endpoint.
    pub fn new(
        config: WechatConfig,
        registry: Arc<MethodRegistry>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let key = pem::decode_private_key(&config.private_key)?;
        let signer = Arc::new(RequestSigner::new(
            &config.mch_id,
            &config.serial_no,
            key,
            Arc::clone(&registry),
        )?);
        let source = PlatformCertificateSource::new(
            Arc::clone(&signer),
            Arc::clone(&transport),
            Arc::clone(&registry),
            config.base_url(),
            config.api_v3_key.as_bytes(),
        );
        let cache = Arc::new(CertificateCache::new(Arc::new(source)));
        Ok(Self::with_cache(config, signer, cache, registry, transport))
    }

    /// Use an existing certificate cache, for example one over local PEM
    /// files instead of the download endpoint.
    pub fn with_cache(
        config: WechatConfig,
        signer: Arc<RequestSigner>,
        cache: Arc<CertificateCache>,
        registry: Arc<MethodRegistry>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let verifier = ResponseVerifier::new(cache, registry);
        verifier.set_auto_verify(config.auto_verify);
        Self {
            base_url: config.base_url().to_string(),
            api_v3_key: config.api_v3_key.into_bytes(),
            signer,
            verifier,
            transport,
        }
    }

    pub fn set_auto_verify(&self, enabled: bool) {
        self.verifier.set_auto_verify(enabled);
    }

    pub fn certificates(&self) -> &Arc<CertificateCache> {
        self.verifier.cache()
    }

    pub fn signer(&self) -> &RequestSigner {
        &self.signer
    }

    /// Sign, send and verify one call. `path` includes the query string.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: &str,
        cancel: &CancellationToken,
    ) -> Result<V3Response> {
        self.send(method, path, body, None, cancel).await
    }

    async fn send(
        &self,
        method: &str,
        path: &str,
        body: &str,
        platform_serial: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<V3Response> {
        let authorization = self.signer.authorization(method, path, body)?;
        let mut request = HttpRequest::new(method, format!("{}{path}", self.base_url))
            .header("Authorization", authorization)
            .header("Accept", "application/json");
        if let Some(serial) = platform_serial {
            request = request.header(HEADER_SERIAL, serial);
        }
        if !body.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = self.transport.send(request, cancel).await?;
        let request_id = response.header(HEADER_REQUEST_ID).map(str::to_string);
        let text = response.text();
        debug!(status = response.status, request_id = ?request_id, "wechat v3 response");

        let verification = if self.verifier.auto_verify() {
            let info = SignInfo::from_headers(&response.headers, &text)?;
            self.verifier.verify_response(&info, cancel).await?
        } else {
            Verification::Skipped
        };

        Ok(V3Response {
            status: response.status,
            request_id,
            body: text,
            verification,
        })
    }

    pub async fn get(&self, path: &str, cancel: &CancellationToken) -> Result<V3Response> {
        self.request("GET", path, "", cancel).await
    }

    pub async fn post(&self, path: &str, body: &ParameterBag, cancel: &CancellationToken) -> Result<V3Response> {
        self.request("POST", path, &body.json_body(), cancel).await
    }

    /// POST a body whose sensitive fields were produced by
    /// [`encrypt_text`](Self::encrypt_text); `platform_serial` tells WeChat
    /// which certificate to decrypt them with.
    pub async fn post_encrypted(
        &self,
        path: &str,
        body: &ParameterBag,
        platform_serial: &str,
        cancel: &CancellationToken,
    ) -> Result<V3Response> {
        self.send("POST", path, &body.json_body(), Some(platform_serial), cancel).await
    }

    /// Encrypt a sensitive field (bank account, name, ID number) to the
    /// newest platform certificate with RSA-OAEP/SHA-1.
    ///
    /// Returns the base64 ciphertext and the certificate serial to send as
    /// `Wechatpay-Serial`. Downloads the certificates first when the cache is
    /// empty.
    pub async fn encrypt_text(&self, plain: &str, cancel: &CancellationToken) -> Result<(String, String)> {
        let cache = self.certificates();
        let newest = match cache.newest().await {
            Some(entry) => entry,
            None => {
                cache.refresh(cancel).await?;
                cache
                    .newest()
                    .await
                    .ok_or_else(|| PaySignError::PublicKeyNotFound(String::new()))?
            }
        };
        let VerifyingKey::Rsa(public_key) = newest.public_key.as_ref() else {
            return Err(PaySignError::InvalidKeyType(newest.public_key.kind().to_string()));
        };
        let ciphertext = public_key
            .encrypt(&mut rand::thread_rng(), Oaep::new::<sha1::Sha1>(), plain.as_bytes())
            .map_err(|e| PaySignError::Encrypt(e.to_string()))?;
        debug!(serial = %newest.serial, "sensitive field encrypted");
        Ok((STANDARD.encode(ciphertext), newest.serial))
    }

    /// `APPID\nTIMESTAMP\nNONCE\nPACKAGE\n`, signed with the merchant key.
    fn pay_sign(&self, appid: &str, package: &str) -> Result<(String, String, String)> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let nonce = auth::nonce();
        let message = format!("{appid}\n{timestamp}\n{nonce}\n{package}\n");
        let signature = self.signer.sign(&message)?;
        Ok((timestamp, nonce, signature))
    }

    pub fn pay_sign_jsapi(&self, appid: &str, prepay_id: &str) -> Result<JsapiPayParams> {
        let package = format!("prepay_id={prepay_id}");
        let (time_stamp, nonce_str, pay_sign) = self.pay_sign(appid, &package)?;
        Ok(JsapiPayParams {
            app_id: appid.to_string(),
            time_stamp,
            nonce_str,
            package,
            sign_type: "RSA".to_string(),
            pay_sign,
        })
    }

    /// Mini-program payments sign exactly like JSAPI.
    pub fn pay_sign_applet(&self, appid: &str, prepay_id: &str) -> Result<JsapiPayParams> {
        self.pay_sign_jsapi(appid, prepay_id)
    }

    /// The app variant signs the bare prepay id.
    pub fn pay_sign_app(&self, appid: &str, prepay_id: &str) -> Result<AppPayParams> {
        let (timestamp, noncestr, sign) = self.pay_sign(appid, prepay_id)?;
        Ok(AppPayParams {
            appid: appid.to_string(),
            partnerid: self.signer.mch_id().to_string(),
            prepayid: prepay_id.to_string(),
            package: "Sign=WXPay".to_string(),
            noncestr,
            timestamp,
            sign,
        })
    }

    /// Check a callback's signature. Always verifies, whatever the
    /// auto-verify switch says.
    pub async fn verify_notification(
        &self,
        headers: &HashMap<String, String>,
        body: &str,
        cancel: &CancellationToken,
    ) -> Result<Notification> {
        let info = SignInfo::from_headers(headers, body)?;
        self.verifier.verify(&info, cancel).await?;
        Ok(serde_json::from_str(body)?)
    }

    /// Plain JSON of a verified notification's resource.
    pub fn decrypt_notification(&self, notification: &Notification) -> Result<String> {
        decrypt_resource(&self.api_v3_key, &notification.resource)
    }
}

impl std::fmt::Debug for V3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V3Client")
            .field("base_url", &self.base_url)
            .field("signer", &self.signer)
            .field("auto_verify", &self.verifier.auto_verify())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{PemSource, SerialScheme};
    use crate::signing::{RSA2, SigningKey};
    use crate::transport::HttpResponse;

    const MERCHANT_KEY: &str = include_str!("../../testdata/merchant_key.pem");
    const MERCHANT_PUB: &str = include_str!("../../testdata/merchant_pub.pem");
    const API_V3_KEY: &str = "0123456789abcdef0123456789abcdef";
    const PLATFORM_KEY: &str = include_str!("../../testdata/platform_key.pem");
    const PLATFORM_CERT: &str = include_str!("../../testdata/platform_cert.pem");
    const PLATFORM2_KEY: &str = include_str!("../../testdata/platform2_key.pem");
    const PLATFORM2_CERT: &str = include_str!("../../testdata/platform2_cert.pem");
    const PLATFORM_SERIAL: &str = "5157F09EFDC096DE63B4E3A7D2C8B1F9A1B2C3D4";

    /// Never reached by the pay-sign helpers.
    struct NoTransport;

    #[async_trait::async_trait]
    impl HttpTransport for NoTransport {
        async fn send(&self, _request: HttpRequest, _cancel: &CancellationToken) -> Result<HttpResponse> {
            Err(PaySignError::Transport("offline".into()))
        }
    }

    fn config() -> WechatConfig {
        serde_json::from_value(serde_json::json!({
            "mch_id": "1900000001",
            "serial_no": "MERCHANTSERIAL",
            "api_v3_key": API_V3_KEY,
            "private_key": MERCHANT_KEY,
        }))
        .unwrap()
    }

    fn client() -> V3Client {
        V3Client::new(config(), Arc::new(MethodRegistry::standard()), Arc::new(NoTransport)).unwrap()
    }

    fn client_with_cache(cache: Arc<CertificateCache>) -> V3Client {
        let registry = Arc::new(MethodRegistry::standard());
        let signer = Arc::new(
            RequestSigner::new(
                "1900000001",
                "MERCHANTSERIAL",
                pem::decode_private_key(MERCHANT_KEY).unwrap(),
                Arc::clone(&registry),
            )
            .unwrap(),
        );
        V3Client::with_cache(config(), signer, cache, registry, Arc::new(NoTransport))
    }

    fn verify_merchant(message: &str, signature: &str) {
        MethodRegistry::standard()
            .verify(RSA2, message, signature, &pem::decode_public_key(MERCHANT_PUB).unwrap())
            .unwrap();
    }

    #[test]
    fn jsapi_pay_sign_covers_prepay_package() {
        let params = client().pay_sign_jsapi("wx8888888888888888", "wx201410272009395522657a690389285100").unwrap();
        assert_eq!(params.package, "prepay_id=wx201410272009395522657a690389285100");
        assert_eq!(params.sign_type, "RSA");
        let message = format!(
            "wx8888888888888888\n{}\n{}\nprepay_id=wx201410272009395522657a690389285100\n",
            params.time_stamp, params.nonce_str
        );
        verify_merchant(&message, &params.pay_sign);

        let json = serde_json::to_value(&params).unwrap();
        assert!(json.get("appId").is_some() && json.get("paySign").is_some());
    }

    #[test]
    fn app_pay_sign_uses_bare_prepay_id() {
        let params = client().pay_sign_app("wxapp", "WX1217752501201407033233368018").unwrap();
        assert_eq!(params.partnerid, "1900000001");
        assert_eq!(params.package, "Sign=WXPay");
        let message = format!(
            "wxapp\n{}\n{}\nWX1217752501201407033233368018\n",
            params.timestamp, params.noncestr
        );
        verify_merchant(&message, &params.sign);
    }

    #[test]
    fn invalid_config_fails_before_any_request() {
        let mut config = config();
        config.private_key = String::new();
        let err = V3Client::new(config, Arc::new(MethodRegistry::standard()), Arc::new(NoTransport)).unwrap_err();
        assert!(matches!(err, PaySignError::MissingConfig("private_key")));
    }

    #[tokio::test]
    async fn transport_failure_propagates_unchanged() {
        let client = client();
        let err = client.get("/v3/pay/transactions/id/1", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PaySignError::Transport(msg) if msg == "offline"));
    }

    #[test]
    fn api_error_is_read_from_status_body() {
        let err = PaySignError::HttpStatus {
            status: 400,
            body: r#"{"code":"PARAM_ERROR","message":"appid missing"}"#.into(),
        };
        let api = ApiError::from_error(&err).unwrap();
        assert_eq!(api.code, "PARAM_ERROR");
        assert!(ApiError::from_error(&PaySignError::Cancelled).is_none());
    }

    #[tokio::test]
    async fn encrypt_text_targets_newest_platform_certificate() {
        let source = PemSource::new(SerialScheme::Hex)
            .certificate(PLATFORM_CERT)
            .unwrap()
            .certificate(PLATFORM2_CERT)
            .unwrap();
        let cache = Arc::new(CertificateCache::new(Arc::new(source)));
        let client = client_with_cache(Arc::clone(&cache));

        let (ciphertext, serial) = client
            .encrypt_text("6225880137706868", &CancellationToken::new())
            .await
            .unwrap();
        let newest = cache.newest().await.unwrap();
        assert_eq!(serial, newest.serial);
        assert_eq!(cache.refresh_count(), 1);

        let key_pem = if serial == PLATFORM_SERIAL { PLATFORM_KEY } else { PLATFORM2_KEY };
        let SigningKey::Rsa(private) = pem::decode_private_key(key_pem).unwrap() else {
            panic!("platform key is RSA");
        };
        let plain = private
            .decrypt(Oaep::new::<sha1::Sha1>(), &STANDARD.decode(&ciphertext).unwrap())
            .unwrap();
        assert_eq!(plain, b"6225880137706868");

        let (again, _) = client.encrypt_text("6225880137706868", &CancellationToken::new()).await.unwrap();
        assert_ne!(again, ciphertext);
        assert_eq!(cache.refresh_count(), 1);
    }

    #[tokio::test]
    async fn encrypt_text_without_certificates_fails() {
        let client = client_with_cache(Arc::new(CertificateCache::fixed([])));
        let err = client.encrypt_text("secret", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PaySignError::PublicKeyNotFound(_)));
    }

    #[test]
    fn notification_resource_decrypts() {
        let client = client_with_cache(Arc::new(CertificateCache::fixed([])));

        let resource = super::super::encrypt_resource(
            API_V3_KEY.as_bytes(),
            "fdasflkja484",
            "transaction",
            r#"{"out_trade_no":"T1"}"#,
        )
        .unwrap();
        let notification = Notification {
            id: "EV-1".into(),
            create_time: "2026-10-18T10:00:00+08:00".into(),
            event_type: "TRANSACTION.SUCCESS".into(),
            resource_type: "encrypt-resource".into(),
            summary: String::new(),
            resource,
        };
        assert_eq!(client.decrypt_notification(&notification).unwrap(), r#"{"out_trade_no":"T1"}"#);
    }
}

//! Alipay OpenAPI gateway client.
//!
//! Requests are form POSTs carrying the public parameters plus a JSON
//! `biz_content`, signed over their canonical string. Responses carry the
//! method's payload under `<method>_response` and a `sign` over the exact
//! raw text of that member, so the payload is kept as unparsed JSON.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{FixedOffset, Utc};
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cert::{CertificateCache, CertificateEntry, PemSource, SerialScheme};
use crate::config::AlipayConfig;
use crate::error::{BusinessError, PaySignError, Result};
use crate::params::ParameterBag;
use crate::pem;
use crate::signing::{MethodRegistry, SigningKey};
use crate::transport::{HttpRequest, HttpTransport};
use crate::verify::Verification;

pub const SUCCESS_CODE: &str = "10000";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const ERROR_RESPONSE: &str = "error_response";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded;charset=utf-8";

/// Gateway time, `yyyy-MM-dd HH:mm:ss` in UTC+8.
pub fn timestamp() -> String {
    let now = Utc::now();
    match FixedOffset::east_opt(8 * 3600) {
        Some(beijing) => now.with_timezone(&beijing).format(TIMESTAMP_FORMAT).to_string(),
        None => now.format(TIMESTAMP_FORMAT).to_string(),
    }
}

/// `alipay.trade.query` answers under `alipay_trade_query_response`.
pub fn response_key(method: &str) -> String {
    format!("{}_response", method.replace('.', "_"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlipayResponse {
    pub method: String,
    /// Raw JSON of the `*_response` member.
    pub payload: String,
    /// The exact text the gateway signed; equal to `payload`.
    pub sign_data: String,
    pub sign: Option<String>,
    /// SN of the Alipay certificate that signed, in certificate mode.
    pub cert_sn: Option<String>,
    pub business_error: Option<BusinessError>,
    pub verification: Verification,
}

impl AlipayResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn is_success(&self) -> bool {
        self.business_error.is_none()
    }
}

#[derive(Debug, serde::Deserialize)]
struct Status {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    sub_code: String,
    #[serde(default)]
    sub_msg: String,
}

fn business_error(payload: &str) -> Result<Option<BusinessError>> {
    let status: Status = serde_json::from_str(payload)?;
    if status.code == SUCCESS_CODE {
        return Ok(None);
    }
    Ok(Some(BusinessError {
        code: status.code,
        msg: status.msg,
        sub_code: status.sub_code,
        sub_msg: status.sub_msg,
    }))
}

fn string_member(members: &HashMap<String, &RawValue>, name: &str) -> Result<Option<String>> {
    members
        .get(name)
        .map(|raw| serde_json::from_str::<String>(raw.get()))
        .transpose()
        .map_err(PaySignError::from)
}

pub struct AlipayClient {
    app_id: String,
    sign_type: String,
    gateway: String,
    key: SigningKey,
    registry: Arc<MethodRegistry>,
    keys: Arc<CertificateCache>,
    /// Key id used when a response or notification names none: `""` in
    /// public-key mode, the configured Alipay certificate SN otherwise.
    default_key_id: String,
    app_cert_sn: Option<String>,
    alipay_root_cert_sn: Option<String>,
    notify_url: Option<String>,
    return_url: Option<String>,
    app_auth_token: Option<String>,
    auto_verify: AtomicBool,
    transport: Arc<dyn HttpTransport>,
}

impl AlipayClient {
    /// Public-key mode registers the configured key under `""`; certificate
    /// mode keys the cache by Alipay SN, refreshing from the configured
    /// certificate.
    pub fn new(
        config: AlipayConfig,
        registry: Arc<MethodRegistry>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let (keys, default_key_id) = match (&config.alipay_cert, &config.alipay_public_key) {
            (Some(alipay_cert), _) if config.cert_mode() => {
                let source = PemSource::new(SerialScheme::AlipaySn).certificate(alipay_cert)?;
                let sn = pem::alipay_cert_sn(alipay_cert)?;
                (CertificateCache::new(Arc::new(source)), sn)
            }
            (_, Some(public_key)) => {
                let entry = CertificateEntry::new("", pem::decode_public_key(public_key)?, None);
                (CertificateCache::fixed([entry]), String::new())
            }
            _ => (CertificateCache::fixed([]), String::new()),
        };
        Self::with_keys(config, Arc::new(keys), default_key_id, registry, transport)
    }

    /// Use an existing key cache, e.g. one over [`crate::cert::PemFileSource`]
    /// so a rotated Alipay certificate is picked up from disk.
    pub fn with_keys(
        config: AlipayConfig,
        keys: Arc<CertificateCache>,
        default_key_id: impl Into<String>,
        registry: Arc<MethodRegistry>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        config.validate()?;
        registry.get(&config.sign_type)?;
        let key = pem::decode_private_key(&config.private_key)?;
        let (app_cert_sn, alipay_root_cert_sn) = match (&config.app_cert, &config.alipay_root_cert) {
            (Some(app_cert), Some(root)) if config.cert_mode() => {
                (Some(pem::alipay_cert_sn(app_cert)?), Some(pem::alipay_root_cert_sn(root)?))
            }
            _ => (None, None),
        };
        Ok(Self {
            gateway: config.gateway().to_string(),
            app_id: config.app_id,
            sign_type: config.sign_type,
            key,
            registry,
            keys,
            default_key_id: default_key_id.into(),
            app_cert_sn,
            alipay_root_cert_sn,
            notify_url: config.notify_url,
            return_url: config.return_url,
            app_auth_token: config.app_auth_token,
            auto_verify: AtomicBool::new(config.auto_verify),
            transport,
        })
    }

    pub fn set_auto_verify(&self, enabled: bool) {
        self.auto_verify.store(enabled, Ordering::Relaxed);
    }

    pub fn auto_verify(&self) -> bool {
        self.auto_verify.load(Ordering::Relaxed)
    }

    pub fn keys(&self) -> &Arc<CertificateCache> {
        &self.keys
    }

    pub fn app_cert_sn(&self) -> Option<&str> {
        self.app_cert_sn.as_deref()
    }

    pub fn alipay_root_cert_sn(&self) -> Option<&str> {
        self.alipay_root_cert_sn.as_deref()
    }

    /// Public parameters, `biz_content` and `sign` for one call.
    pub fn signed_params(&self, method: &str, biz: &ParameterBag) -> Result<ParameterBag> {
        let mut bag = ParameterBag::new()
            .with("app_id", self.app_id.as_str())
            .with("method", method)
            .with("format", "JSON")
            .with("charset", "utf-8")
            .with("sign_type", self.sign_type.as_str())
            .with("timestamp", timestamp())
            .with("version", "1.0");
        let optional = [
            ("app_cert_sn", &self.app_cert_sn),
            ("alipay_root_cert_sn", &self.alipay_root_cert_sn),
            ("notify_url", &self.notify_url),
            ("return_url", &self.return_url),
            ("app_auth_token", &self.app_auth_token),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                bag.set(name, value.as_str());
            }
        }
        if !biz.is_empty() {
            bag.set("biz_content", biz.json_body());
        }

        let input = bag.canonical_string_without(&["sign"]);
        debug!(method, signing_string = %input, "alipay request");
        let sign = self.registry.sign(&self.sign_type, &input, &self.key)?;
        bag.set("sign", sign);
        Ok(bag)
    }

    pub async fn request(
        &self,
        method: &str,
        biz: &ParameterBag,
        cancel: &CancellationToken,
    ) -> Result<AlipayResponse> {
        let params = self.signed_params(method, biz)?;
        let request = HttpRequest::new("POST", self.gateway.as_str())
            .header("Content-Type", FORM_CONTENT_TYPE)
            .header("Accept", "application/json")
            .body(params.form_urlencoded());
        let response = self.transport.send(request, cancel).await?;
        let body = response.text();
        debug!(method, status = response.status, "alipay response");
        self.read_response(method, &body, cancel).await
    }

    /// Split a gateway body into payload and signature, then verify.
    pub async fn read_response(
        &self,
        method: &str,
        body: &str,
        cancel: &CancellationToken,
    ) -> Result<AlipayResponse> {
        let members: HashMap<String, &RawValue> = serde_json::from_str(body)?;
        let raw = members
            .get(&response_key(method))
            .or_else(|| members.get(ERROR_RESPONSE))
            .ok_or_else(|| PaySignError::SignData(response_key(method)))?;
        let payload = raw.get().to_string();
        let sign = string_member(&members, "sign")?;
        let cert_sn = string_member(&members, "alipay_cert_sn")?;
        let business_error = business_error(&payload)?;

        let verification = match (&sign, self.auto_verify()) {
            (_, false) => Verification::Skipped,
            (Some(sign), true) => {
                let serial = cert_sn.as_deref().unwrap_or(&self.default_key_id);
                self.verify_with(serial, &payload, sign, cancel).await?
            }
            (None, true) if business_error.is_some() => {
                warn!(method, "unsigned error response");
                Verification::Skipped
            }
            (None, true) => return Err(PaySignError::SignData("sign".into())),
        };

        Ok(AlipayResponse {
            method: method.to_string(),
            sign_data: payload.clone(),
            payload,
            sign,
            cert_sn,
            business_error,
            verification,
        })
    }

    /// Check an asynchronous notification. `sign_type` in the bag selects
    /// the method; it and `sign` are excluded from the signed string.
    pub async fn verify_notification(
        &self,
        notification: &ParameterBag,
        cancel: &CancellationToken,
    ) -> Result<Verification> {
        let sign = notification
            .get_str("sign")
            .ok_or_else(|| PaySignError::SignData("sign".into()))?;
        let sign_type = notification
            .get_str("sign_type")
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.sign_type);
        let key = self.keys.resolve(&self.default_key_id, cancel).await?;
        self.registry
            .verify(sign_type, &notification.canonical_string(), sign, &key)?;
        Ok(Verification::Verified {
            serial: self.default_key_id.clone(),
        })
    }

    async fn verify_with(
        &self,
        serial: &str,
        data: &str,
        sign: &str,
        cancel: &CancellationToken,
    ) -> Result<Verification> {
        let key = self.keys.resolve(serial, cancel).await?;
        self.registry.verify(&self.sign_type, data, sign, &key)?;
        Ok(Verification::Verified {
            serial: serial.to_string(),
        })
    }
}

impl std::fmt::Debug for AlipayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlipayClient")
            .field("app_id", &self.app_id)
            .field("gateway", &self.gateway)
            .field("sign_type", &self.sign_type)
            .field("cert_mode", &self.app_cert_sn.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::RSA2;
    use crate::transport::HttpResponse;

    const APP_KEY: &str = include_str!("../testdata/merchant_key.pem");
    const APP_PUB: &str = include_str!("../testdata/merchant_pub.pem");
    const ALIPAY_KEY: &str = include_str!("../testdata/alipay_key.pem");
    const ALIPAY_CERT: &str = include_str!("../testdata/alipay_cert.pem");
    const ALIPAY_SN: &str = "27b6d756d51be6853987bd814885bfb0";

    struct NoTransport;

    #[async_trait::async_trait]
    impl HttpTransport for NoTransport {
        async fn send(&self, _request: HttpRequest, _cancel: &CancellationToken) -> Result<HttpResponse> {
            Err(PaySignError::Transport("offline".into()))
        }
    }

    fn client() -> AlipayClient {
        let config: AlipayConfig = serde_json::from_value(serde_json::json!({
            "app_id": "2016091200494382",
            "private_key": APP_KEY,
            "alipay_public_key": ALIPAY_CERT,
            "notify_url": "https://example.com/notify",
        }))
        .unwrap();
        AlipayClient::new(config, Arc::new(MethodRegistry::standard()), Arc::new(NoTransport)).unwrap()
    }

    fn alipay_sign(data: &str) -> String {
        MethodRegistry::standard()
            .sign(RSA2, data, &pem::decode_private_key(ALIPAY_KEY).unwrap())
            .unwrap()
    }

    #[test]
    fn response_key_replaces_dots() {
        assert_eq!(response_key("alipay.trade.query"), "alipay_trade_query_response");
    }

    #[test]
    fn timestamp_has_gateway_format() {
        let ts = timestamp();
        assert!(chrono::NaiveDateTime::parse_from_str(&ts, TIMESTAMP_FORMAT).is_ok());
    }

    #[test]
    fn signed_params_verify_with_app_key() {
        let biz = ParameterBag::new().with("out_trade_no", "T-1").with("total_amount", "0.01");
        let params = client().signed_params("alipay.trade.query", &biz).unwrap();
        assert_eq!(params.get_str("biz_content"), Some(r#"{"out_trade_no":"T-1","total_amount":"0.01"}"#));
        assert_eq!(params.get_str("notify_url"), Some("https://example.com/notify"));
        assert!(!params.contains("app_cert_sn"));

        MethodRegistry::standard()
            .verify(
                RSA2,
                &params.canonical_string_without(&["sign"]),
                params.get_str("sign").unwrap(),
                &pem::decode_public_key(APP_PUB).unwrap(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn sign_covers_exact_payload_text() {
        let payload = r#"{"code":"10000","msg":"Success","out_trade_no":"T-1","total_amount":"0.01"}"#;
        let body = format!(
            r#"{{"alipay_trade_query_response":{payload},"sign":"{}"}}"#,
            alipay_sign(payload)
        );
        let response = client()
            .read_response("alipay.trade.query", &body, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.sign_data, payload);
        assert!(response.is_success());
        assert_eq!(response.verification, Verification::Verified { serial: String::new() });
    }

    #[tokio::test]
    async fn reformatted_payload_fails_verification() {
        let payload = r#"{"code":"10000","msg":"Success"}"#;
        let spaced = r#"{"code": "10000", "msg": "Success"}"#;
        let body = format!(
            r#"{{"alipay_trade_query_response":{spaced},"sign":"{}"}}"#,
            alipay_sign(payload)
        );
        let err = client()
            .read_response("alipay.trade.query", &body, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_signature());
    }

    #[tokio::test]
    async fn business_error_rides_alongside_verification() {
        let payload = r#"{"code":"40004","msg":"Business Failed","sub_code":"ACQ.TRADE_NOT_EXIST","sub_msg":"no such trade"}"#;
        let body = format!(
            r#"{{"alipay_trade_query_response":{payload},"sign":"{}"}}"#,
            alipay_sign(payload)
        );
        let response = client()
            .read_response("alipay.trade.query", &body, &CancellationToken::new())
            .await
            .unwrap();
        let error = response.business_error.unwrap();
        assert_eq!(error.sub_code, "ACQ.TRADE_NOT_EXIST");
        assert!(response.verification.is_verified());
    }

    #[tokio::test]
    async fn unsigned_error_response_is_returned_unverified() {
        let body = r#"{"error_response":{"code":"40002","msg":"Invalid Arguments","sub_code":"isv.invalid-app-id"}}"#;
        let response = client()
            .read_response("alipay.trade.query", body, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.business_error.unwrap().code, "40002");
        assert_eq!(response.verification, Verification::Skipped);
    }

    #[tokio::test]
    async fn unsigned_success_is_rejected() {
        let body = r#"{"alipay_trade_query_response":{"code":"10000","msg":"Success"}}"#;
        let err = client()
            .read_response("alipay.trade.query", body, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PaySignError::SignData(_)));
    }

    #[tokio::test]
    async fn notification_verifies_over_canonical_string() {
        let mut notification = ParameterBag::new()
            .with("notify_id", "ac05099524730693a8b330c5ecf72da9786")
            .with("out_trade_no", "T-1")
            .with("trade_status", "TRADE_SUCCESS")
            .with("sign_type", "RSA2");
        let sign = alipay_sign(&notification.canonical_string());
        notification.set("sign", sign);

        let client = client();
        client
            .verify_notification(&notification, &CancellationToken::new())
            .await
            .unwrap();

        notification.set("trade_status", "TRADE_CLOSED");
        assert!(client
            .verify_notification(&notification, &CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn certificate_mode_resolves_by_response_sn() {
        let keys = Arc::new(CertificateCache::new(Arc::new(
            PemSource::new(SerialScheme::AlipaySn).certificate(ALIPAY_CERT).unwrap(),
        )));
        let config: AlipayConfig = serde_json::from_value(serde_json::json!({
            "app_id": "2016091200494382",
            "private_key": APP_KEY,
            "auto_verify": false,
        }))
        .unwrap();
        let client = AlipayClient::with_keys(
            config,
            keys,
            ALIPAY_SN,
            Arc::new(MethodRegistry::standard()),
            Arc::new(NoTransport),
        )
        .unwrap();
        client.set_auto_verify(true);

        let payload = r#"{"code":"10000","msg":"Success"}"#;
        let body = format!(
            r#"{{"alipay_trade_query_response":{payload},"alipay_cert_sn":"{ALIPAY_SN}","sign":"{}"}}"#,
            alipay_sign(payload)
        );
        let response = client
            .read_response("alipay.trade.query", &body, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.cert_sn.as_deref(), Some(ALIPAY_SN));
        assert_eq!(response.verification, Verification::Verified { serial: ALIPAY_SN.into() });
        assert_eq!(client.keys().refresh_count(), 1);

        let unknown = body.replace(ALIPAY_SN, "00000000000000000000000000000000");
        let err = client
            .read_response("alipay.trade.query", &unknown, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PaySignError::PublicKeyNotFound(_)));
    }
}

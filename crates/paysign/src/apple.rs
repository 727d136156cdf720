//! App Store Server API: ES256 bearer tokens and signed JWS payloads.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::AppleConfig;
use crate::error::{PaySignError, Result};
use crate::params::ParameterBag;
use crate::pem;
use crate::signing::{ES256, MethodRegistry, SigningKey};
use crate::transport::{HttpRequest, HttpTransport};

pub const AUDIENCE: &str = "appstoreconnect-v1";
pub const TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Serialize)]
struct TokenHeader<'a> {
    alg: &'a str,
    kid: &'a str,
    typ: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
    pub bid: String,
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?))
}

fn decode_segment<T: DeserializeOwned>(segment: &str, what: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| PaySignError::SignData(format!("JWS {what}: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Mints the bearer token for App Store Server API calls.
pub struct AppStoreSigner {
    issuer_id: String,
    key_id: String,
    bundle_id: String,
    key: SigningKey,
    registry: Arc<MethodRegistry>,
}

impl AppStoreSigner {
    pub fn new(config: &AppleConfig, registry: Arc<MethodRegistry>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            issuer_id: config.issuer_id.clone(),
            key_id: config.key_id.clone(),
            bundle_id: config.bundle_id.clone(),
            key: pem::decode_private_key(&config.private_key)?,
            registry,
        })
    }

    pub fn token(&self) -> Result<String> {
        self.token_at(chrono::Utc::now().timestamp())
    }

    /// Token issued at `iat`, valid for an hour.
    pub fn token_at(&self, iat: i64) -> Result<String> {
        let header = TokenHeader {
            alg: ES256,
            kid: &self.key_id,
            typ: "JWT",
        };
        let claims = TokenClaims {
            iss: self.issuer_id.clone(),
            iat,
            exp: iat + TOKEN_TTL_SECS,
            aud: AUDIENCE.to_string(),
            bid: self.bundle_id.clone(),
        };
        let input = format!("{}.{}", encode_segment(&header)?, encode_segment(&claims)?);
        let signature = self.registry.sign(ES256, &input, &self.key)?;
        Ok(format!("{input}.{signature}"))
    }
}

impl std::fmt::Debug for AppStoreSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppStoreSigner")
            .field("issuer_id", &self.issuer_id)
            .field("key_id", &self.key_id)
            .field("bundle_id", &self.bundle_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct JwsHeader {
    alg: String,
    #[serde(default)]
    x5c: Vec<String>,
}

/// Verify a JWS signed by the leaf certificate in its `x5c` header and
/// decode its claims. The chain above the leaf is not checked.
pub fn decode_signed_payload<T: DeserializeOwned>(jws: &str, registry: &MethodRegistry) -> Result<T> {
    let mut parts = jws.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(PaySignError::SignData("JWS must have three segments".into()));
    };

    let jws_header: JwsHeader = decode_segment(header, "header")?;
    if jws_header.alg != ES256 {
        return Err(PaySignError::Verification(format!(
            "unexpected JWS algorithm {}",
            jws_header.alg
        )));
    }
    let leaf = jws_header
        .x5c
        .first()
        .ok_or_else(|| PaySignError::SignData("JWS header has no x5c chain".into()))?;
    let der = STANDARD
        .decode(leaf)
        .map_err(|e| PaySignError::KeyDecode(format!("x5c leaf: {e}")))?;
    let certificate = pem::certificate_from_der(&der)?;

    registry.verify(
        ES256,
        &format!("{header}.{payload}"),
        signature,
        &certificate.public_key,
    )?;
    decode_segment(payload, "payload")
}

/// Decoded `signedTransactionInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwsTransaction {
    pub transaction_id: String,
    pub original_transaction_id: String,
    #[serde(default)]
    pub web_order_line_item_id: Option<String>,
    pub bundle_id: String,
    pub product_id: String,
    #[serde(default)]
    pub subscription_group_identifier: Option<String>,
    pub purchase_date: i64,
    pub original_purchase_date: i64,
    #[serde(default)]
    pub expires_date: Option<i64>,
    pub quantity: i32,
    #[serde(rename = "type")]
    pub kind: String,
    pub in_app_ownership_type: String,
    pub signed_date: i64,
    #[serde(default)]
    pub offer_type: Option<i32>,
    pub environment: String,
}

/// Decoded `signedRenewalInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwsRenewalInfo {
    pub original_transaction_id: String,
    pub auto_renew_product_id: String,
    pub product_id: String,
    pub auto_renew_status: i32,
    #[serde(default)]
    pub expiration_intent: Option<i32>,
    #[serde(default)]
    pub is_in_billing_retry_period: Option<bool>,
    pub signed_date: i64,
    pub environment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHistoryResponse {
    #[serde(default)]
    pub app_apple_id: i64,
    pub bundle_id: String,
    pub environment: String,
    pub has_more: bool,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub signed_transactions: Vec<String>,
}

impl TransactionHistoryResponse {
    pub fn decode_transactions(&self, registry: &MethodRegistry) -> Result<Vec<JwsTransaction>> {
        self.signed_transactions
            .iter()
            .map(|jws| decode_signed_payload(jws, registry))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastTransaction {
    pub original_transaction_id: String,
    /// 1 active, 2 expired, 3 billing retry, 4 grace period, 5 revoked.
    pub status: i32,
    pub signed_renewal_info: String,
    pub signed_transaction_info: String,
}

impl LastTransaction {
    pub fn decode_transaction(&self, registry: &MethodRegistry) -> Result<JwsTransaction> {
        decode_signed_payload(&self.signed_transaction_info, registry)
    }

    pub fn decode_renewal_info(&self, registry: &MethodRegistry) -> Result<JwsRenewalInfo> {
        decode_signed_payload(&self.signed_renewal_info, registry)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionGroupStatus {
    pub subscription_group_identifier: String,
    #[serde(default)]
    pub last_transactions: Vec<LastTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllSubscriptionStatusesResponse {
    #[serde(default)]
    pub app_apple_id: i64,
    pub bundle_id: String,
    pub environment: String,
    #[serde(default)]
    pub data: Vec<SubscriptionGroupStatus>,
}

pub struct AppStoreClient {
    host: String,
    signer: AppStoreSigner,
    transport: Arc<dyn HttpTransport>,
}

impl AppStoreClient {
    pub fn new(
        config: AppleConfig,
        registry: Arc<MethodRegistry>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        let signer = AppStoreSigner::new(&config, registry)?;
        Ok(Self {
            host: config.host().to_string(),
            signer,
            transport,
        })
    }

    pub fn signer(&self) -> &AppStoreSigner {
        &self.signer
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, cancel: &CancellationToken) -> Result<T> {
        let request = HttpRequest::new("GET", format!("{}{path}", self.host))
            .header("Authorization", format!("Bearer {}", self.signer.token()?))
            .header("Accept", "application/json");
        let response = self.transport.send(request, cancel).await?;
        debug!(path, status = response.status, "app store response");
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// `GET /inApps/v1/history/{id}`; `query` carries `revision`, `sort`
    /// and the other filters.
    pub async fn transaction_history(
        &self,
        transaction_id: &str,
        query: &ParameterBag,
        cancel: &CancellationToken,
    ) -> Result<TransactionHistoryResponse> {
        let mut path = format!("/inApps/v1/history/{transaction_id}");
        if !query.is_empty() {
            path.push('?');
            path.push_str(&query.form_urlencoded());
        }
        self.get(&path, cancel).await
    }

    pub async fn subscription_statuses(
        &self,
        transaction_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AllSubscriptionStatusesResponse> {
        self.get(&format!("/inApps/v1/subscriptions/{transaction_id}"), cancel)
            .await
    }
}

impl std::fmt::Debug for AppStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppStoreClient")
            .field("host", &self.host)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

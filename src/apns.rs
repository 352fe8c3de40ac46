//! APNs provider client: HTTP/2 submission with cached ES256 bearer tokens.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::ApnsConfig;
use crate::error::AppError;

const APNS_PRODUCTION: &str = "https://api.push.apple.com";
const APNS_SANDBOX: &str = "https://api.development.push.apple.com";

/// Apple rejects tokens older than an hour; refresh comfortably before that.
const TOKEN_LIFETIME: Duration = Duration::from_secs(50 * 60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// The `alert` dictionary inside `aps`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApnsAlert {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subtitle: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
}

/// The `aps` dictionary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Aps {
    pub alert: ApnsAlert,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sound: String,
    #[serde(
        rename = "thread-id",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    #[serde(
        rename = "mutable-content",
        default,
        skip_serializing_if = "is_zero"
    )]
    pub mutable_content: i64,
}

/// Full notification body: `aps` plus app-specific extension fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApnsPayload {
    pub aps: Aps,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub level: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub badge: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub call: bool,
    #[serde(rename = "isarchive", default, skip_serializing_if = "is_false")]
    pub is_archive: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,
}

/// Provider verdict for one submission.
#[derive(Debug, Clone)]
pub struct ApnsResponse {
    pub status: u16,
    pub apns_id: Option<String>,
    pub reason: Option<String>,
}

impl ApnsResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

struct CachedToken {
    token: String,
    minted_at: Instant,
}

pub struct ApnsClient {
    http: reqwest::Client,
    key_id: String,
    team_id: String,
    signing_key: SigningKey,
    topic: String,
    endpoint: String,
    token: RwLock<Option<CachedToken>>,
}

impl ApnsClient {
    pub fn new(cfg: &ApnsConfig) -> Result<Self, AppError> {
        let signing_key = parse_private_key(&cfg.private_key_pem)?;

        let http = reqwest::Client::builder()
            // Apple's provider API only speaks HTTP/2.
            .http2_prior_knowledge()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::StartServer(format!("apns http client: {e}")))?;

        let endpoint = if cfg.production {
            APNS_PRODUCTION
        } else {
            APNS_SANDBOX
        };

        Ok(Self {
            http,
            key_id: cfg.key_id.clone(),
            team_id: cfg.team_id.clone(),
            signing_key,
            topic: cfg.topic.clone(),
            endpoint: endpoint.to_string(),
            token: RwLock::new(None),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Send one notification to `device_token`.
    pub async fn push(
        &self,
        device_token: &str,
        payload: &ApnsPayload,
        collapse_id: Option<&str>,
    ) -> Result<ApnsResponse, AppError> {
        let url = format!("{}/3/device/{}", self.endpoint, device_token);
        let bearer = self.bearer_token().await?;

        let push_type = if payload.delete { "background" } else { "alert" };

        let mut request = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .header("apns-topic", &self.topic)
            .header("apns-push-type", push_type)
            .header("authorization", format!("bearer {bearer}"))
            .json(payload);
        if let Some(id) = collapse_id {
            request = request.header("apns-collapse-id", id);
        }

        let response = request.send().await.map_err(|e| AppError::ProviderRejected {
            status: 500,
            reason: format!("request failed: {e}"),
        })?;

        let status = response.status().as_u16();
        let apns_id = response
            .headers()
            .get("apns-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        #[derive(Deserialize)]
        struct ErrorBody {
            reason: String,
        }
        let reason = response
            .bytes()
            .await
            .ok()
            .and_then(|body| serde_json::from_slice::<ErrorBody>(&body).ok())
            .map(|b| b.reason);

        Ok(ApnsResponse {
            status,
            apns_id,
            reason,
        })
    }

    /// Return the cached bearer token, minting a fresh one when expired.
    ///
    /// Readers check validity under the shared lock; the refresh path
    /// re-checks under the exclusive lock so concurrent callers mint once.
    pub async fn bearer_token(&self) -> Result<String, AppError> {
        {
            let cache = self.token.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.minted_at.elapsed() < TOKEN_LIFETIME {
                    return Ok(cached.token.clone());
                }
            }
        }

        let mut cache = self.token.write().await;
        if let Some(cached) = cache.as_ref() {
            if cached.minted_at.elapsed() < TOKEN_LIFETIME {
                return Ok(cached.token.clone());
            }
        }

        let token = self.mint_token()?;
        *cache = Some(CachedToken {
            token: token.clone(),
            minted_at: Instant::now(),
        });
        Ok(token)
    }

    /// Mint `header.claims.signature` with ES256: the signature is the raw
    /// 64-byte `r || s` concatenation, base64url without padding.
    fn mint_token(&self) -> Result<String, AppError> {
        let header = serde_json::json!({ "alg": "ES256", "kid": self.key_id });
        let claims = serde_json::json!({
            "iss": self.team_id,
            "iat": chrono::Utc::now().timestamp(),
        });

        let header_b64 = URL_SAFE_NO_PAD.encode(header.to_string());
        let claims_b64 = URL_SAFE_NO_PAD.encode(claims.to_string());
        let signing_input = format!("{header_b64}.{claims_b64}");

        let signature: Signature = self
            .signing_key
            .try_sign(signing_input.as_bytes())
            .map_err(|e| AppError::TokenSigning(e.to_string()))?;
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

        Ok(format!("{signing_input}.{signature_b64}"))
    }
}

/// PKCS#8 first (how Apple ships .p8 files), SEC1 as a fallback.
fn parse_private_key(pem: &str) -> Result<SigningKey, AppError> {
    if let Ok(key) = SigningKey::from_pkcs8_pem(pem) {
        return Ok(key);
    }
    p256::SecretKey::from_sec1_pem(pem)
        .map(SigningKey::from)
        .map_err(|e| AppError::Config(format!("invalid APNs private key: {e}")))
}

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

use crate::serde_rpc::de_opt_timestamp;

#[derive(Clone)]
pub struct PayPalApi {
    http: reqwest::Client,
    base_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    webhook_id: Option<String>,
    token: Arc<Mutex<Option<CachedToken>>>,
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct VerifySignatureResponse {
    verification_status: String,
}

/// Transmission headers PayPal sends with every webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookHeaders {
    pub auth_algo: String,
    pub cert_url: String,
    pub transmission_id: String,
    pub transmission_sig: String,
    pub transmission_time: String,
}

impl WebhookHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Some(Self {
            auth_algo: get("paypal-auth-algo")?,
            cert_url: get("paypal-cert-url")?,
            transmission_id: get("paypal-transmission-id")?,
            transmission_sig: get("paypal-transmission-sig")?,
            transmission_time: get("paypal-transmission-time")?,
        })
    }
}

impl PayPalApi {
    pub fn new(
        base_url: &str,
        client_id: Option<String>,
        client_secret: Option<String>,
        webhook_id: Option<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to create PayPal HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            webhook_id,
            token: Arc::new(Mutex::new(None)),
        })
    }

    pub fn verifies_webhooks(&self) -> bool {
        self.webhook_id.is_some()
    }

    /// Asks PayPal whether a delivery is authentic. `Ok(false)` is a forged or
    /// mangled delivery; `Err` means PayPal could not be asked.
    pub async fn verify_webhook_signature(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> anyhow::Result<bool> {
        let webhook_id = self
            .webhook_id
            .as_deref()
            .ok_or_else(|| anyhow!("PAYPAL_WEBHOOK_ID is not configured."))?;

        let webhook_event: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(_) => return Ok(false),
        };

        let response: VerifySignatureResponse = self
            .post_json(
                "v1/notifications/verify-webhook-signature",
                &json!({
                    "auth_algo": headers.auth_algo,
                    "cert_url": headers.cert_url,
                    "transmission_id": headers.transmission_id,
                    "transmission_sig": headers.transmission_sig,
                    "transmission_time": headers.transmission_time,
                    "webhook_id": webhook_id,
                    "webhook_event": webhook_event,
                }),
            )
            .await?;

        Ok(response.verification_status.eq_ignore_ascii_case("SUCCESS"))
    }

    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<PayPalSubscription> {
        self.get_json(&format!("v1/billing/subscriptions/{}", subscription_id))
            .await
    }

    fn require_credentials(&self) -> anyhow::Result<(&str, &str)> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) => Ok((id, secret)),
            _ => Err(anyhow!(
                "PAYPAL_CLIENT_ID and PAYPAL_CLIENT_SECRET are not configured."
            )),
        }
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        let cached = self
            .token
            .lock()
            .as_ref()
            .filter(|token| token.expires_at > Instant::now())
            .map(|token| token.value.clone());
        if let Some(token) = cached {
            return Ok(token);
        }

        let (client_id, client_secret) = self.require_credentials()?;
        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.base_url))
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .context("PayPal token request failed")?;

        let token: TokenResponse = parse_paypal_response(response, "v1/oauth2/token").await?;
        // refresh a minute early
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *self.token.lock() = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> anyhow::Result<T> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("PayPal POST failed for {}", path))?;

        parse_paypal_response(response, path).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{}/{}", self.base_url, path))
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("PayPal GET failed for {}", path))?;

        parse_paypal_response(response, path).await
    }
}

async fn parse_paypal_response<T: DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> anyhow::Result<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read PayPal response body for {}", path))?;

    if !status.is_success() {
        return Err(anyhow!(
            "PayPal API {} failed with status {}: {}",
            path,
            status,
            text
        ));
    }

    serde_json::from_str::<T>(&text)
        .with_context(|| format!("failed to decode PayPal response for {}", path))
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalSubscription {
    pub id: String,
    pub status: String,
    pub plan_id: Option<String>,
    pub custom_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub status_update_time: Option<DateTime<Utc>>,
}

impl PayPalSubscription {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("ACTIVE")
    }
}

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const AUDIENCE: &str = "authenticated";

/// Verifies access tokens minted by the hosted auth provider.
///
/// Projects with a legacy shared secret sign HS256; newer ones publish
/// asymmetric keys at `<SUPABASE_URL>/auth/v1/.well-known/jwks.json`.
#[derive(Clone)]
pub struct AuthService {
    http: reqwest::Client,
    jwks_cache: Arc<RwLock<Option<CachedJwks>>>,
    jwks_ttl: Duration,
    jwks_url: Option<String>,
    expected_issuer: Option<String>,
    jwt_secret: Option<String>,
}

#[derive(Clone)]
struct CachedJwks {
    keys: Vec<Jwk>,
    fetched_at: Instant,
}

#[derive(Debug, Deserialize, Clone)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize, Clone)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccessClaims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub role: Option<String>,
}

impl AuthService {
    pub fn new(supabase_url: Option<&str>, jwt_secret: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build auth HTTP client")?;

        let auth_base = supabase_url.map(|url| format!("{}/auth/v1", url.trim_end_matches('/')));

        Ok(Self {
            http,
            jwks_cache: Arc::new(RwLock::new(None)),
            jwks_ttl: Duration::from_secs(10 * 60),
            jwks_url: auth_base
                .as_ref()
                .map(|base| format!("{base}/.well-known/jwks.json")),
            expected_issuer: auth_base,
            jwt_secret,
        })
    }

    pub async fn verify_bearer_token(
        &self,
        authorization_header: &str,
    ) -> anyhow::Result<AccessClaims> {
        let token = extract_bearer_token(authorization_header)?;
        self.verify_token(token).await
    }

    pub async fn verify_token(&self, token: &str) -> anyhow::Result<AccessClaims> {
        let header = decode_header(token).context("invalid JWT header")?;

        let decoding_key = match header.alg {
            Algorithm::HS256 => {
                let secret = self
                    .jwt_secret
                    .as_deref()
                    .ok_or_else(|| anyhow!("HS256 token received but SUPABASE_JWT_SECRET is not set"))?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            Algorithm::RS256 | Algorithm::ES256 => {
                let kid = header
                    .kid
                    .as_deref()
                    .ok_or_else(|| anyhow!("JWT header missing kid"))?;
                let keys = self.get_jwks().await?;
                let jwk = keys
                    .iter()
                    .find(|candidate| candidate.kid.as_deref() == Some(kid))
                    .ok_or_else(|| anyhow!("No matching JWK found for kid"))?;
                decoding_key_for(jwk, header.alg)?
            }
            other => return Err(anyhow!("Unsupported JWT alg: {:?}", other)),
        };

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[AUDIENCE]);
        if let Some(issuer) = &self.expected_issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }

        let token_data = decode::<AccessClaims>(token, &decoding_key, &validation)
            .context("JWT signature validation failed")?;
        let claims = token_data.claims;

        if claims.sub.trim().is_empty() {
            return Err(anyhow!("JWT has an empty subject"));
        }
        if claims.role.as_deref() == Some("anon") {
            return Err(anyhow!("anonymous tokens do not identify a user"));
        }

        tracing::debug!(exp = claims.exp, role = ?claims.role, "verified bearer token");
        Ok(claims)
    }

    async fn get_jwks(&self) -> anyhow::Result<Vec<Jwk>> {
        {
            let cache = self.jwks_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.jwks_ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let jwks_url = self
            .jwks_url
            .as_deref()
            .ok_or_else(|| anyhow!("SUPABASE_URL is not set; cannot fetch signing keys"))?;
        let response = self
            .http
            .get(jwks_url)
            .send()
            .await
            .with_context(|| format!("failed to fetch JWKS from {jwks_url}"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "failed to fetch JWKS from {}: HTTP {}",
                jwks_url,
                response.status()
            ));
        }

        let jwks: Jwks = response
            .json()
            .await
            .with_context(|| format!("invalid JWKS response from {jwks_url}"))?;

        let keys = jwks.keys;
        *self.jwks_cache.write().await = Some(CachedJwks {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });

        Ok(keys)
    }
}

fn decoding_key_for(jwk: &Jwk, alg: Algorithm) -> anyhow::Result<DecodingKey> {
    match (jwk.kty.as_str(), alg) {
        ("RSA", Algorithm::RS256) => {
            let n = jwk
                .n
                .as_ref()
                .ok_or_else(|| anyhow!("JWK missing modulus (n)"))?;
            let e = jwk
                .e
                .as_ref()
                .ok_or_else(|| anyhow!("JWK missing exponent (e)"))?;
            DecodingKey::from_rsa_components(n, e).context("failed to build RSA decoding key")
        }
        ("EC", Algorithm::ES256) => {
            let x = jwk.x.as_ref().ok_or_else(|| anyhow!("JWK missing x"))?;
            let y = jwk.y.as_ref().ok_or_else(|| anyhow!("JWK missing y"))?;
            DecodingKey::from_ec_components(x, y).context("failed to build EC decoding key")
        }
        (kty, alg) => Err(anyhow!("JWK type {} does not match alg {:?}", kty, alg)),
    }
}

pub fn extract_bearer_token(value: &str) -> anyhow::Result<&str> {
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default();

    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(anyhow!("Invalid Authorization header format"));
    }

    Ok(token.trim())
}

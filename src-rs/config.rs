use std::{env, path::PathBuf, time::Duration};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreBackend {
    Supabase,
    Memory,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub trust_proxy: bool,
    pub production: bool,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub store_backend: StoreBackend,
    pub supabase_url: Option<String>,
    pub supabase_service_role_key: Option<String>,
    pub supabase_jwt_secret: Option<String>,
    pub paypal_api_base: String,
    pub paypal_client_id: Option<String>,
    pub paypal_client_secret: Option<String>,
    pub paypal_webhook_id: Option<String>,
    pub paypal_plan_id_pro: Option<String>,
    pub paypal_plan_id_agency: Option<String>,
    pub default_plan_id: String,
    pub guest_monthly_cap: u32,
    pub store_timeout: Duration,
    pub fallback_sentinel_limit: u32,
    pub analysis_webhook_url: Option<String>,
    pub comparison_webhook_url: Option<String>,
    pub admin_api_token: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let store_backend = match env::var("STORE_BACKEND")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "" | "supabase" => StoreBackend::Supabase,
            "memory" => StoreBackend::Memory,
            other => return Err(anyhow::anyhow!("unknown STORE_BACKEND: {other}")),
        };

        let supabase_url = non_empty(env::var("SUPABASE_URL").ok())
            .map(|url| url.trim_end_matches('/').to_string());
        let supabase_service_role_key = non_empty(env::var("SUPABASE_SERVICE_ROLE_KEY").ok());

        if store_backend == StoreBackend::Supabase {
            if supabase_url.is_none() {
                return Err(anyhow::anyhow!(
                    "SUPABASE_URL environment variable is not set"
                ));
            }
            if supabase_service_role_key.is_none() {
                return Err(anyhow::anyhow!(
                    "SUPABASE_SERVICE_ROLE_KEY environment variable is not set"
                ));
            }
        }

        Ok(Self {
            port: parse_u16(env::var("PORT").ok(), 9001),
            trust_proxy: parse_flag(env::var("TRUST_PROXY").ok(), true),
            production: env::var("APP_ENV")
                .map(|value| value.trim().eq_ignore_ascii_case("production"))
                .unwrap_or(false),
            tls_key_path: env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
            tls_cert_path: env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            store_backend,
            supabase_url,
            supabase_service_role_key,
            supabase_jwt_secret: non_empty(env::var("SUPABASE_JWT_SECRET").ok()),
            paypal_api_base: env::var("PAYPAL_API_BASE")
                .unwrap_or_else(|_| "https://api-m.paypal.com".to_string()),
            paypal_client_id: non_empty(env::var("PAYPAL_CLIENT_ID").ok()),
            paypal_client_secret: non_empty(env::var("PAYPAL_CLIENT_SECRET").ok()),
            paypal_webhook_id: non_empty(env::var("PAYPAL_WEBHOOK_ID").ok()),
            paypal_plan_id_pro: non_empty(env::var("PAYPAL_PLAN_ID_PRO").ok()),
            paypal_plan_id_agency: non_empty(env::var("PAYPAL_PLAN_ID_AGENCY").ok()),
            default_plan_id: non_empty(env::var("DEFAULT_PLAN_ID").ok())
                .unwrap_or_else(|| "free".to_string()),
            guest_monthly_cap: parse_u32(env::var("GUEST_MONTHLY_CAP").ok(), 2),
            store_timeout: Duration::from_millis(parse_u64(
                env::var("STORE_TIMEOUT_MS").ok(),
                3_000,
            )),
            fallback_sentinel_limit: parse_u32(env::var("FALLBACK_SENTINEL_LIMIT").ok(), 999),
            analysis_webhook_url: non_empty(env::var("ANALYSIS_WEBHOOK_URL").ok()),
            comparison_webhook_url: non_empty(env::var("COMPARISON_WEBHOOK_URL").ok()),
            admin_api_token: non_empty(env::var("ADMIN_API_TOKEN").ok()),
        })
    }

    /// Defaults for a memory-backed instance with no external collaborators.
    #[cfg(test)]
    pub fn local() -> Self {
        Self {
            port: 9001,
            trust_proxy: false,
            production: false,
            tls_key_path: None,
            tls_cert_path: None,
            store_backend: StoreBackend::Memory,
            supabase_url: None,
            supabase_service_role_key: None,
            supabase_jwt_secret: None,
            paypal_api_base: "https://api-m.sandbox.paypal.com".to_string(),
            paypal_client_id: None,
            paypal_client_secret: None,
            paypal_webhook_id: None,
            paypal_plan_id_pro: None,
            paypal_plan_id_agency: None,
            default_plan_id: "free".to_string(),
            guest_monthly_cap: 2,
            store_timeout: Duration::from_millis(3_000),
            fallback_sentinel_limit: 999,
            analysis_webhook_url: None,
            comparison_webhook_url: None,
            admin_api_token: None,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_flag(value: Option<String>, fallback: bool) -> bool {
    match value {
        Some(value) => {
            let normalized = value.trim().to_lowercase();
            !matches!(normalized.as_str(), "false" | "0" | "off" | "no")
        }
        None => fallback,
    }
}

fn parse_u16(value: Option<String>, fallback: u16) -> u16 {
    value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_u32(value: Option<String>, fallback: u32) -> u32 {
    value
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(fallback)
}

fn parse_u64(value: Option<String>, fallback: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing_treats_unknown_values_as_enabled() {
        assert!(parse_flag(Some("yes".into()), false));
        assert!(!parse_flag(Some(" Off ".into()), true));
        assert!(parse_flag(None, true));
    }

    #[test]
    fn numeric_parsing_falls_back_on_garbage() {
        assert_eq!(parse_u16(Some("0".into()), 9001), 9001);
        assert_eq!(parse_u32(Some("0".into()), 2), 0);
        assert_eq!(parse_u32(Some("abc".into()), 2), 2);
        assert_eq!(parse_u64(Some("250".into()), 3_000), 250);
    }

    #[test]
    fn blank_values_are_treated_as_missing() {
        assert_eq!(non_empty(Some("   ".into())), None);
        assert_eq!(non_empty(Some(" plan ".into())), Some("plan".into()));
    }
}

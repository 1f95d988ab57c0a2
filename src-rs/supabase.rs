use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::{
    month::YearMonth,
    plans::ActionKind,
    serde_rpc::value_to_count,
    store::{EntitlementStore, StoreError, Subscription, SubscriptionWrite, UpsertOutcome},
};

/// Calls Postgres functions exposed through PostgREST (`/rest/v1/rpc/<name>`).
#[derive(Clone)]
pub struct RpcClient {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(base_url: &str, service_role_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "apikey",
            HeaderValue::from_str(service_role_key)
                .context("invalid SUPABASE_SERVICE_ROLE_KEY for header")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {service_role_key}"))
                .context("invalid SUPABASE_SERVICE_ROLE_KEY for header")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("failed to create Supabase HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            timeout,
        })
    }

    pub async fn call<T: DeserializeOwned>(&self, function: &str, args: Value) -> Result<T, StoreError> {
        let value = self.call_value(function, args).await?;
        serde_json::from_value(value)
            .map_err(|error| StoreError::Decode(format!("{function}: {error}")))
    }

    pub async fn call_value(&self, function: &str, args: Value) -> Result<Value, StoreError> {
        let endpoint = format!("{}/rest/v1/rpc/{}", self.base_url, function);
        let mut args = args;
        prune_null_object_fields(&mut args);

        let response = match self.http.post(&endpoint).json(&args).send().await {
            Ok(response) => response,
            Err(error) if error.is_timeout() => return Err(StoreError::Timeout(self.timeout)),
            Err(error) => {
                return Err(StoreError::Unavailable(anyhow::Error::new(error).context(
                    format!("Supabase rpc {} request failed (base_url={})", function, self.base_url),
                )))
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(error) if error.is_timeout() => return Err(StoreError::Timeout(self.timeout)),
            Err(error) => {
                return Err(StoreError::Unavailable(
                    anyhow::Error::new(error)
                        .context(format!("failed to read Supabase rpc {function} response")),
                ))
            }
        };

        if status.is_server_error() {
            return Err(StoreError::Unavailable(anyhow::anyhow!(
                "Supabase rpc {} HTTP error {}: {}",
                function,
                status,
                text
            )));
        }

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(text);
            return Err(StoreError::Rejected(format!(
                "{} returned {}: {}",
                function, status, message
            )));
        }

        // void functions answer with an empty body
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text)
            .map_err(|error| StoreError::Decode(format!("{function}: {error}")))
    }
}

#[derive(Clone)]
pub struct RpcStore {
    rpc: RpcClient,
}

impl RpcStore {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl EntitlementStore for RpcStore {
    async fn upsert_subscription(
        &self,
        write: &SubscriptionWrite,
    ) -> Result<UpsertOutcome, StoreError> {
        self.rpc
            .call(
                "upsert_subscription",
                json!({
                    "p_external_subscription_id": &write.external_subscription_id,
                    "p_user_id": write.user_id,
                    "p_plan_id": write.plan_id.as_str(),
                    "p_set_plan": write.set_plan,
                    "p_status": write.status.as_str(),
                    "p_event_at": write.event_at,
                }),
            )
            .await
    }

    async fn get_subscription(&self, user_id: &str) -> Result<Option<Subscription>, StoreError> {
        let value = self
            .rpc
            .call_value("get_subscription", json!({ "p_user_id": user_id }))
            .await?;

        // `returns setof` functions answer with an array
        let value = match value {
            Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
            Value::Array(_) => Value::Null,
            other => other,
        };

        serde_json::from_value(value)
            .map_err(|error| StoreError::Decode(format!("get_subscription: {error}")))
    }

    async fn get_monthly_usage(
        &self,
        user_id: &str,
        action: ActionKind,
        month: Option<YearMonth>,
    ) -> Result<u32, StoreError> {
        let value = self
            .rpc
            .call_value(
                "get_monthly_usage",
                json!({
                    "p_user_id": user_id,
                    "p_action": action.as_str(),
                    "p_year_month": month.map(|month| month.to_string()),
                }),
            )
            .await?;
        value_to_count(&value).map_err(|error| StoreError::Decode(format!("get_monthly_usage: {error}")))
    }

    async fn get_project_count(&self, user_id: &str) -> Result<u32, StoreError> {
        let value = self
            .rpc
            .call_value("get_project_count", json!({ "p_user_id": user_id }))
            .await?;
        value_to_count(&value).map_err(|error| StoreError::Decode(format!("get_project_count: {error}")))
    }

    async fn increment_usage(
        &self,
        user_id: &str,
        action: ActionKind,
        month: Option<YearMonth>,
    ) -> Result<(), StoreError> {
        self.rpc
            .call_value(
                "increment_usage",
                json!({
                    "p_user_id": user_id,
                    "p_action": action.as_str(),
                    "p_year_month": month.map(|month| month.to_string()),
                }),
            )
            .await?;
        Ok(())
    }
}

fn prune_null_object_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, value| !value.is_null());
            for child in map.values_mut() {
                prune_null_object_fields(child);
            }
        }
        Value::Array(values) => {
            for child in values {
                prune_null_object_fields(child);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_arguments_are_dropped_so_sql_defaults_apply() {
        let mut args = json!({
            "p_user_id": null,
            "p_status": "active",
            "nested": { "keep": 1, "drop": null },
        });
        prune_null_object_fields(&mut args);
        assert_eq!(
            args,
            json!({ "p_status": "active", "nested": { "keep": 1 } })
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_reported_as_unavailable() {
        let rpc = RpcClient::new("http://127.0.0.1:9", "service-key", Duration::from_secs(2))
            .expect("client");
        let store = RpcStore::new(rpc);

        match store.get_project_count("u1").await {
            Err(StoreError::Unavailable(_)) | Err(StoreError::Timeout(_)) => {}
            other => panic!("expected unavailable store, got {other:?}"),
        }
    }
}

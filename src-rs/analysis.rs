//! Client for the AI scoring webhooks.
//!
//! The oracles are opaque: whatever JSON object they return is passed back to
//! the caller untouched. Failures here are retryable for the UI and never
//! touch entitlement state.

use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("{0} webhook is not configured")]
    NotConfigured(&'static str),
    #[error("analysis webhook request failed: {0}")]
    Transport(String),
    #[error("analysis webhook answered with HTTP {status}")]
    Upstream { status: u16 },
    #[error("analysis webhook returned malformed JSON: {0}")]
    Malformed(String),
}

#[derive(Clone)]
pub struct AnalysisClient {
    http: reqwest::Client,
    analysis_url: Option<String>,
    comparison_url: Option<String>,
}

impl AnalysisClient {
    pub fn new(analysis_url: Option<String>, comparison_url: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to create analysis HTTP client")?;

        Ok(Self {
            http,
            analysis_url,
            comparison_url,
        })
    }

    pub async fn analyze(&self, url: &str) -> Result<Value, AnalysisError> {
        let endpoint = self
            .analysis_url
            .as_deref()
            .ok_or(AnalysisError::NotConfigured("analysis"))?;
        self.post(endpoint, json!({ "url": url })).await
    }

    pub async fn compare(&self, url: &str, competitor_url: &str) -> Result<Value, AnalysisError> {
        let endpoint = self
            .comparison_url
            .as_deref()
            .ok_or(AnalysisError::NotConfigured("comparison"))?;
        self.post(
            endpoint,
            json!({ "url": url, "competitorUrl": competitor_url }),
        )
        .await
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value, AnalysisError> {
        let response = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|error| AnalysisError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::Upstream {
                status: status.as_u16(),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|error| AnalysisError::Transport(error.to_string()))?;
        parse_result(&text)
    }
}

fn parse_result(text: &str) -> Result<Value, AnalysisError> {
    let value: Value =
        serde_json::from_str(text).map_err(|error| AnalysisError::Malformed(error.to_string()))?;

    // some deployments wrap the single result in an array
    let value = match value {
        Value::Array(mut items) if items.len() == 1 => items.swap_remove(0),
        other => other,
    };

    if !value.is_object() {
        return Err(AnalysisError::Malformed(
            "expected a JSON object".to_string(),
        ));
    }
    Ok(value)
}

use axum::{
    body::Bytes,
    extract::{Extension, Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    allowance::{AllowanceDecision, Identity},
    analysis::AnalysisError,
    middleware::AuthenticatedUser,
    paypal::WebhookHeaders,
    plans::{ActionKind, Plan},
    state::AppState,
    store::{SubscriptionStatus, SubscriptionWrite},
    webhook::Trigger,
};

#[derive(Debug, Deserialize)]
pub struct AnalysisRequest {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ComparisonRequest {
    pub url: Option<String>,
    #[serde(rename = "competitorUrl")]
    pub competitor_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActivateSubscriptionRequest {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminOverrideRequest {
    pub user_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub plan_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
struct QuotaExceededBody<'a> {
    error: &'static str,
    action: &'static str,
    #[serde(flatten)]
    decision: &'a AllowanceDecision,
}

enum OracleCall {
    Analyze { url: String },
    Compare { url: String, competitor_url: String },
}

impl OracleCall {
    fn action(&self) -> ActionKind {
        match self {
            OracleCall::Analyze { .. } => ActionKind::Analysis,
            OracleCall::Compare { .. } => ActionKind::Comparison,
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Response {
    let probe = tokio::time::timeout(
        state.config.store_timeout,
        state.store.get_subscription("00000000-0000-0000-0000-000000000000"),
    )
    .await;

    let store_error = match probe {
        Ok(Ok(_)) => None,
        Ok(Err(error)) => Some(error.to_string()),
        Err(_) => Some("timed out".to_string()),
    };

    match store_error {
        None => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "store": "reachable",
                "webhookVerification": state.paypal.verifies_webhooks(),
            })),
        )
            .into_response(),
        Some(error) => {
            tracing::error!(error = %error, "entitlement store health probe failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "degraded",
                    "store": "unreachable",
                    "webhookVerification": state.paypal.verifies_webhooks(),
                })),
            )
                .into_response()
        }
    }
}

pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

pub async fn handle_paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state.paypal.verifies_webhooks() {
        let transmission = match WebhookHeaders::from_headers(&headers) {
            Some(value) => value,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Missing PayPal signature headers." })),
                )
                    .into_response()
            }
        };

        match state
            .paypal
            .verify_webhook_signature(&transmission, &body)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    transmission_id = %transmission.transmission_id,
                    "PayPal webhook signature verification failed"
                );
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Invalid signature." })),
                )
                    .into_response();
            }
            Err(error) => {
                tracing::error!(error = %error, "could not verify PayPal webhook signature");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Webhook verification unavailable." })),
                )
                    .into_response();
            }
        }
    }

    match state.ingestor.ingest(&body).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome.to_json())).into_response(),
        Err(error) => {
            let status = error.status_code();
            if status.is_server_error() {
                tracing::error!(error = %error, "PayPal webhook handling failed");
            } else {
                tracing::warn!(error = %error, "rejected PayPal webhook");
            }
            (status, Json(json!({ "error": error.to_string() }))).into_response()
        }
    }
}

pub async fn get_allowance(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(action): Path<String>,
) -> Response {
    let action = match ActionKind::parse(&action) {
        Some(action) => action,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Unknown action. Use analysis, comparison or project." })),
            )
                .into_response()
        }
    };

    let decision = state.evaluator.evaluate(&identity, action).await;
    (StatusCode::OK, Json(decision)).into_response()
}

pub async fn run_analysis(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<AnalysisRequest>,
) -> Response {
    let url = match body.url.as_deref().and_then(normalize_target_url) {
        Some(url) => url,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "A valid http(s) url is required." })),
            )
                .into_response()
        }
    };

    run_metered(state, identity, OracleCall::Analyze { url }).await
}

pub async fn run_comparison(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<ComparisonRequest>,
) -> Response {
    let url = body.url.as_deref().and_then(normalize_target_url);
    let competitor_url = body.competitor_url.as_deref().and_then(normalize_target_url);

    match (url, competitor_url) {
        (Some(url), Some(competitor_url)) => {
            run_metered(
                state,
                identity,
                OracleCall::Compare {
                    url,
                    competitor_url,
                },
            )
            .await
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Both url and competitorUrl must be valid http(s) urls." })),
        )
            .into_response(),
    }
}

async fn run_metered(state: AppState, identity: Identity, call: OracleCall) -> Response {
    let action = call.action();
    let decision = state.evaluator.evaluate(&identity, action).await;
    if !decision.can_proceed {
        return quota_exceeded_response(action, &decision);
    }

    let result = match &call {
        OracleCall::Analyze { url } => state.analysis.analyze(url).await,
        OracleCall::Compare {
            url,
            competitor_url,
        } => state.analysis.compare(url, competitor_url).await,
    };

    let result = match result {
        Ok(value) => value,
        Err(error) => return analysis_error_response(action, error),
    };

    if let Err(error) = state.evaluator.record_usage(&identity, action).await {
        tracing::error!(error = %error, action = action.as_str(), "failed to record usage");
    }

    (
        StatusCode::OK,
        Json(json!({
            "result": result,
            "remaining": decision.remaining.map(|remaining| remaining.saturating_sub(1)),
            "limit": decision.limit,
        })),
    )
        .into_response()
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    match state.store.get_subscription(&user.user_id).await {
        Ok(Some(subscription)) => {
            let plan = if subscription.status.is_active() {
                state
                    .catalog
                    .resolve(&subscription.plan_id)
                    .unwrap_or_else(|| state.catalog.default_plan())
            } else {
                state.catalog.default_plan()
            };
            (
                StatusCode::OK,
                Json(json!({
                    "subscription": subscription,
                    "entitlement": plan_json(plan),
                })),
            )
                .into_response()
        }
        Ok(None) => (
            StatusCode::OK,
            Json(json!({
                "plan": state.catalog.default_plan().plan_id,
                "status": SubscriptionStatus::None,
                "entitlement": plan_json(state.catalog.default_plan()),
            })),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to fetch subscription");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error fetching subscription",
            )
                .into_response()
        }
    }
}

pub async fn activate_paypal_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<ActivateSubscriptionRequest>,
) -> Response {
    let subscription_id = match body
        .subscription_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        Some(value) => value,
        None => return (StatusCode::BAD_REQUEST, "Missing subscriptionId").into_response(),
    };

    let subscription = match state.paypal.retrieve_subscription(&subscription_id).await {
        Ok(subscription) => subscription,
        Err(error) => {
            tracing::error!(error = %error, "failed to retrieve PayPal subscription");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error activating subscription",
            )
                .into_response();
        }
    };

    if subscription.custom_id.as_deref().map(str::trim) != Some(user.user_id.as_str()) {
        tracing::warn!(
            user_id = %user.user_id,
            subscription_id = %subscription_id,
            "approval callback for a subscription owned by another account"
        );
        return (
            StatusCode::FORBIDDEN,
            "Subscription belongs to a different account.",
        )
            .into_response();
    }

    if !subscription.is_active() {
        return (StatusCode::BAD_REQUEST, "Subscription is not active yet.").into_response();
    }

    let resolution = state
        .catalog
        .resolve_or_default(subscription.plan_id.as_deref());
    if resolution.unresolved {
        tracing::warn!(
            subscription_id = %subscription_id,
            plan_id = ?subscription.plan_id,
            "PayPal plan not in catalog; recording subscription with default plan"
        );
    }

    let write = SubscriptionWrite {
        external_subscription_id: subscription.id.clone(),
        user_id: Some(user.user_id.clone()),
        plan_id: resolution.plan_id,
        set_plan: true,
        status: SubscriptionStatus::Active,
        event_at: subscription.status_update_time,
    };

    match state
        .ingestor
        .write(&write, Trigger::ApprovalCallback)
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "plan": resolution.plan_id,
                "status": SubscriptionStatus::Active,
                "outcome": outcome,
            })),
        )
            .into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error activating subscription",
        )
            .into_response(),
    }
}

pub async fn admin_override_subscription(
    State(state): State<AppState>,
    Json(body): Json<AdminOverrideRequest>,
) -> Response {
    let required = |value: Option<String>| {
        value
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let (user_id, external_subscription_id, plan_id, status) = match (
        required(body.user_id),
        required(body.external_subscription_id),
        required(body.plan_id),
        required(body.status),
    ) {
        (Some(user_id), Some(external_id), Some(plan_id), Some(status)) => {
            (user_id, external_id, plan_id, status)
        }
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "userId, externalSubscriptionId, planId and status are required."
                })),
            )
                .into_response()
        }
    };

    let plan = match state.catalog.resolve(&plan_id) {
        Some(plan) => plan.plan_id,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("Unknown plan: {plan_id}") })),
            )
                .into_response()
        }
    };

    let status = match SubscriptionStatus::parse(&status) {
        Some(status) => status,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("Unknown status: {status}") })),
            )
                .into_response()
        }
    };

    let write = SubscriptionWrite {
        external_subscription_id,
        user_id: Some(user_id),
        plan_id: plan,
        set_plan: true,
        status,
        event_at: Some(Utc::now()),
    };

    match state.ingestor.write(&write, Trigger::AdminOverride).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "success": true, "outcome": outcome })),
        )
            .into_response(),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": error.to_string() })),
        )
            .into_response(),
    }
}

fn normalize_target_url(raw: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return None;
    }
    Some(parsed.to_string())
}

fn plan_json(plan: &Plan) -> serde_json::Value {
    json!({
        "planId": plan.plan_id,
        "displayName": plan.display_name,
        "monthlyAnalysisLimit": plan.monthly_analysis_limit.as_option(),
        "monthlyComparisonLimit": plan.monthly_comparison_limit.as_option(),
        "projectLimit": plan.project_limit.as_option(),
        "priceUsd": plan.price_usd,
    })
}

fn quota_exceeded_response(action: ActionKind, decision: &AllowanceDecision) -> Response {
    (
        StatusCode::PAYMENT_REQUIRED,
        Json(QuotaExceededBody {
            error: "Limit reached. Upgrade your plan to continue.",
            action: action.as_str(),
            decision,
        }),
    )
        .into_response()
}

fn analysis_error_response(action: ActionKind, error: AnalysisError) -> Response {
    tracing::error!(error = %error, action = action.as_str(), "analysis webhook failed");
    let status = match error {
        AnalysisError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
        AnalysisError::Transport(_)
        | AnalysisError::Upstream { .. }
        | AnalysisError::Malformed(_) => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(json!({
            "error": "The analysis service failed. Please try again.",
            "retryable": true,
        })),
    )
        .into_response()
}

mod allowance;
mod analysis;
mod auth;
mod config;
mod guest;
mod handlers;
mod middleware;
mod month;
mod paypal;
mod plans;
mod policy;
mod rate_limit;
mod serde_rpc;
mod state;
mod store;
mod supabase;
mod webhook;

use std::{collections::HashSet, env, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use config::{Config, StoreBackend};
use state::AppState;
use store::{EntitlementStore, InMemoryStore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env or .env.local file found. Using process environment only.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded environment files");
    }

    let config = Config::from_env()?;

    if config.paypal_webhook_id.is_none() {
        if config.production {
            return Err(anyhow::anyhow!(
                "PAYPAL_WEBHOOK_ID environment variable is not set"
            ));
        }

        tracing::warn!(
            "PAYPAL_WEBHOOK_ID is not set. Webhook deliveries will be accepted without signature verification."
        );
    }
    if config.paypal_client_id.is_none() || config.paypal_client_secret.is_none() {
        tracing::warn!(
            "PAYPAL_CLIENT_ID/PAYPAL_CLIENT_SECRET are not set. Approval callbacks will fail until they are provided."
        );
    }
    if config.supabase_jwt_secret.is_none() && config.supabase_url.is_none() {
        tracing::warn!("Neither SUPABASE_JWT_SECRET nor SUPABASE_URL is set. Every caller will be treated as a guest.");
    }

    let store = build_store(&config)?;
    let auth = auth::AuthService::new(
        config.supabase_url.as_deref(),
        config.supabase_jwt_secret.clone(),
    )?;
    let paypal = paypal::PayPalApi::new(
        &config.paypal_api_base,
        config.paypal_client_id.clone(),
        config.paypal_client_secret.clone(),
        config.paypal_webhook_id.clone(),
    )?;
    let analysis = analysis::AnalysisClient::new(
        config.analysis_webhook_url.clone(),
        config.comparison_webhook_url.clone(),
    )?;

    let state = AppState::new(config.clone(), store, auth, paypal, analysis)?;

    match tokio::time::timeout(
        config.store_timeout,
        state
            .store
            .get_subscription("00000000-0000-0000-0000-000000000000"),
    )
    .await
    {
        Ok(Ok(_)) => {
            tracing::info!(backend = ?config.store_backend, "Entitlement store connectivity check passed");
        }
        Ok(Err(error)) => {
            tracing::error!(
                error = %error,
                backend = ?config.store_backend,
                "Entitlement store connectivity check failed. Allowance checks will run in degraded mode until it recovers."
            );
        }
        Err(_) => {
            tracing::error!(
                backend = ?config.store_backend,
                "Entitlement store connectivity check timed out."
            );
        }
    }

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;

        tracing::info!(
            port = config.port,
            "TLS configuration loaded. Running in HTTPS mode."
        );

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")?;
    } else {
        tracing::info!(port = config.port, "Running in HTTP mode.");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")?;
    }

    Ok(())
}

fn build_store(config: &Config) -> anyhow::Result<Arc<dyn EntitlementStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("STORE_BACKEND=memory. Subscriptions and usage are lost on restart.");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreBackend::Supabase => {
            let url = config
                .supabase_url
                .as_deref()
                .context("SUPABASE_URL environment variable is not set")?;
            let key = config
                .supabase_service_role_key
                .as_deref()
                .context("SUPABASE_SERVICE_ROLE_KEY environment variable is not set")?;
            let rpc = supabase::RpcClient::new(url, key, config.store_timeout)?;
            Ok(Arc::new(supabase::RpcStore::new(rpc)))
        }
    }
}

fn build_router(state: AppState) -> Router {
    let metered_router = Router::new()
        .route("/allowance/{action}", get(handlers::get_allowance))
        .route("/analyses", post(handlers::run_analysis))
        .route("/comparisons", post(handlers::run_comparison))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::resolve_identity,
        ));

    let account_router = Router::new()
        .route("/subscription", get(handlers::get_subscription))
        .route(
            "/paypal/activate",
            post(handlers::activate_paypal_subscription),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let admin_router = Router::new()
        .route(
            "/subscriptions",
            post(handlers::admin_override_subscription),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_admin,
        ));

    let api_router = Router::new()
        .merge(metered_router)
        .merge(account_router)
        .nest("/admin", admin_router)
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::api_rate_limit,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([axum::http::HeaderName::from_static(
            middleware::GUEST_ID_HEADER,
        )]);

    Router::new()
        .route("/api/paypal/webhook", post(handlers::handle_paypal_webhook))
        .route("/health", get(handlers::health))
        .nest("/api", api_router)
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn valid_tls_paths(config: &Config) -> Option<(String, String)> {
    let cert_path = config
        .tls_cert_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());
    let key_path = config
        .tls_key_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());

    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_exists = std::path::Path::new(&cert_path).exists();
            let key_exists = std::path::Path::new(&key_path).exists();

            if cert_exists && key_exists {
                Some((cert_path, key_path))
            } else {
                if !key_exists {
                    tracing::error!(path = %key_path, "TLS key file not found");
                }
                if !cert_exists {
                    tracing::error!(path = %cert_path, "TLS certificate file not found");
                }
                tracing::error!("Proceeding without TLS.");
                None
            }
        }
        (Some(cert_path), None) => {
            tracing::error!(path = %cert_path, "TLS certificate file provided but TLS key path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, Some(key_path)) => {
            tracing::error!(path = %key_path, "TLS key file provided but TLS certificate path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, None) => None,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(executable_path) = env::current_exe() {
        if let Some(executable_dir) = executable_path.parent() {
            roots.push(executable_dir.to_path_buf());
        }
    }
    roots.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")));

    let mut seen_roots = HashSet::new();
    let mut loaded = Vec::new();

    for root in roots {
        let key = root.to_string_lossy().to_string();
        if !seen_roots.insert(key) {
            continue;
        }

        for filename in [".env", ".env.local"] {
            let path = root.join(filename);
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    if loaded.is_empty() {
        if let Ok(path) = dotenvy::dotenv() {
            loaded.push(path);
        }
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use axum::{extract::Path, Json};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        auth::tests::{mint_token, TEST_SECRET, TEST_SUPABASE_URL},
        month::YearMonth,
        plans::ActionKind,
        store::SubscriptionStatus,
    };

    const ADMIN_TOKEN: &str = "admin-token-for-tests";

    fn test_app() -> (Router, Arc<InMemoryStore>) {
        let mut config = Config::local();
        config.admin_api_token = Some(ADMIN_TOKEN.to_string());
        app_with(config)
    }

    fn app_with(config: Config) -> (Router, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let auth = auth::AuthService::new(Some(TEST_SUPABASE_URL), Some(TEST_SECRET.to_string()))
            .unwrap();
        let paypal = paypal::PayPalApi::new(
            &config.paypal_api_base,
            config.paypal_client_id.clone(),
            config.paypal_client_secret.clone(),
            config.paypal_webhook_id.clone(),
        )
        .unwrap();
        let analysis = analysis::AnalysisClient::new(None, None).unwrap();
        let state = AppState::new(config, store.clone(), auth, paypal, analysis).unwrap();

        (build_router(state), store)
    }

    /// Local stand-in for the PayPal REST API.
    ///
    /// `I-GOOD` is active and owned by `u1`, `I-PENDING` belongs to `u1` but is
    /// not active yet, `I-OTHER` belongs to another account. Every webhook
    /// signature check fails.
    async fn spawn_paypal_stub() -> String {
        async fn token() -> Json<Value> {
            Json(json!({ "access_token": "stub-token", "expires_in": 3600 }))
        }

        async fn subscription(Path(id): Path<String>) -> Json<Value> {
            let (status, custom_id) = match id.as_str() {
                "I-GOOD" => ("ACTIVE", "u1"),
                "I-PENDING" => ("APPROVAL_PENDING", "u1"),
                _ => ("ACTIVE", "someone-else"),
            };
            Json(json!({
                "id": id,
                "status": status,
                "plan_id": "P-AGENCY",
                "custom_id": custom_id,
                "status_update_time": "2026-03-01T10:00:00Z",
            }))
        }

        async fn verify() -> Json<Value> {
            Json(json!({ "verification_status": "FAILURE" }))
        }

        let stub = Router::new()
            .route("/v1/oauth2/token", post(token))
            .route("/v1/billing/subscriptions/{id}", get(subscription))
            .route("/v1/notifications/verify-webhook-signature", post(verify));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, stub).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn paypal_app() -> (Router, Arc<InMemoryStore>) {
        let mut config = Config::local();
        config.paypal_api_base = spawn_paypal_stub().await;
        config.paypal_client_id = Some("client".to_string());
        config.paypal_client_secret = Some("secret".to_string());
        config.paypal_webhook_id = Some("WH-1".to_string());
        config.paypal_plan_id_agency = Some("P-AGENCY".to_string());
        app_with(config)
    }

    fn activate_request(user_id: &str, subscription_id: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/paypal/activate")
            .header(header::AUTHORIZATION, bearer(user_id))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "subscriptionId": subscription_id }).to_string(),
            ))
            .unwrap()
    }

    fn bearer(user_id: &str) -> String {
        format!(
            "Bearer {}",
            mint_token(TEST_SECRET, user_id, "authenticated", 3600)
        )
    }

    fn webhook_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/paypal/webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn activation_webhook_upgrades_allowance() {
        let (app, store) = test_app();
        let activation = json!({
            "event_type": "BILLING.SUBSCRIPTION.ACTIVATED",
            "create_time": "2026-03-01T10:00:00Z",
            "resource": { "id": "sub_1", "custom_id": "u1", "plan_id": "pro" }
        });

        let response = app
            .clone()
            .oneshot(webhook_request(activation.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);

        // redelivery is acknowledged without a second row
        let response = app
            .clone()
            .oneshot(webhook_request(activation))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.subscription_rows().len(), 1);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/allowance/analysis")
                    .header(header::AUTHORIZATION, bearer("u1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["canProceed"], true);
        assert_eq!(body["limit"], 100);
        assert_eq!(body["mode"], "plan");
    }

    #[tokio::test]
    async fn malformed_and_unattributable_webhooks_are_rejected() {
        let (app, store) = test_app();

        let response = app
            .clone()
            .oneshot(webhook_request(json!({ "resource": { "id": "sub_1" } })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(webhook_request(json!({
                "event_type": "BILLING.SUBSCRIPTION.ACTIVATED",
                "resource": { "id": "sub_2", "plan_id": "pro" }
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.subscription_rows().is_empty());
    }

    #[tokio::test]
    async fn guests_receive_a_device_id_and_guest_cap() {
        let (app, _) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/allowance/analysis")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(middleware::GUEST_ID_HEADER)
            .is_some());
        let body = json_body(response).await;
        assert_eq!(body["mode"], "guest");
        assert_eq!(body["limit"], 2);
        assert_eq!(body["remaining"], 2);
    }

    #[tokio::test]
    async fn invalid_token_is_not_downgraded_to_guest() {
        let (app, _) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/allowance/analysis")
                    .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_action_is_a_bad_request() {
        let (app, _) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/allowance/exports")
                    .header(header::AUTHORIZATION, bearer("u1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn analysis_over_quota_is_payment_required() {
        let (app, store) = test_app();
        store.set_usage("u1", ActionKind::Analysis, YearMonth::current(), 5);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/analyses")
                    .header(header::AUTHORIZATION, bearer("u1"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({ "url": "https://example.com" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = json_body(response).await;
        assert_eq!(body["canProceed"], false);
        assert_eq!(body["remaining"], 0);
        assert_eq!(body["action"], "analysis");
    }

    #[tokio::test]
    async fn failed_analysis_does_not_consume_quota() {
        let (app, store) = test_app();
        store.set_usage("u1", ActionKind::Analysis, YearMonth::current(), 4);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/analyses")
                    .header(header::AUTHORIZATION, bearer("u1"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({ "url": "https://example.com" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["retryable"], true);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/allowance/analysis")
                    .header(header::AUTHORIZATION, bearer("u1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(response).await["remaining"], 1);
    }

    #[tokio::test]
    async fn subscription_requires_auth_and_defaults_to_free() {
        let (app, _) = test_app();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/subscription")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/subscription")
                    .header(header::AUTHORIZATION, bearer("u1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["plan"], "free");
        assert_eq!(body["status"], "none");
        assert_eq!(body["entitlement"]["monthlyAnalysisLimit"], 5);
    }

    #[tokio::test]
    async fn admin_override_requires_token() {
        let (app, store) = test_app();
        let payload = json!({
            "userId": "u9",
            "externalSubscriptionId": "manual_1",
            "planId": "agency",
            "status": "active"
        })
        .to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/admin/subscriptions")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(store.subscription_rows().is_empty());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/admin/subscriptions")
                    .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let rows = store.subscription_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "u9");
        assert_eq!(rows[0].plan_id, "agency");
        assert_eq!(rows[0].status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn approval_callback_rejects_another_accounts_subscription() {
        let (app, store) = paypal_app().await;

        let response = app.oneshot(activate_request("u1", "I-OTHER")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(store.subscription_rows().is_empty());
    }

    #[tokio::test]
    async fn approval_callback_requires_an_active_subscription() {
        let (app, store) = paypal_app().await;

        let response = app
            .oneshot(activate_request("u1", "I-PENDING"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.subscription_rows().is_empty());
    }

    #[tokio::test]
    async fn approval_callback_activates_the_callers_subscription() {
        let (app, store) = paypal_app().await;

        let response = app
            .clone()
            .oneshot(activate_request("u1", "I-GOOD"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["plan"], "agency");

        let rows = store.subscription_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].external_subscription_id, "I-GOOD");
        assert_eq!(rows[0].user_id, "u1");
        assert_eq!(rows[0].plan_id, "agency");
        assert_eq!(rows[0].status, SubscriptionStatus::Active);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/allowance/analysis")
                    .header(header::AUTHORIZATION, bearer("u1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(response).await["limit"], 500);
    }

    #[tokio::test]
    async fn signed_webhook_that_fails_verification_is_rejected() {
        let (app, store) = paypal_app().await;
        let activation = json!({
            "event_type": "BILLING.SUBSCRIPTION.ACTIVATED",
            "resource": { "id": "I-GOOD", "custom_id": "u1", "plan_id": "P-AGENCY" }
        });

        let request = Request::builder()
            .method("POST")
            .uri("/api/paypal/webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .header("paypal-auth-algo", "SHA256withRSA")
            .header("paypal-cert-url", "https://api.paypal.com/v1/notifications/certs/CERT-1")
            .header("paypal-transmission-id", "69cd13f0")
            .header("paypal-transmission-sig", "Zm9yZ2Vk")
            .header("paypal-transmission-time", "2026-03-01T10:00:00Z")
            .body(Body::from(activation.to_string()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Invalid signature.");
        assert!(store.subscription_rows().is_empty());
    }

    #[tokio::test]
    async fn webhook_without_transmission_headers_is_rejected_when_verifying() {
        let (app, store) = paypal_app().await;

        let response = app
            .oneshot(webhook_request(json!({
                "event_type": "BILLING.SUBSCRIPTION.ACTIVATED",
                "resource": { "id": "I-GOOD", "custom_id": "u1", "plan_id": "P-AGENCY" }
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.subscription_rows().is_empty());
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let (app, _) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

use std::{sync::Arc, time::Duration};

use crate::{
    allowance::AllowanceEvaluator,
    analysis::AnalysisClient,
    auth::AuthService,
    config::Config,
    guest::GuestAllowance,
    paypal::PayPalApi,
    plans::PlanCatalog,
    policy::DegradedModePolicy,
    rate_limit::InMemoryRateLimiter,
    store::EntitlementStore,
    webhook::SubscriptionIngestor,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn EntitlementStore>,
    pub catalog: Arc<PlanCatalog>,
    pub evaluator: AllowanceEvaluator,
    pub ingestor: SubscriptionIngestor,
    pub auth: AuthService,
    pub paypal: PayPalApi,
    pub analysis: AnalysisClient,
    pub guest_limiter: Arc<InMemoryRateLimiter>,
    pub api_limiter: Arc<InMemoryRateLimiter>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn EntitlementStore>,
        auth: AuthService,
        paypal: PayPalApi,
        analysis: AnalysisClient,
    ) -> anyhow::Result<Self> {
        let catalog = Arc::new(PlanCatalog::from_config(&config)?);
        let guest = Arc::new(GuestAllowance::new(config.guest_monthly_cap));
        let evaluator = AllowanceEvaluator::new(
            store.clone(),
            catalog.clone(),
            DegradedModePolicy::from_config(&config),
            guest,
        );
        let ingestor = SubscriptionIngestor::new(store.clone(), catalog.clone());

        Ok(Self {
            guest_limiter: Arc::new(InMemoryRateLimiter::new(
                Duration::from_secs(15 * 60),
                20,
            )),
            api_limiter: Arc::new(InMemoryRateLimiter::new(
                Duration::from_secs(15 * 60),
                300,
            )),
            config: Arc::new(config),
            store,
            catalog,
            evaluator,
            ingestor,
            auth,
            paypal,
            analysis,
        })
    }
}

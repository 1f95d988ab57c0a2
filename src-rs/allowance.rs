use std::sync::Arc;

use serde::Serialize;

use crate::{
    guest::GuestAllowance,
    month::YearMonth,
    plans::{ActionKind, Limit, Plan, PlanCatalog, PlanId},
    policy::DegradedModePolicy,
    store::{EntitlementStore, StoreError, Subscription},
};

const LIMIT_REACHED: &str = "Monthly limit reached. Upgrade your plan to continue.";
const PROJECT_LIMIT_REACHED: &str = "Project limit reached. Upgrade your plan to add more projects.";
const GUEST_LIMIT_REACHED: &str = "Free guest analyses used up for this month. Sign up to continue.";

/// Who is asking. Guests are identified by a client-chosen device key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Identity {
    User(String),
    Guest(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    Plan,
    Guest,
    Degraded,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceDecision {
    pub can_proceed: bool,
    /// `None` only for unlimited plans.
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reason: Option<String>,
    pub mode: DecisionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanId>,
}

impl AllowanceDecision {
    pub fn from_usage(limit: Limit, used: u32, mode: DecisionMode, denied_reason: &str) -> Self {
        match limit {
            Limit::Unlimited => Self {
                can_proceed: true,
                limit: None,
                remaining: None,
                reason: None,
                mode,
                plan: None,
            },
            Limit::Finite(limit) => {
                let remaining = limit.saturating_sub(used);
                let can_proceed = remaining > 0;
                Self {
                    can_proceed,
                    limit: Some(limit),
                    remaining: Some(remaining),
                    reason: (!can_proceed).then(|| denied_reason.to_string()),
                    mode,
                    plan: None,
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct AllowanceEvaluator {
    store: Arc<dyn EntitlementStore>,
    catalog: Arc<PlanCatalog>,
    policy: DegradedModePolicy,
    guest: Arc<GuestAllowance>,
}

impl AllowanceEvaluator {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        catalog: Arc<PlanCatalog>,
        policy: DegradedModePolicy,
        guest: Arc<GuestAllowance>,
    ) -> Self {
        Self {
            store,
            catalog,
            policy,
            guest,
        }
    }

    /// Decides against the store's current month for users and the local
    /// month for guests.
    pub async fn evaluate(&self, identity: &Identity, action: ActionKind) -> AllowanceDecision {
        self.evaluate_at(identity, action, None).await
    }

    #[cfg(test)]
    pub async fn evaluate_in(
        &self,
        identity: &Identity,
        action: ActionKind,
        month: YearMonth,
    ) -> AllowanceDecision {
        self.evaluate_at(identity, action, Some(month)).await
    }

    async fn evaluate_at(
        &self,
        identity: &Identity,
        action: ActionKind,
        month: Option<YearMonth>,
    ) -> AllowanceDecision {
        match identity {
            Identity::Guest(device) => {
                let used = self
                    .guest
                    .count_in(device, month.unwrap_or_else(YearMonth::current));
                AllowanceDecision::from_usage(
                    Limit::Finite(self.guest.cap()),
                    used,
                    DecisionMode::Guest,
                    GUEST_LIMIT_REACHED,
                )
            }
            Identity::User(user_id) => match self.evaluate_user(user_id, action, month).await {
                Ok(decision) => decision,
                Err(error) => self.policy.decision(user_id, action, &error),
            },
        }
    }

    /// Records one completed action against the caller's allowance.
    pub async fn record_usage(&self, identity: &Identity, action: ActionKind) -> Result<(), StoreError> {
        match identity {
            Identity::Guest(device) => {
                if !self.guest.consume(device) {
                    tracing::debug!(device = %device, "guest allowance already exhausted");
                }
                Ok(())
            }
            Identity::User(user_id) => {
                self.store
                    .increment_usage(user_id, action, None)
                    .await
            }
        }
    }

    async fn evaluate_user(
        &self,
        user_id: &str,
        action: ActionKind,
        month: Option<YearMonth>,
    ) -> Result<AllowanceDecision, StoreError> {
        let subscription = self
            .policy
            .guard(self.store.get_subscription(user_id))
            .await?;
        let plan = self.plan_for(user_id, subscription.as_ref());
        let limit = plan.limit_for(action);

        let mut decision = if limit == Limit::Unlimited {
            AllowanceDecision::from_usage(limit, 0, DecisionMode::Plan, LIMIT_REACHED)
        } else {
            let used = match action {
                ActionKind::Project => {
                    self.policy
                        .guard(self.store.get_project_count(user_id))
                        .await?
                }
                ActionKind::Analysis | ActionKind::Comparison => {
                    self.policy
                        .guard(self.store.get_monthly_usage(user_id, action, month))
                        .await?
                }
            };
            let reason = if action == ActionKind::Project {
                PROJECT_LIMIT_REACHED
            } else {
                LIMIT_REACHED
            };
            AllowanceDecision::from_usage(limit, used, DecisionMode::Plan, reason)
        };

        decision.plan = Some(plan.plan_id);
        if !decision.can_proceed {
            tracing::info!(
                user_id = %user_id,
                action = action.as_str(),
                plan = plan.plan_id.as_str(),
                "allowance exhausted"
            );
        }
        Ok(decision)
    }

    fn plan_for(&self, user_id: &str, subscription: Option<&Subscription>) -> &Plan {
        match subscription {
            Some(subscription) if subscription.status.is_active() => {
                match self.catalog.resolve(&subscription.plan_id) {
                    Some(plan) => plan,
                    None => {
                        tracing::warn!(
                            user_id = %user_id,
                            plan_id = %subscription.plan_id,
                            "stored plan is not in the catalog; using default plan"
                        );
                        self.catalog.default_plan()
                    }
                }
            }
            _ => self.catalog.default_plan(),
        }
    }
}

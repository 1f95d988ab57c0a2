//! Degraded-mode policy for allowance checks.
//!
//! When the entitlement store cannot answer in time, users are let through
//! with a generous but finite allowance. Every such decision is marked
//! `mode = degraded` and logged, so it never looks like a real plan limit.

use std::{future::Future, time::Duration};

use crate::{
    allowance::{AllowanceDecision, DecisionMode},
    config::Config,
    plans::ActionKind,
    store::StoreError,
};

#[derive(Clone, Debug)]
pub struct DegradedModePolicy {
    sentinel_limit: u32,
    store_timeout: Duration,
}

impl DegradedModePolicy {
    pub fn new(sentinel_limit: u32, store_timeout: Duration) -> Self {
        Self {
            sentinel_limit,
            store_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.fallback_sentinel_limit, config.store_timeout)
    }

    /// Bounds a store read; an elapsed timeout becomes `StoreError::Timeout`.
    pub async fn guard<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    pub fn decision(&self, user_id: &str, action: ActionKind, error: &StoreError) -> AllowanceDecision {
        tracing::warn!(
            degraded = true,
            user_id = %user_id,
            action = action.as_str(),
            sentinel_limit = self.sentinel_limit,
            error = %error,
            "entitlement store unavailable; allowing action in degraded mode"
        );

        AllowanceDecision {
            can_proceed: true,
            limit: Some(self.sentinel_limit),
            remaining: Some(self.sentinel_limit),
            reason: Some("Usage limits could not be verified right now.".to_string()),
            mode: DecisionMode::Degraded,
            plan: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_calls_become_timeouts() {
        let policy = DegradedModePolicy::new(999, Duration::from_millis(20));
        let result: Result<u32, StoreError> = policy
            .guard(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let policy = DegradedModePolicy::new(999, Duration::from_secs(1));
        let result: Result<u32, StoreError> = policy.guard(async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn degraded_decision_allows_with_sentinel() {
        let policy = DegradedModePolicy::new(999, Duration::from_secs(1));
        let decision = policy.decision(
            "u1",
            ActionKind::Analysis,
            &StoreError::Timeout(Duration::from_secs(1)),
        );
        assert!(decision.can_proceed);
        assert_eq!(decision.limit, Some(999));
        assert_eq!(decision.remaining, Some(999));
        assert_eq!(decision.mode, DecisionMode::Degraded);
    }
}

//! Entitlement store boundary.
//!
//! The core only talks to persistence through the named operations of
//! [`EntitlementStore`]. `supabase::RpcStore` is the production backend;
//! [`InMemoryStore`] backs local development and tests.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    month::YearMonth,
    plans::{ActionKind, PlanId},
    serde_rpc::de_opt_timestamp,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
    PastDue,
    None,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(SubscriptionStatus::Active),
            "cancelled" | "canceled" => Some(SubscriptionStatus::Cancelled),
            "expired" => Some(SubscriptionStatus::Expired),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "none" => Some(SubscriptionStatus::None),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        self == SubscriptionStatus::Active
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: String,
    pub external_subscription_id: String,
    /// Stored as text; a plan removed from the catalog must still load.
    pub plan_id: String,
    pub status: SubscriptionStatus,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub last_event_at: Option<DateTime<Utc>>,
}

/// One idempotent write keyed by `external_subscription_id`.
///
/// Applying the same write twice leaves the row exactly as the first
/// application did.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionWrite {
    pub external_subscription_id: String,
    pub user_id: Option<String>,
    pub plan_id: PlanId,
    /// When false, `plan_id` is only used if the row has to be inserted.
    pub set_plan: bool,
    pub status: SubscriptionStatus,
    pub event_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// The stored row was written by a newer event.
    Stale,
    /// No row exists and the write carries no user to attribute it to.
    Unattributed,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0:#}")]
    Unavailable(anyhow::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store rejected the call: {0}")]
    Rejected(String),
    #[error("unexpected store response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Atomic upsert by external subscription id (single round trip).
    async fn upsert_subscription(
        &self,
        write: &SubscriptionWrite,
    ) -> Result<UpsertOutcome, StoreError>;

    /// The user's current subscription, ignoring superseded rows.
    async fn get_subscription(&self, user_id: &str) -> Result<Option<Subscription>, StoreError>;

    /// `month: None` counts the store's current calendar month by its own clock.
    async fn get_monthly_usage(
        &self,
        user_id: &str,
        action: ActionKind,
        month: Option<YearMonth>,
    ) -> Result<u32, StoreError>;

    async fn get_project_count(&self, user_id: &str) -> Result<u32, StoreError>;

    async fn increment_usage(
        &self,
        user_id: &str,
        action: ActionKind,
        month: Option<YearMonth>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug)]
struct StoredSubscription {
    subscription: Subscription,
    superseded: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<String, StoredSubscription>,
    usage: HashMap<(String, ActionKind, YearMonth), u32>,
    projects: HashMap<String, u32>,
}

impl MemoryState {
    fn has_current_row(&self, user_id: &str) -> bool {
        self.rows
            .values()
            .any(|row| !row.superseded && row.subscription.user_id == user_id)
    }

    fn supersede_current_rows(&mut self, user_id: &str, keep: &str) {
        for (external_id, row) in self.rows.iter_mut() {
            if row.subscription.user_id == user_id && external_id != keep {
                row.superseded = true;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row ever written, superseded ones included.
    #[cfg(test)]
    pub fn subscription_rows(&self) -> Vec<Subscription> {
        self.state
            .lock()
            .rows
            .values()
            .map(|row| row.subscription.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn set_usage(&self, user_id: &str, action: ActionKind, month: YearMonth, count: u32) {
        let mut state = self.state.lock();
        if action == ActionKind::Project {
            state.projects.insert(user_id.to_string(), count);
        } else {
            state
                .usage
                .insert((user_id.to_string(), action, month), count);
        }
    }
}

#[async_trait]
impl EntitlementStore for InMemoryStore {
    async fn upsert_subscription(
        &self,
        write: &SubscriptionWrite,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock();

        if let Some(row) = state.rows.get_mut(&write.external_subscription_id) {
            if let (Some(stored), Some(incoming)) = (row.subscription.last_event_at, write.event_at)
            {
                if incoming < stored {
                    return Ok(UpsertOutcome::Stale);
                }
            }

            let plan_id = if write.set_plan {
                write.plan_id.as_str().to_string()
            } else {
                row.subscription.plan_id.clone()
            };
            let changed = row.subscription.status != write.status
                || row.subscription.plan_id != plan_id
                || (write.status.is_active() && row.superseded);

            row.subscription.status = write.status;
            row.subscription.plan_id = plan_id;
            row.subscription.last_event_at = write.event_at.or(row.subscription.last_event_at);

            if write.status.is_active() && row.superseded {
                row.superseded = false;
                let user_id = row.subscription.user_id.clone();
                state.supersede_current_rows(&user_id, &write.external_subscription_id);
            }

            return Ok(if changed {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Unchanged
            });
        }

        let Some(user_id) = write.user_id.clone() else {
            return Ok(UpsertOutcome::Unattributed);
        };

        // an inactive row never displaces the user's current one
        let superseded = if write.status.is_active() {
            state.supersede_current_rows(&user_id, &write.external_subscription_id);
            false
        } else {
            state.has_current_row(&user_id)
        };
        state.rows.insert(
            write.external_subscription_id.clone(),
            StoredSubscription {
                subscription: Subscription {
                    user_id,
                    external_subscription_id: write.external_subscription_id.clone(),
                    plan_id: write.plan_id.as_str().to_string(),
                    status: write.status,
                    last_event_at: write.event_at,
                },
                superseded,
            },
        );

        Ok(UpsertOutcome::Inserted)
    }

    async fn get_subscription(&self, user_id: &str) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .state
            .lock()
            .rows
            .values()
            .find(|row| !row.superseded && row.subscription.user_id == user_id)
            .map(|row| row.subscription.clone()))
    }

    async fn get_monthly_usage(
        &self,
        user_id: &str,
        action: ActionKind,
        month: Option<YearMonth>,
    ) -> Result<u32, StoreError> {
        let month = month.unwrap_or_else(YearMonth::current);
        Ok(self
            .state
            .lock()
            .usage
            .get(&(user_id.to_string(), action, month))
            .copied()
            .unwrap_or(0))
    }

    async fn get_project_count(&self, user_id: &str) -> Result<u32, StoreError> {
        Ok(self
            .state
            .lock()
            .projects
            .get(user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn increment_usage(
        &self,
        user_id: &str,
        action: ActionKind,
        month: Option<YearMonth>,
    ) -> Result<(), StoreError> {
        let month = month.unwrap_or_else(YearMonth::current);
        let mut state = self.state.lock();
        let counter = if action == ActionKind::Project {
            state.projects.entry(user_id.to_string()).or_insert(0)
        } else {
            state
                .usage
                .entry((user_id.to_string(), action, month))
                .or_insert(0)
        };
        *counter = counter.saturating_add(1);
        Ok(())
    }
}

/// Store double whose every call fails the way an unreachable backend does.
#[cfg(test)]
pub(crate) struct FailingStore;

#[cfg(test)]
#[async_trait]
impl EntitlementStore for FailingStore {
    async fn upsert_subscription(
        &self,
        _write: &SubscriptionWrite,
    ) -> Result<UpsertOutcome, StoreError> {
        Err(StoreError::Unavailable(anyhow::anyhow!("connection refused")))
    }

    async fn get_subscription(&self, _user_id: &str) -> Result<Option<Subscription>, StoreError> {
        Err(StoreError::Unavailable(anyhow::anyhow!("connection refused")))
    }

    async fn get_monthly_usage(
        &self,
        _user_id: &str,
        _action: ActionKind,
        _month: Option<YearMonth>,
    ) -> Result<u32, StoreError> {
        Err(StoreError::Unavailable(anyhow::anyhow!("connection refused")))
    }

    async fn get_project_count(&self, _user_id: &str) -> Result<u32, StoreError> {
        Err(StoreError::Unavailable(anyhow::anyhow!("connection refused")))
    }

    async fn increment_usage(
        &self,
        _user_id: &str,
        _action: ActionKind,
        _month: Option<YearMonth>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(anyhow::anyhow!("connection refused")))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn activation(external_id: &str, user_id: &str, plan_id: PlanId) -> SubscriptionWrite {
        SubscriptionWrite {
            external_subscription_id: external_id.to_string(),
            user_id: Some(user_id.to_string()),
            plan_id,
            set_plan: true,
            status: SubscriptionStatus::Active,
            event_at: None,
        }
    }

    #[tokio::test]
    async fn repeated_write_is_a_no_op() {
        let store = InMemoryStore::new();
        let write = activation("I-1", "u1", PlanId::Pro);

        assert_eq!(
            store.upsert_subscription(&write).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_subscription(&write).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(store.subscription_rows().len(), 1);
    }

    #[tokio::test]
    async fn status_only_write_keeps_plan() {
        let store = InMemoryStore::new();
        store
            .upsert_subscription(&activation("I-1", "u1", PlanId::Agency))
            .await
            .unwrap();

        let cancel = SubscriptionWrite {
            user_id: None,
            plan_id: PlanId::Free,
            set_plan: false,
            status: SubscriptionStatus::Cancelled,
            ..activation("I-1", "u1", PlanId::Free)
        };
        assert_eq!(
            store.upsert_subscription(&cancel).await.unwrap(),
            UpsertOutcome::Updated
        );

        let current = store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(current.plan_id, "agency");
        assert_eq!(current.status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn older_event_does_not_overwrite_newer_state() {
        let store = InMemoryStore::new();
        let newer = Utc.with_ymd_and_hms(2026, 5, 2, 10, 0, 0).unwrap();
        let older = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();

        let expire = SubscriptionWrite {
            status: SubscriptionStatus::Expired,
            set_plan: false,
            event_at: Some(newer),
            ..activation("I-1", "u1", PlanId::Pro)
        };
        store.upsert_subscription(&expire).await.unwrap();

        let late_activation = SubscriptionWrite {
            event_at: Some(older),
            ..activation("I-1", "u1", PlanId::Pro)
        };
        assert_eq!(
            store.upsert_subscription(&late_activation).await.unwrap(),
            UpsertOutcome::Stale
        );
        let current = store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(current.status, SubscriptionStatus::Expired);
    }

    #[tokio::test]
    async fn unattributed_write_creates_nothing() {
        let store = InMemoryStore::new();
        let write = SubscriptionWrite {
            user_id: None,
            ..activation("I-9", "ignored", PlanId::Pro)
        };
        assert_eq!(
            store.upsert_subscription(&write).await.unwrap(),
            UpsertOutcome::Unattributed
        );
        assert!(store.subscription_rows().is_empty());
    }

    #[tokio::test]
    async fn new_subscription_supersedes_previous_row_for_user() {
        let store = InMemoryStore::new();
        store
            .upsert_subscription(&activation("I-1", "u1", PlanId::Pro))
            .await
            .unwrap();
        store
            .upsert_subscription(&activation("I-2", "u1", PlanId::Agency))
            .await
            .unwrap();

        assert_eq!(store.subscription_rows().len(), 2);
        let current = store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(current.external_subscription_id, "I-2");
    }

    #[tokio::test]
    async fn late_inactive_row_does_not_displace_current_subscription() {
        let store = InMemoryStore::new();
        store
            .upsert_subscription(&activation("sub_2", "u1", PlanId::Agency))
            .await
            .unwrap();

        let old_expiry = SubscriptionWrite {
            plan_id: PlanId::Free,
            set_plan: false,
            status: SubscriptionStatus::Expired,
            ..activation("sub_1", "u1", PlanId::Free)
        };
        assert_eq!(
            store.upsert_subscription(&old_expiry).await.unwrap(),
            UpsertOutcome::Inserted
        );

        let current = store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(current.external_subscription_id, "sub_2");
        assert_eq!(current.status, SubscriptionStatus::Active);
        assert_eq!(current.plan_id, "agency");
        assert_eq!(store.subscription_rows().len(), 2);
    }

    #[tokio::test]
    async fn first_inactive_row_is_current_when_nothing_else_exists() {
        let store = InMemoryStore::new();
        let cancelled = SubscriptionWrite {
            status: SubscriptionStatus::Cancelled,
            set_plan: false,
            ..activation("sub_1", "u1", PlanId::Pro)
        };
        store.upsert_subscription(&cancelled).await.unwrap();

        let current = store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(current.external_subscription_id, "sub_1");
        assert_eq!(current.status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn usage_counters_are_scoped_by_month_and_action() {
        let store = InMemoryStore::new();
        let may = YearMonth::new(2026, 5).unwrap();

        store
            .increment_usage("u1", ActionKind::Analysis, Some(may))
            .await
            .unwrap();
        store
            .increment_usage("u1", ActionKind::Analysis, Some(may))
            .await
            .unwrap();
        store
            .increment_usage("u1", ActionKind::Project, Some(may))
            .await
            .unwrap();

        assert_eq!(
            store
                .get_monthly_usage("u1", ActionKind::Analysis, Some(may))
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .get_monthly_usage("u1", ActionKind::Analysis, Some(may.next()))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .get_monthly_usage("u1", ActionKind::Comparison, Some(may))
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.get_project_count("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unspecified_month_uses_the_store_clock() {
        let store = InMemoryStore::new();
        store
            .increment_usage("u1", ActionKind::Comparison, None)
            .await
            .unwrap();

        assert_eq!(
            store
                .get_monthly_usage("u1", ActionKind::Comparison, Some(YearMonth::current()))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .get_monthly_usage("u1", ActionKind::Comparison, None)
                .await
                .unwrap(),
            1
        );
    }
}

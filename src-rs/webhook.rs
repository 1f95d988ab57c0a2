//! PayPal subscription webhook ingestion.
//!
//! Payloads are validated once at the boundary into [`PaymentEvent`]; every
//! subscription-affecting event becomes a single idempotent
//! [`SubscriptionWrite`] keyed by the PayPal subscription id.

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    plans::PlanCatalog,
    serde_rpc::parse_timestamp,
    store::{EntitlementStore, StoreError, SubscriptionStatus, SubscriptionWrite, UpsertOutcome},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionEventKind {
    Activated,
    Cancelled,
    Expired,
    PaymentFailed,
    PaymentCompleted,
}

impl SubscriptionEventKind {
    /// Accepts both `SUBSCRIPTION.*` and PayPal's `BILLING.SUBSCRIPTION.*` names.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        let normalized = event_type.trim().to_ascii_uppercase();
        let name = normalized.strip_prefix("BILLING.").unwrap_or(&normalized);
        match name {
            "SUBSCRIPTION.ACTIVATED" => Some(Self::Activated),
            "SUBSCRIPTION.CANCELLED" => Some(Self::Cancelled),
            "SUBSCRIPTION.EXPIRED" => Some(Self::Expired),
            "SUBSCRIPTION.PAYMENT.FAILED" => Some(Self::PaymentFailed),
            "SUBSCRIPTION.PAYMENT.COMPLETED" => Some(Self::PaymentCompleted),
            _ => None,
        }
    }

    pub fn target_status(self) -> SubscriptionStatus {
        match self {
            Self::Activated | Self::PaymentCompleted => SubscriptionStatus::Active,
            Self::Cancelled => SubscriptionStatus::Cancelled,
            Self::Expired => SubscriptionStatus::Expired,
            Self::PaymentFailed => SubscriptionStatus::PastDue,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionResource {
    pub id: String,
    /// Internal user id attached when the subscription was created.
    pub custom_id: Option<String>,
    pub plan_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PaymentEvent {
    Subscription {
        kind: SubscriptionEventKind,
        event_type: String,
        resource: SubscriptionResource,
        occurred_at: Option<DateTime<Utc>>,
    },
    Unhandled {
        event_type: String,
        resource_id: String,
    },
}

/// Which payment trigger produced a write; only used for logging.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trigger {
    Webhook,
    ApprovalCallback,
    AdminOverride,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Webhook => "webhook",
            Trigger::ApprovalCallback => "approval_callback",
            Trigger::AdminOverride => "admin_override",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("subscription {subscription_id} has no user identity attached")]
    UnattributableSubscription { subscription_id: String },
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

impl IngestError {
    /// 400s are final; a 500 asks the provider to redeliver.
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::MalformedEvent(_) | IngestError::UnattributableSubscription { .. } => {
                StatusCode::BAD_REQUEST
            }
            IngestError::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum IngestOutcome {
    Applied {
        event_type: String,
        subscription_id: String,
        status: SubscriptionStatus,
        outcome: UpsertOutcome,
        plan_unresolved: bool,
    },
    Ignored {
        event_type: String,
    },
}

impl IngestOutcome {
    pub fn to_json(&self) -> Value {
        match self {
            IngestOutcome::Applied {
                event_type,
                subscription_id,
                status,
                outcome,
                plan_unresolved,
            } => json!({
                "success": true,
                "eventType": event_type,
                "subscriptionId": subscription_id,
                "status": status,
                "outcome": outcome,
                "planUnresolved": plan_unresolved,
            }),
            IngestOutcome::Ignored { event_type } => json!({
                "success": true,
                "eventType": event_type,
                "outcome": "ignored",
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    event_type: Option<String>,
    create_time: Option<String>,
    resource: Option<RawResource>,
}

#[derive(Debug, Deserialize)]
struct RawResource {
    id: Option<String>,
    custom_id: Option<String>,
    plan_id: Option<String>,
}

pub fn parse_event(body: &[u8]) -> Result<PaymentEvent, IngestError> {
    let envelope: RawEnvelope = serde_json::from_slice(body)
        .map_err(|error| IngestError::MalformedEvent(format!("invalid JSON payload: {error}")))?;

    let event_type = non_blank(envelope.event_type)
        .ok_or_else(|| IngestError::MalformedEvent("missing event_type".to_string()))?;
    let resource = envelope
        .resource
        .ok_or_else(|| IngestError::MalformedEvent("missing resource".to_string()))?;
    let resource_id = non_blank(resource.id)
        .ok_or_else(|| IngestError::MalformedEvent("missing resource.id".to_string()))?;

    let Some(kind) = SubscriptionEventKind::from_event_type(&event_type) else {
        return Ok(PaymentEvent::Unhandled {
            event_type,
            resource_id,
        });
    };

    // an unparseable timestamp only costs us ordering, not the event
    let occurred_at = envelope
        .create_time
        .as_deref()
        .and_then(|value| parse_timestamp(value.trim()).ok());

    Ok(PaymentEvent::Subscription {
        kind,
        event_type,
        resource: SubscriptionResource {
            id: resource_id,
            custom_id: non_blank(resource.custom_id),
            plan_id: non_blank(resource.plan_id),
        },
        occurred_at,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Clone)]
pub struct SubscriptionIngestor {
    store: Arc<dyn EntitlementStore>,
    catalog: Arc<PlanCatalog>,
}

impl SubscriptionIngestor {
    pub fn new(store: Arc<dyn EntitlementStore>, catalog: Arc<PlanCatalog>) -> Self {
        Self { store, catalog }
    }

    pub async fn ingest(&self, body: &[u8]) -> Result<IngestOutcome, IngestError> {
        let event = parse_event(body)?;
        self.apply(event).await
    }

    pub async fn apply(&self, event: PaymentEvent) -> Result<IngestOutcome, IngestError> {
        let (kind, event_type, resource, occurred_at) = match event {
            PaymentEvent::Unhandled {
                event_type,
                resource_id,
            } => {
                tracing::debug!(
                    event_type = %event_type,
                    resource_id = %resource_id,
                    "ignoring unhandled PayPal event"
                );
                return Ok(IngestOutcome::Ignored { event_type });
            }
            PaymentEvent::Subscription {
                kind,
                event_type,
                resource,
                occurred_at,
            } => (kind, event_type, resource, occurred_at),
        };

        if kind == SubscriptionEventKind::Activated && resource.custom_id.is_none() {
            tracing::error!(
                subscription_id = %resource.id,
                "ACTIVATED event without custom_id; the subscription cannot be attributed to an account"
            );
            return Err(IngestError::UnattributableSubscription {
                subscription_id: resource.id,
            });
        }

        let resolution = self.catalog.resolve_or_default(resource.plan_id.as_deref());
        let plan_unresolved = kind == SubscriptionEventKind::Activated && resolution.unresolved;
        if plan_unresolved {
            tracing::warn!(
                subscription_id = %resource.id,
                plan_id = ?resource.plan_id,
                default_plan = resolution.plan_id.as_str(),
                "PayPal plan not in catalog; recording subscription with default plan"
            );
        }

        let status = kind.target_status();
        let write = SubscriptionWrite {
            external_subscription_id: resource.id.clone(),
            user_id: resource.custom_id,
            plan_id: resolution.plan_id,
            set_plan: kind == SubscriptionEventKind::Activated,
            status,
            event_at: occurred_at,
        };

        let outcome = self.write(&write, Trigger::Webhook).await?;

        Ok(IngestOutcome::Applied {
            event_type,
            subscription_id: resource.id,
            status,
            outcome,
            plan_unresolved,
        })
    }

    /// The single write path shared by every payment trigger.
    pub async fn write(
        &self,
        write: &SubscriptionWrite,
        trigger: Trigger,
    ) -> Result<UpsertOutcome, StoreError> {
        let outcome = match self.store.upsert_subscription(write).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(
                    error = %error,
                    trigger = trigger.as_str(),
                    subscription_id = %write.external_subscription_id,
                    "failed to persist subscription state"
                );
                return Err(error);
            }
        };

        match outcome {
            UpsertOutcome::Unattributed => tracing::warn!(
                trigger = trigger.as_str(),
                subscription_id = %write.external_subscription_id,
                status = write.status.as_str(),
                "no stored subscription and no user identity; event acknowledged without changes"
            ),
            UpsertOutcome::Stale => tracing::info!(
                trigger = trigger.as_str(),
                subscription_id = %write.external_subscription_id,
                event_at = ?write.event_at,
                "skipped event older than stored subscription state"
            ),
            _ => tracing::info!(
                trigger = trigger.as_str(),
                subscription_id = %write.external_subscription_id,
                user_id = ?write.user_id,
                plan = write.plan_id.as_str(),
                status = write.status.as_str(),
                outcome = ?outcome,
                "subscription state reconciled"
            ),
        }

        Ok(outcome)
    }
}

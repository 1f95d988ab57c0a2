use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanId {
    Free,
    Pro,
    Agency,
}

impl PlanId {
    pub const ALL: [PlanId; 3] = [PlanId::Free, PlanId::Pro, PlanId::Agency];

    pub fn as_str(self) -> &'static str {
        match self {
            PlanId::Free => "free",
            PlanId::Pro => "pro",
            PlanId::Agency => "agency",
        }
    }

    pub fn parse(value: &str) -> Option<PlanId> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(PlanId::Free),
            "pro" => Some(PlanId::Pro),
            "agency" => Some(PlanId::Agency),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Analysis,
    Comparison,
    Project,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Analysis => "analysis",
            ActionKind::Comparison => "comparison",
            ActionKind::Project => "project",
        }
    }

    pub fn parse(value: &str) -> Option<ActionKind> {
        match value.trim().to_ascii_lowercase().as_str() {
            "analysis" | "analyses" => Some(ActionKind::Analysis),
            "comparison" | "comparisons" => Some(ActionKind::Comparison),
            "project" | "projects" => Some(ActionKind::Project),
            _ => None,
        }
    }
}

/// A plan quota. `Unlimited` is never reported as a number.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Limit {
    Finite(u32),
    Unlimited,
}

impl Limit {
    pub fn as_option(self) -> Option<u32> {
        match self {
            Limit::Finite(value) => Some(value),
            Limit::Unlimited => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Plan {
    pub plan_id: PlanId,
    pub display_name: &'static str,
    pub monthly_analysis_limit: Limit,
    pub monthly_comparison_limit: Limit,
    pub project_limit: Limit,
    pub price_usd: u32,
}

impl Plan {
    pub fn limit_for(&self, action: ActionKind) -> Limit {
        match action {
            ActionKind::Analysis => self.monthly_analysis_limit,
            ActionKind::Comparison => self.monthly_comparison_limit,
            ActionKind::Project => self.project_limit,
        }
    }
}

pub fn plan_definition(plan_id: PlanId) -> Plan {
    match plan_id {
        PlanId::Free => Plan {
            plan_id,
            display_name: "Free",
            monthly_analysis_limit: Limit::Finite(5),
            monthly_comparison_limit: Limit::Finite(2),
            project_limit: Limit::Finite(1),
            price_usd: 0,
        },
        PlanId::Pro => Plan {
            plan_id,
            display_name: "Pro",
            monthly_analysis_limit: Limit::Finite(100),
            monthly_comparison_limit: Limit::Finite(25),
            project_limit: Limit::Finite(10),
            price_usd: 19,
        },
        PlanId::Agency => Plan {
            plan_id,
            display_name: "Agency",
            monthly_analysis_limit: Limit::Finite(500),
            monthly_comparison_limit: Limit::Finite(150),
            project_limit: Limit::Finite(50),
            price_usd: 79,
        },
    }
}

/// Outcome of resolving a plan id that may be missing or unknown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlanResolution {
    pub plan_id: PlanId,
    pub unresolved: bool,
}

#[derive(Clone, Debug)]
pub struct PlanCatalog {
    plans: HashMap<PlanId, Plan>,
    by_external_id: HashMap<String, PlanId>,
    default_plan: PlanId,
}

impl PlanCatalog {
    pub fn new(default_plan: PlanId, external_ids: &[(Option<String>, PlanId)]) -> Self {
        let plans = PlanId::ALL
            .iter()
            .map(|plan_id| (*plan_id, plan_definition(*plan_id)))
            .collect();

        let mut by_external_id = HashMap::new();
        for (external_id, plan_id) in external_ids {
            if let Some(external_id) = external_id.as_deref().map(str::trim) {
                if !external_id.is_empty() {
                    by_external_id.insert(external_id.to_string(), *plan_id);
                }
            }
        }

        Self {
            plans,
            by_external_id,
            default_plan,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let default_plan = PlanId::parse(&config.default_plan_id).ok_or_else(|| {
            anyhow::anyhow!("DEFAULT_PLAN_ID is not a known plan: {}", config.default_plan_id)
        })?;

        Ok(Self::new(
            default_plan,
            &[
                (config.paypal_plan_id_pro.clone(), PlanId::Pro),
                (config.paypal_plan_id_agency.clone(), PlanId::Agency),
            ],
        ))
    }

    pub fn default_plan(&self) -> &Plan {
        self.plan(self.default_plan)
    }

    pub fn plan(&self, plan_id: PlanId) -> &Plan {
        // every PlanId is inserted in `new`
        &self.plans[&plan_id]
    }

    /// Looks up an external (payment provider) plan id first, then an internal plan key.
    pub fn resolve(&self, id: &str) -> Option<&Plan> {
        let id = id.trim();
        if id.is_empty() {
            return None;
        }
        self.by_external_id
            .get(id)
            .copied()
            .or_else(|| PlanId::parse(id))
            .map(|plan_id| self.plan(plan_id))
    }

    pub fn resolve_or_default(&self, id: Option<&str>) -> PlanResolution {
        match id.and_then(|id| self.resolve(id)) {
            Some(plan) => PlanResolution {
                plan_id: plan.plan_id,
                unresolved: false,
            },
            None => PlanResolution {
                plan_id: self.default_plan,
                unresolved: true,
            },
        }
    }
}

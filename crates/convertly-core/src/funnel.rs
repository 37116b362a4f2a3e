use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attribution::{validate_model, AttributionModel, AttributionModelType};
use crate::error::ConversionError;
use crate::goals::{validate_goal_condition, validate_step_condition, GoalCondition, StepCondition};

const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStatus {
    Active,
    Paused,
    Archived,
}

impl FunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelStatus::Active => "active",
            FunnelStatus::Paused => "paused",
            FunnelStatus::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(FunnelStatus::Active),
            "paused" => Some(FunnelStatus::Paused),
            "archived" => Some(FunnelStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    Revenue,
    Lead,
    Engagement,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStep {
    pub id: String,
    pub name: String,
    pub order: u32,
    pub conditions: Vec<StepCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionGoal {
    pub id: String,
    pub name: String,
    pub goal_type: GoalType,
    pub value: f64,
    pub currency: String,
    pub conditions: Vec<GoalCondition>,
    /// Overrides the funnel's default model for conversions on this goal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution_model: Option<AttributionModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionConfiguration {
    #[serde(default = "default_model")]
    pub default_model: AttributionModel,
    /// Named models offered for comparison next to the default.
    #[serde(default)]
    pub alternates: BTreeMap<String, AttributionModel>,
}

fn default_model() -> AttributionModel {
    AttributionModel::new(AttributionModelType::LastTouch)
}

impl Default for AttributionConfiguration {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            alternates: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionFunnel {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<FunnelStep>,
    pub goals: Vec<ConversionGoal>,
    pub attribution: AttributionConfiguration,
    pub status: FunnelStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversionFunnel {
    pub fn is_active(&self) -> bool {
        self.status == FunnelStatus::Active
    }

    /// The model a conversion on `goal` is attributed with.
    pub fn model_for_goal<'a>(&'a self, goal: &'a ConversionGoal) -> &'a AttributionModel {
        goal.attribution_model
            .as_ref()
            .unwrap_or(&self.attribution.default_model)
    }

    pub fn goal(&self, goal_id: &str) -> Option<&ConversionGoal> {
        self.goals.iter().find(|g| g.id == goal_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFunnelStep {
    pub name: String,
    pub order: u32,
    #[serde(default)]
    pub conditions: Vec<StepCondition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGoal {
    pub name: String,
    pub goal_type: GoalType,
    #[serde(default)]
    pub value: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub conditions: Vec<GoalCondition>,
    pub attribution_model: Option<AttributionModel>,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFunnelRequest {
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<CreateFunnelStep>,
    #[serde(default)]
    pub goals: Vec<CreateGoal>,
    pub attribution: Option<AttributionConfiguration>,
}

fn prefixed_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

fn validate_steps(steps: &[CreateFunnelStep]) -> Result<(), ConversionError> {
    if steps.is_empty() {
        return Err(ConversionError::validation("steps", "a funnel needs at least one step"));
    }
    let mut orders: Vec<u32> = steps.iter().map(|s| s.order).collect();
    orders.sort_unstable();
    if orders.iter().enumerate().any(|(i, &o)| o as usize != i + 1) {
        return Err(ConversionError::validation(
            "steps",
            "step orders must be unique and contiguous starting at 1",
        ));
    }
    for (i, step) in steps.iter().enumerate() {
        let field = format!("steps[{i}]");
        if step.name.trim().is_empty() {
            return Err(ConversionError::validation(format!("{field}.name"), "must not be empty"));
        }
        if step.conditions.is_empty() {
            return Err(ConversionError::validation(
                format!("{field}.conditions"),
                "a step needs at least one condition",
            ));
        }
        for (j, condition) in step.conditions.iter().enumerate() {
            validate_step_condition(&format!("{field}.conditions[{j}]"), condition)?;
        }
    }
    Ok(())
}

fn validate_goals(goals: &[CreateGoal]) -> Result<(), ConversionError> {
    if goals.is_empty() {
        return Err(ConversionError::validation("goals", "a funnel needs at least one goal"));
    }
    for (i, goal) in goals.iter().enumerate() {
        let field = format!("goals[{i}]");
        if goal.name.trim().is_empty() {
            return Err(ConversionError::validation(format!("{field}.name"), "must not be empty"));
        }
        if !goal.value.is_finite() || goal.value < 0.0 {
            return Err(ConversionError::validation(
                format!("{field}.value"),
                "must be a finite, non-negative number",
            ));
        }
        if goal.conditions.is_empty() {
            return Err(ConversionError::validation(
                format!("{field}.conditions"),
                "a goal needs at least one condition",
            ));
        }
        for (j, condition) in goal.conditions.iter().enumerate() {
            validate_goal_condition(&format!("{field}.conditions[{j}]"), condition)?;
        }
        if let Some(model) = &goal.attribution_model {
            validate_model(&format!("{field}.attribution_model"), model)?;
        }
    }
    Ok(())
}

/// Validate a creation request and materialize the funnel.
///
/// Nothing is stored on failure; the first offending field is reported.
pub fn build_funnel(
    req: CreateFunnelRequest,
    now: DateTime<Utc>,
) -> Result<ConversionFunnel, ConversionError> {
    if req.user_id.trim().is_empty() {
        return Err(ConversionError::validation("user_id", "must not be empty"));
    }
    let name = req.name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(ConversionError::validation(
            "name",
            format!("must be 1-{MAX_NAME_LEN} characters"),
        ));
    }
    validate_steps(&req.steps)?;
    validate_goals(&req.goals)?;

    let attribution = req.attribution.unwrap_or_default();
    validate_model("attribution.default_model", &attribution.default_model)?;
    for (label, model) in &attribution.alternates {
        validate_model(&format!("attribution.alternates.{label}"), model)?;
    }

    let mut steps: Vec<FunnelStep> = req
        .steps
        .into_iter()
        .map(|s| FunnelStep {
            id: prefixed_id("fstep"),
            name: s.name.trim().to_string(),
            order: s.order,
            conditions: s.conditions,
        })
        .collect();
    steps.sort_by_key(|s| s.order);

    let goals = req
        .goals
        .into_iter()
        .map(|g| ConversionGoal {
            id: prefixed_id("goal"),
            name: g.name.trim().to_string(),
            goal_type: g.goal_type,
            value: g.value,
            currency: g.currency,
            conditions: g.conditions,
            attribution_model: g.attribution_model,
        })
        .collect();

    Ok(ConversionFunnel {
        id: prefixed_id("fun"),
        user_id: req.user_id.trim().to_string(),
        name: name.to_string(),
        description: req.description.filter(|d| !d.trim().is_empty()),
        steps,
        goals,
        attribution,
        status: FunnelStatus::Active,
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> CreateFunnelRequest {
        serde_json::from_value(json!({
            "user_id": "user_1",
            "name": "Checkout",
            "steps": [
                {"name": "Purchase", "order": 3, "conditions": [{"kind": "event_trigger", "operator": "equals", "value": "purchase"}]},
                {"name": "Visit", "order": 1, "conditions": [{"kind": "url_match", "operator": "contains", "value": "/"}]},
                {"name": "Signup", "order": 2, "conditions": [{"kind": "event_trigger", "operator": "equals", "value": "signup"}]}
            ],
            "goals": [
                {"name": "Purchase", "goal_type": "revenue", "value": 50.0, "conditions": [
                    {"kind": "event", "operator": "equals", "value": "purchase"},
                    {"kind": "value", "operator": "greater_than", "value": 0}
                ]}
            ]
        }))
        .expect("valid request json")
    }

    #[test]
    fn build_sorts_steps_and_assigns_ids() {
        let funnel = build_funnel(request(), Utc::now()).expect("valid funnel");
        let orders: Vec<u32> = funnel.steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(funnel.steps[0].name, "Visit");
        assert!(funnel.id.starts_with("fun_"));
        assert!(funnel.goals[0].id.starts_with("goal_"));
        assert_eq!(funnel.goals[0].currency, "USD");
        assert_eq!(funnel.status, FunnelStatus::Active);
        assert_eq!(
            funnel.attribution.default_model.model_type,
            AttributionModelType::LastTouch
        );
    }

    #[test]
    fn gaps_in_step_order_are_rejected() {
        let mut req = request();
        req.steps[0].order = 4;
        match build_funnel(req, Utc::now()) {
            Err(ConversionError::Validation { field, .. }) => assert_eq!(field, "steps"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn goal_without_conditions_is_rejected() {
        let mut req = request();
        req.goals[0].conditions.clear();
        match build_funnel(req, Utc::now()) {
            Err(ConversionError::Validation { field, .. }) => {
                assert_eq!(field, "goals[0].conditions")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn empty_funnel_and_long_name_are_rejected() {
        let mut req = request();
        req.steps.clear();
        assert!(build_funnel(req, Utc::now()).is_err());

        let mut req = request();
        req.goals.clear();
        assert!(build_funnel(req, Utc::now()).is_err());

        let mut req = request();
        req.name = "x".repeat(101);
        assert!(build_funnel(req, Utc::now()).is_err());
    }

    #[test]
    fn invalid_goal_model_is_rejected() {
        let mut req = request();
        let mut model = AttributionModel::new(AttributionModelType::PositionBased);
        model.parameters.first_touch_weight = 0.8;
        model.parameters.last_touch_weight = 0.8;
        req.goals[0].attribution_model = Some(model);
        assert!(matches!(
            build_funnel(req, Utc::now()),
            Err(ConversionError::Validation { .. })
        ));
    }
}

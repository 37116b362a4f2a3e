//! Goal and funnel-step condition interpreter.
//!
//! Conditions arrive as loosely-typed JSON (`kind`, `operator`, `value`).
//! They are lowered into a [`Predicate`] and evaluated by a single pure
//! function against a [`ConversionEvent`].

use serde::{Deserialize, Serialize};

use crate::error::ConversionError;
use crate::event::ConversionEvent;
use crate::funnel::{ConversionFunnel, ConversionGoal, FunnelStep};

const VALUE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    GreaterThan,
    LessThan,
}

impl ConditionOperator {
    fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::Contains => "contains",
            ConditionOperator::StartsWith => "starts_with",
            ConditionOperator::EndsWith => "ends_with",
            ConditionOperator::Regex => "regex",
            ConditionOperator::GreaterThan => "greater_than",
            ConditionOperator::LessThan => "less_than",
        }
    }

    fn is_text(&self) -> bool {
        matches!(
            self,
            ConditionOperator::Equals
                | ConditionOperator::Contains
                | ConditionOperator::StartsWith
                | ConditionOperator::EndsWith
                | ConditionOperator::Regex
        )
    }
}

/// Comparison operand. Clients send either a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Number(f64),
    Text(String),
}

impl ConditionValue {
    pub fn as_text(&self) -> String {
        match self {
            ConditionValue::Number(n) => n.to_string(),
            ConditionValue::Text(s) => s.clone(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ConditionValue::Number(n) => Some(*n),
            ConditionValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
        .filter(|n| n.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalConditionKind {
    Event,
    Page,
    Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalCondition {
    pub kind: GoalConditionKind,
    pub operator: ConditionOperator,
    pub value: ConditionValue,
    /// For `value` conditions: compare against this event property instead
    /// of the event's numeric value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepConditionKind {
    UrlMatch,
    EventTrigger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    pub kind: StepConditionKind,
    pub operator: ConditionOperator,
    pub value: ConditionValue,
}

enum Predicate<'a> {
    EventName {
        op: ConditionOperator,
        expected: &'a ConditionValue,
    },
    PageUrl {
        op: ConditionOperator,
        expected: &'a ConditionValue,
    },
    Numeric {
        op: ConditionOperator,
        expected: &'a ConditionValue,
        property: Option<&'a str>,
    },
}

impl GoalCondition {
    fn predicate(&self) -> Predicate<'_> {
        match self.kind {
            GoalConditionKind::Event => Predicate::EventName {
                op: self.operator,
                expected: &self.value,
            },
            GoalConditionKind::Page => Predicate::PageUrl {
                op: self.operator,
                expected: &self.value,
            },
            GoalConditionKind::Value => Predicate::Numeric {
                op: self.operator,
                expected: &self.value,
                property: self.property.as_deref(),
            },
        }
    }
}

impl StepCondition {
    fn predicate(&self) -> Predicate<'_> {
        match self.kind {
            StepConditionKind::UrlMatch => Predicate::PageUrl {
                op: self.operator,
                expected: &self.value,
            },
            StepConditionKind::EventTrigger => Predicate::EventName {
                op: self.operator,
                expected: &self.value,
            },
        }
    }
}

fn match_text(op: ConditionOperator, haystack: &str, needle: &str) -> bool {
    match op {
        ConditionOperator::Equals => haystack == needle,
        ConditionOperator::Contains => haystack.contains(needle),
        ConditionOperator::StartsWith => haystack.starts_with(needle),
        ConditionOperator::EndsWith => haystack.ends_with(needle),
        ConditionOperator::Regex => regex::Regex::new(needle)
            .map(|re| re.is_match(haystack))
            .unwrap_or(false),
        ConditionOperator::GreaterThan | ConditionOperator::LessThan => false,
    }
}

fn property_text(event: &ConversionEvent, name: &str) -> Option<String> {
    match event.properties.get(name)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn evaluate(predicate: &Predicate<'_>, event: &ConversionEvent) -> bool {
    match predicate {
        Predicate::EventName { op, expected } => {
            let needle = expected.as_text();
            match_text(*op, &event.event_type, &needle)
                || event
                    .event_name
                    .as_deref()
                    .is_some_and(|name| match_text(*op, name, &needle))
        }
        Predicate::PageUrl { op, expected } => event
            .page_url
            .as_deref()
            .is_some_and(|url| match_text(*op, url, &expected.as_text())),
        Predicate::Numeric {
            op,
            expected,
            property,
        } => {
            if *op == ConditionOperator::Contains {
                let haystack = match property {
                    Some(name) => property_text(event, name),
                    None => Some(event.value.to_string()),
                };
                return haystack.is_some_and(|h| h.contains(&expected.as_text()));
            }
            let actual = match property {
                Some(name) => property_text(event, name).and_then(|s| s.trim().parse::<f64>().ok()),
                None => Some(event.value),
            };
            let (Some(actual), Some(target)) = (actual, expected.as_number()) else {
                return false;
            };
            match op {
                ConditionOperator::Equals => (actual - target).abs() < VALUE_EPSILON,
                ConditionOperator::GreaterThan => actual > target,
                ConditionOperator::LessThan => actual < target,
                _ => false,
            }
        }
    }
}

/// A goal fires when every one of its conditions holds.
pub fn goal_matches(event: &ConversionEvent, goal: &ConversionGoal) -> bool {
    !goal.conditions.is_empty()
        && goal
            .conditions
            .iter()
            .all(|c| evaluate(&c.predicate(), event))
}

/// True when any goal of the funnel fires for this event.
pub fn is_conversion(event: &ConversionEvent, funnel: &ConversionFunnel) -> bool {
    matching_goal(event, funnel).is_some()
}

/// The first goal (declaration order) that fires for this event.
pub fn matching_goal<'f>(
    event: &ConversionEvent,
    funnel: &'f ConversionFunnel,
) -> Option<&'f ConversionGoal> {
    funnel.goals.iter().find(|goal| goal_matches(event, goal))
}

pub fn matches_step_conditions(event: &ConversionEvent, step: &FunnelStep) -> bool {
    !step.conditions.is_empty()
        && step
            .conditions
            .iter()
            .all(|c| evaluate(&c.predicate(), event))
}

fn check_operand(
    field: &str,
    operator: ConditionOperator,
    value: &ConditionValue,
) -> Result<(), ConversionError> {
    if value.as_text().trim().is_empty() {
        return Err(ConversionError::validation(field, "condition value must not be empty"));
    }
    if operator == ConditionOperator::Regex {
        if let Err(e) = regex::Regex::new(&value.as_text()) {
            return Err(ConversionError::validation(
                field,
                format!("invalid regex: {e}"),
            ));
        }
    }
    Ok(())
}

fn unsupported(field: &str, operator: ConditionOperator, kind: &str) -> ConversionError {
    ConversionError::validation(
        field,
        format!("operator '{}' is not supported for '{kind}' conditions", operator.as_str()),
    )
}

pub fn validate_goal_condition(field: &str, condition: &GoalCondition) -> Result<(), ConversionError> {
    let op = condition.operator;
    match condition.kind {
        GoalConditionKind::Event => {
            if !matches!(op, ConditionOperator::Equals | ConditionOperator::Contains) {
                return Err(unsupported(field, op, "event"));
            }
        }
        GoalConditionKind::Page => {
            if !op.is_text() {
                return Err(unsupported(field, op, "page"));
            }
        }
        GoalConditionKind::Value => match op {
            ConditionOperator::Equals
            | ConditionOperator::GreaterThan
            | ConditionOperator::LessThan => {
                if condition.value.as_number().is_none() {
                    return Err(ConversionError::validation(
                        field,
                        "numeric comparison requires a numeric value",
                    ));
                }
            }
            ConditionOperator::Contains => {}
            _ => return Err(unsupported(field, op, "value")),
        },
    }
    check_operand(field, op, &condition.value)
}

pub fn validate_step_condition(field: &str, condition: &StepCondition) -> Result<(), ConversionError> {
    let op = condition.operator;
    match condition.kind {
        StepConditionKind::UrlMatch => {
            if !op.is_text() {
                return Err(unsupported(field, op, "url_match"));
            }
        }
        StepConditionKind::EventTrigger => {
            if !matches!(op, ConditionOperator::Equals | ConditionOperator::Contains) {
                return Err(unsupported(field, op, "event_trigger"));
            }
        }
    }
    check_operand(field, op, &condition.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChannelType, Touchpoint};
    use chrono::Utc;

    fn event(event_type: &str, value: f64, url: Option<&str>) -> ConversionEvent {
        ConversionEvent {
            id: "evt_1".to_string(),
            funnel_id: "fun_1".to_string(),
            session_id: "s1".to_string(),
            visitor_id: "v1".to_string(),
            event_type: event_type.to_string(),
            event_name: None,
            value,
            page_url: url.map(str::to_string),
            timestamp: Utc::now(),
            properties: serde_json::Map::new(),
            device_type: "desktop".to_string(),
            user_id: None,
            touchpoint: Touchpoint {
                id: "tp".to_string(),
                channel: ChannelType::Direct,
                source: "direct".to_string(),
                medium: "none".to_string(),
                campaign: None,
                timestamp: Utc::now(),
                value: 0.0,
                position: 1,
            },
            is_conversion: false,
            goal_id: None,
            attribution: None,
        }
    }

    fn goal_condition(kind: GoalConditionKind, op: ConditionOperator, value: ConditionValue) -> GoalCondition {
        GoalCondition {
            kind,
            operator: op,
            value,
            property: None,
        }
    }

    #[test]
    fn event_condition_matches_type_or_name() {
        let cond = goal_condition(
            GoalConditionKind::Event,
            ConditionOperator::Equals,
            ConditionValue::Text("purchase".to_string()),
        );
        assert!(evaluate(&cond.predicate(), &event("purchase", 0.0, None)));

        let mut custom = event("custom", 0.0, None);
        custom.event_name = Some("purchase".to_string());
        assert!(evaluate(&cond.predicate(), &custom));
        assert!(!evaluate(&cond.predicate(), &event("signup", 0.0, None)));
    }

    #[test]
    fn value_conditions_compare_numerically() {
        let gt = goal_condition(
            GoalConditionKind::Value,
            ConditionOperator::GreaterThan,
            ConditionValue::Number(0.0),
        );
        assert!(evaluate(&gt.predicate(), &event("purchase", 100.0, None)));
        assert!(!evaluate(&gt.predicate(), &event("purchase", 0.0, None)));

        let eq = goal_condition(
            GoalConditionKind::Value,
            ConditionOperator::Equals,
            ConditionValue::Text("49.99".to_string()),
        );
        assert!(evaluate(&eq.predicate(), &event("purchase", 49.99, None)));

        let contains = goal_condition(
            GoalConditionKind::Value,
            ConditionOperator::Contains,
            ConditionValue::Text("99".to_string()),
        );
        assert!(evaluate(&contains.predicate(), &event("purchase", 199.0, None)));
    }

    #[test]
    fn value_condition_can_target_a_property() {
        let mut cond = goal_condition(
            GoalConditionKind::Value,
            ConditionOperator::Contains,
            ConditionValue::Text("pro".to_string()),
        );
        cond.property = Some("plan".to_string());
        let mut e = event("signup", 0.0, None);
        assert!(!evaluate(&cond.predicate(), &e));
        e.properties
            .insert("plan".to_string(), serde_json::json!("pro_annual"));
        assert!(evaluate(&cond.predicate(), &e));
    }

    #[test]
    fn page_conditions_use_string_operators() {
        let url = Some("https://shop.example.com/checkout/thanks");
        let cases = [
            (ConditionOperator::Contains, "/checkout", true),
            (ConditionOperator::StartsWith, "https://shop", true),
            (ConditionOperator::EndsWith, "/thanks", true),
            (ConditionOperator::Regex, r"/checkout/\w+$", true),
            (ConditionOperator::Equals, "/checkout", false),
            (ConditionOperator::Regex, "(", false),
        ];
        for (op, needle, expected) in cases {
            let cond = goal_condition(GoalConditionKind::Page, op, ConditionValue::Text(needle.to_string()));
            assert_eq!(evaluate(&cond.predicate(), &event("page_view", 0.0, url)), expected, "{op:?} {needle}");
        }
        let cond = goal_condition(
            GoalConditionKind::Page,
            ConditionOperator::Contains,
            ConditionValue::Text("/".to_string()),
        );
        assert!(!evaluate(&cond.predicate(), &event("page_view", 0.0, None)));
    }

    #[test]
    fn validation_rejects_bad_conditions() {
        let bad = [
            goal_condition(GoalConditionKind::Event, ConditionOperator::Regex, ConditionValue::Text("x".into())),
            goal_condition(GoalConditionKind::Value, ConditionOperator::GreaterThan, ConditionValue::Text("lots".into())),
            goal_condition(GoalConditionKind::Page, ConditionOperator::Regex, ConditionValue::Text("[".into())),
            goal_condition(GoalConditionKind::Page, ConditionOperator::Equals, ConditionValue::Text(" ".into())),
            goal_condition(GoalConditionKind::Page, ConditionOperator::LessThan, ConditionValue::Number(1.0)),
        ];
        for cond in &bad {
            assert!(
                matches!(validate_goal_condition("goals[0]", cond), Err(ConversionError::Validation { .. })),
                "{cond:?}"
            );
        }
        let ok = goal_condition(GoalConditionKind::Value, ConditionOperator::GreaterThan, ConditionValue::Number(0.0));
        assert!(validate_goal_condition("goals[0]", &ok).is_ok());

        let step = StepCondition {
            kind: StepConditionKind::EventTrigger,
            operator: ConditionOperator::StartsWith,
            value: ConditionValue::Text("sign".into()),
        };
        assert!(validate_step_condition("steps[0]", &step).is_err());
    }
}

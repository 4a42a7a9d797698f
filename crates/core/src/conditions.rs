//! Condition trees — typed boolean/leaf nodes shared by segments, scorings
//! and auto-generated rules.
//!
//! A [`Condition`] is a type identifier plus a map of named parameters. A
//! parameter value is a closed [`ParameterValue`] so that tree walks are
//! exhaustive instead of relying on runtime type checks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known condition type identifiers.
/// Largest integer an `f64` holds exactly (2^53).
const MAX_EXACT_FLOAT_INTEGER: f64 = 9_007_199_254_740_992.0;

pub mod types {
    pub const BOOLEAN: &str = "booleanCondition";
    pub const NOT: &str = "notCondition";
    pub const MATCH_ALL: &str = "matchAllCondition";
    pub const PROFILE_PROPERTY: &str = "profilePropertyCondition";
    pub const PROFILE_SEGMENT: &str = "profileSegmentCondition";
    pub const SCORING: &str = "scoringCondition";
    pub const PAST_EVENT: &str = "pastEventCondition";
    pub const EVENT_TYPE: &str = "eventTypeCondition";
    pub const EVENT_PROPERTY: &str = "eventPropertyCondition";
    pub const SESSION_PROPERTY: &str = "sessionPropertyCondition";
}

/// Well-known parameter names.
pub mod params {
    pub const OPERATOR: &str = "operator";
    pub const SUB_CONDITIONS: &str = "subConditions";
    pub const SUB_CONDITION: &str = "subCondition";
    pub const SEGMENTS: &str = "segments";
    pub const MATCH_TYPE: &str = "matchType";
    pub const SCORING_PLAN_ID: &str = "scoringPlanId";
    pub const SCORE_VALUE: &str = "scoreValue";
    pub const PROPERTY_NAME: &str = "propertyName";
    pub const COMPARISON_OPERATOR: &str = "comparisonOperator";
    pub const PROPERTY_VALUE: &str = "propertyValue";
    pub const PROPERTY_VALUE_INTEGER: &str = "propertyValueInteger";
    pub const PROPERTY_VALUE_DATE: &str = "propertyValueDate";
    pub const PROPERTY_VALUE_DATE_EXPR: &str = "propertyValueDateExpr";
    pub const PROPERTY_VALUES: &str = "propertyValues";
    pub const EVENT_TYPE_ID: &str = "eventTypeId";
    pub const EVENT_CONDITION: &str = "eventCondition";
    pub const NUMBER_OF_DAYS: &str = "numberOfDays";
    pub const FROM_DATE: &str = "fromDate";
    pub const TO_DATE: &str = "toDate";
    pub const MINIMUM_EVENT_COUNT: &str = "minimumEventCount";
    pub const MAXIMUM_EVENT_COUNT: &str = "maximumEventCount";
    pub const GENERATED_PROPERTY_KEY: &str = "generatedPropertyKey";
    pub const PAST_EVENT_CONDITION: &str = "pastEventCondition";
}

/// Logical operator of a boolean combinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BooleanOperator {
    And,
    Or,
}

impl BooleanOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            BooleanOperator::And => "and",
            BooleanOperator::Or => "or",
        }
    }
}

/// A node of a condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_id: String,
    #[serde(default)]
    pub parameter_values: BTreeMap<String, ParameterValue>,
}

/// Value held by a condition or action parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Condition(Box<Condition>),
    Conditions(Vec<Condition>),
    Scalars(Vec<serde_json::Value>),
    Scalar(serde_json::Value),
}

impl From<Condition> for ParameterValue {
    fn from(condition: Condition) -> Self {
        ParameterValue::Condition(Box::new(condition))
    }
}

impl From<Vec<Condition>> for ParameterValue {
    fn from(conditions: Vec<Condition>) -> Self {
        ParameterValue::Conditions(conditions)
    }
}

impl From<Vec<String>> for ParameterValue {
    fn from(values: Vec<String>) -> Self {
        ParameterValue::Scalars(values.into_iter().map(serde_json::Value::String).collect())
    }
}

impl From<serde_json::Value> for ParameterValue {
    fn from(value: serde_json::Value) -> Self {
        ParameterValue::Scalar(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Scalar(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Scalar(serde_json::Value::String(value))
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Scalar(serde_json::Value::from(value))
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Scalar(serde_json::Value::Bool(value))
    }
}

impl ParameterValue {
    /// Plain JSON rendering, used by matchers and canonical key derivation.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParameterValue::Scalar(v) => v.clone(),
            ParameterValue::Scalars(vs) => serde_json::Value::Array(vs.clone()),
            other => serde_json::to_value(other).unwrap_or(serde_json::Value::Null),
        }
    }
}

impl Condition {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            parameter_values: BTreeMap::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with_parameter(mut self, name: &str, value: impl Into<ParameterValue>) -> Self {
        self.set_parameter(name, value);
        self
    }

    /// `booleanCondition` combining `sub_conditions` with `operator`.
    pub fn boolean(operator: BooleanOperator, sub_conditions: Vec<Condition>) -> Self {
        Condition::new(types::BOOLEAN)
            .with_parameter(params::OPERATOR, operator.as_str())
            .with_parameter(params::SUB_CONDITIONS, sub_conditions)
    }

    pub fn not(sub_condition: Condition) -> Self {
        Condition::new(types::NOT).with_parameter(params::SUB_CONDITION, sub_condition)
    }

    /// `profilePropertyCondition` on `property_name`.
    pub fn profile_property(
        property_name: &str,
        comparison_operator: &str,
        value: Option<serde_json::Value>,
    ) -> Self {
        let mut condition = Condition::new(types::PROFILE_PROPERTY)
            .with_parameter(params::PROPERTY_NAME, property_name)
            .with_parameter(params::COMPARISON_OPERATOR, comparison_operator);
        if let Some(value) = value {
            condition.set_parameter(params::PROPERTY_VALUE, value);
        }
        condition
    }

    /// Profiles whose `segments` field contains `segment_id`.
    pub fn segment_membership(segment_id: &str) -> Self {
        Condition::profile_property(
            params::SEGMENTS,
            "equals",
            Some(serde_json::Value::String(segment_id.to_string())),
        )
    }

    /// Profiles carrying a `scores.<scoring_id>` field.
    pub fn has_score(scoring_id: &str) -> Self {
        Condition::profile_property(&format!("scores.{scoring_id}"), "exists", None)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterValue> {
        self.parameter_values.get(name)
    }

    pub fn contains_parameter(&self, name: &str) -> bool {
        self.parameter_values.contains_key(name)
    }

    pub fn set_parameter(&mut self, name: &str, value: impl Into<ParameterValue>) {
        self.parameter_values.insert(name.to_string(), value.into());
    }

    pub fn remove_parameter(&mut self, name: &str) -> Option<ParameterValue> {
        self.parameter_values.remove(name)
    }

    pub fn is_boolean(&self) -> bool {
        self.type_id == types::BOOLEAN
    }

    pub fn string_parameter(&self, name: &str) -> Option<&str> {
        match self.parameter(name)? {
            ParameterValue::Scalar(serde_json::Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer parameter. Whole floats and numeric strings are accepted.
    pub fn integer_parameter(&self, name: &str) -> Option<i64> {
        match self.parameter(name)? {
            ParameterValue::Scalar(serde_json::Value::Number(n)) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() <= MAX_EXACT_FLOAT_INTEGER)
                    .map(|f| f as i64)
            }),
            ParameterValue::Scalar(serde_json::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String members of a list parameter. A single string is a one-element list.
    pub fn string_list_parameter(&self, name: &str) -> Vec<String> {
        match self.parameter(name) {
            Some(ParameterValue::Scalars(values)) => values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(ParameterValue::Scalar(serde_json::Value::String(s))) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    pub fn condition_parameter(&self, name: &str) -> Option<&Condition> {
        match self.parameter(name)? {
            ParameterValue::Condition(c) => Some(c),
            _ => None,
        }
    }

    /// Children of a boolean combinator. An empty `Conditions` list
    /// deserializes the same way as an empty scalar list, so both count.
    pub fn sub_conditions(&self) -> Option<&[Condition]> {
        match self.parameter(params::SUB_CONDITIONS)? {
            ParameterValue::Conditions(subs) => Some(subs.as_slice()),
            ParameterValue::Scalars(values) if values.is_empty() => Some(&[]),
            _ => None,
        }
    }

    pub fn operator(&self) -> BooleanOperator {
        match self.string_parameter(params::OPERATOR) {
            Some("or") => BooleanOperator::Or,
            _ => BooleanOperator::And,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_nested_tree() {
        let raw = json!({
            "type": "booleanCondition",
            "parameterValues": {
                "operator": "or",
                "subConditions": [
                    {"type": "profileSegmentCondition", "parameterValues": {"segments": ["a", "c"], "matchType": "in"}},
                    {"type": "profilePropertyCondition", "parameterValues": {"propertyName": "properties.age", "comparisonOperator": "greaterThan", "propertyValueInteger": 30}}
                ]
            }
        });
        let condition: Condition = serde_json::from_value(raw).unwrap();
        assert!(condition.is_boolean());
        assert_eq!(condition.operator(), BooleanOperator::Or);

        let subs = condition.sub_conditions().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].string_list_parameter(params::SEGMENTS), vec!["a", "c"]);
        assert_eq!(subs[1].integer_parameter(params::PROPERTY_VALUE_INTEGER), Some(30));
    }

    #[test]
    fn test_serialize_keeps_shape() {
        let condition = Condition::not(Condition::segment_membership("seg-1"));
        let value = serde_json::to_value(&condition).unwrap();
        assert_eq!(value["type"], "notCondition");
        assert_eq!(
            value["parameterValues"]["subCondition"]["parameterValues"]["propertyValue"],
            "seg-1"
        );
        let back: Condition = serde_json::from_value(value).unwrap();
        assert_eq!(back, condition);
    }

    #[test]
    fn test_empty_sub_conditions() {
        let condition: Condition = serde_json::from_value(json!({
            "type": "booleanCondition",
            "parameterValues": {"operator": "and", "subConditions": []}
        }))
        .unwrap();
        assert_eq!(condition.sub_conditions().map(|s| s.len()), Some(0));
    }

    #[test]
    fn test_integer_parameter_coercion() {
        let condition = Condition::new(types::PAST_EVENT)
            .with_parameter("int", 7i64)
            .with_parameter("float", serde_json::json!(7.0))
            .with_parameter("fraction", serde_json::json!(7.5))
            .with_parameter("text", "7")
            .with_parameter("word", "seven");
        assert_eq!(condition.integer_parameter("int"), Some(7));
        assert_eq!(condition.integer_parameter("float"), Some(7));
        assert_eq!(condition.integer_parameter("text"), Some(7));
        assert_eq!(condition.integer_parameter("fraction"), None);
        assert_eq!(condition.integer_parameter("word"), None);
        assert_eq!(condition.integer_parameter("absent"), None);
    }
}

//! Reference evaluation of condition trees against profiles and events.
//!
//! Supports the builtin condition types. Property comparisons follow
//! search-engine term semantics: `equals` on an array field matches when any
//! element is equal. Ordered comparisons work on numbers, then on dates
//! (RFC 3339 or `now-7d` style expressions), then on plain strings.

use std::cmp::Ordering;

use audience_core::conditions::{params, types, Condition, ParameterValue};
use audience_core::types::{Event, Profile};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("unsupported condition type '{0}'")]
    UnsupportedType(String),

    #[error("condition '{type_id}' is missing parameter '{parameter}'")]
    MissingParameter {
        type_id: String,
        parameter: &'static str,
    },

    #[error("unknown comparison operator '{0}'")]
    UnknownOperator(String),
}

/// What a condition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Profile(&'a Profile),
    Event(&'a Event),
}

impl<'a> Subject<'a> {
    /// Value at a dotted path, e.g. `properties.age` or `scores.engagement`.
    pub fn field(&self, path: &str) -> Option<Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        match self {
            Subject::Profile(profile) => {
                let root = match head {
                    "itemId" => Value::String(profile.item_id.clone()),
                    "segments" => serde_json::to_value(&profile.segments).ok()?,
                    "scores" => serde_json::to_value(&profile.scores).ok()?,
                    "properties" => return lookup_map(&profile.properties, rest),
                    "systemProperties" => return lookup_map(&profile.system_properties, rest),
                    _ => return None,
                };
                lookup(root, rest)
            }
            Subject::Event(event) => {
                let root = match head {
                    "itemId" => Value::String(event.item_id.clone()),
                    "eventType" => Value::String(event.event_type.clone()),
                    "profileId" => Value::String(event.profile_id.clone()),
                    "timeStamp" => Value::String(event.time_stamp.to_rfc3339()),
                    "properties" => return lookup_map(&event.properties, rest),
                    _ => return None,
                };
                lookup(root, rest)
            }
        }
    }
}

fn lookup_map(map: &serde_json::Map<String, Value>, path: Option<&str>) -> Option<Value> {
    match path {
        None => Some(Value::Object(map.clone())),
        Some(path) => {
            let mut parts = path.split('.');
            let first = map.get(parts.next()?)?;
            parts
                .try_fold(first, |value, key| value.get(key))
                .cloned()
        }
    }
}

fn lookup(root: Value, path: Option<&str>) -> Option<Value> {
    match path {
        None => Some(root),
        Some(path) => path
            .split('.')
            .try_fold(&root, |value, key| value.get(key))
            .cloned(),
    }
}

/// Fail on the first node whose type this matcher cannot evaluate.
pub fn check_supported(condition: &Condition) -> Result<(), MatchError> {
    const SUPPORTED: &[&str] = &[
        types::BOOLEAN,
        types::NOT,
        types::MATCH_ALL,
        types::PROFILE_PROPERTY,
        types::PROFILE_SEGMENT,
        types::SCORING,
        types::PAST_EVENT,
        types::EVENT_TYPE,
        types::EVENT_PROPERTY,
        types::SESSION_PROPERTY,
    ];
    if !SUPPORTED.contains(&condition.type_id.as_str()) {
        return Err(MatchError::UnsupportedType(condition.type_id.clone()));
    }
    for value in condition.parameter_values.values() {
        match value {
            ParameterValue::Condition(child) => check_supported(child)?,
            ParameterValue::Conditions(children) => {
                for child in children {
                    check_supported(child)?;
                }
            }
            ParameterValue::Scalar(_) | ParameterValue::Scalars(_) => {}
        }
    }
    Ok(())
}

pub fn profile_matches(condition: &Condition, profile: &Profile) -> Result<bool, MatchError> {
    evaluate(condition, Subject::Profile(profile), Utc::now())
}

pub fn event_matches(condition: &Condition, event: &Event) -> Result<bool, MatchError> {
    evaluate(condition, Subject::Event(event), Utc::now())
}

pub fn evaluate(
    condition: &Condition,
    subject: Subject<'_>,
    now: DateTime<Utc>,
) -> Result<bool, MatchError> {
    match condition.type_id.as_str() {
        types::MATCH_ALL => Ok(true),
        types::BOOLEAN => {
            let subs = condition.sub_conditions().unwrap_or_default();
            if condition.string_parameter(params::OPERATOR) == Some("or") {
                for sub in subs {
                    if evaluate(sub, subject, now)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            } else {
                for sub in subs {
                    if !evaluate(sub, subject, now)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
        types::NOT => {
            let sub = required_condition(condition, params::SUB_CONDITION)?;
            Ok(!evaluate(sub, subject, now)?)
        }
        types::PROFILE_PROPERTY | types::EVENT_PROPERTY | types::SESSION_PROPERTY => {
            property_matches(condition, subject, now)
        }
        types::PROFILE_SEGMENT => {
            let Subject::Profile(profile) = subject else {
                return Ok(false);
            };
            let wanted = condition.string_list_parameter(params::SEGMENTS);
            let held = |id: &String| profile.segments.contains(id);
            Ok(match condition.string_parameter(params::MATCH_TYPE).unwrap_or("in") {
                "notIn" => !wanted.iter().any(held),
                "all" => wanted.iter().all(held),
                _ => wanted.iter().any(held),
            })
        }
        types::SCORING => {
            let Subject::Profile(profile) = subject else {
                return Ok(false);
            };
            let scoring_id = required_string(condition, params::SCORING_PLAN_ID)?;
            let threshold = condition.integer_parameter(params::SCORE_VALUE).unwrap_or(0);
            Ok(profile
                .scores
                .get(scoring_id)
                .is_some_and(|score| *score >= threshold))
        }
        types::PAST_EVENT => {
            let Subject::Profile(profile) = subject else {
                return Ok(false);
            };
            required_condition(condition, params::EVENT_CONDITION)?;
            let count = condition
                .string_parameter(params::GENERATED_PROPERTY_KEY)
                .and_then(|key| profile.past_event_count(key))
                .unwrap_or(0);
            let minimum = condition.integer_parameter(params::MINIMUM_EVENT_COUNT).unwrap_or(1);
            let maximum = condition
                .integer_parameter(params::MAXIMUM_EVENT_COUNT)
                .unwrap_or(i64::MAX);
            Ok(count >= minimum && count <= maximum)
        }
        types::EVENT_TYPE => {
            let Subject::Event(event) = subject else {
                return Ok(false);
            };
            Ok(event.event_type == required_string(condition, params::EVENT_TYPE_ID)?)
        }
        other => Err(MatchError::UnsupportedType(other.to_string())),
    }
}

fn required_condition<'c>(
    condition: &'c Condition,
    parameter: &'static str,
) -> Result<&'c Condition, MatchError> {
    condition
        .condition_parameter(parameter)
        .ok_or_else(|| MatchError::MissingParameter {
            type_id: condition.type_id.clone(),
            parameter,
        })
}

fn required_string<'c>(
    condition: &'c Condition,
    parameter: &'static str,
) -> Result<&'c str, MatchError> {
    condition
        .string_parameter(parameter)
        .ok_or_else(|| MatchError::MissingParameter {
            type_id: condition.type_id.clone(),
            parameter,
        })
}

fn property_matches(
    condition: &Condition,
    subject: Subject<'_>,
    now: DateTime<Utc>,
) -> Result<bool, MatchError> {
    let name = required_string(condition, params::PROPERTY_NAME)?;
    let operator = required_string(condition, params::COMPARISON_OPERATOR)?;
    let actual = subject.field(name).unwrap_or(Value::Null);
    let expected = expected_value(condition, now);
    let values = match condition.parameter(params::PROPERTY_VALUES) {
        Some(ParameterValue::Scalars(values)) => values.clone(),
        _ => Vec::new(),
    };
    compare_values(&actual, operator, expected.as_ref(), &values, now)
}

/// First configured comparison value; date expressions are resolved against
/// `now` into RFC 3339 timestamps.
fn expected_value(condition: &Condition, now: DateTime<Utc>) -> Option<Value> {
    let scalar = |name: &str| match condition.parameter(name) {
        Some(ParameterValue::Scalar(value)) if !value.is_null() => Some(value.clone()),
        _ => None,
    };
    scalar(params::PROPERTY_VALUE)
        .or_else(|| scalar(params::PROPERTY_VALUE_INTEGER))
        .or_else(|| scalar(params::PROPERTY_VALUE_DATE))
        .or_else(|| {
            scalar(params::PROPERTY_VALUE_DATE_EXPR).map(|expr| {
                expr.as_str()
                    .and_then(|e| parse_date(e, now))
                    .map(|date| Value::String(date.to_rfc3339()))
                    .unwrap_or(expr)
            })
        })
}

pub fn compare_values(
    actual: &Value,
    operator: &str,
    expected: Option<&Value>,
    values: &[Value],
    now: DateTime<Utc>,
) -> Result<bool, MatchError> {
    let expected_or_null = expected.unwrap_or(&Value::Null);
    let ordered = |accept: fn(Ordering) -> bool| {
        expected.is_some_and(|e| any_element(actual, |a| order(a, e, now).is_some_and(accept)))
    };
    let text = |test: fn(&str, &str) -> bool| {
        expected
            .and_then(Value::as_str)
            .is_some_and(|e| any_element(actual, |a| a.as_str().is_some_and(|a| test(a, e))))
    };

    let matched = match operator {
        "equals" => any_element(actual, |a| loosely_equal(a, expected_or_null)),
        "notEquals" => !any_element(actual, |a| loosely_equal(a, expected_or_null)),
        "greaterThan" => ordered(|o| o == Ordering::Greater),
        "greaterThanOrEqualTo" => ordered(|o| o != Ordering::Less),
        "lessThan" => ordered(|o| o == Ordering::Less),
        "lessThanOrEqualTo" => ordered(|o| o != Ordering::Greater),
        "between" => match values {
            [low, high] => any_element(actual, |a| {
                order(a, low, now).is_some_and(|o| o != Ordering::Less)
                    && order(a, high, now).is_some_and(|o| o != Ordering::Greater)
            }),
            _ => false,
        },
        "exists" => !actual.is_null(),
        "missing" => actual.is_null(),
        "contains" => text(|a, e| a.contains(e)),
        "notContains" => !text(|a, e| a.contains(e)),
        "startsWith" => text(|a, e| a.starts_with(e)),
        "endsWith" => text(|a, e| a.ends_with(e)),
        "in" | "hasSomeOf" => values
            .iter()
            .any(|v| any_element(actual, |a| loosely_equal(a, v))),
        "notIn" | "hasNoneOf" => !values
            .iter()
            .any(|v| any_element(actual, |a| loosely_equal(a, v))),
        "all" => {
            !values.is_empty()
                && values
                    .iter()
                    .all(|v| any_element(actual, |a| loosely_equal(a, v)))
        }
        other => return Err(MatchError::UnknownOperator(other.to_string())),
    };
    Ok(matched)
}

/// Apply `test` to `value`, or to each element when it is an array.
fn any_element(value: &Value, test: impl Fn(&Value) -> bool) -> bool {
    match value {
        Value::Array(items) => items.iter().any(test),
        other => test(other),
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn order(actual: &Value, expected: &Value, now: DateTime<Utc>) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a.partial_cmp(&b);
    }
    let (a, b) = (actual.as_str()?, expected.as_str()?);
    match (parse_date(a, now), parse_date(b, now)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => Some(a.cmp(b)),
    }
}

/// RFC 3339 timestamp, plain `YYYY-MM-DD` date, or a date expression such
/// as `now`, `now-7d`, `now+1h` or `now-1d/d`.
pub fn parse_date(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(expr) = text.strip_prefix("now") {
        return parse_date_expression(expr, now);
    }
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Some(date.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0)?))
}

fn parse_date_expression(mut expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut date = now;
    while !expr.is_empty() {
        let sign = expr.chars().next()?;
        let body = &expr[sign.len_utf8()..];
        match sign {
            '+' | '-' => {
                let digits = body.chars().take_while(char::is_ascii_digit).count();
                let amount: i32 = body[..digits].parse().ok()?;
                let unit = body[digits..].chars().next()?;
                let delta = unit_duration(unit)?.checked_mul(amount)?;
                date = if sign == '+' {
                    date.checked_add_signed(delta)?
                } else {
                    date.checked_sub_signed(delta)?
                };
                expr = &body[digits + unit.len_utf8()..];
            }
            '/' => {
                let unit = body.chars().next()?;
                date = round_down(date, unit)?;
                expr = &body[unit.len_utf8()..];
            }
            _ => return None,
        }
    }
    Some(date)
}

fn unit_duration(unit: char) -> Option<Duration> {
    Some(match unit {
        's' => Duration::seconds(1),
        'm' => Duration::minutes(1),
        'h' | 'H' => Duration::hours(1),
        'd' => Duration::days(1),
        'w' => Duration::weeks(1),
        'M' => Duration::days(30),
        'y' => Duration::days(365),
        _ => return None,
    })
}

fn round_down(date: DateTime<Utc>, unit: char) -> Option<DateTime<Utc>> {
    let naive = date.naive_utc();
    let rounded = match unit {
        'd' => naive.date().and_hms_opt(0, 0, 0)?,
        'h' | 'H' => naive.date().and_hms_opt(chrono::Timelike::hour(&naive), 0, 0)?,
        _ => return Some(date),
    };
    Some(Utc.from_utc_datetime(&rounded))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use audience_core::conditions::BooleanOperator;
    use serde_json::json;

    fn profile() -> Profile {
        let mut profile = Profile::new("p1")
            .with_property("age", json!(42))
            .with_property("city", json!("Lyon"))
            .with_property("interests", json!(["golf", "jazz"]))
            .with_property("address", json!({"zip": "69001"}));
        profile.segments.insert("vip".to_string());
        profile.scores.insert("engagement".to_string(), 12);
        profile.set_system_property("pastEvents", json!({"eventTriggeredk": 3}));
        profile
    }

    fn prop(name: &str, op: &str, value: Value) -> Condition {
        Condition::profile_property(name, op, Some(value))
    }

    #[test]
    fn test_property_comparisons() {
        let p = profile();
        let yes = |c: Condition| assert!(profile_matches(&c, &p).unwrap(), "{c:?}");
        let no = |c: Condition| assert!(!profile_matches(&c, &p).unwrap(), "{c:?}");

        yes(prop("properties.age", "greaterThan", json!(30)));
        no(prop("properties.age", "lessThan", json!(30)));
        yes(prop("properties.age", "equals", json!(42.0)));
        yes(prop("properties.city", "startsWith", json!("Ly")));
        yes(prop("properties.interests", "equals", json!("jazz")));
        yes(prop("properties.address.zip", "equals", json!("69001")));
        yes(Condition::profile_property("properties.city", "exists", None));
        yes(Condition::profile_property("properties.nope", "missing", None));
        yes(Condition::segment_membership("vip"));
        yes(Condition::has_score("engagement"));
        no(Condition::has_score("other"));
        yes(Condition::profile_property("properties.interests", "hasSomeOf", None)
            .with_parameter(params::PROPERTY_VALUES, vec!["golf".to_string(), "chess".to_string()]));
        no(Condition::profile_property("properties.interests", "all", None)
            .with_parameter(params::PROPERTY_VALUES, vec!["golf".to_string(), "chess".to_string()]));
    }

    #[test]
    fn test_combinators_and_references() {
        let p = profile();
        let tree = Condition::boolean(
            BooleanOperator::And,
            vec![
                Condition::new(types::PROFILE_SEGMENT)
                    .with_parameter(params::SEGMENTS, vec!["gold".to_string(), "vip".to_string()]),
                Condition::not(prop("properties.city", "equals", json!("Paris"))),
                Condition::new(types::SCORING)
                    .with_parameter(params::SCORING_PLAN_ID, "engagement")
                    .with_parameter(params::SCORE_VALUE, 10i64),
            ],
        );
        assert!(profile_matches(&tree, &p).unwrap());

        let all = Condition::new(types::PROFILE_SEGMENT)
            .with_parameter(params::SEGMENTS, vec!["gold".to_string(), "vip".to_string()])
            .with_parameter(params::MATCH_TYPE, "all");
        assert!(!profile_matches(&all, &p).unwrap());
        assert!(!profile_matches(&Condition::boolean(BooleanOperator::Or, vec![]), &p).unwrap());
    }

    #[test]
    fn test_past_event_uses_generated_key() {
        let p = profile();
        let trigger = Condition::new(types::EVENT_TYPE).with_parameter(params::EVENT_TYPE_ID, "view");
        let past = |min: i64, max: Option<i64>| {
            let mut c = Condition::new(types::PAST_EVENT)
                .with_parameter(params::EVENT_CONDITION, trigger.clone())
                .with_parameter(params::GENERATED_PROPERTY_KEY, "eventTriggeredk")
                .with_parameter(params::MINIMUM_EVENT_COUNT, min);
            if let Some(max) = max {
                c.set_parameter(params::MAXIMUM_EVENT_COUNT, max);
            }
            c
        };
        assert!(profile_matches(&past(2, None), &p).unwrap());
        assert!(!profile_matches(&past(4, None), &p).unwrap());
        assert!(!profile_matches(&past(1, Some(2)), &p).unwrap());

        let unstamped = Condition::new(types::PAST_EVENT).with_parameter(params::EVENT_CONDITION, trigger);
        assert!(!profile_matches(&unstamped, &p).unwrap());
    }

    #[test]
    fn test_event_window() {
        let now = Utc::now();
        let event = Event {
            item_id: "e1".to_string(),
            event_type: "view".to_string(),
            profile_id: "p1".to_string(),
            time_stamp: now - Duration::days(3),
            properties: Default::default(),
        };
        let since = |days: i64| {
            Condition::new(types::SESSION_PROPERTY)
                .with_parameter(params::PROPERTY_NAME, "timeStamp")
                .with_parameter(params::COMPARISON_OPERATOR, "greaterThan")
                .with_parameter(params::PROPERTY_VALUE, format!("now-{days}d"))
        };
        assert!(event_matches(&since(7), &event).unwrap());
        assert!(!event_matches(&since(1), &event).unwrap());

        let before = Condition::new(types::SESSION_PROPERTY)
            .with_parameter(params::PROPERTY_NAME, "timeStamp")
            .with_parameter(params::COMPARISON_OPERATOR, "lessThanOrEqualTo")
            .with_parameter(params::PROPERTY_VALUE_DATE, "2000-01-01T00:00:00Z");
        assert!(!event_matches(&before, &event).unwrap());

        let typed = Condition::new(types::EVENT_TYPE).with_parameter(params::EVENT_TYPE_ID, "view");
        assert!(event_matches(&typed, &event).unwrap());
    }

    #[test]
    fn test_date_expressions() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 15, 30, 0).unwrap();
        assert_eq!(parse_date("now", now), Some(now));
        assert_eq!(
            parse_date("now-1d/d", now),
            Some(Utc.with_ymd_and_hms(2024, 5, 9, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_date("now+2h", now), Some(now + Duration::hours(2)));
        assert_eq!(
            parse_date("2024-01-02", now),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_date("now-x", now), None);
    }

    #[test]
    fn test_malformed_date_expressions_are_plain_strings() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 15, 30, 0).unwrap();
        assert_eq!(parse_date("nowé", now), None);
        assert_eq!(parse_date("now-é", now), None);
        assert_eq!(parse_date("now-99999999y", now), None);
        assert_eq!(parse_date("now+99999999999d", now), None);

        let p = profile().with_property("nickname", json!("nowé"));
        assert!(profile_matches(&prop("properties.nickname", "greaterThan", json!("a")), &p).unwrap());
        assert!(!profile_matches(&prop("properties.nickname", "lessThan", json!("a")), &p).unwrap());
    }

    #[test]
    fn test_errors() {
        let p = profile();
        assert_eq!(
            check_supported(&Condition::not(Condition::new("custom"))),
            Err(MatchError::UnsupportedType("custom".to_string()))
        );
        assert!(matches!(
            profile_matches(&Condition::new(types::PROFILE_PROPERTY), &p),
            Err(MatchError::MissingParameter { .. })
        ));
        assert!(matches!(
            profile_matches(&prop("properties.age", "isDay", json!(1)), &p),
            Err(MatchError::UnknownOperator(_))
        ));
    }
}

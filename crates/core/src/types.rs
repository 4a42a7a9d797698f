use crate::conditions::{Condition, ParameterValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Scope assigned to definitions that arrive without one.
pub const SYSTEM_SCOPE: &str = "systemscope";

/// Identity and lifecycle flags shared by segments, scorings and rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub missing_plugins: bool,
    #[serde(default)]
    pub system_tags: BTreeSet<String>,
}

fn default_enabled() -> bool {
    true
}

impl Metadata {
    pub fn new(
        scope: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let description = description.into();
        Self {
            id: id.into(),
            name: name.into(),
            description: if description.is_empty() {
                None
            } else {
                Some(description)
            },
            scope: Some(scope.into()),
            enabled: true,
            hidden: false,
            missing_plugins: false,
            system_tags: BTreeSet::new(),
        }
    }
}

/// Anything persisted in a definition store.
pub trait Item: Clone + Send + Sync + 'static {
    const ITEM_TYPE: &'static str;

    fn metadata(&self) -> &Metadata;

    fn metadata_mut(&mut self) -> &mut Metadata;

    fn item_id(&self) -> &str {
        &self.metadata().id
    }
}

/// Named boolean condition over profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub metadata: Metadata,
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl Segment {
    pub fn new(metadata: Metadata, condition: Condition) -> Self {
        Self {
            metadata,
            condition: Some(condition),
        }
    }
}

impl Item for Segment {
    const ITEM_TYPE: &'static str = "segment";

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// One weighted condition of a scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringElement {
    pub condition: Condition,
    pub value: i64,
}

/// Named weighted set of conditions producing an integer score per profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scoring {
    pub metadata: Metadata,
    #[serde(default)]
    pub elements: Vec<ScoringElement>,
}

impl Scoring {
    pub fn new(metadata: Metadata, elements: Vec<ScoringElement>) -> Self {
        Self { metadata, elements }
    }
}

impl Item for Scoring {
    const ITEM_TYPE: &'static str = "scoring";

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Action executed when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub type_id: String,
    #[serde(default)]
    pub parameter_values: BTreeMap<String, ParameterValue>,
}

impl Action {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            parameter_values: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: &str, value: impl Into<ParameterValue>) -> Self {
        self.parameter_values.insert(name.to_string(), value.into());
        self
    }

    pub fn condition_parameter(&self, name: &str) -> Option<&Condition> {
        match self.parameter_values.get(name)? {
            ParameterValue::Condition(c) => Some(c),
            _ => None,
        }
    }
}

/// Background rule. Auto-generated rules count past events for the
/// definitions listed in `linked_items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub metadata: Metadata,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub linked_items: BTreeSet<String>,
}

impl Item for Rule {
    const ITEM_TYPE: &'static str = "rule";

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Profile fields this engine reads and writes. Everything else a profile
/// store keeps is opaque here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub item_id: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub system_properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub segments: BTreeSet<String>,
    #[serde(default)]
    pub scores: BTreeMap<String, i64>,
}

impl Profile {
    pub const ITEM_TYPE: &'static str = "profile";

    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, name: &str, value: serde_json::Value) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    /// Profile-local score overrides keyed by scoring id.
    pub fn score_modifiers(&self) -> BTreeMap<String, i64> {
        self.system_properties
            .get("scoreModifiers")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_i64().map(|n| (k.clone(), n)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Running count stored by an auto-generated counting rule.
    pub fn past_event_count(&self, key: &str) -> Option<i64> {
        self.system_properties
            .get("pastEvents")
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_i64())
    }

    pub fn set_system_property(&mut self, name: &str, value: serde_json::Value) {
        self.system_properties.insert(name.to_string(), value);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.set_system_property("lastUpdated", serde_json::Value::String(now.to_rfc3339()));
    }
}

/// Raw event as kept by the event store; only what past-event counting needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub item_id: String,
    pub event_type: String,
    pub profile_id: String,
    pub time_stamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// Definitions impacted by a change to one segment or scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependentMetadata {
    pub segments: Vec<Metadata>,
    pub scorings: Vec<Metadata>,
}

impl DependentMetadata {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.scorings.is_empty()
    }
}

/// Result of classifying one profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentsAndScores {
    pub segments: BTreeSet<String>,
    pub scores: BTreeMap<String, i64>,
}

/// One page of a query, optionally carrying a scroll cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialList<T> {
    pub list: Vec<T>,
    pub offset: usize,
    pub page_size: usize,
    pub total_size: u64,
    #[serde(default)]
    pub scroll_identifier: Option<String>,
    #[serde(default)]
    pub scroll_time_validity: Option<String>,
}

impl<T> PartialList<T> {
    pub fn empty() -> Self {
        Self {
            list: Vec::new(),
            offset: 0,
            page_size: 0,
            total_size: 0,
            scroll_identifier: None,
            scroll_time_validity: None,
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

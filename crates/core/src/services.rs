//! Contracts of the collaborators the segmentation engine drives.
//!
//! The engine never matches conditions or pages through storage itself; it
//! talks to these traits. `audience-store` ships in-memory implementations.

use crate::conditions::Condition;
use crate::error::AudienceResult;
use crate::types::{Item, Metadata, PartialList, Profile, Rule};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// System tag carried by condition types that match events.
pub const EVENT_CONDITION_TAG: &str = "eventCondition";
/// System tag carried by condition types that match profiles.
pub const PROFILE_CONDITION_TAG: &str = "profileCondition";

/// Action type of auto-generated counting rules.
pub const SET_EVENT_OCCURRENCE_COUNT_ACTION: &str = "setEventOccurenceCountAction";

/// Partial document written into a profile. Nested objects merge into the
/// stored document; any other value replaces the field.
pub type FieldChanges = serde_json::Map<String, serde_json::Value>;

/// Durable storage of one kind of definition.
pub trait DefinitionStore<T: Item>: Send + Sync {
    fn load(&self, id: &str) -> AudienceResult<Option<T>>;

    fn save(&self, item: &T) -> AudienceResult<()>;

    fn remove(&self, id: &str) -> AudienceResult<bool>;

    fn all(&self) -> AudienceResult<Vec<T>>;

    /// Metadata page, optionally restricted to one scope.
    fn query_metadata(
        &self,
        scope: Option<&str>,
        offset: usize,
        size: usize,
        sort_by: Option<&str>,
    ) -> AudienceResult<PartialList<Metadata>>;
}

/// Storage of rules, including the auto-generated counting rules.
pub trait RuleStore: Send + Sync {
    fn get_rule(&self, id: &str) -> AudienceResult<Option<Rule>>;

    fn set_rule(&self, rule: &Rule) -> AudienceResult<()>;

    fn remove_rule(&self, id: &str) -> AudienceResult<bool>;

    fn update_linked_items(&self, id: &str, linked_items: &BTreeSet<String>) -> AudienceResult<()>;

    /// Rules whose linked items contain `item_id`.
    fn rules_linked_to(&self, item_id: &str) -> AudienceResult<Vec<Rule>>;

    fn rule_metadatas(&self) -> AudienceResult<Vec<Metadata>>;
}

/// Typed replacement for server-side update scripts on score fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum ScoreScript {
    /// Set `scores[scoring_id]` to the profile's score modifier when one
    /// exists, otherwise drop the field.
    ResetToModifier { scoring_id: String },
    /// Add `value` to `scores[scoring_id]`, creating it when missing.
    Increment { scoring_id: String, value: i64 },
    /// Drop `scores[scoring_id]`.
    Remove { scoring_id: String },
}

impl ScoreScript {
    pub fn scoring_id(&self) -> &str {
        match self {
            ScoreScript::ResetToModifier { scoring_id }
            | ScoreScript::Increment { scoring_id, .. }
            | ScoreScript::Remove { scoring_id } => scoring_id,
        }
    }
}

/// One script applied to every profile matching `condition`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedUpdate {
    pub condition: Condition,
    pub script: ScoreScript,
}

/// Profile storage plus the predicate evaluator it embeds.
pub trait ProfileStore: Send + Sync {
    fn test_match(&self, condition: &Condition, profile: &Profile) -> bool;

    fn is_valid_condition(&self, condition: &Condition, sample: &Profile) -> bool;

    /// First page of profiles matching `condition`. With `scroll_ttl` set the
    /// page carries a cursor for [`continue_scroll`](Self::continue_scroll).
    fn query(
        &self,
        condition: &Condition,
        sort_by: Option<&str>,
        offset: usize,
        size: usize,
        scroll_ttl: Option<&str>,
    ) -> AudienceResult<PartialList<Profile>>;

    fn continue_scroll(
        &self,
        scroll_id: &str,
        scroll_ttl: &str,
    ) -> AudienceResult<Option<PartialList<Profile>>>;

    fn query_count(&self, condition: &Condition) -> AudienceResult<u64>;

    fn load(&self, id: &str) -> AudienceResult<Option<Profile>>;

    fn update(&self, id: &str, changes: &FieldChanges) -> AudienceResult<bool>;

    /// Multi-update. Returns the ids whose update failed.
    fn update_batch(&self, changes: &BTreeMap<String, FieldChanges>) -> AudienceResult<Vec<String>>;

    /// Apply each script, in order, to every profile matching its condition.
    fn update_by_query_with_script(&self, updates: &[ScriptedUpdate]) -> AudienceResult<()>;

    fn create_mapping(&self, item_type: &str, mapping: &serde_json::Value) -> AudienceResult<()>;

    fn refresh_index(&self) -> AudienceResult<()>;
}

/// Terms-aggregation partition (`index` of `count`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: u32,
    pub count: u32,
}

/// Raw event storage, used to backfill past-event counts.
pub trait EventStore: Send + Sync {
    /// Event counts per profile id over events matching `condition`.
    fn count_by_profile(
        &self,
        condition: &Condition,
        partition: Option<Partition>,
        max_buckets: Option<usize>,
    ) -> AudienceResult<BTreeMap<String, u64>>;

    /// Number of distinct profiles with at least one matching event.
    fn distinct_profile_count(&self, condition: &Condition) -> AudienceResult<u64>;
}

/// Schema metadata of a condition type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionType {
    pub id: String,
    #[serde(default)]
    pub system_tags: BTreeSet<String>,
}

impl ConditionType {
    pub fn new(id: impl Into<String>, tags: &[&str]) -> Self {
        Self {
            id: id.into(),
            system_tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.system_tags.contains(tag)
    }
}

/// Schema metadata of an action type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionType {
    pub id: String,
    #[serde(default)]
    pub system_tags: BTreeSet<String>,
}

/// Registry resolving condition and action type identifiers.
pub trait TypeRegistry: Send + Sync {
    fn condition_type(&self, id: &str) -> Option<ConditionType>;

    fn action_type(&self, id: &str) -> Option<ActionType>;
}

//! In-memory profile store with scroll cursors and partial updates.

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use audience_core::conditions::Condition;
use audience_core::error::{AudienceError, AudienceResult};
use audience_core::services::{FieldChanges, ProfileStore, ScoreScript, ScriptedUpdate};
use audience_core::types::{PartialList, Profile};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::matcher::{check_supported, profile_matches, Subject};

const DEFAULT_SCROLL_TTL: Duration = Duration::from_secs(600);

struct ScrollCursor {
    remaining: VecDeque<String>,
    page_size: usize,
    offset: usize,
    total: u64,
    expires_at: Instant,
}

pub struct InMemoryProfileStore {
    profiles: DashMap<String, Profile>,
    scrolls: DashMap<String, ScrollCursor>,
    mappings: DashMap<String, Value>,
    pages_served: AtomicUsize,
    refreshes: AtomicUsize,
}

impl Default for InMemoryProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        info!("Profile store initialized (in-memory, development mode)");
        Self {
            profiles: DashMap::new(),
            scrolls: DashMap::new(),
            mappings: DashMap::new(),
            pages_served: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, profile: Profile) {
        self.profiles.insert(profile.item_id.clone(), profile);
    }

    pub fn remove(&self, id: &str) -> Option<Profile> {
        self.profiles.remove(id).map(|(_, profile)| profile)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Non-empty pages handed out through scroll cursors so far.
    pub fn scroll_pages_served(&self) -> usize {
        self.pages_served.load(AtomicOrdering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(AtomicOrdering::SeqCst)
    }

    pub fn mapping(&self, item_type: &str) -> Option<Value> {
        self.mappings.get(item_type).map(|m| m.value().clone())
    }

    fn matching_ids(&self, condition: &Condition, sort_by: Option<&str>) -> AudienceResult<Vec<String>> {
        let mut matched = Vec::new();
        for entry in self.profiles.iter() {
            let hit = profile_matches(condition, entry.value())
                .map_err(|e| AudienceError::Store(e.to_string()))?;
            if hit {
                matched.push(entry.value().clone());
            }
        }
        sort_profiles(&mut matched, sort_by);
        Ok(matched.into_iter().map(|p| p.item_id).collect())
    }

    fn load_all(&self, ids: impl IntoIterator<Item = String>) -> Vec<Profile> {
        ids.into_iter()
            .filter_map(|id| self.profiles.get(&id).map(|p| p.value().clone()))
            .collect()
    }

    fn apply_script(&self, id: &str, script: &ScoreScript) {
        let Some(mut entry) = self.profiles.get_mut(id) else {
            return;
        };
        let profile = entry.value_mut();
        match script {
            ScoreScript::ResetToModifier { scoring_id } => {
                match profile.score_modifiers().get(scoring_id) {
                    Some(modifier) => {
                        profile.scores.insert(scoring_id.clone(), *modifier);
                    }
                    None => {
                        profile.scores.remove(scoring_id);
                    }
                }
            }
            ScoreScript::Increment { scoring_id, value } => {
                let score = profile.scores.entry(scoring_id.clone()).or_insert(0);
                *score = score.saturating_add(*value);
            }
            ScoreScript::Remove { scoring_id } => {
                profile.scores.remove(scoring_id);
            }
        }
        profile.touch(Utc::now());
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn test_match(&self, condition: &Condition, profile: &Profile) -> bool {
        profile_matches(condition, profile).unwrap_or_else(|e| {
            debug!(profile_id = %profile.item_id, error = %e, "condition not evaluable");
            false
        })
    }

    fn is_valid_condition(&self, condition: &Condition, sample: &Profile) -> bool {
        check_supported(condition).is_ok() && profile_matches(condition, sample).is_ok()
    }

    fn query(
        &self,
        condition: &Condition,
        sort_by: Option<&str>,
        offset: usize,
        size: usize,
        scroll_ttl: Option<&str>,
    ) -> AudienceResult<PartialList<Profile>> {
        let ids = self.matching_ids(condition, sort_by)?;
        let total = ids.len() as u64;
        let mut remaining: VecDeque<String> = ids.into_iter().skip(offset).collect();
        let page_ids: Vec<String> = remaining.drain(..size.min(remaining.len())).collect();
        let list = self.load_all(page_ids);

        let mut page = PartialList {
            list,
            offset,
            page_size: size,
            total_size: total,
            scroll_identifier: None,
            scroll_time_validity: None,
        };

        if let Some(ttl) = scroll_ttl {
            if !page.is_empty() {
                self.pages_served.fetch_add(1, AtomicOrdering::SeqCst);
            }
            if !remaining.is_empty() {
                let scroll_id = Uuid::new_v4().to_string();
                self.scrolls.insert(
                    scroll_id.clone(),
                    ScrollCursor {
                        remaining,
                        page_size: size,
                        offset: offset + page.len(),
                        total,
                        expires_at: Instant::now() + parse_ttl(ttl),
                    },
                );
                page.scroll_identifier = Some(scroll_id);
                page.scroll_time_validity = Some(ttl.to_string());
            }
        }
        Ok(page)
    }

    fn continue_scroll(
        &self,
        scroll_id: &str,
        scroll_ttl: &str,
    ) -> AudienceResult<Option<PartialList<Profile>>> {
        let Some((_, mut cursor)) = self.scrolls.remove(scroll_id) else {
            return Ok(None);
        };
        if cursor.expires_at < Instant::now() {
            return Err(AudienceError::Store(format!("scroll {scroll_id} expired")));
        }

        // ids deleted since the snapshot are skipped, never ending the scroll early
        let mut list = Vec::new();
        while list.is_empty() && !cursor.remaining.is_empty() {
            let take = cursor.page_size.max(1).min(cursor.remaining.len());
            let page_ids: Vec<String> = cursor.remaining.drain(..take).collect();
            list = self.load_all(page_ids);
        }
        if list.is_empty() {
            return Ok(None);
        }
        self.pages_served.fetch_add(1, AtomicOrdering::SeqCst);

        let mut page = PartialList {
            list,
            offset: cursor.offset,
            page_size: cursor.page_size,
            total_size: cursor.total,
            scroll_identifier: None,
            scroll_time_validity: None,
        };
        if !cursor.remaining.is_empty() {
            cursor.offset += page.len();
            cursor.expires_at = Instant::now() + parse_ttl(scroll_ttl);
            self.scrolls.insert(scroll_id.to_string(), cursor);
            page.scroll_identifier = Some(scroll_id.to_string());
            page.scroll_time_validity = Some(scroll_ttl.to_string());
        }
        Ok(Some(page))
    }

    fn query_count(&self, condition: &Condition) -> AudienceResult<u64> {
        let mut count = 0;
        for entry in self.profiles.iter() {
            if profile_matches(condition, entry.value())
                .map_err(|e| AudienceError::Store(e.to_string()))?
            {
                count += 1;
            }
        }
        Ok(count)
    }

    fn load(&self, id: &str) -> AudienceResult<Option<Profile>> {
        Ok(self.profiles.get(id).map(|p| p.value().clone()))
    }

    fn update(&self, id: &str, changes: &FieldChanges) -> AudienceResult<bool> {
        let Some(mut entry) = self.profiles.get_mut(id) else {
            return Ok(false);
        };
        let mut document = serde_json::to_value(entry.value())?;
        merge_fields(&mut document, changes);
        *entry.value_mut() = serde_json::from_value(document)?;
        Ok(true)
    }

    fn update_batch(&self, changes: &BTreeMap<String, FieldChanges>) -> AudienceResult<Vec<String>> {
        let mut failed = Vec::new();
        for (id, fields) in changes {
            match self.update(id, fields) {
                Ok(true) => {}
                Ok(false) => failed.push(id.clone()),
                Err(e) => {
                    debug!(profile_id = %id, error = %e, "batched profile update failed");
                    failed.push(id.clone());
                }
            }
        }
        Ok(failed)
    }

    fn update_by_query_with_script(&self, updates: &[ScriptedUpdate]) -> AudienceResult<()> {
        for update in updates {
            let ids = self.matching_ids(&update.condition, None)?;
            debug!(
                scoring_id = update.script.scoring_id(),
                profiles = ids.len(),
                "applying score script"
            );
            for id in ids {
                self.apply_script(&id, &update.script);
            }
        }
        Ok(())
    }

    fn create_mapping(&self, item_type: &str, mapping: &Value) -> AudienceResult<()> {
        let mut entry = self
            .mappings
            .entry(item_type.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(fields) = mapping {
            merge_fields(entry.value_mut(), fields);
        }
        Ok(())
    }

    fn refresh_index(&self) -> AudienceResult<()> {
        self.refreshes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }
}

/// Deep-merge `changes` into `document`: objects merge key by key, any other
/// value replaces what is there.
pub fn merge_fields(document: &mut Value, changes: &FieldChanges) {
    if !document.is_object() {
        *document = Value::Object(Default::default());
    }
    let Value::Object(target) = document else {
        return;
    };
    for (key, value) in changes {
        if let Value::Object(nested) = value {
            if let Some(existing) = target.get_mut(key).filter(|v| v.is_object()) {
                merge_fields(existing, nested);
                continue;
            }
        }
        target.insert(key.clone(), value.clone());
    }
}

/// `"10m"`, `"30s"`, `"1h"` or `"500ms"`; anything else means ten minutes.
fn parse_ttl(ttl: &str) -> Duration {
    let digits = ttl.chars().take_while(char::is_ascii_digit).count();
    let Ok(amount) = ttl[..digits].parse::<u64>() else {
        return DEFAULT_SCROLL_TTL;
    };
    match &ttl[digits..] {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "h" => Duration::from_secs(amount * 3600),
        "d" => Duration::from_secs(amount * 86_400),
        _ => DEFAULT_SCROLL_TTL,
    }
}

/// `sort_by` is a property path with an optional `:asc`/`:desc` suffix;
/// ties and unsorted queries fall back to profile id.
fn sort_profiles(profiles: &mut [Profile], sort_by: Option<&str>) {
    let Some(spec) = sort_by else {
        profiles.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        return;
    };
    let (path, descending) = match spec.rsplit_once(':') {
        Some((path, "desc")) => (path, true),
        Some((path, _)) => (path, false),
        None => (spec, false),
    };
    profiles.sort_by(|a, b| {
        let left = Subject::Profile(a).field(path).unwrap_or(Value::Null);
        let right = Subject::Profile(b).field(path).unwrap_or(Value::Null);
        let ordering = compare_json(&left, &right);
        let ordering = if descending { ordering.reverse() } else { ordering };
        ordering.then_with(|| a.item_id.cmp(&b.item_id))
    });
}

fn compare_json(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded(count: usize) -> InMemoryProfileStore {
        let store = InMemoryProfileStore::new();
        for i in 0..count {
            store.insert(Profile::new(format!("p{i:02}")).with_property("rank", json!(i)));
        }
        store
    }

    #[test]
    fn test_scroll_pages_until_exhausted() {
        let store = seeded(5);
        let all = Condition::new("matchAllCondition");
        let first = store.query(&all, None, 0, 2, Some("1m")).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.total_size, 5);
        let scroll_id = first.scroll_identifier.clone().unwrap();

        let second = store.continue_scroll(&scroll_id, "1m").unwrap().unwrap();
        assert_eq!(second.list[0].item_id, "p02");
        let third = store.continue_scroll(&scroll_id, "1m").unwrap().unwrap();
        assert_eq!(third.len(), 1);
        assert!(third.scroll_identifier.is_none());
        assert!(store.continue_scroll(&scroll_id, "1m").unwrap().is_none());
        assert_eq!(store.scroll_pages_served(), 3);
    }

    #[test]
    fn test_scroll_skips_deleted_pages() {
        let store = seeded(5);
        let first = store
            .query(&Condition::new("matchAllCondition"), None, 0, 2, Some("1m"))
            .unwrap();
        store.remove("p02");
        store.remove("p03");

        let scroll_id = first.scroll_identifier.clone().unwrap();
        let next = store.continue_scroll(&scroll_id, "1m").unwrap().unwrap();
        assert_eq!(next.list.len(), 1);
        assert_eq!(next.list[0].item_id, "p04");
        assert!(next.scroll_identifier.is_none());
    }

    #[test]
    fn test_score_increment_saturates() {
        let store = InMemoryProfileStore::new();
        let mut profile = Profile::new("p1");
        profile.scores.insert("s".to_string(), i64::MAX - 1);
        store.insert(profile);

        store
            .update_by_query_with_script(&[ScriptedUpdate {
                condition: Condition::has_score("s"),
                script: ScoreScript::Increment { scoring_id: "s".to_string(), value: 10 },
            }])
            .unwrap();
        assert_eq!(store.load("p1").unwrap().unwrap().scores["s"], i64::MAX);
    }

    #[test]
    fn test_expired_scroll_fails() {
        let store = seeded(3);
        let first = store
            .query(&Condition::new("matchAllCondition"), None, 0, 1, Some("0s"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(store
            .continue_scroll(first.scroll_identifier.as_deref().unwrap(), "1m")
            .is_err());
    }

    #[test]
    fn test_sorted_offset_query() {
        let store = seeded(4);
        let page = store
            .query(&Condition::new("matchAllCondition"), Some("properties.rank:desc"), 1, 2, None)
            .unwrap();
        let ids: Vec<_> = page.list.iter().map(|p| p.item_id.as_str()).collect();
        assert_eq!(ids, vec!["p02", "p01"]);
        assert!(page.scroll_identifier.is_none());
    }

    #[test]
    fn test_update_merges_nested_objects() {
        let store = InMemoryProfileStore::new();
        let mut profile = Profile::new("p1");
        profile.set_system_property("pastEvents", json!({"a": 1}));
        profile.set_system_property("lastUpdated", json!("old"));
        store.insert(profile);

        let changes = json!({"systemProperties": {"pastEvents": {"b": 2}, "lastUpdated": "new"}});
        assert!(store.update("p1", changes.as_object().unwrap()).unwrap());
        let updated = store.load("p1").unwrap().unwrap();
        assert_eq!(updated.past_event_count("a"), Some(1));
        assert_eq!(updated.past_event_count("b"), Some(2));
        assert_eq!(updated.system_properties["lastUpdated"], "new");

        let failed = store
            .update_batch(&BTreeMap::from([
                ("p1".to_string(), FieldChanges::new()),
                ("ghost".to_string(), FieldChanges::new()),
            ]))
            .unwrap();
        assert_eq!(failed, vec!["ghost"]);
    }

    #[test]
    fn test_validity_rejects_unknown_types() {
        let store = InMemoryProfileStore::new();
        let sample = Profile::new("validation-profile-id");
        assert!(store.is_valid_condition(&Condition::new("matchAllCondition"), &sample));
        assert!(!store.is_valid_condition(&Condition::new("mysteryCondition"), &sample));
        assert!(!store.test_match(&Condition::new("mysteryCondition"), &sample));
    }

    #[test]
    fn test_create_mapping_accumulates() {
        let store = InMemoryProfileStore::new();
        for id in ["a", "b"] {
            store
                .create_mapping(
                    "profile",
                    &json!({"properties": {"scores": {"properties": {id: {"type": "long"}}}}}),
                )
                .unwrap();
        }
        let mapping = store.mapping("profile").unwrap();
        let scores = &mapping["properties"]["scores"]["properties"];
        assert_eq!(scores["a"]["type"], "long");
        assert_eq!(scores["b"]["type"], "long");
    }
}

//! Periodically reloaded snapshot of every segment and scoring definition.
//!
//! Readers clone the current `Arc` and evaluate against it without holding
//! the lock; the refresh task builds a complete snapshot before swapping it
//! in, so a reader never sees half of a reload.

use std::sync::Arc;

use audience_core::error::AudienceResult;
use audience_core::services::{DefinitionStore, ProfileStore, TypeRegistry};
use audience_core::types::{Metadata, Profile, Scoring, Segment, SegmentsAndScores};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::condition_tree::unresolved_types;

/// Immutable view of all definitions at one point in time.
#[derive(Debug, Clone)]
pub struct DefinitionSnapshot {
    pub segments: Vec<Segment>,
    pub scorings: Vec<Scoring>,
    pub loaded_at: DateTime<Utc>,
}

impl Default for DefinitionSnapshot {
    fn default() -> Self {
        Self {
            segments: Vec::new(),
            scorings: Vec::new(),
            loaded_at: Utc::now(),
        }
    }
}

impl DefinitionSnapshot {
    pub fn new(segments: Vec<Segment>, scorings: Vec<Scoring>) -> Self {
        Self {
            segments,
            scorings,
            loaded_at: Utc::now(),
        }
    }

    /// Enabled segments whose condition matches `profile`.
    pub fn matching_segments<'a>(
        &'a self,
        profile: &'a Profile,
        matcher: &'a dyn ProfileStore,
    ) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |segment| {
            segment.metadata.enabled
                && segment
                    .condition
                    .as_ref()
                    .is_some_and(|c| matcher.test_match(c, profile))
        })
    }

    /// Score of `profile` for `scoring`: the weights of matching elements
    /// plus the profile's own modifier for that scoring.
    pub fn score(&self, scoring: &Scoring, profile: &Profile, matcher: &dyn ProfileStore) -> i64 {
        let matched = scoring
            .elements
            .iter()
            .filter(|element| matcher.test_match(&element.condition, profile))
            .fold(0i64, |total, element| total.saturating_add(element.value));
        let modifier = profile
            .score_modifiers()
            .get(&scoring.metadata.id)
            .copied()
            .unwrap_or(0);
        matched.saturating_add(modifier)
    }

    /// Every enabled segment the profile belongs to and its score in every
    /// enabled scoring.
    pub fn classify(&self, profile: &Profile, matcher: &dyn ProfileStore) -> SegmentsAndScores {
        let segments = self
            .matching_segments(profile, matcher)
            .map(|s| s.metadata.id.clone())
            .collect();
        let scores = self
            .scorings
            .iter()
            .filter(|scoring| scoring.metadata.enabled)
            .map(|scoring| (scoring.metadata.id.clone(), self.score(scoring, profile, matcher)))
            .collect();
        SegmentsAndScores { segments, scores }
    }

    pub fn segment_metadatas_for(&self, profile: &Profile, matcher: &dyn ProfileStore) -> Vec<Metadata> {
        self.matching_segments(profile, matcher)
            .map(|s| s.metadata.clone())
            .collect()
    }
}

/// Swappable holder of the current [`DefinitionSnapshot`].
pub struct DefinitionCache {
    current: RwLock<Arc<DefinitionSnapshot>>,
}

impl Default for DefinitionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(DefinitionSnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<DefinitionSnapshot> {
        self.current.read().clone()
    }

    pub fn publish(&self, snapshot: DefinitionSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    /// Reload both definition lists and swap them in. Enabled definitions
    /// with condition types the registry cannot resolve are kept as they are.
    pub fn refresh(
        &self,
        segments: &dyn DefinitionStore<Segment>,
        scorings: &dyn DefinitionStore<Scoring>,
        registry: &dyn TypeRegistry,
    ) -> AudienceResult<Arc<DefinitionSnapshot>> {
        let all_segments = segments.all()?;
        let all_scorings = scorings.all()?;

        for segment in all_segments.iter().filter(|s| s.metadata.enabled) {
            if let Some(condition) = &segment.condition {
                warn_unresolved(condition, registry, "segment", &segment.metadata.id);
            }
        }
        for scoring in all_scorings.iter().filter(|s| s.metadata.enabled) {
            for element in &scoring.elements {
                warn_unresolved(&element.condition, registry, "scoring", &scoring.metadata.id);
            }
        }

        let snapshot = Arc::new(DefinitionSnapshot::new(all_segments, all_scorings));
        *self.current.write() = snapshot.clone();

        metrics::counter!("segmentation.cache.refresh").increment(1);
        debug!(
            segments = snapshot.segments.len(),
            scorings = snapshot.scorings.len(),
            "definition cache refreshed"
        );
        Ok(snapshot)
    }
}

fn warn_unresolved(
    condition: &audience_core::Condition,
    registry: &dyn TypeRegistry,
    kind: &'static str,
    id: &str,
) {
    for type_id in unresolved_types(condition, registry) {
        warn!(kind, id, condition_type = %type_id, "unresolved condition type, definition kept as is");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use audience_core::conditions::Condition;
    use audience_core::types::ScoringElement;
    use audience_store::{BuiltinTypeRegistry, InMemoryDefinitionStore, InMemoryProfileStore};
    use serde_json::json;

    fn age(op: &str, value: i64) -> Condition {
        Condition::profile_property("properties.age", op, Some(json!(value)))
    }

    fn engagement() -> Scoring {
        Scoring::new(
            Metadata::new("acme", "engagement", "Engagement", ""),
            vec![
                ScoringElement { condition: age("greaterThan", 30), value: 5 },
                ScoringElement { condition: age("lessThan", 18), value: 3 },
            ],
        )
    }

    #[test]
    fn test_score_sums_matching_elements() {
        let matcher = InMemoryProfileStore::new();
        let snapshot = DefinitionSnapshot::new(Vec::new(), vec![engagement()]);
        let profile = Profile::new("p").with_property("age", json!(40));

        let result = snapshot.classify(&profile, &matcher);
        assert_eq!(result.scores.get("engagement"), Some(&5));
    }

    #[test]
    fn test_score_adds_modifier() {
        let matcher = InMemoryProfileStore::new();
        let snapshot = DefinitionSnapshot::new(Vec::new(), vec![engagement()]);
        let mut profile = Profile::new("p").with_property("age", json!(40));
        profile.set_system_property("scoreModifiers", json!({"engagement": 2}));

        let result = snapshot.classify(&profile, &matcher);
        assert_eq!(result.scores.get("engagement"), Some(&7));
    }

    #[test]
    fn test_score_saturates() {
        let matcher = InMemoryProfileStore::new();
        let mut scoring = engagement();
        scoring.elements[0].value = i64::MAX;
        scoring.elements.push(ScoringElement { condition: age("greaterThan", 20), value: 1 });
        let mut profile = Profile::new("p").with_property("age", json!(40));
        profile.set_system_property("scoreModifiers", json!({"engagement": 2}));

        let snapshot = DefinitionSnapshot::new(Vec::new(), Vec::new());
        assert_eq!(snapshot.score(&scoring, &profile, &matcher), i64::MAX);
    }

    #[test]
    fn test_disabled_definitions_ignored() {
        let matcher = InMemoryProfileStore::new();
        let mut adults = Segment::new(Metadata::new("acme", "adults", "Adults", ""), age("greaterThan", 30));
        let seniors = Segment::new(Metadata::new("acme", "seniors", "Seniors", ""), age("greaterThan", 30));
        adults.metadata.enabled = false;
        let mut scoring = engagement();
        scoring.metadata.enabled = false;

        let snapshot = DefinitionSnapshot::new(vec![adults, seniors], vec![scoring]);
        let profile = Profile::new("p").with_property("age", json!(70));
        let result = snapshot.classify(&profile, &matcher);
        assert_eq!(result.segments.into_iter().collect::<Vec<_>>(), vec!["seniors"]);
        assert!(result.scores.is_empty());
    }

    #[test]
    fn test_refresh_swaps_snapshot() {
        let segments = InMemoryDefinitionStore::<Segment>::new();
        let scorings = InMemoryDefinitionStore::<Scoring>::new();
        let registry = BuiltinTypeRegistry::new();
        let cache = DefinitionCache::new();

        let before = cache.snapshot();
        assert!(before.segments.is_empty());

        segments
            .save(&Segment::new(
                Metadata::new("acme", "odd", "Odd", ""),
                Condition::new("unknownCondition"),
            ))
            .unwrap();
        scorings.save(&engagement()).unwrap();
        cache.refresh(&segments, &scorings, &registry).unwrap();

        let after = cache.snapshot();
        assert_eq!(after.segments.len(), 1);
        assert_eq!(after.scorings.len(), 1);
        // readers holding the old snapshot are unaffected
        assert!(before.segments.is_empty());
    }
}

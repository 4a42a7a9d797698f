//! Bulk profile maintenance: membership sync, score rescoring and past-event
//! count backfill.
//!
//! Membership updates stream matching profiles page by page through a
//! scroll cursor. Each page is written either one profile at a time or as a
//! single multi-update; ids the store reports as failed are reloaded and
//! retried a bounded number of times, then left for the next full resync.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use audience_core::conditions::{params, BooleanOperator, Condition};
use audience_core::config::SegmentationConfig;
use audience_core::error::AudienceResult;
use audience_core::event_bus::{profile_updated, EventSink};
use audience_core::services::{
    EventStore, FieldChanges, Partition, ProfileStore, ScoreScript, ScriptedUpdate,
};
use audience_core::types::{Profile, Scoring, Segment};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::rule_deriver::PastEventWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Add,
    Remove,
}

impl MembershipChange {
    fn verb(&self) -> &'static str {
        match self {
            MembershipChange::Add => "added to",
            MembershipChange::Remove => "removed from",
        }
    }
}

/// Knobs of the pipeline, lifted from [`SegmentationConfig`].
#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    pub batch_size: usize,
    pub batch_update: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub send_profile_updated_event: bool,
    pub scroll_ttl: String,
    pub aggregate_query_bucket_size: u64,
    pub maximum_ids_query_count: usize,
    pub past_events_disable_partitions: bool,
}

impl From<&SegmentationConfig> for UpdaterSettings {
    fn from(config: &SegmentationConfig) -> Self {
        Self {
            batch_size: config.segment_update_batch_size.max(1),
            batch_update: config.batch_segment_profile_update,
            max_retries: config.max_retries_for_update_profile_segment,
            retry_delay: Duration::from_secs(config.seconds_delay_for_retry_update_profile_segment),
            send_profile_updated_event: config.send_profile_update_event_for_segment_update,
            scroll_ttl: config.scroll_time_validity.clone(),
            aggregate_query_bucket_size: config.aggregate_query_bucket_size.max(1),
            maximum_ids_query_count: config.maximum_ids_query_count,
            past_events_disable_partitions: config.past_events_disable_partitions,
        }
    }
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self::from(&SegmentationConfig::default())
    }
}

/// Apply `change` to the profile's in-memory segment set and build the
/// partial document writing it back.
pub fn membership_changes(
    profile: &mut Profile,
    segment_id: &str,
    change: MembershipChange,
) -> FieldChanges {
    match change {
        MembershipChange::Add => {
            profile.segments.insert(segment_id.to_string());
        }
        MembershipChange::Remove => {
            profile.segments.remove(segment_id);
        }
    }
    profile.touch(Utc::now());

    let mut changes = FieldChanges::new();
    changes.insert("segments".to_string(), json!(profile.segments));
    changes.insert(
        "systemProperties".to_string(),
        Value::Object(profile.system_properties.clone()),
    );
    changes
}

/// Outcome of a past-event count backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub updated: u64,
    pub failed: u64,
}

impl BackfillSummary {
    pub fn absorb(&mut self, other: BackfillSummary) {
        self.updated += other.updated;
        self.failed += other.failed;
    }
}

pub struct ProfileUpdater {
    profiles: Arc<dyn ProfileStore>,
    events: Arc<dyn EventStore>,
    sink: Arc<dyn EventSink>,
    settings: UpdaterSettings,
}

impl ProfileUpdater {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        events: Arc<dyn EventStore>,
        sink: Arc<dyn EventSink>,
        settings: UpdaterSettings,
    ) -> Self {
        Self {
            profiles,
            events,
            sink,
            settings,
        }
    }

    /// Re-sync membership of `segment`: add matching non-members, remove
    /// members that no longer match. A disabled segment loses all members.
    pub fn update_existing_profiles_for_segment(&self, segment: &Segment) -> AudienceResult<u64> {
        let started = Instant::now();
        let segment_id = segment.metadata.id.as_str();
        let membership = Condition::segment_membership(segment_id);

        let updated = match (&segment.condition, segment.metadata.enabled) {
            (Some(condition), true) => {
                let to_add = Condition::boolean(
                    BooleanOperator::And,
                    vec![condition.clone(), Condition::not(membership.clone())],
                );
                let to_remove = Condition::boolean(
                    BooleanOperator::And,
                    vec![membership, Condition::not(condition.clone())],
                );
                self.update_profiles_segment(&to_add, segment_id, MembershipChange::Add)?
                    + self.update_profiles_segment(&to_remove, segment_id, MembershipChange::Remove)?
            }
            _ => self.update_profiles_segment(&membership, segment_id, MembershipChange::Remove)?,
        };

        info!(
            segment_id,
            updated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "profiles updated for segment"
        );
        Ok(updated)
    }

    /// Drop `segment_id` from every profile currently holding it.
    pub fn remove_segment_from_profiles(&self, segment_id: &str) -> AudienceResult<u64> {
        let started = Instant::now();
        let removed = self.update_profiles_segment(
            &Condition::segment_membership(segment_id),
            segment_id,
            MembershipChange::Remove,
        )?;
        info!(
            segment_id,
            removed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "removed segment from profiles"
        );
        Ok(removed)
    }

    /// Stream every profile matching `condition` and apply `change`.
    pub fn update_profiles_segment(
        &self,
        condition: &Condition,
        segment_id: &str,
        change: MembershipChange,
    ) -> AudienceResult<u64> {
        let mut updated = 0u64;
        let mut page = Some(self.profiles.query(
            condition,
            None,
            0,
            self.settings.batch_size,
            Some(&self.settings.scroll_ttl),
        )?);

        while let Some(mut profiles) = page.take().filter(|p| !p.is_empty()) {
            let started = Instant::now();
            let failed: BTreeSet<String> = if self.settings.batch_update {
                self.batch_update_profiles_segment(segment_id, &mut profiles.list, change)?
            } else {
                let mut failed = BTreeSet::new();
                for profile in profiles.list.iter_mut() {
                    let changes = membership_changes(profile, segment_id, change);
                    if !self.profiles.update(&profile.item_id, &changes)? {
                        warn!(profile_id = %profile.item_id, segment_id, "profile segment update rejected");
                        metrics::counter!("segmentation.profiles.update_failed").increment(1);
                        failed.insert(profile.item_id.clone());
                    }
                }
                failed
            };

            let mutated: Vec<&Profile> = profiles
                .list
                .iter()
                .filter(|profile| !failed.contains(&profile.item_id))
                .collect();
            if self.settings.send_profile_updated_event {
                for profile in &mutated {
                    self.sink.send(profile_updated(profile));
                }
            }

            updated += mutated.len() as u64;
            metrics::counter!("segmentation.profiles.updated").increment(mutated.len() as u64);
            info!(
                count = mutated.len(),
                failed = failed.len(),
                segment_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "profiles {} segment",
                change.verb()
            );

            page = match profiles.scroll_identifier.as_deref() {
                Some(scroll_id) => {
                    let ttl = profiles
                        .scroll_time_validity
                        .as_deref()
                        .unwrap_or(&self.settings.scroll_ttl);
                    self.profiles.continue_scroll(scroll_id, ttl)?
                }
                None => None,
            };
        }

        Ok(updated)
    }

    /// Write one page as a multi-update and retry what failed. Returns the
    /// ids still not updated once retries are exhausted.
    fn batch_update_profiles_segment(
        &self,
        segment_id: &str,
        profiles: &mut [Profile],
        change: MembershipChange,
    ) -> AudienceResult<BTreeSet<String>> {
        let batch: BTreeMap<String, FieldChanges> = profiles
            .iter_mut()
            .map(|profile| {
                let changes = membership_changes(profile, segment_id, change);
                (profile.item_id.clone(), changes)
            })
            .collect();

        let failed = self.profiles.update_batch(&batch)?;
        Ok(failed
            .into_iter()
            .filter(|profile_id| !self.retry_failed_segment_update(profile_id, segment_id, change))
            .collect())
    }

    /// Reload and re-apply a failed membership change up to `max_retries`
    /// times. Returns whether the profile ended up updated.
    pub fn retry_failed_segment_update(
        &self,
        profile_id: &str,
        segment_id: &str,
        change: MembershipChange,
    ) -> bool {
        for attempt in 1..=self.settings.max_retries {
            if !self.settings.retry_delay.is_zero() {
                std::thread::sleep(self.settings.retry_delay);
            }
            warn!(profile_id, segment_id, attempt, "retry updating profile segment");
            metrics::counter!("segmentation.retry.attempts").increment(1);

            match self.try_segment_update(profile_id, segment_id, change) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!(profile_id, segment_id, error = %e, "retry failed"),
            }
        }

        error!(
            profile_id,
            segment_id,
            retries = self.settings.max_retries,
            "profile segment update failed, profile left stale until next resync"
        );
        metrics::counter!("segmentation.profiles.update_failed").increment(1);
        false
    }

    fn try_segment_update(
        &self,
        profile_id: &str,
        segment_id: &str,
        change: MembershipChange,
    ) -> AudienceResult<bool> {
        let Some(mut profile) = self.profiles.load(profile_id)? else {
            debug!(profile_id, "profile gone, nothing to retry");
            return Ok(true);
        };
        let changes = membership_changes(&mut profile, segment_id, change);
        self.profiles.update(profile_id, &changes)
    }

    /// Rescore every profile for `scoring`: reset each existing or modified
    /// score to the profile's modifier (or drop it), then add the weight of
    /// every matching element. A disabled scoring drops the score field from
    /// every profile holding one.
    pub fn update_existing_profiles_for_scoring(&self, scoring: &Scoring) -> AudienceResult<()> {
        let started = Instant::now();
        let scoring_id = scoring.metadata.id.clone();

        let updates = if scoring.metadata.enabled {
            let has_modifier = Condition::profile_property(
                &format!("systemProperties.scoreModifiers.{scoring_id}"),
                "exists",
                None,
            );
            let mut updates = vec![ScriptedUpdate {
                condition: Condition::boolean(
                    BooleanOperator::Or,
                    vec![Condition::has_score(&scoring_id), has_modifier],
                ),
                script: ScoreScript::ResetToModifier {
                    scoring_id: scoring_id.clone(),
                },
            }];
            updates.extend(scoring.elements.iter().map(|element| ScriptedUpdate {
                condition: element.condition.clone(),
                script: ScoreScript::Increment {
                    scoring_id: scoring_id.clone(),
                    value: element.value,
                },
            }));
            updates
        } else {
            vec![ScriptedUpdate {
                condition: Condition::has_score(&scoring_id),
                script: ScoreScript::Remove {
                    scoring_id: scoring_id.clone(),
                },
            }]
        };

        self.profiles.update_by_query_with_script(&updates)?;
        info!(
            scoring_id = %scoring_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "updated scoring for profiles"
        );
        Ok(())
    }

    pub fn remove_scoring_from_profiles(&self, scoring_id: &str) -> AudienceResult<()> {
        let started = Instant::now();
        self.profiles.update_by_query_with_script(&[ScriptedUpdate {
            condition: Condition::has_score(scoring_id),
            script: ScoreScript::Remove {
                scoring_id: scoring_id.to_string(),
            },
        }])?;
        info!(
            scoring_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "removed scoring from profiles"
        );
        Ok(())
    }

    /// Recount `event_condition` inside the window of `window_condition` and
    /// store the counts under the window's `generatedPropertyKey`.
    pub fn backfill_past_event_counts(
        &self,
        event_condition: &Condition,
        window_condition: &Condition,
        force_refresh: bool,
    ) -> AudienceResult<BackfillSummary> {
        let started = Instant::now();
        let Some(key) = window_condition.string_parameter(params::GENERATED_PROPERTY_KEY) else {
            warn!("past event window carries no generated key, backfill skipped");
            return Ok(BackfillSummary::default());
        };
        let scoped = PastEventWindow::from_condition(window_condition).scope(event_condition);

        let summary = if self.settings.past_events_disable_partitions {
            let counts = self.events.count_by_profile(
                &scoped,
                None,
                Some(self.settings.maximum_ids_query_count),
            )?;
            self.write_past_event_counts(&counts, key)
        } else {
            let cardinality = self.events.distinct_profile_count(&scoped)?;
            let parts = u32::try_from(cardinality / self.settings.aggregate_query_bucket_size)
                .unwrap_or(u32::MAX)
                .saturating_add(2);
            let mut summary = BackfillSummary::default();
            for index in 0..parts {
                let counts = self.events.count_by_profile(
                    &scoped,
                    Some(Partition {
                        index,
                        count: parts,
                    }),
                    None,
                )?;
                summary.absorb(self.write_past_event_counts(&counts, key));
            }
            summary
        };

        if force_refresh && summary.updated > 0 {
            self.profiles.refresh_index()?;
        }

        info!(
            key,
            updated = summary.updated,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "profiles updated for past event condition"
        );
        Ok(summary)
    }

    fn write_past_event_counts(&self, counts: &BTreeMap<String, u64>, key: &str) -> BackfillSummary {
        let mut summary = BackfillSummary::default();
        let mut batch: BTreeMap<String, FieldChanges> = BTreeMap::new();
        let eligible: Vec<(&String, &u64)> =
            counts.iter().filter(|(id, _)| !id.starts_with('_')).collect();
        let total = eligible.len();

        for (position, (profile_id, count)) in eligible.into_iter().enumerate() {
            let mut changes = FieldChanges::new();
            changes.insert(
                "systemProperties".to_string(),
                json!({
                    "pastEvents": { key: count },
                    "lastUpdated": Utc::now().to_rfc3339(),
                }),
            );
            batch.insert(profile_id.clone(), changes);

            if batch.len() == self.settings.batch_size || position + 1 == total {
                match self.profiles.update_batch(&batch) {
                    Ok(failed) => {
                        for profile_id in &failed {
                            error!(profile_id = %profile_id, key, "past event count not written");
                        }
                        summary.updated += (batch.len() - failed.len()) as u64;
                        summary.failed += failed.len() as u64;
                    }
                    Err(e) => {
                        error!(count = batch.len(), error = %e, "error updating profiles for past event system properties");
                        summary.failed += batch.len() as u64;
                    }
                }
                batch.clear();
            }
        }
        if summary.failed > 0 {
            metrics::counter!("segmentation.profiles.update_failed").increment(summary.failed);
        }
        summary
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use audience_core::event_bus::capture_sink;
    use audience_core::services::ProfileStore;
    use audience_core::types::{Event, Metadata, ScoringElement};
    use audience_core::conditions::types;
    use audience_store::{InMemoryEventStore, InMemoryProfileStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(batch_size: usize) -> UpdaterSettings {
        UpdaterSettings {
            batch_size,
            retry_delay: Duration::ZERO,
            ..UpdaterSettings::default()
        }
    }

    fn adult() -> Condition {
        Condition::profile_property("properties.age", "greaterThan", Some(json!(30)))
    }

    fn seed(store: &InMemoryProfileStore, count: usize, age: i64) {
        for i in 0..count {
            store.insert(Profile::new(format!("p{i:05}")).with_property("age", json!(age)));
        }
    }

    /// Wraps the in-memory store and fails writes for chosen ids.
    struct FlakyStore {
        inner: InMemoryProfileStore,
        failing: BTreeSet<String>,
        attempts: AtomicUsize,
    }

    impl ProfileStore for FlakyStore {
        fn test_match(&self, condition: &Condition, profile: &Profile) -> bool {
            self.inner.test_match(condition, profile)
        }
        fn is_valid_condition(&self, condition: &Condition, sample: &Profile) -> bool {
            self.inner.is_valid_condition(condition, sample)
        }
        fn query(
            &self,
            condition: &Condition,
            sort_by: Option<&str>,
            offset: usize,
            size: usize,
            scroll_ttl: Option<&str>,
        ) -> AudienceResult<audience_core::PartialList<Profile>> {
            self.inner.query(condition, sort_by, offset, size, scroll_ttl)
        }
        fn continue_scroll(
            &self,
            scroll_id: &str,
            scroll_ttl: &str,
        ) -> AudienceResult<Option<audience_core::PartialList<Profile>>> {
            self.inner.continue_scroll(scroll_id, scroll_ttl)
        }
        fn query_count(&self, condition: &Condition) -> AudienceResult<u64> {
            self.inner.query_count(condition)
        }
        fn load(&self, id: &str) -> AudienceResult<Option<Profile>> {
            self.inner.load(id)
        }
        fn update(&self, id: &str, changes: &FieldChanges) -> AudienceResult<bool> {
            if self.failing.contains(id) {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                return Ok(false);
            }
            self.inner.update(id, changes)
        }
        fn update_batch(
            &self,
            changes: &BTreeMap<String, FieldChanges>,
        ) -> AudienceResult<Vec<String>> {
            let mut failed = Vec::new();
            for (id, fields) in changes {
                if self.failing.contains(id) {
                    self.attempts.fetch_add(1, Ordering::SeqCst);
                    failed.push(id.clone());
                } else {
                    self.inner.update(id, fields)?;
                }
            }
            Ok(failed)
        }
        fn update_by_query_with_script(&self, updates: &[ScriptedUpdate]) -> AudienceResult<()> {
            self.inner.update_by_query_with_script(updates)
        }
        fn create_mapping(&self, item_type: &str, mapping: &Value) -> AudienceResult<()> {
            self.inner.create_mapping(item_type, mapping)
        }
        fn refresh_index(&self) -> AudienceResult<()> {
            self.inner.refresh_index()
        }
    }

    #[test]
    fn test_membership_changes_idempotent() {
        let mut profile = Profile::new("p1");
        membership_changes(&mut profile, "s", MembershipChange::Add);
        membership_changes(&mut profile, "s", MembershipChange::Add);
        assert_eq!(profile.segments, BTreeSet::from(["s".to_string()]));

        let changes = membership_changes(&mut profile, "s", MembershipChange::Remove);
        membership_changes(&mut profile, "s", MembershipChange::Remove);
        assert!(profile.segments.is_empty());
        assert_eq!(changes["segments"], json!([]));
        assert!(changes["systemProperties"]["lastUpdated"].is_string());
    }

    #[test]
    fn test_pages_and_notifications() {
        let store = Arc::new(InMemoryProfileStore::new());
        seed(&store, 2500, 40);
        let sink = capture_sink();
        let updater = ProfileUpdater::new(
            store.clone(),
            Arc::new(InMemoryEventStore::new()),
            sink.clone(),
            settings(1000),
        );

        let updated = updater
            .update_profiles_segment(&adult(), "adults", MembershipChange::Add)
            .unwrap();
        assert_eq!(updated, 2500);
        assert_eq!(store.scroll_pages_served(), 3);
        assert_eq!(sink.count(), 2500);
        assert_eq!(sink.count_for("p00042"), 1);
        assert!(store.load("p02499").unwrap().unwrap().segments.contains("adults"));
    }

    #[test]
    fn test_events_can_be_disabled() {
        let store = Arc::new(InMemoryProfileStore::new());
        seed(&store, 10, 40);
        let sink = capture_sink();
        let updater = ProfileUpdater::new(
            store,
            Arc::new(InMemoryEventStore::new()),
            sink.clone(),
            UpdaterSettings {
                send_profile_updated_event: false,
                ..settings(4)
            },
        );
        let updated = updater
            .update_profiles_segment(&adult(), "adults", MembershipChange::Add)
            .unwrap();
        assert_eq!(updated, 10);
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_segment_sync_adds_and_removes() {
        let store = Arc::new(InMemoryProfileStore::new());
        store.insert(Profile::new("young").with_property("age", json!(20)));
        store.insert(Profile::new("old").with_property("age", json!(50)));
        let mut stale = Profile::new("stale").with_property("age", json!(10));
        stale.segments.insert("adults".to_string());
        store.insert(stale);

        let updater = ProfileUpdater::new(
            store.clone(),
            Arc::new(InMemoryEventStore::new()),
            capture_sink(),
            settings(100),
        );
        let mut segment = Segment::new(Metadata::new("acme", "adults", "Adults", ""), adult());
        updater.update_existing_profiles_for_segment(&segment).unwrap();

        assert!(store.load("old").unwrap().unwrap().segments.contains("adults"));
        assert!(store.load("young").unwrap().unwrap().segments.is_empty());
        assert!(store.load("stale").unwrap().unwrap().segments.is_empty());

        segment.metadata.enabled = false;
        updater.update_existing_profiles_for_segment(&segment).unwrap();
        assert!(store.load("old").unwrap().unwrap().segments.is_empty());
    }

    #[test]
    fn test_retry_bounded() {
        let inner = InMemoryProfileStore::new();
        seed(&inner, 5, 40);
        let store = Arc::new(FlakyStore {
            inner,
            failing: BTreeSet::from(["p00003".to_string()]),
            attempts: AtomicUsize::new(0),
        });
        let updater = ProfileUpdater::new(
            store.clone(),
            Arc::new(InMemoryEventStore::new()),
            capture_sink(),
            UpdaterSettings {
                batch_update: true,
                max_retries: 3,
                ..settings(100)
            },
        );

        let updated = updater
            .update_profiles_segment(&adult(), "adults", MembershipChange::Add)
            .unwrap();
        assert_eq!(updated, 4);
        // one batched attempt plus three retries
        assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
        assert!(store.load("p00003").unwrap().unwrap().segments.is_empty());
        assert!(store.load("p00004").unwrap().unwrap().segments.contains("adults"));
    }

    #[test]
    fn test_retry_disabled_by_default() {
        let inner = InMemoryProfileStore::new();
        seed(&inner, 2, 40);
        let store = Arc::new(FlakyStore {
            inner,
            failing: BTreeSet::from(["p00000".to_string()]),
            attempts: AtomicUsize::new(0),
        });
        let updater = ProfileUpdater::new(
            store.clone(),
            Arc::new(InMemoryEventStore::new()),
            capture_sink(),
            UpdaterSettings {
                batch_update: true,
                ..settings(100)
            },
        );
        updater
            .update_profiles_segment(&adult(), "adults", MembershipChange::Add)
            .unwrap();
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scoring_rescore_and_modifier() {
        let store = Arc::new(InMemoryProfileStore::new());
        store.insert(Profile::new("match").with_property("age", json!(40)));
        let mut with_modifier = Profile::new("modified").with_property("age", json!(40));
        with_modifier.set_system_property("scoreModifiers", json!({"engagement": 2}));
        with_modifier.scores.insert("engagement".to_string(), 99);
        store.insert(with_modifier);
        store.insert(Profile::new("miss").with_property("age", json!(10)));

        let updater = ProfileUpdater::new(
            store.clone(),
            Arc::new(InMemoryEventStore::new()),
            capture_sink(),
            settings(100),
        );
        let scoring = Scoring::new(
            Metadata::new("acme", "engagement", "Engagement", ""),
            vec![
                ScoringElement { condition: adult(), value: 5 },
                ScoringElement {
                    condition: Condition::profile_property("properties.age", "lessThan", Some(json!(0))),
                    value: 3,
                },
            ],
        );
        updater.update_existing_profiles_for_scoring(&scoring).unwrap();

        assert_eq!(store.load("match").unwrap().unwrap().scores.get("engagement"), Some(&5));
        assert_eq!(store.load("modified").unwrap().unwrap().scores.get("engagement"), Some(&7));
        assert_eq!(store.load("miss").unwrap().unwrap().scores.get("engagement"), None);

        updater.remove_scoring_from_profiles("engagement").unwrap();
        assert!(store.load("match").unwrap().unwrap().scores.is_empty());
    }

    #[test]
    fn test_disabled_scoring_drops_scores_and_ignores_modifiers() {
        let store = Arc::new(InMemoryProfileStore::new());
        let mut scored = Profile::new("scored").with_property("age", json!(40));
        scored.scores.insert("engagement".to_string(), 5);
        store.insert(scored);
        let mut modifier_only = Profile::new("modifier-only").with_property("age", json!(40));
        modifier_only.set_system_property("scoreModifiers", json!({"engagement": 2}));
        store.insert(modifier_only);

        let updater = ProfileUpdater::new(
            store.clone(),
            Arc::new(InMemoryEventStore::new()),
            capture_sink(),
            settings(100),
        );
        let mut scoring = Scoring::new(
            Metadata::new("acme", "engagement", "Engagement", ""),
            vec![ScoringElement { condition: adult(), value: 5 }],
        );
        scoring.metadata.enabled = false;
        updater.update_existing_profiles_for_scoring(&scoring).unwrap();

        assert!(store.load("scored").unwrap().unwrap().scores.is_empty());
        assert!(store.load("modifier-only").unwrap().unwrap().scores.is_empty());
    }

    #[test]
    fn test_past_event_backfill_partitions() {
        let store = Arc::new(InMemoryProfileStore::new());
        let events = Arc::new(InMemoryEventStore::new());
        for i in 0..5 {
            store.insert(Profile::new(format!("p{i}")));
            for n in 0..=i {
                events.insert(Event {
                    item_id: format!("e{i}-{n}"),
                    event_type: "view".to_string(),
                    profile_id: format!("p{i}"),
                    time_stamp: Utc::now(),
                    properties: Default::default(),
                });
            }
        }

        let window = Condition::new(types::PAST_EVENT)
            .with_parameter(params::NUMBER_OF_DAYS, 7i64)
            .with_parameter(params::GENERATED_PROPERTY_KEY, "eventTriggeredtest");
        let trigger = Condition::new(types::EVENT_TYPE).with_parameter(params::EVENT_TYPE_ID, "view");

        for disable_partitions in [false, true] {
            let updater = ProfileUpdater::new(
                store.clone(),
                events.clone(),
                capture_sink(),
                UpdaterSettings {
                    aggregate_query_bucket_size: 2,
                    past_events_disable_partitions: disable_partitions,
                    ..settings(2)
                },
            );
            let summary = updater.backfill_past_event_counts(&trigger, &window, true).unwrap();
            assert_eq!(summary, BackfillSummary { updated: 5, failed: 0 });
            assert_eq!(
                store.load("p3").unwrap().unwrap().past_event_count("eventTriggeredtest"),
                Some(4)
            );
        }
    }

    #[test]
    fn test_failed_profiles_get_no_notification() {
        let inner = InMemoryProfileStore::new();
        seed(&inner, 3, 40);
        let store = Arc::new(FlakyStore {
            inner,
            failing: BTreeSet::from(["p00001".to_string()]),
            attempts: AtomicUsize::new(0),
        });
        let sink = capture_sink();
        for batch_update in [true, false] {
            sink.clear();
            let updater = ProfileUpdater::new(
                store.clone(),
                Arc::new(InMemoryEventStore::new()),
                sink.clone(),
                UpdaterSettings {
                    batch_update,
                    max_retries: 0,
                    ..settings(100)
                },
            );
            let updated = updater
                .update_profiles_segment(&adult(), "adults", MembershipChange::Add)
                .unwrap();
            assert_eq!(updated, 2);
            assert_eq!(sink.count(), 2);
            assert_eq!(sink.count_for("p00001"), 0);
        }
    }

    #[test]
    fn test_backfill_counts_only_written_profiles() {
        let inner = InMemoryProfileStore::new();
        let events = Arc::new(InMemoryEventStore::new());
        for i in 0..3 {
            inner.insert(Profile::new(format!("p{i}")));
            events.insert(Event {
                item_id: format!("e{i}"),
                event_type: "view".to_string(),
                profile_id: format!("p{i}"),
                time_stamp: Utc::now(),
                properties: Default::default(),
            });
        }
        let store = Arc::new(FlakyStore {
            inner,
            failing: BTreeSet::from(["p1".to_string()]),
            attempts: AtomicUsize::new(0),
        });
        let window = Condition::new(types::PAST_EVENT)
            .with_parameter(params::NUMBER_OF_DAYS, 7i64)
            .with_parameter(params::GENERATED_PROPERTY_KEY, "eventTriggeredflaky");
        let trigger = Condition::new(types::EVENT_TYPE).with_parameter(params::EVENT_TYPE_ID, "view");

        let updater = ProfileUpdater::new(store.clone(), events, capture_sink(), settings(10));
        let summary = updater.backfill_past_event_counts(&trigger, &window, false).unwrap();

        assert_eq!(summary, BackfillSummary { updated: 2, failed: 1 });
        assert_eq!(store.load("p1").unwrap().unwrap().past_event_count("eventTriggeredflaky"), None);
        assert_eq!(store.load("p2").unwrap().unwrap().past_event_count("eventTriggeredflaky"), Some(1));
    }
}

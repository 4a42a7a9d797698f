//! Segment and scoring lifecycle: validated saves, impact-checked removals,
//! profile classification and the maintenance entry points.

use std::sync::Arc;

use audience_core::conditions::{params, Condition};
use audience_core::config::SegmentationConfig;
use audience_core::error::{AudienceError, AudienceResult};
use audience_core::event_bus::EventSink;
use audience_core::services::{
    DefinitionStore, EventStore, ProfileStore, RuleStore, TypeRegistry,
};
use audience_core::types::{
    DependentMetadata, Metadata, PartialList, Profile, Scoring, Segment, SegmentsAndScores,
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::cache::{DefinitionCache, DefinitionSnapshot};
use crate::condition_tree::{unresolved_types, Reference};
use crate::dependency::{
    find_dependents, remove_scoring_dependency, remove_segment_dependency, Dependents,
};
use crate::rule_deriver::RuleDeriver;
use crate::scheduler::MaintenanceError;
use crate::updater::{BackfillSummary, ProfileUpdater, UpdaterSettings};

/// Id of the throwaway profile conditions are validated against.
pub const VALIDATION_PROFILE_ID: &str = "validation-profile-id";

/// Everything the service talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub segments: Arc<dyn DefinitionStore<Segment>>,
    pub scorings: Arc<dyn DefinitionStore<Scoring>>,
    pub rules: Arc<dyn RuleStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub events: Arc<dyn EventStore>,
    pub registry: Arc<dyn TypeRegistry>,
    pub sink: Arc<dyn EventSink>,
}

pub struct SegmentService {
    segments: Arc<dyn DefinitionStore<Segment>>,
    scorings: Arc<dyn DefinitionStore<Scoring>>,
    profiles: Arc<dyn ProfileStore>,
    registry: Arc<dyn TypeRegistry>,
    cache: DefinitionCache,
    updater: Arc<ProfileUpdater>,
    deriver: RuleDeriver,
}

impl SegmentService {
    pub fn new(collaborators: Collaborators, config: &SegmentationConfig) -> Self {
        let updater = Arc::new(ProfileUpdater::new(
            collaborators.profiles.clone(),
            collaborators.events,
            collaborators.sink,
            UpdaterSettings::from(config),
        ));
        let deriver = RuleDeriver::new(
            collaborators.rules,
            collaborators.registry.clone(),
            updater.clone(),
        );
        Self {
            segments: collaborators.segments,
            scorings: collaborators.scorings,
            profiles: collaborators.profiles,
            registry: collaborators.registry,
            cache: DefinitionCache::new(),
            updater,
            deriver,
        }
    }

    pub fn snapshot(&self) -> Arc<DefinitionSnapshot> {
        self.cache.snapshot()
    }

    // ── Segments ──────────────────────────────────────────────────────────

    /// Validate, derive counting rules, persist, then resync membership.
    pub fn set_segment_definition(&self, mut segment: Segment) -> AudienceResult<()> {
        if segment.metadata.enabled {
            let Some(condition) = segment.condition.as_mut() else {
                return Err(AudienceError::BadSegmentCondition(format!(
                    "enabled segment {} has no condition",
                    segment.metadata.id
                )));
            };
            self.warn_unresolved(condition, "segment", &segment.metadata.id);
            if !self
                .profiles
                .is_valid_condition(condition, &Profile::new(VALIDATION_PROFILE_ID))
            {
                return Err(AudienceError::BadSegmentCondition(segment.metadata.id.clone()));
            }
            if !segment.metadata.missing_plugins {
                let triggers = self.deriver.extract_triggers(condition);
                self.deriver
                    .update_auto_generated_rules(&segment.metadata, &triggers)?;
            }
        }

        self.segments.save(&segment)?;
        info!(segment_id = %segment.metadata.id, enabled = segment.metadata.enabled, "segment saved");
        self.updater.update_existing_profiles_for_segment(&segment)?;
        Ok(())
    }

    pub fn get_segment_definition(&self, segment_id: &str) -> AudienceResult<Option<Segment>> {
        let segment = self.segments.load(segment_id)?;
        if let Some(segment) = &segment {
            if let (true, Some(condition)) = (segment.metadata.enabled, &segment.condition) {
                self.warn_unresolved(condition, "segment", segment_id);
            }
        }
        Ok(segment)
    }

    pub fn get_segment_metadatas(
        &self,
        scope: Option<&str>,
        offset: usize,
        size: usize,
        sort_by: Option<&str>,
    ) -> AudienceResult<PartialList<Metadata>> {
        self.segments.query_metadata(scope, offset, size, sort_by)
    }

    /// Definitions that would be rewritten if `segment_id` were removed.
    pub fn get_segment_dependent_metadata(&self, segment_id: &str) -> DependentMetadata {
        self.dependents_of(&Reference::Segment(segment_id)).metadata()
    }

    /// Remove a segment. With `validate` set and dependents present nothing
    /// changes; otherwise members lose it, dependents are rewritten without
    /// it and the definition is deleted. Returns the dependents either way.
    pub fn remove_segment_definition(
        &self,
        segment_id: &str,
        validate: bool,
    ) -> AudienceResult<DependentMetadata> {
        let reference = Reference::Segment(segment_id);
        let dependents = self.dependents_of(&reference);
        let summary = dependents.metadata();
        if validate && !dependents.is_empty() {
            info!(segment_id, dependents = summary.segments.len() + summary.scorings.len(), "segment removal blocked by dependents");
            return Ok(summary);
        }

        self.updater.remove_segment_from_profiles(segment_id)?;
        self.rewrite_dependents(dependents, &reference)?;

        self.segments.remove(segment_id)?;
        self.deriver.clear_rules_linked_to(segment_id)?;
        info!(segment_id, "segment removed");
        Ok(summary)
    }

    /// Page of the segment's current members; empty for an unknown segment.
    pub fn get_matching_individuals(
        &self,
        segment_id: &str,
        offset: usize,
        size: usize,
        sort_by: Option<&str>,
    ) -> AudienceResult<PartialList<Profile>> {
        if self.get_segment_definition(segment_id)?.is_none() {
            return Ok(PartialList::empty());
        }
        self.profiles.query(
            &Condition::segment_membership(segment_id),
            sort_by,
            offset,
            size,
            None,
        )
    }

    pub fn get_matching_individuals_count(&self, segment_id: &str) -> AudienceResult<u64> {
        if self.get_segment_definition(segment_id)?.is_none() {
            return Ok(0);
        }
        self.profiles
            .query_count(&Condition::segment_membership(segment_id))
    }

    // ── Classification ────────────────────────────────────────────────────

    pub fn get_segments_and_scores_for_profile(&self, profile: &Profile) -> SegmentsAndScores {
        self.cache.snapshot().classify(profile, self.profiles.as_ref())
    }

    pub fn is_profile_in_segment(&self, profile: &Profile, segment_id: &str) -> bool {
        self.get_segments_and_scores_for_profile(profile)
            .segments
            .contains(segment_id)
    }

    pub fn get_segment_metadatas_for_profile(&self, profile: &Profile) -> Vec<Metadata> {
        self.cache
            .snapshot()
            .segment_metadatas_for(profile, self.profiles.as_ref())
    }

    // ── Scorings ──────────────────────────────────────────────────────────

    /// Validate, derive counting rules across all elements, persist, map the
    /// score field, then rescore every profile.
    pub fn set_scoring_definition(&self, mut scoring: Scoring) -> AudienceResult<()> {
        if scoring.metadata.enabled {
            let validation_profile = Profile::new(VALIDATION_PROFILE_ID);
            let mut triggers = Vec::new();
            for element in scoring.elements.iter_mut() {
                self.warn_unresolved(&element.condition, "scoring", &scoring.metadata.id);
                if !self
                    .profiles
                    .is_valid_condition(&element.condition, &validation_profile)
                {
                    return Err(AudienceError::BadScoringCondition(scoring.metadata.id.clone()));
                }
                if !scoring.metadata.missing_plugins {
                    triggers.extend(self.deriver.extract_triggers(&mut element.condition));
                }
            }
            if !scoring.metadata.missing_plugins {
                self.deriver
                    .update_auto_generated_rules(&scoring.metadata, &triggers)?;
            }
        }

        self.scorings.save(&scoring)?;
        self.profiles.create_mapping(
            Profile::ITEM_TYPE,
            &json!({
                "properties": {
                    "scores": {
                        "properties": { scoring.metadata.id.as_str(): { "type": "long" } }
                    }
                }
            }),
        )?;
        info!(scoring_id = %scoring.metadata.id, enabled = scoring.metadata.enabled, "scoring saved");
        self.updater.update_existing_profiles_for_scoring(&scoring)?;
        Ok(())
    }

    /// Save a new enabled scoring with no elements.
    pub fn create_scoring_definition(
        &self,
        scope: &str,
        scoring_id: &str,
        name: &str,
        description: &str,
    ) -> AudienceResult<()> {
        let metadata = Metadata::new(scope, scoring_id, name, description);
        self.set_scoring_definition(Scoring::new(metadata, Vec::new()))
    }

    pub fn get_scoring_definition(&self, scoring_id: &str) -> AudienceResult<Option<Scoring>> {
        let scoring = self.scorings.load(scoring_id)?;
        if let Some(scoring) = scoring.as_ref().filter(|s| s.metadata.enabled) {
            for element in &scoring.elements {
                self.warn_unresolved(&element.condition, "scoring", scoring_id);
            }
        }
        Ok(scoring)
    }

    pub fn get_scoring_metadatas(
        &self,
        scope: Option<&str>,
        offset: usize,
        size: usize,
        sort_by: Option<&str>,
    ) -> AudienceResult<PartialList<Metadata>> {
        self.scorings.query_metadata(scope, offset, size, sort_by)
    }

    pub fn get_scoring_dependent_metadata(&self, scoring_id: &str) -> DependentMetadata {
        self.dependents_of(&Reference::Scoring(scoring_id)).metadata()
    }

    pub fn remove_scoring_definition(
        &self,
        scoring_id: &str,
        validate: bool,
    ) -> AudienceResult<DependentMetadata> {
        let reference = Reference::Scoring(scoring_id);
        let dependents = self.dependents_of(&reference);
        let summary = dependents.metadata();
        if validate && !dependents.is_empty() {
            info!(scoring_id, "scoring removal blocked by dependents");
            return Ok(summary);
        }

        self.updater.remove_scoring_from_profiles(scoring_id)?;
        self.rewrite_dependents(dependents, &reference)?;

        self.scorings.remove(scoring_id)?;
        self.deriver.clear_rules_linked_to(scoring_id)?;
        info!(scoring_id, "scoring removed");
        Ok(summary)
    }

    // ── Maintenance ───────────────────────────────────────────────────────

    pub fn refresh_definitions(&self) -> AudienceResult<()> {
        self.cache.refresh(
            self.segments.as_ref(),
            self.scorings.as_ref(),
            self.registry.as_ref(),
        )?;
        Ok(())
    }

    /// Recount every counting rule with a sliding window. Profiles whose
    /// count could not be written make the pass incomplete.
    pub fn recompute_past_event_rules(&self) -> Result<usize, MaintenanceError> {
        let recount = self.deriver.recompute_relative_windows()?;
        let BackfillSummary { updated, failed } = recount.profiles;
        if failed > 0 {
            return Err(MaintenanceError::Incomplete {
                failed: usize::try_from(failed).unwrap_or(usize::MAX),
                total: usize::try_from(updated + failed).unwrap_or(usize::MAX),
            });
        }
        Ok(recount.rules)
    }

    /// Resync membership of enabled segments using date expressions, whose
    /// result drifts with the calendar. Keeps going past failing segments.
    pub fn recompute_date_expr_segments(&self) -> Result<usize, MaintenanceError> {
        let snapshot = self.cache.snapshot();
        let candidates: Vec<&Segment> = snapshot
            .segments
            .iter()
            .filter(|segment| segment.metadata.enabled && uses_date_expression(segment))
            .collect();

        let total = candidates.len();
        let mut failed = 0;
        for segment in candidates {
            if let Err(e) = self.updater.update_existing_profiles_for_segment(segment) {
                error!(segment_id = %segment.metadata.id, error = %e, "date expression resync failed");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(MaintenanceError::Incomplete { failed, total });
        }
        Ok(total)
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn dependents_of(&self, reference: &Reference<'_>) -> Dependents {
        let snapshot = self.cache.snapshot();
        find_dependents(reference, &snapshot.segments, &snapshot.scorings)
    }

    fn rewrite_dependents(
        &self,
        dependents: Dependents,
        reference: &Reference<'_>,
    ) -> AudienceResult<()> {
        for segment in &dependents.segments {
            let rewritten = remove_segment_dependency(segment, reference);
            if rewritten.emptied {
                self.deriver.clear_rules_linked_to(&segment.metadata.id)?;
                warn!(segment_id = %segment.metadata.id, removed = reference.id(), "segment condition emptied, segment disabled");
            }
            self.set_segment_definition(rewritten.definition)?;
        }
        for scoring in &dependents.scorings {
            let rewritten = remove_scoring_dependency(scoring, reference);
            if rewritten.emptied {
                self.deriver.clear_rules_linked_to(&scoring.metadata.id)?;
                warn!(scoring_id = %scoring.metadata.id, removed = reference.id(), "scoring emptied, scoring disabled");
            }
            self.set_scoring_definition(rewritten.definition)?;
        }
        Ok(())
    }

    fn warn_unresolved(&self, condition: &Condition, kind: &'static str, id: &str) {
        for type_id in unresolved_types(condition, self.registry.as_ref()) {
            warn!(kind, id, condition_type = %type_id, "could not resolve condition type");
        }
    }
}

fn uses_date_expression(segment: &Segment) -> bool {
    segment
        .condition
        .as_ref()
        .and_then(|c| serde_json::to_string(c).ok())
        .is_some_and(|text| text.contains(params::PROPERTY_VALUE_DATE_EXPR))
}

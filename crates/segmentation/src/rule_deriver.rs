//! Auto-generated past-event counting rules.
//!
//! A segment or scoring may embed "event X happened in window W" clauses.
//! Each distinct (trigger, window) pair becomes one hidden rule whose id is
//! a content hash of the pair; the same hash is the profile system-property
//! key under which the running count lives. Definitions sharing a clause
//! share the rule and list themselves in its `linked_items`.

use std::collections::BTreeSet;
use std::sync::Arc;

use audience_core::conditions::{params, types, BooleanOperator, Condition, ParameterValue};
use audience_core::error::AudienceResult;
use audience_core::services::{RuleStore, TypeRegistry, SET_EVENT_OCCURRENCE_COUNT_ACTION};
use audience_core::types::{Action, Metadata, Rule, SYSTEM_SCOPE};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::condition_tree::is_past_event_trigger;
use crate::updater::{BackfillSummary, ProfileUpdater};

pub const GENERATED_KEY_PREFIX: &str = "eventTriggered";

/// Time window read off the parent of a trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PastEventWindow {
    pub number_of_days: Option<i64>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

impl PastEventWindow {
    pub fn from_condition(window: &Condition) -> Self {
        Self {
            number_of_days: window.integer_parameter(params::NUMBER_OF_DAYS),
            from_date: window.string_parameter(params::FROM_DATE).map(str::to_string),
            to_date: window.string_parameter(params::TO_DATE).map(str::to_string),
        }
    }

    /// Relative windows slide every day and need a daily recount.
    pub fn is_relative(&self) -> bool {
        self.number_of_days.is_some()
    }

    /// Event time-stamp bounds, one condition per configured bound.
    pub fn conditions(&self) -> Vec<Condition> {
        let bound = |operator: &str| {
            Condition::new(types::SESSION_PROPERTY)
                .with_parameter(params::PROPERTY_NAME, "timeStamp")
                .with_parameter(params::COMPARISON_OPERATOR, operator)
        };
        let mut bounds = Vec::new();
        if let Some(days) = self.number_of_days {
            bounds.push(
                bound("greaterThan").with_parameter(params::PROPERTY_VALUE, format!("now-{days}d")),
            );
        }
        if let Some(from) = &self.from_date {
            bounds.push(
                bound("greaterThanOrEqualTo")
                    .with_parameter(params::PROPERTY_VALUE_DATE, from.as_str()),
            );
        }
        if let Some(to) = &self.to_date {
            bounds.push(
                bound("lessThanOrEqualTo").with_parameter(params::PROPERTY_VALUE_DATE, to.as_str()),
            );
        }
        bounds
    }

    /// `trigger AND <window bounds>`.
    pub fn scope(&self, trigger: &Condition) -> Condition {
        let mut subs = vec![trigger.clone()];
        subs.extend(self.conditions());
        Condition::boolean(BooleanOperator::And, subs)
    }
}

/// Canonical key source. Field order is alphabetical, conditions keep
/// their parameters in sorted maps and dates are rendered in one format, so
/// equal inputs serialize identically.
#[derive(Serialize)]
struct KeySource<'a> {
    condition: &'a Condition,
    #[serde(rename = "fromDate", skip_serializing_if = "Option::is_none")]
    from_date: Option<String>,
    #[serde(rename = "numberOfDays")]
    number_of_days: Option<i64>,
    #[serde(rename = "toDate", skip_serializing_if = "Option::is_none")]
    to_date: Option<String>,
}

/// RFC 3339 UTC for absolute dates; date expressions such as `now-7d` are
/// kept as written.
fn canonical_date(text: &str) -> String {
    let parsed = DateTime::parse_from_rfc3339(text)
        .map(|date| date.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|day| day.and_hms_opt(0, 0, 0))
                .map(|midnight| midnight.and_utc())
        });
    match parsed {
        Some(date) => date.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        None => text.to_string(),
    }
}

/// Content-addressed rule id / profile property key for a trigger+window.
pub fn generated_property_key(
    trigger: &Condition,
    window: &PastEventWindow,
) -> Result<String, serde_json::Error> {
    let source = KeySource {
        condition: trigger,
        from_date: window.from_date.as_deref().map(canonical_date),
        number_of_days: window.number_of_days,
        to_date: window.to_date.as_deref().map(canonical_date),
    };
    let canonical = serde_json::to_string(&source)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{GENERATED_KEY_PREFIX}{}", hex::encode(digest)))
}

/// A past-event clause found in a definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub key: String,
    /// The event-class subtree being counted.
    pub event_condition: Condition,
    /// Parent condition holding the window and the generated key.
    pub window_condition: Condition,
}

/// Rules recounted by the daily pass and the profiles they touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecountSummary {
    pub rules: usize,
    pub profiles: BackfillSummary,
}

pub struct RuleDeriver {
    rules: Arc<dyn RuleStore>,
    registry: Arc<dyn TypeRegistry>,
    updater: Arc<ProfileUpdater>,
}

impl RuleDeriver {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        registry: Arc<dyn TypeRegistry>,
        updater: Arc<ProfileUpdater>,
    ) -> Self {
        Self {
            rules,
            registry,
            updater,
        }
    }

    /// Find every trigger under `condition` and stamp its key onto the parent
    /// as `generatedPropertyKey`.
    pub fn extract_triggers(&self, condition: &mut Condition) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        if is_past_event_trigger(condition, self.registry.as_ref()) {
            warn!(
                condition_type = %condition.type_id,
                "event condition at tree root has no window, skipping"
            );
            return triggers;
        }
        self.collect_triggers(condition, &mut triggers);
        triggers
    }

    fn collect_triggers(&self, condition: &mut Condition, triggers: &mut Vec<Trigger>) {
        let mut found = Vec::new();
        for value in condition.parameter_values.values_mut() {
            match value {
                ParameterValue::Condition(child) => self.visit(child, &mut found, triggers),
                ParameterValue::Conditions(children) => {
                    for child in children.iter_mut() {
                        self.visit(child, &mut found, triggers);
                    }
                }
                ParameterValue::Scalar(_) | ParameterValue::Scalars(_) => {}
            }
        }

        for event_condition in found {
            let window = PastEventWindow::from_condition(condition);
            match generated_property_key(&event_condition, &window) {
                Ok(key) => {
                    condition.set_parameter(params::GENERATED_PROPERTY_KEY, key.as_str());
                    triggers.push(Trigger {
                        key,
                        event_condition,
                        window_condition: condition.clone(),
                    });
                }
                Err(e) => {
                    error!(error = %e, "cannot generate past event key, trigger skipped");
                }
            }
        }
    }

    fn visit(&self, child: &mut Condition, found: &mut Vec<Condition>, triggers: &mut Vec<Trigger>) {
        if is_past_event_trigger(child, self.registry.as_ref()) {
            found.push(child.clone());
        } else {
            self.collect_triggers(child, triggers);
        }
    }

    /// Bring the rules linked to `metadata.id` in line with `triggers`:
    /// create or link the derived ones, unlink the rest.
    pub fn update_auto_generated_rules(
        &self,
        metadata: &Metadata,
        triggers: &[Trigger],
    ) -> AudienceResult<()> {
        let item_id = metadata.id.as_str();
        let previous = self.rules.rules_linked_to(item_id)?;
        let mut derived = BTreeSet::new();

        for trigger in triggers {
            if !derived.insert(trigger.key.clone()) {
                continue;
            }
            match self.rules.get_rule(&trigger.key)? {
                Some(mut rule) => {
                    if rule.linked_items.insert(item_id.to_string()) {
                        self.rules.update_linked_items(&rule.metadata.id, &rule.linked_items)?;
                        debug!(rule_id = %rule.metadata.id, item_id, "linked existing rule");
                    }
                }
                None => {
                    let rule = counting_rule(metadata, trigger);
                    self.rules.set_rule(&rule)?;
                    metrics::counter!("segmentation.rules.created").increment(1);
                    info!(rule_id = %rule.metadata.id, item_id, "created past event rule");

                    self.updater.backfill_past_event_counts(
                        &trigger.event_condition,
                        &trigger.window_condition,
                        true,
                    )?;
                }
            }
        }

        let stale = previous
            .into_iter()
            .filter(|rule| !derived.contains(&rule.metadata.id))
            .collect();
        self.clear_auto_generated_rules(stale, item_id)
    }

    /// Unlink `item_id` from `rules`, deleting those left with no links.
    pub fn clear_auto_generated_rules(&self, rules: Vec<Rule>, item_id: &str) -> AudienceResult<()> {
        for mut rule in rules {
            rule.linked_items.remove(item_id);
            if rule.linked_items.is_empty() {
                self.rules.remove_rule(&rule.metadata.id)?;
                metrics::counter!("segmentation.rules.deleted").increment(1);
                info!(rule_id = %rule.metadata.id, item_id, "deleted unlinked past event rule");
            } else {
                self.rules.update_linked_items(&rule.metadata.id, &rule.linked_items)?;
            }
        }
        Ok(())
    }

    pub fn clear_rules_linked_to(&self, item_id: &str) -> AudienceResult<()> {
        let rules = self.rules.rules_linked_to(item_id)?;
        self.clear_auto_generated_rules(rules, item_id)
    }

    /// Recount every rule with a relative (`numberOfDays`) window.
    pub fn recompute_relative_windows(&self) -> AudienceResult<RecountSummary> {
        let mut recount = RecountSummary::default();
        for metadata in self.rules.rule_metadatas()? {
            let Some(rule) = self.rules.get_rule(&metadata.id)? else {
                continue;
            };
            let Some(event_condition) = rule.condition.as_ref() else {
                continue;
            };
            for action in rule
                .actions
                .iter()
                .filter(|a| a.type_id == SET_EVENT_OCCURRENCE_COUNT_ACTION)
            {
                let Some(window) = action.condition_parameter(params::PAST_EVENT_CONDITION) else {
                    continue;
                };
                if PastEventWindow::from_condition(window).is_relative() {
                    let summary = self
                        .updater
                        .backfill_past_event_counts(event_condition, window, false)?;
                    recount.rules += 1;
                    recount.profiles.absorb(summary);
                }
            }
        }
        Ok(recount)
    }
}

fn counting_rule(owner: &Metadata, trigger: &Trigger) -> Rule {
    let scope = owner.scope.clone().unwrap_or_else(|| SYSTEM_SCOPE.to_string());
    let mut metadata = Metadata::new(
        scope,
        trigger.key.clone(),
        format!("Auto generated rule for {}", owner.name),
        "",
    );
    metadata.hidden = true;

    Rule {
        metadata,
        condition: Some(trigger.event_condition.clone()),
        actions: vec![Action::new(SET_EVENT_OCCURRENCE_COUNT_ACTION)
            .with_parameter(params::PAST_EVENT_CONDITION, trigger.window_condition.clone())],
        linked_items: BTreeSet::from([owner.id.clone()]),
    }
}

//! Impact analysis for definition removal.

use audience_core::types::{DependentMetadata, Scoring, Segment};

use crate::condition_tree::{references, rewrite_removing_reference, Reference};

/// Segments and scorings whose conditions reference a given id.
#[derive(Debug, Clone, Default)]
pub struct Dependents {
    pub segments: Vec<Segment>,
    pub scorings: Vec<Scoring>,
}

impl Dependents {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.scorings.is_empty()
    }

    pub fn metadata(&self) -> DependentMetadata {
        DependentMetadata {
            segments: self.segments.iter().map(|s| s.metadata.clone()).collect(),
            scorings: self.scorings.iter().map(|s| s.metadata.clone()).collect(),
        }
    }
}

/// A dependent definition after the reference was stripped out of it.
#[derive(Debug, Clone)]
pub struct Rewritten<T> {
    pub definition: T,
    /// Nothing was left, so the definition has been disabled.
    pub emptied: bool,
}

pub fn find_dependents(
    reference: &Reference<'_>,
    segments: &[Segment],
    scorings: &[Scoring],
) -> Dependents {
    let segments = segments
        .iter()
        .filter(|segment| {
            segment
                .condition
                .as_ref()
                .is_some_and(|c| references(c, reference))
        })
        .cloned()
        .collect();

    let scorings = scorings
        .iter()
        .filter(|scoring| {
            scoring
                .elements
                .iter()
                .any(|element| references(&element.condition, reference))
        })
        .cloned()
        .collect();

    Dependents { segments, scorings }
}

pub fn remove_segment_dependency(segment: &Segment, reference: &Reference<'_>) -> Rewritten<Segment> {
    let mut definition = segment.clone();
    definition.condition = segment
        .condition
        .as_ref()
        .and_then(|c| rewrite_removing_reference(c, reference));
    let emptied = definition.condition.is_none();
    if emptied {
        definition.metadata.enabled = false;
    }
    Rewritten { definition, emptied }
}

/// Elements whose condition vanishes are dropped; a scoring left with no
/// elements is disabled.
pub fn remove_scoring_dependency(scoring: &Scoring, reference: &Reference<'_>) -> Rewritten<Scoring> {
    let mut definition = scoring.clone();
    definition.elements = scoring
        .elements
        .iter()
        .filter_map(|element| {
            rewrite_removing_reference(&element.condition, reference).map(|condition| {
                let mut element = element.clone();
                element.condition = condition;
                element
            })
        })
        .collect();
    let emptied = definition.elements.is_empty();
    if emptied {
        definition.metadata.enabled = false;
    }
    Rewritten { definition, emptied }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use audience_core::conditions::{params, types, BooleanOperator, Condition};
    use audience_core::types::{Metadata, ScoringElement};

    fn meta(id: &str) -> Metadata {
        Metadata::new("acme", id, id, "")
    }

    fn in_segments(ids: &[&str]) -> Condition {
        Condition::new(types::PROFILE_SEGMENT).with_parameter(
            params::SEGMENTS,
            ids.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
    }

    fn gender(value: &str) -> Condition {
        Condition::profile_property(
            "properties.gender",
            "equals",
            Some(serde_json::Value::String(value.to_string())),
        )
    }

    #[test]
    fn test_find_dependents_through_nesting() {
        let deep = Segment::new(
            meta("deep"),
            Condition::boolean(
                BooleanOperator::And,
                vec![
                    gender("f"),
                    Condition::boolean(
                        BooleanOperator::Or,
                        vec![gender("m"), Condition::boolean(BooleanOperator::And, vec![in_segments(&["a"])])],
                    ),
                ],
            ),
        );
        let unrelated = Segment::new(meta("unrelated"), in_segments(&["b"]));
        let scoring = Scoring::new(
            meta("score"),
            vec![
                ScoringElement { condition: gender("f"), value: 1 },
                ScoringElement { condition: in_segments(&["b", "a"]), value: 2 },
            ],
        );
        let other_scoring = Scoring::new(
            meta("other"),
            vec![ScoringElement { condition: gender("f"), value: 1 }],
        );

        let dependents = find_dependents(
            &Reference::Segment("a"),
            &[deep, unrelated],
            &[scoring, other_scoring],
        );
        let summary = dependents.metadata();
        assert_eq!(summary.segments.len(), 1);
        assert_eq!(summary.segments[0].id, "deep");
        assert_eq!(summary.scorings.len(), 1);
        assert_eq!(summary.scorings[0].id, "score");
    }

    #[test]
    fn test_shared_reference_keeps_dependent_enabled() {
        let b = Segment::new(meta("b"), in_segments(&["a", "c"]));
        let rewritten = remove_segment_dependency(&b, &Reference::Segment("a"));
        assert!(!rewritten.emptied);
        assert!(rewritten.definition.metadata.enabled);
        assert_eq!(
            rewritten
                .definition
                .condition
                .unwrap()
                .string_list_parameter(params::SEGMENTS),
            vec!["c"]
        );
    }

    #[test]
    fn test_sole_reference_disables_dependent() {
        let d = Segment::new(meta("d"), in_segments(&["a"]));
        let rewritten = remove_segment_dependency(&d, &Reference::Segment("a"));
        assert!(rewritten.emptied);
        assert!(rewritten.definition.condition.is_none());
        assert!(!rewritten.definition.metadata.enabled);
    }

    #[test]
    fn test_scoring_elements_pruned() {
        let scoring_ref = Condition::new(types::SCORING).with_parameter(params::SCORING_PLAN_ID, "s1");
        let scoring = Scoring::new(
            meta("composite"),
            vec![
                ScoringElement { condition: scoring_ref.clone(), value: 4 },
                ScoringElement {
                    condition: Condition::boolean(BooleanOperator::And, vec![scoring_ref, gender("f")]),
                    value: 2,
                },
            ],
        );
        let rewritten = remove_scoring_dependency(&scoring, &Reference::Scoring("s1"));
        assert!(!rewritten.emptied);
        assert_eq!(rewritten.definition.elements.len(), 1);
        assert_eq!(rewritten.definition.elements[0].value, 2);
        assert_eq!(rewritten.definition.elements[0].condition, gender("f"));
    }
}

//! Recursive inspection and rewriting of condition trees.
//!
//! Only boolean combinators are descended into by the leaf walks here; any
//! other node is a leaf, whatever parameters it carries. Rewrites never
//! leave an empty or unary combinator behind.

use audience_core::conditions::{params, types, Condition, ParameterValue};
use audience_core::services::{TypeRegistry, EVENT_CONDITION_TAG, PROFILE_CONDITION_TAG};

/// Outcome of rewriting a single leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafRewrite {
    Keep,
    Remove,
    Replace(Condition),
}

/// A definition id as it appears inside reference leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    /// `profileSegmentCondition`, which holds a list of segment ids.
    Segment(&'a str),
    /// `scoringCondition`, which holds a single scoring id.
    Scoring(&'a str),
}

impl<'a> Reference<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            Reference::Segment(id) | Reference::Scoring(id) => id,
        }
    }

    /// Whether `leaf` refers to this id.
    pub fn matches(&self, leaf: &Condition) -> bool {
        match self {
            Reference::Segment(id) => {
                leaf.type_id == types::PROFILE_SEGMENT
                    && leaf
                        .string_list_parameter(params::SEGMENTS)
                        .iter()
                        .any(|s| s == id)
            }
            Reference::Scoring(id) => {
                leaf.type_id == types::SCORING
                    && leaf.string_parameter(params::SCORING_PLAN_ID) == Some(*id)
            }
        }
    }

    /// Rewrite `leaf` so it no longer refers to this id.
    pub fn strip(&self, leaf: &Condition) -> LeafRewrite {
        if !self.matches(leaf) {
            return LeafRewrite::Keep;
        }
        match self {
            Reference::Scoring(_) => LeafRewrite::Remove,
            Reference::Segment(id) => {
                let remaining: Vec<String> = leaf
                    .string_list_parameter(params::SEGMENTS)
                    .into_iter()
                    .filter(|s| s != id)
                    .collect();
                if remaining.is_empty() {
                    LeafRewrite::Remove
                } else {
                    let mut shrunk = leaf.clone();
                    shrunk.set_parameter(params::SEGMENTS, remaining);
                    LeafRewrite::Replace(shrunk)
                }
            }
        }
    }
}

/// Depth-first search for leaves satisfying `predicate`, each paired with
/// its parent combinator (`None` for a leaf at the root).
pub fn find_leaves_of_type<'a, F>(
    condition: &'a Condition,
    predicate: F,
) -> Vec<(&'a Condition, Option<&'a Condition>)>
where
    F: Fn(&Condition) -> bool,
{
    let mut found = Vec::new();
    collect_leaves(condition, None, &predicate, &mut found);
    found
}

fn collect_leaves<'a, F>(
    condition: &'a Condition,
    parent: Option<&'a Condition>,
    predicate: &F,
    found: &mut Vec<(&'a Condition, Option<&'a Condition>)>,
) where
    F: Fn(&Condition) -> bool,
{
    if condition.is_boolean() {
        for sub in condition.sub_conditions().unwrap_or_default() {
            collect_leaves(sub, Some(condition), predicate, found);
        }
    } else if predicate(condition) {
        found.push((condition, parent));
    }
}

/// Short-circuiting form of [`find_leaves_of_type`].
pub fn any_leaf<F>(condition: &Condition, predicate: &F) -> bool
where
    F: Fn(&Condition) -> bool,
{
    if condition.is_boolean() {
        condition
            .sub_conditions()
            .unwrap_or_default()
            .iter()
            .any(|sub| any_leaf(sub, predicate))
    } else {
        predicate(condition)
    }
}

/// Rewrite every leaf with `rewrite`, then collapse combinators: no
/// survivors yields `None`, a single survivor replaces its combinator.
pub fn rewrite_leaves<F>(condition: &Condition, rewrite: &F) -> Option<Condition>
where
    F: Fn(&Condition) -> LeafRewrite,
{
    if !condition.is_boolean() {
        return match rewrite(condition) {
            LeafRewrite::Keep => Some(condition.clone()),
            LeafRewrite::Remove => None,
            LeafRewrite::Replace(replacement) => Some(replacement),
        };
    }

    let mut survivors: Vec<Condition> = condition
        .sub_conditions()
        .unwrap_or_default()
        .iter()
        .filter_map(|sub| rewrite_leaves(sub, rewrite))
        .collect();

    match survivors.len() {
        0 => None,
        1 => survivors.pop(),
        _ => {
            let mut rewritten = condition.clone();
            rewritten.set_parameter(params::SUB_CONDITIONS, survivors);
            Some(rewritten)
        }
    }
}

pub fn references(condition: &Condition, reference: &Reference<'_>) -> bool {
    any_leaf(condition, &|leaf| reference.matches(leaf))
}

/// `condition` without any leaf pointing at `reference`, or `None` when
/// nothing is left.
pub fn rewrite_removing_reference(
    condition: &Condition,
    reference: &Reference<'_>,
) -> Option<Condition> {
    rewrite_leaves(condition, &|leaf| reference.strip(leaf))
}

/// Visit every node reachable through any condition-valued parameter.
pub fn for_each_node<F>(condition: &Condition, visit: &mut F)
where
    F: FnMut(&Condition),
{
    visit(condition);
    for value in condition.parameter_values.values() {
        match value {
            ParameterValue::Condition(child) => for_each_node(child, visit),
            ParameterValue::Conditions(children) => {
                for child in children {
                    for_each_node(child, visit);
                }
            }
            ParameterValue::Scalar(_) | ParameterValue::Scalars(_) => {}
        }
    }
}

/// Condition type ids in the tree that the registry does not know.
pub fn unresolved_types(condition: &Condition, registry: &dyn TypeRegistry) -> Vec<String> {
    let mut unresolved = Vec::new();
    for_each_node(condition, &mut |node| {
        if registry.condition_type(&node.type_id).is_none() && !unresolved.contains(&node.type_id)
        {
            unresolved.push(node.type_id.clone());
        }
    });
    unresolved
}

/// Event-class and not profile-class: the node counts past events.
pub fn is_past_event_trigger(condition: &Condition, registry: &dyn TypeRegistry) -> bool {
    registry
        .condition_type(&condition.type_id)
        .map(|t| t.has_tag(EVENT_CONDITION_TAG) && !t.has_tag(PROFILE_CONDITION_TAG))
        .unwrap_or(false)
}

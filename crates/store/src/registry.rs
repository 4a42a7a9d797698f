//! Condition and action type registry preloaded with the builtin types.

use audience_core::conditions::types;
use audience_core::services::{
    ActionType, ConditionType, TypeRegistry, EVENT_CONDITION_TAG, PROFILE_CONDITION_TAG,
    SET_EVENT_OCCURRENCE_COUNT_ACTION,
};
use dashmap::DashMap;

pub const LOGICAL_TAG: &str = "logical";
pub const SESSION_CONDITION_TAG: &str = "sessionCondition";

pub struct BuiltinTypeRegistry {
    conditions: DashMap<String, ConditionType>,
    actions: DashMap<String, ActionType>,
}

impl Default for BuiltinTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinTypeRegistry {
    pub fn new() -> Self {
        let registry = Self {
            conditions: DashMap::new(),
            actions: DashMap::new(),
        };
        for id in [types::BOOLEAN, types::NOT, types::MATCH_ALL] {
            registry.register_condition_type(ConditionType::new(id, &[LOGICAL_TAG]));
        }
        for id in [
            types::PROFILE_PROPERTY,
            types::PROFILE_SEGMENT,
            types::SCORING,
            types::PAST_EVENT,
        ] {
            registry.register_condition_type(ConditionType::new(id, &[PROFILE_CONDITION_TAG]));
        }
        for id in [types::EVENT_TYPE, types::EVENT_PROPERTY] {
            registry.register_condition_type(ConditionType::new(id, &[EVENT_CONDITION_TAG]));
        }
        registry.register_condition_type(ConditionType::new(
            types::SESSION_PROPERTY,
            &[SESSION_CONDITION_TAG],
        ));
        registry.register_action_type(ActionType {
            id: SET_EVENT_OCCURRENCE_COUNT_ACTION.to_string(),
            system_tags: Default::default(),
        });
        registry
    }

    pub fn register_condition_type(&self, condition_type: ConditionType) {
        self.conditions
            .insert(condition_type.id.clone(), condition_type);
    }

    pub fn register_action_type(&self, action_type: ActionType) {
        self.actions.insert(action_type.id.clone(), action_type);
    }
}

impl TypeRegistry for BuiltinTypeRegistry {
    fn condition_type(&self, id: &str) -> Option<ConditionType> {
        self.conditions.get(id).map(|t| t.value().clone())
    }

    fn action_type(&self, id: &str) -> Option<ActionType> {
        self.actions.get(id).map(|t| t.value().clone())
    }
}

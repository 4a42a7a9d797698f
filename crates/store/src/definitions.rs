//! In-memory definition and rule stores backed by DashMap.

use std::collections::BTreeSet;

use audience_core::error::{AudienceError, AudienceResult};
use audience_core::services::{DefinitionStore, RuleStore};
use audience_core::types::{Item, Metadata, PartialList, Rule};
use dashmap::DashMap;
use tracing::debug;

/// Thread-safe store of one definition kind, keyed by id.
pub struct InMemoryDefinitionStore<T: Item> {
    items: DashMap<String, T>,
}

impl<T: Item> Default for InMemoryDefinitionStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Item> InMemoryDefinitionStore<T> {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Item> DefinitionStore<T> for InMemoryDefinitionStore<T> {
    fn load(&self, id: &str) -> AudienceResult<Option<T>> {
        Ok(self.items.get(id).map(|r| r.value().clone()))
    }

    fn save(&self, item: &T) -> AudienceResult<()> {
        debug!(item_type = T::ITEM_TYPE, id = item.item_id(), "saving definition");
        self.items.insert(item.item_id().to_string(), item.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> AudienceResult<bool> {
        Ok(self.items.remove(id).is_some())
    }

    fn all(&self) -> AudienceResult<Vec<T>> {
        let mut items: Vec<T> = self.items.iter().map(|r| r.value().clone()).collect();
        items.sort_by(|a, b| a.item_id().cmp(b.item_id()));
        Ok(items)
    }

    fn query_metadata(
        &self,
        scope: Option<&str>,
        offset: usize,
        size: usize,
        sort_by: Option<&str>,
    ) -> AudienceResult<PartialList<Metadata>> {
        let mut metadatas: Vec<Metadata> = self
            .items
            .iter()
            .map(|r| r.value().metadata().clone())
            .filter(|m| scope.is_none() || m.scope.as_deref() == scope)
            .collect();
        sort_metadatas(&mut metadatas, sort_by);

        let total = metadatas.len() as u64;
        let list = metadatas.into_iter().skip(offset).take(size).collect();
        Ok(PartialList {
            list,
            offset,
            page_size: size,
            total_size: total,
            scroll_identifier: None,
            scroll_time_validity: None,
        })
    }
}

/// `name` or `id`, optionally suffixed `:desc`.
fn sort_metadatas(metadatas: &mut [Metadata], sort_by: Option<&str>) {
    let (field, descending) = match sort_by.and_then(|s| s.rsplit_once(':')) {
        Some((field, direction)) => (field, direction == "desc"),
        None => (sort_by.unwrap_or("id"), false),
    };
    metadatas.sort_by(|a, b| {
        let ordering = match field {
            "name" | "metadata.name" => a.name.cmp(&b.name),
            _ => a.id.cmp(&b.id),
        };
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

pub struct InMemoryRuleStore {
    rules: DashMap<String, Rule>,
}

impl Default for InMemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl RuleStore for InMemoryRuleStore {
    fn get_rule(&self, id: &str) -> AudienceResult<Option<Rule>> {
        Ok(self.rules.get(id).map(|r| r.value().clone()))
    }

    fn set_rule(&self, rule: &Rule) -> AudienceResult<()> {
        self.rules.insert(rule.metadata.id.clone(), rule.clone());
        Ok(())
    }

    fn remove_rule(&self, id: &str) -> AudienceResult<bool> {
        Ok(self.rules.remove(id).is_some())
    }

    fn update_linked_items(&self, id: &str, linked_items: &BTreeSet<String>) -> AudienceResult<()> {
        let mut rule = self.rules.get_mut(id).ok_or_else(|| AudienceError::NotFound {
            item_type: Rule::ITEM_TYPE,
            id: id.to_string(),
        })?;
        rule.linked_items = linked_items.clone();
        Ok(())
    }

    fn rules_linked_to(&self, item_id: &str) -> AudienceResult<Vec<Rule>> {
        let mut rules: Vec<Rule> = self
            .rules
            .iter()
            .filter(|r| r.value().linked_items.contains(item_id))
            .map(|r| r.value().clone())
            .collect();
        rules.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        Ok(rules)
    }

    fn rule_metadatas(&self) -> AudienceResult<Vec<Metadata>> {
        let mut metadatas: Vec<Metadata> =
            self.rules.iter().map(|r| r.value().metadata.clone()).collect();
        metadatas.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(metadatas)
    }
}

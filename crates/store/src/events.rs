//! In-memory event store answering the per-profile count aggregations used
//! by past-event backfills.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use audience_core::conditions::Condition;
use audience_core::error::{AudienceError, AudienceResult};
use audience_core::services::{EventStore, Partition};
use audience_core::types::Event;
use dashmap::DashMap;
use tracing::info;

use crate::matcher::event_matches;

pub struct InMemoryEventStore {
    events: DashMap<String, Event>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        info!("Event store initialized (in-memory, development mode)");
        Self {
            events: DashMap::new(),
        }
    }

    pub fn insert(&self, event: Event) {
        self.events.insert(event.item_id.clone(), event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn matching_profile_ids(&self, condition: &Condition) -> AudienceResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.events.iter() {
            if event_matches(condition, entry.value())
                .map_err(|e| AudienceError::Store(e.to_string()))?
            {
                ids.push(entry.value().profile_id.clone());
            }
        }
        Ok(ids)
    }
}

/// Stable bucket of `profile_id` among `count` partitions.
pub fn partition_of(profile_id: &str, count: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    profile_id.hash(&mut hasher);
    (hasher.finish() % u64::from(count.max(1))) as u32
}

impl EventStore for InMemoryEventStore {
    fn count_by_profile(
        &self,
        condition: &Condition,
        partition: Option<Partition>,
        max_buckets: Option<usize>,
    ) -> AudienceResult<BTreeMap<String, u64>> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for profile_id in self.matching_profile_ids(condition)? {
            if let Some(Partition { index, count }) = partition {
                if partition_of(&profile_id, count) != index {
                    continue;
                }
            }
            *counts.entry(profile_id).or_insert(0) += 1;
        }

        // Like a terms aggregation: keep the largest buckets.
        if let Some(limit) = max_buckets.filter(|limit| counts.len() > *limit) {
            let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            ranked.truncate(limit);
            counts = ranked.into_iter().collect();
        }
        Ok(counts)
    }

    fn distinct_profile_count(&self, condition: &Condition) -> AudienceResult<u64> {
        let distinct: BTreeSet<String> = self.matching_profile_ids(condition)?.into_iter().collect();
        Ok(distinct.len() as u64)
    }
}

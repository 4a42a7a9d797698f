//! Profile-updated notifications.
//!
//! Components that mutate profiles in bulk accept an `Arc<dyn EventSink>`
//! and push one non-persistent `profileUpdated` event per mutated profile.
//! Delivery is fire-and-forget.

use crate::types::Profile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

pub const PROFILE_UPDATED: &str = "profileUpdated";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub profile_id: String,
    pub profile: Profile,
    pub persistent: bool,
    pub timestamp: DateTime<Utc>,
}

/// Trait for delivering profile events to whatever consumes them.
pub trait EventSink: Send + Sync {
    fn send(&self, event: ProfileEvent);
}

/// No-op sink for tests and deployments without event delivery.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn send(&self, _event: ProfileEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<ProfileEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<ProfileEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_for(&self, profile_id: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.profile_id == profile_id)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn send(&self, event: ProfileEvent) {
        self.events.lock().push(event);
    }
}

/// Build the transient `profileUpdated` event for `profile`.
pub fn profile_updated(profile: &Profile) -> ProfileEvent {
    ProfileEvent {
        event_id: Uuid::new_v4(),
        event_type: PROFILE_UPDATED.to_string(),
        profile_id: profile.item_id.clone(),
        profile: profile.clone(),
        persistent: false,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op sink.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

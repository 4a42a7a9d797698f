//! Segment and scoring engine: impact-checked definition lifecycle, derived
//! past-event counting rules, bulk membership maintenance and periodic
//! upkeep of the definition cache.

pub mod cache;
pub mod condition_tree;
pub mod dependency;
pub mod predefined;
pub mod rule_deriver;
pub mod scheduler;
pub mod service;
pub mod updater;

pub use cache::{DefinitionCache, DefinitionSnapshot};
pub use predefined::load_predefined_definitions;
pub use scheduler::{start_maintenance, MaintenanceError, MaintenanceScheduler, MaintenanceTask};
pub use service::{Collaborators, SegmentService};
pub use rule_deriver::RecountSummary;
pub use updater::{BackfillSummary, ProfileUpdater, UpdaterSettings};

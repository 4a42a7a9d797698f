//! In-memory implementations of the collaborator contracts, for development
//! and tests. Production deployments plug a search-engine backed store in
//! behind the same traits.

pub mod definitions;
pub mod events;
pub mod matcher;
pub mod profiles;
pub mod registry;

pub use definitions::{InMemoryDefinitionStore, InMemoryRuleStore};
pub use events::InMemoryEventStore;
pub use profiles::InMemoryProfileStore;
pub use registry::BuiltinTypeRegistry;

pub mod conditions;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod services;
pub mod types;

pub use conditions::{BooleanOperator, Condition, ParameterValue};
pub use config::{AppConfig, SegmentationConfig};
pub use error::{AudienceError, AudienceResult};
pub use types::{
    DependentMetadata, Item, Metadata, PartialList, Profile, Rule, Scoring, ScoringElement,
    Segment, SegmentsAndScores,
};

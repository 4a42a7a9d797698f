//! Audience Engine: segment and scoring maintenance node.
//!
//! Wires the segmentation service to its collaborators, loads predefined
//! definitions and runs the background maintenance jobs until interrupted.

use audience_core::config::AppConfig;
use audience_core::event_bus::noop_sink;
use audience_core::types::{Scoring, Segment};
use audience_segmentation::{
    load_predefined_definitions, start_maintenance, Collaborators, SegmentService,
};
use audience_store::{
    BuiltinTypeRegistry, InMemoryDefinitionStore, InMemoryEventStore, InMemoryProfileStore,
    InMemoryRuleStore,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "audience-engine")]
#[command(about = "Segment membership and scoring maintenance engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "AUDIENCE_ENGINE__NODE_ID")]
    node_id: Option<String>,

    /// Profiles per bulk update page (overrides config)
    #[arg(long, env = "AUDIENCE_ENGINE__SEGMENTATION__SEGMENT_UPDATE_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Definition cache reload period in milliseconds (overrides config)
    #[arg(long, env = "AUDIENCE_ENGINE__SEGMENTATION__SEGMENT_REFRESH_INTERVAL_MS")]
    refresh_interval_ms: Option<u64>,

    /// Directory holding predefined `segments/` and `scoring/` JSON files
    #[arg(long, env = "AUDIENCE_ENGINE__DEFINITIONS")]
    definitions: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audience_engine=info,audience_segmentation=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Audience Engine starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(batch_size) = cli.batch_size {
        config.segmentation.segment_update_batch_size = batch_size;
    }
    if let Some(interval) = cli.refresh_interval_ms {
        config.segmentation.segment_refresh_interval_ms = interval;
    }

    info!(
        node_id = %config.node_id,
        batch_size = config.segmentation.segment_update_batch_size,
        refresh_interval_ms = config.segmentation.segment_refresh_interval_ms,
        batch_updates = config.segmentation.batch_segment_profile_update,
        "Configuration loaded"
    );

    let collaborators = Collaborators {
        segments: Arc::new(InMemoryDefinitionStore::<Segment>::new()),
        scorings: Arc::new(InMemoryDefinitionStore::<Scoring>::new()),
        rules: Arc::new(InMemoryRuleStore::new()),
        profiles: Arc::new(InMemoryProfileStore::new()),
        events: Arc::new(InMemoryEventStore::new()),
        registry: Arc::new(BuiltinTypeRegistry::new()),
        sink: noop_sink(),
    };
    let service = Arc::new(SegmentService::new(collaborators, &config.segmentation));

    if let Some(root) = cli.definitions.as_deref() {
        let loaded = load_predefined_definitions(&service, root);
        info!(
            segments = loaded.segments,
            scorings = loaded.scorings,
            "Predefined definitions installed"
        );
    }
    service.refresh_definitions()?;

    let scheduler = start_maintenance(service, &config.segmentation);
    info!(tasks = scheduler.task_count(), "Audience Engine is ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    scheduler.shutdown();

    Ok(())
}

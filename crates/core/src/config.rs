use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `AUDIENCE_ENGINE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
}

/// Tuning for segment/scoring maintenance.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentationConfig {
    /// Page size of bulk profile updates and past-event count batches.
    #[serde(default = "default_segment_update_batch_size")]
    pub segment_update_batch_size: usize,
    /// Period of the definition cache reload.
    #[serde(default = "default_segment_refresh_interval_ms")]
    pub segment_refresh_interval_ms: u64,
    #[serde(default = "default_aggregate_query_bucket_size")]
    pub aggregate_query_bucket_size: u64,
    /// Retries per profile after a failed batched update. 0 disables retrying.
    #[serde(default)]
    pub max_retries_for_update_profile_segment: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub seconds_delay_for_retry_update_profile_segment: u64,
    #[serde(default)]
    pub batch_segment_profile_update: bool,
    #[serde(default = "default_true")]
    pub send_profile_update_event_for_segment_update: bool,
    #[serde(default = "default_maximum_ids_query_count")]
    pub maximum_ids_query_count: usize,
    #[serde(default)]
    pub past_events_disable_partitions: bool,
    #[serde(default = "default_daily_date_expr_evaluation_hour_utc")]
    pub daily_date_expr_evaluation_hour_utc: u32,
    #[serde(default = "default_task_execution_period_days")]
    pub task_execution_period_days: u64,
    #[serde(default = "default_scroll_time_validity")]
    pub scroll_time_validity: String,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_segment_update_batch_size() -> usize {
    1000
}
fn default_segment_refresh_interval_ms() -> u64 {
    1000
}
fn default_aggregate_query_bucket_size() -> u64 {
    5000
}
fn default_retry_delay_secs() -> u64 {
    1
}
fn default_true() -> bool {
    true
}
fn default_maximum_ids_query_count() -> usize {
    5000
}
fn default_daily_date_expr_evaluation_hour_utc() -> u32 {
    5
}
fn default_task_execution_period_days() -> u64 {
    1
}
fn default_scroll_time_validity() -> String {
    "10m".to_string()
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            segment_update_batch_size: default_segment_update_batch_size(),
            segment_refresh_interval_ms: default_segment_refresh_interval_ms(),
            aggregate_query_bucket_size: default_aggregate_query_bucket_size(),
            max_retries_for_update_profile_segment: 0,
            seconds_delay_for_retry_update_profile_segment: default_retry_delay_secs(),
            batch_segment_profile_update: false,
            send_profile_update_event_for_segment_update: true,
            maximum_ids_query_count: default_maximum_ids_query_count(),
            past_events_disable_partitions: false,
            daily_date_expr_evaluation_hour_utc: default_daily_date_expr_evaluation_hour_utc(),
            task_execution_period_days: default_task_execution_period_days(),
            scroll_time_validity: default_scroll_time_validity(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            segmentation: SegmentationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("AUDIENCE_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

//! Periodic maintenance: cache reload, relative-window recounts and the
//! daily date-expression resync.
//!
//! Each job runs on its own tokio task. Bodies are synchronous and go
//! through `spawn_blocking`; a failed or panicking run is logged and the job
//! simply waits for its next tick. Shutdown stops future ticks only.

use std::sync::Arc;
use std::time::Duration;

use audience_core::config::SegmentationConfig;
use audience_core::error::AudienceError;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::service::SegmentService;

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);
/// Upper bound on the recount period, about a century.
const MAX_TASK_PERIOD_DAYS: u32 = 36_500;

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Audience(#[from] AudienceError),

    #[error("{failed} of {total} items could not be processed")]
    Incomplete { failed: usize, total: usize },
}

/// Body of a periodic job.
pub trait MaintenanceTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn run(&self) -> Result<(), MaintenanceError>;
}

/// Runs [`MaintenanceTask`]s at a fixed rate until shut down.
pub struct MaintenanceScheduler {
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for MaintenanceScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MaintenanceScheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` after `initial_delay`, then every `period`. Must be called
    /// from within a tokio runtime.
    pub fn schedule_at_fixed_rate(
        &self,
        task: Arc<dyn MaintenanceTask>,
        initial_delay: Duration,
        period: Duration,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let period = period.max(Duration::from_millis(1));
        info!(
            task = task.name(),
            initial_delay_secs = initial_delay.as_secs(),
            period_ms = period.as_millis() as u64,
            "scheduling maintenance task"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                run_once(task.clone()).await;
            }
            debug!(task = task.name(), "maintenance task stopped");
        });
        self.handles.lock().push(handle);
    }

    /// Stop scheduling new runs. Runs already in progress complete.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        info!("maintenance scheduler shut down");
    }

    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }
}

async fn run_once(task: Arc<dyn MaintenanceTask>) {
    let name = task.name();
    let started = std::time::Instant::now();
    match tokio::task::spawn_blocking(move || task.run()).await {
        Ok(Ok(())) => {
            debug!(task = name, elapsed_ms = started.elapsed().as_millis() as u64, "maintenance task finished");
        }
        Ok(Err(MaintenanceError::Incomplete { failed, total })) => {
            warn!(task = name, failed, total, "maintenance task finished with failures");
        }
        Ok(Err(e)) => {
            error!(task = name, error = %e, "maintenance task failed");
        }
        Err(e) => {
            error!(task = name, error = %e, "maintenance task panicked");
        }
    }
}

/// Seconds from `now` until the next `hour`:00:00 UTC; zero when `now` is
/// exactly on it.
pub fn seconds_until_hour(hour: u32, now: DateTime<Utc>) -> u64 {
    let Some(target) = now.date_naive().and_hms_opt(hour % 24, 0, 0) else {
        return 0;
    };
    let mut next = Utc.from_utc_datetime(&target);
    if now > next {
        next += ChronoDuration::days(1);
    }
    (next - now).num_seconds().max(0) as u64
}

pub struct RefreshDefinitionsTask(pub Arc<SegmentService>);

impl MaintenanceTask for RefreshDefinitionsTask {
    fn name(&self) -> &'static str {
        "refresh-definitions"
    }

    fn run(&self) -> Result<(), MaintenanceError> {
        self.0.refresh_definitions()?;
        Ok(())
    }
}

pub struct RecomputePastEventsTask(pub Arc<SegmentService>);

impl MaintenanceTask for RecomputePastEventsTask {
    fn name(&self) -> &'static str {
        "recompute-past-event-rules"
    }

    fn run(&self) -> Result<(), MaintenanceError> {
        let recomputed = self.0.recompute_past_event_rules()?;
        info!(recomputed, "past event rules recomputed");
        Ok(())
    }
}

pub struct RecomputeDateExprTask(pub Arc<SegmentService>);

impl MaintenanceTask for RecomputeDateExprTask {
    fn name(&self) -> &'static str {
        "recompute-date-expr-segments"
    }

    fn run(&self) -> Result<(), MaintenanceError> {
        let updated = self.0.recompute_date_expr_segments()?;
        info!(segments = updated, "date expression segments recomputed");
        Ok(())
    }
}

/// Period of the relative-window recount, clamped to at least one day.
pub fn task_period(days: u64) -> Duration {
    let days = u32::try_from(days)
        .unwrap_or(MAX_TASK_PERIOD_DAYS)
        .clamp(1, MAX_TASK_PERIOD_DAYS);
    ONE_DAY * days
}

/// Schedule the three maintenance jobs for `service`.
pub fn start_maintenance(
    service: Arc<SegmentService>,
    config: &SegmentationConfig,
) -> MaintenanceScheduler {
    let scheduler = MaintenanceScheduler::new();
    let daily_period = task_period(config.task_execution_period_days);

    scheduler.schedule_at_fixed_rate(
        Arc::new(RefreshDefinitionsTask(service.clone())),
        Duration::ZERO,
        Duration::from_millis(config.segment_refresh_interval_ms),
    );
    scheduler.schedule_at_fixed_rate(
        Arc::new(RecomputePastEventsTask(service.clone())),
        daily_period,
        daily_period,
    );
    scheduler.schedule_at_fixed_rate(
        Arc::new(RecomputeDateExprTask(service)),
        Duration::from_secs(seconds_until_hour(
            config.daily_date_expr_evaluation_hour_utc,
            Utc::now(),
        )),
        ONE_DAY,
    );
    scheduler
}

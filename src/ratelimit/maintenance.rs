//! Background refill and idle-eviction tasks.
//!
//! Both sweeps run on their own tokio task and stop when the owning
//! [`MaintenanceHandle`] is shut down or dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::registry::BucketRegistry;

/// How often each sweep runs and what counts as idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSchedule {
    /// Period of the refill sweep
    pub refill_interval: Duration,
    /// Period of the idle-eviction sweep
    pub cleanup_interval: Duration,
    /// Buckets not refilled for this long are evicted
    pub idle_timeout: Duration,
}

impl Default for MaintenanceSchedule {
    fn default() -> Self {
        Self {
            refill_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Owner of the running maintenance tasks.
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Spawn the refill and eviction sweeps for `registry`.
    ///
    /// Must be called from within a tokio runtime. The first run of each
    /// sweep happens one full period after start.
    pub fn start(registry: Arc<BucketRegistry>, schedule: MaintenanceSchedule) -> Self {
        let (shutdown, signal) = watch::channel(false);

        let refill = {
            let registry = Arc::clone(&registry);
            spawn_periodic("refill", schedule.refill_interval, signal.clone(), move || {
                registry.refill_all();
            })
        };

        let idle_timeout = schedule.idle_timeout;
        let cleanup = spawn_periodic("cleanup", schedule.cleanup_interval, signal, move || {
            registry.evict_idle(idle_timeout);
        });

        info!(
            refill_interval_secs = schedule.refill_interval.as_secs(),
            cleanup_interval_secs = schedule.cleanup_interval.as_secs(),
            idle_timeout_secs = schedule.idle_timeout.as_secs(),
            "Rate limit maintenance started"
        );

        Self {
            shutdown,
            tasks: vec![refill, cleanup],
        }
    }

    /// Stop both sweeps and wait for them to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);

        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }

        info!("Rate limit maintenance stopped");
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut sweep: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => sweep(),
                _ = shutdown.changed() => {
                    debug!(task = name, "Maintenance task stopping");
                    break;
                }
            }
        }
    })
}

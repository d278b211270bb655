//! Scheduled deployments: turns each configured schedule into periodic triggers

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::storage::settings::ScheduleSettings;
use crate::trigger::receiver::{TriggerEvent, TriggerReceiver};
use crate::workers::deployer::DeployQueue;

/// Scheduler worker options
#[derive(Debug, Clone)]
pub struct Options {
    pub schedule: ScheduleSettings,

    /// Delay before the first trigger
    pub initial_delay: Duration,
}

impl Options {
    pub fn new(schedule: ScheduleSettings) -> Self {
        let initial_delay = Duration::from_secs(schedule.interval_secs);
        Self {
            schedule,
            initial_delay,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_secs.max(1))
    }
}

/// Run one schedule until shutdown
pub async fn run<S, F>(
    options: &Options,
    receiver: &TriggerReceiver,
    queue: &DeployQueue,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    let schedule = &options.schedule;
    info!(
        "Scheduler {} starting: {} to {} every {:?}",
        schedule.name,
        schedule.source_ref,
        schedule.target_host,
        options.interval()
    );

    let mut wait = options.initial_delay;
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Scheduler {} shutting down...", schedule.name);
                return;
            }
            _ = sleep_fn(wait) => {}
        }
        wait = options.interval();

        let event = TriggerEvent::Schedule {
            name: schedule.name.clone(),
            source_ref: schedule.source_ref.clone(),
            target_host: schedule.target_host.clone(),
        };
        let request = match receiver.accept(event) {
            Ok(request) => request,
            Err(e) => {
                error!("Scheduler {} trigger rejected: {}", schedule.name, e);
                continue;
            }
        };

        debug!(
            "Scheduler {} submitting request {}",
            schedule.name,
            request.request_id()
        );
        if let Err(e) = queue.submit(request) {
            error!("Scheduler {} unable to queue deployment: {}", schedule.name, e);
        }
    }
}

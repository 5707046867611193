//! RolloutScheduler — feeds queued jobs to a bounded worker pool.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use crate::service::RolloutService;

/// Pulls due jobs off the queue and runs one FSM turn per job, at most
/// `max_concurrent_jobs` at a time.
pub struct RolloutScheduler {
    service: Arc<RolloutService>,
}

impl RolloutScheduler {
    pub fn new(service: Arc<RolloutService>) -> Self {
        Self { service }
    }

    /// Run until `shutdown` flips to true.
    ///
    /// Dispatching starts only after the queue has been rebuilt from the
    /// repository; rehydration failures are retried indefinitely. In-flight
    /// turns are not cancelled on shutdown; they finish and persist their
    /// status.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.service.init_jobs().await {
                Ok(()) => break,
                Err(err) => {
                    warn!(error = %err, "failed to initialize jobs from repository");
                    tokio::select! {
                        _ = tokio::time::sleep(self.service.config().init_retry_interval) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.service.config().max_concurrent_jobs));

        loop {
            // Hold a permit before blocking on the queue so at most
            // `max_concurrent_jobs` turns are ever in flight.
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let job = match self
                .service
                .queue()
                .next(self.service.clock(), &mut shutdown)
                .await
            {
                Ok(job) => job,
                Err(err) => {
                    info!(error = %err, "job queue stopped, shutting scheduler down");
                    return;
                }
            };

            let service = self.service.clone();
            tokio::spawn(async move {
                if let Err(err) = service.run_turn(&job).await {
                    warn!(
                        capsule_id = %job.capsule_id,
                        rollout_id = job.rollout_id,
                        error = %err,
                        "rollout turn failed"
                    );
                }
                drop(permit);
            });
        }
    }
}

//! Worker pools: one per queue, each bounded by its stage's concurrency.
//!
//! A pool pulls a delivery only when it holds a free slot, so a busy stage
//! leaves its tasks in the queue for other processes. Broker errors back the
//! pool off instead of ending it.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};

use super::Pipeline;
use crate::error::Result;
use crate::model::QueueName;
use crate::telemetry::metrics;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    queue: QueueName,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<Pipeline>, queue: QueueName) -> Self {
        let concurrency = pipeline.config().stages.for_queue(queue).concurrency.max(1);
        let poll_interval = pipeline.config().worker.poll_interval();
        Self {
            pipeline,
            queue,
            concurrency,
            poll_interval,
        }
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Pull and handle tasks until `shutdown` flips to `true`, then wait for
    /// in-flight handlers to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut running = JoinSet::new();
        let mut backoff = MIN_BACKOFF;

        info!(queue = %self.queue, concurrency = self.concurrency, "worker pool started");

        loop {
            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!(queue = %self.queue, error = %e, "stage handler panicked");
                }
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = stopped(&mut shutdown) => break,
            };

            let next = tokio::select! {
                next = self.pipeline.router().next(self.queue) => next,
                _ = stopped(&mut shutdown) => break,
            };

            match next {
                Ok(Some(delivery)) => {
                    backoff = MIN_BACKOFF;
                    let pipeline = Arc::clone(&self.pipeline);
                    let queue = self.queue;
                    running.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = pipeline.handle(delivery).await {
                            warn!(%queue, error = %e, "could not settle delivery, it will be redelivered");
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = stopped(&mut shutdown) => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(
                        queue = %self.queue,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "queue unavailable, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stopped(&mut shutdown) => break,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        info!(queue = %self.queue, in_flight = running.len(), "worker pool draining");
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(queue = %self.queue, error = %e, "stage handler panicked");
            }
        }
        info!(queue = %self.queue, "worker pool stopped");
    }
}

/// Periodically publish queue depths on the `contractq.queue.depth` gauge.
pub async fn report_depths(pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) {
    let interval = pipeline.config().worker.depth_report();
    let gauge = metrics::queue_depth();
    loop {
        match pipeline.router().depths().await {
            Ok(depths) => {
                for (queue, depth) in depths {
                    gauge.record(depth, &[KeyValue::new("queue", queue.as_str())]);
                }
            }
            Err(e) => warn!(error = %e, "could not read queue depths"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stopped(&mut shutdown) => break,
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Run a pool for every queue plus the depth reporter until shutdown.
pub async fn serve(pipeline: Arc<Pipeline>, shutdown: watch::Receiver<bool>) -> Result<()> {
    pipeline.init().await?;

    let mut pools = JoinSet::new();
    for queue in QueueName::ALL {
        let pool = WorkerPool::new(Arc::clone(&pipeline), queue);
        let span = info_span!("worker_pool", queue = queue.as_str());
        pools.spawn(pool.run(shutdown.clone()).instrument(span));
    }
    pools.spawn(report_depths(Arc::clone(&pipeline), shutdown.clone()));

    while let Some(joined) = pools.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker pool task failed");
        }
    }
    Ok(())
}

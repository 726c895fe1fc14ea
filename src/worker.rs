use std::{fmt, sync::Arc};

use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, error, info_span, warn, Instrument, Span};

use crate::{
    availability::CompositeGate,
    broker::{Channel, DeliveryStream},
    consumer::Processor,
    delivery::Delivery,
    observability::{Outcome, QueueMetrics},
};

/// Why a consumer task was told to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopCause {
    /// The whole process is stopping.
    Shutdown,
    /// The pool shrank because load dropped.
    ScaledIn,
}

impl StopCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopCause::Shutdown => "shutdown",
            StopCause::ScaledIn => "scaled_in",
        }
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handed to processors with every delivery. Carries the task's stop signal
/// and a span scoped to the queue and worker id.
#[derive(Clone)]
pub struct TaskContext {
    queue: Arc<str>,
    worker_id: usize,
    stop: watch::Receiver<Option<StopCause>>,
    span: Span,
}

impl TaskContext {
    pub fn new(queue: &str, worker_id: usize, stop: watch::Receiver<Option<StopCause>>) -> Self {
        let span = info_span!("worker", queue = %queue, worker_id);

        Self {
            queue: Arc::from(queue),
            worker_id,
            stop,
            span,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.borrow().is_some()
    }

    pub fn stop_cause(&self) -> Option<StopCause> {
        *self.stop.borrow()
    }

    /// Resolves with the cause once the task is told to stop.
    pub async fn cancelled(&self) -> StopCause {
        let mut stop = self.stop.clone();

        let cause = match stop.wait_for(|cause| cause.is_some()).await {
            Ok(cause) => (*cause).unwrap_or(StopCause::Shutdown),
            // Handle dropped
            Err(_) => StopCause::Shutdown,
        };
        cause
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// The pool's grip on one running consumer task.
pub struct WorkerHandle {
    id: usize,
    stop_tx: watch::Sender<Option<StopCause>>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Tells the task to stop. The first cause wins.
    pub fn cancel(&self, cause: StopCause) -> bool {
        self.stop_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);

            true
        })
    }

    pub fn scale_in(&self) -> bool {
        self.cancel(StopCause::ScaledIn)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the task's loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            if e.is_panic() {
                error!(worker_id = self.id, "Consumer task panicked");
            }
        }
    }
}

/// One consumer slot: a dedicated channel, its delivery stream and the
/// topic's processor.
pub struct ConsumerTask {
    ctx: TaskContext,
    channel: Box<dyn Channel>,
    deliveries: DeliveryStream,
    processor: Arc<dyn Processor>,
    gate: Option<CompositeGate>,
    metrics: Arc<dyn QueueMetrics>,
}

impl ConsumerTask {
    pub fn new(
        ctx: TaskContext,
        channel: Box<dyn Channel>,
        deliveries: DeliveryStream,
        processor: Arc<dyn Processor>,
        gate: Option<CompositeGate>,
        metrics: Arc<dyn QueueMetrics>,
    ) -> Self {
        Self {
            ctx,
            channel,
            deliveries,
            processor,
            gate,
            metrics,
        }
    }

    /// Spawns a task for slot `id`, returning its handle.
    pub fn spawn<F>(id: usize, queue: &str, build: F) -> WorkerHandle
    where
        F: FnOnce(TaskContext) -> ConsumerTask,
    {
        let (stop_tx, stop_rx) = watch::channel(None);
        let task = build(TaskContext::new(queue, id, stop_rx));
        let span = task.ctx.span().clone();
        let join = tokio::spawn(task.run().instrument(span));

        WorkerHandle { id, stop_tx, join }
    }

    pub async fn run(mut self) {
        loop {
            let delivery = tokio::select! {
                biased;

                cause = self.ctx.cancelled() => {
                    debug!(cause = %cause, "Consumer task stopping");

                    break;
                }
                delivery = self.deliveries.recv() => delivery,
            };

            let Some(delivery) = delivery else {
                error!("Delivery stream closed unexpectedly; stopping consumer task");

                break;
            };

            if let Some(gate) = &self.gate {
                if !gate.is_available() {
                    debug!(systems = ?gate.systems(), "Waiting for upstream systems");
                }

                tokio::select! {
                    biased;

                    _ = self.ctx.cancelled() => {
                        // Not processed, hand it back
                        if let Err(e) = delivery.reject(true).await {
                            warn!(error = %e, "Failed to requeue delivery on stop");
                        }

                        break;
                    }
                    _ = gate.wait() => {}
                }
            }

            self.handle(delivery).await;
        }

        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "Failed to close consumer channel");
        }

        debug!("Consumer task terminated");
    }

    async fn handle(&self, delivery: Delivery) {
        let queue = self.ctx.queue_name();
        let tag = delivery.delivery_tag();
        let started = Instant::now();

        let result = self
            .processor
            .process(&self.ctx, &delivery)
            .instrument(self.ctx.span().clone())
            .await;

        let outcome = match result {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    error!(delivery_tag = tag, error = %e, "Failed to ack delivery");
                }

                Outcome::Success
            }
            Err(e) => {
                warn!(delivery_tag = tag, error = %e, "Processing failed; rejecting delivery");

                if let Err(e) = delivery.reject(false).await {
                    error!(delivery_tag = tag, error = %e, "Failed to reject delivery");
                }

                Outcome::Error
            }
        };

        self.metrics.inc_message_processed(queue, outcome);
        self.metrics
            .observe_processing_duration(queue, started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_stop_cause_wins() {
        let (stop_tx, stop_rx) = watch::channel(None);
        let ctx = TaskContext::new("jobs", 3, stop_rx);
        let waiter = ctx.clone();
        let join = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        let handle = WorkerHandle {
            id: 3,
            stop_tx,
            join,
        };

        assert!(!ctx.is_cancelled());
        assert!(handle.scale_in());
        assert!(!handle.cancel(StopCause::Shutdown));

        assert_eq!(ctx.stop_cause(), Some(StopCause::ScaledIn));
        assert_eq!(ctx.cancelled().await, StopCause::ScaledIn);
        assert_eq!(ctx.worker_id(), 3);
        assert_eq!(ctx.queue_name(), "jobs");

        handle.join().await;
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_shutdown() {
        let (stop_tx, stop_rx) = watch::channel(None);
        let ctx = TaskContext::new("jobs", 0, stop_rx);
        drop(stop_tx);

        assert_eq!(ctx.cancelled().await, StopCause::Shutdown);
    }

    #[test]
    fn test_stop_cause_labels() {
        assert_eq!(StopCause::Shutdown.to_string(), "shutdown");
        assert_eq!(StopCause::ScaledIn.to_string(), "scaled_in");
    }
}

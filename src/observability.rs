use std::{fmt, time::Duration};

use crate::scaling::ScaleDirection;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for the pool's observability signals.
pub trait QueueMetrics: Send + Sync + 'static {
    fn set_worker_count(&self, queue: &str, count: usize);

    fn set_queue_depth(&self, queue: &str, depth: u64);

    fn inc_scaling_decision(&self, queue: &str, direction: ScaleDirection);

    fn inc_message_processed(&self, queue: &str, outcome: Outcome);

    fn observe_processing_duration(&self, queue: &str, duration: Duration);
}

pub struct NoopMetrics;

impl QueueMetrics for NoopMetrics {
    fn set_worker_count(&self, _queue: &str, _count: usize) {}

    fn set_queue_depth(&self, _queue: &str, _depth: u64) {}

    fn inc_scaling_decision(&self, _queue: &str, _direction: ScaleDirection) {}

    fn inc_message_processed(&self, _queue: &str, _outcome: Outcome) {}

    fn observe_processing_duration(&self, _queue: &str, _duration: Duration) {}
}

/// Forwards to the `metrics` facade; whichever recorder the process installs
/// (Prometheus exporter, statsd, ...) receives the values.
pub struct FacadeMetrics;

impl QueueMetrics for FacadeMetrics {
    fn set_worker_count(&self, queue: &str, count: usize) {
        metrics::gauge!("queue_worker_count", "queue" => queue.to_owned()).set(count as f64);
    }

    fn set_queue_depth(&self, queue: &str, depth: u64) {
        metrics::gauge!("queue_depth", "queue" => queue.to_owned()).set(depth as f64);
    }

    fn inc_scaling_decision(&self, queue: &str, direction: ScaleDirection) {
        metrics::counter!(
            "queue_scaling_decisions_total",
            "queue" => queue.to_owned(),
            "direction" => direction.as_str()
        )
        .increment(1);
    }

    fn inc_message_processed(&self, queue: &str, outcome: Outcome) {
        metrics::counter!(
            "queue_messages_processed_total",
            "queue" => queue.to_owned(),
            "status" => outcome.as_str()
        )
        .increment(1);
    }

    fn observe_processing_duration(&self, queue: &str, duration: Duration) {
        metrics::histogram!("queue_message_processing_seconds", "queue" => queue.to_owned())
            .record(duration.as_secs_f64());
    }
}

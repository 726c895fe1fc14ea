#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rmq_pool::{
    observability::{Outcome, QueueMetrics},
    scaling::ScaleDirection,
    Broker, BrokerError, BrokerResult, Channel, ConsumerError, Delivery, DeliveryStream,
    HealthSource, InMemoryBroker, Processor, QueueInfo, RmqError, RmqResult, TaskContext,
};
use tokio::sync::Notify;

#[derive(Debug)]
pub struct TestError(pub String);

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TestError {}

/// Captures everything the pool reports.
#[derive(Default)]
pub struct RecordingMetrics {
    pub worker_counts: Mutex<Vec<usize>>,
    pub depths: Mutex<Vec<u64>>,
    pub decisions: Mutex<Vec<ScaleDirection>>,
    pub outcomes: Mutex<Vec<Outcome>>,
    pub durations: Mutex<Vec<Duration>>,
}

impl RecordingMetrics {
    pub fn worker_counts(&self) -> Vec<usize> {
        self.worker_counts.lock().unwrap().clone()
    }

    pub fn depths(&self) -> Vec<u64> {
        self.depths.lock().unwrap().clone()
    }

    pub fn decisions(&self) -> Vec<ScaleDirection> {
        self.decisions.lock().unwrap().clone()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn durations(&self) -> usize {
        self.durations.lock().unwrap().len()
    }
}

impl QueueMetrics for RecordingMetrics {
    fn set_worker_count(&self, _queue: &str, count: usize) {
        self.worker_counts.lock().unwrap().push(count);
    }

    fn set_queue_depth(&self, _queue: &str, depth: u64) {
        self.depths.lock().unwrap().push(depth);
    }

    fn inc_scaling_decision(&self, _queue: &str, direction: ScaleDirection) {
        self.decisions.lock().unwrap().push(direction);
    }

    fn inc_message_processed(&self, _queue: &str, outcome: Outcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }

    fn observe_processing_duration(&self, _queue: &str, duration: Duration) {
        self.durations.lock().unwrap().push(duration);
    }
}

/// Wraps the in-memory broker with scriptable depth readings and failures.
#[derive(Clone, Default)]
pub struct FlakyBroker {
    pub inner: InMemoryBroker,
    controls: Arc<Controls>,
}

#[derive(Default)]
struct Controls {
    depths: Mutex<VecDeque<u64>>, // Scripted readings, consumed one per probe call
    fixed_depth: Mutex<Option<u64>>,
    fail_depth: AtomicBool,
    depth_calls: AtomicUsize,
    fail_declares: AtomicUsize, // Remaining declare_queue calls that fail
    opened: AtomicUsize,
}

impl FlakyBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue depth reported by every probe until changed.
    pub fn set_depth(&self, depth: u64) {
        *self.controls.fixed_depth.lock().unwrap() = Some(depth);
    }

    /// Depths reported by the next probes, in order, before falling back to
    /// the fixed depth.
    pub fn script_depths(&self, depths: &[u64]) {
        self.controls.depths.lock().unwrap().extend(depths.iter().copied());
    }

    pub fn fail_depth(&self, fail: bool) {
        self.controls.fail_depth.store(fail, Ordering::SeqCst);
    }

    pub fn depth_calls(&self) -> usize {
        self.controls.depth_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_declares(&self, count: usize) {
        self.controls.fail_declares.store(count, Ordering::SeqCst);
    }

    pub fn channels_opened(&self) -> usize {
        self.controls.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn open_channel(&self) -> BrokerResult<Box<dyn Channel>> {
        let inner = self.inner.open_channel().await?;
        self.controls.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FlakyChannel {
            inner,
            controls: self.controls.clone(),
        }))
    }
}

struct FlakyChannel {
    inner: Box<dyn Channel>,
    controls: Arc<Controls>,
}

#[async_trait]
impl Channel for FlakyChannel {
    async fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<QueueInfo> {
        let failed = self
            .controls
            .fail_declares
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();

        if failed {
            return Err(BrokerError::Transport("declare refused".to_string()));
        }

        self.inner.declare_queue(name, durable).await
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.inner.set_prefetch(count).await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        self.inner.consume(queue, consumer_tag).await
    }

    async fn queue_depth(&self, queue: &str) -> BrokerResult<u64> {
        self.controls.depth_calls.fetch_add(1, Ordering::SeqCst);

        if self.controls.fail_depth.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }

        if let Some(depth) = self.controls.depths.lock().unwrap().pop_front() {
            return Ok(depth);
        }

        if let Some(depth) = *self.controls.fixed_depth.lock().unwrap() {
            return Ok(depth);
        }

        self.inner.queue_depth(queue).await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.close().await
    }
}

/// Health source whose answers are flipped by the test.
#[derive(Default)]
pub struct SwitchableHealth {
    enabled: Mutex<HashMap<String, bool>>,
    failing: AtomicBool,
    polls: AtomicUsize,
}

impl SwitchableHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, system: &str, enabled: bool) {
        self.enabled
            .lock()
            .unwrap()
            .insert(system.to_owned(), enabled);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthSource for SwitchableHealth {
    async fn is_system_enabled(&self, system: &str) -> RmqResult<bool> {
        self.polls.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(RmqError::Health(format!("{} unreachable", system)));
        }

        Ok(self
            .enabled
            .lock()
            .unwrap()
            .get(system)
            .copied()
            .unwrap_or(false))
    }
}

/// Records bodies it sees; bodies starting with `fail` are rejected.
#[derive(Clone, Default)]
pub struct RecordingProcessor {
    pub started: Arc<AtomicUsize>,
    pub seen: Arc<Mutex<Vec<(usize, Bytes)>>>,
    pub processed: Arc<Notify>,
    pub delay: Option<Duration>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn seen(&self) -> Vec<Bytes> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Deliveries that entered `process`, finished or not.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn process(&self, ctx: &TaskContext, delivery: &Delivery) -> Result<(), ConsumerError> {
        self.started.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.seen
            .lock()
            .unwrap()
            .push((ctx.worker_id(), delivery.body().clone()));
        self.processed.notify_waiters();

        if delivery.body().starts_with(b"fail") {
            return Err(ConsumerError::new(TestError(format!(
                "rejected {}",
                String::from_utf8_lossy(delivery.body())
            ))));
        }

        Ok(())
    }
}

/// Polls `check` until it holds, advancing (possibly paused) time in small steps.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    check()
}

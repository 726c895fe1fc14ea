use std::sync::Arc;

use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    availability::{AvailabilityMonitor, CompositeGate},
    broker::{Broker, Channel, DeliveryStream},
    builder::Topic,
    errors::{RmqError, RmqResult},
    observability::{FacadeMetrics, QueueMetrics},
    options::TopicConfig,
    probe::QueueDepthProbe,
    scaling::{HysteresisStrategy, ScalingContext, ScalingState, ScalingStrategy},
    shutdown::ShutdownSignal,
    worker::{ConsumerTask, StopCause, WorkerHandle},
};

/// Collaborators a pool is started with. Build once in the composition root
/// and clone per topic.
#[derive(Clone)]
pub struct PoolContext {
    broker: Arc<dyn Broker>,
    shutdown: ShutdownSignal,
    metrics: Arc<dyn QueueMetrics>,
    availability: Option<Arc<AvailabilityMonitor>>,
    strategy: Option<Arc<dyn ScalingStrategy>>,
    peak_window: bool,
}

impl PoolContext {
    pub fn new(broker: Arc<dyn Broker>, shutdown: ShutdownSignal) -> Self {
        Self {
            broker,
            shutdown,
            metrics: Arc::new(FacadeMetrics),
            availability: None,
            strategy: None,
            peak_window: false,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_availability(mut self, monitor: Arc<AvailabilityMonitor>) -> Self {
        self.availability = Some(monitor);
        self
    }

    /// Replaces the default [`HysteresisStrategy`].
    pub fn with_scaling_strategy(mut self, strategy: Arc<dyn ScalingStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// During a peak-load window pools start at `peak_workers` and never autoscale.
    pub fn peak_window(mut self, peak_window: bool) -> Self {
        self.peak_window = peak_window;
        self
    }
}

struct PoolState {
    workers: Vec<WorkerHandle>, // Index is the worker id
    retired: Vec<WorkerHandle>, // Scaled in, possibly still finishing a delivery
    stopping: bool,
}

struct ManagerInner {
    topic: Topic,
    config: TopicConfig,
    broker: Arc<dyn Broker>,
    metrics: Arc<dyn QueueMetrics>,
    availability: Option<Arc<AvailabilityMonitor>>,
    gate: Option<CompositeGate>,
    strategy: Arc<dyn ScalingStrategy>,
    probe: QueueDepthProbe,
    pool: Mutex<PoolState>,
    scaling: Mutex<ScalingState>,
    shutdown: ShutdownSignal,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns the consumer tasks of one topic and sizes the pool to queue depth.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<ManagerInner>,
}

impl PoolManager {
    /// Fills the pool to its initial size and starts the background loops.
    pub async fn start(topic: Topic, ctx: PoolContext) -> RmqResult<PoolManager> {
        let config = topic.config().resolved();
        config.validate()?;

        let gate = if config.dependent_systems.is_empty() {
            None
        } else {
            let monitor = ctx.availability.as_ref().ok_or_else(|| {
                RmqError::ConfigError(format!(
                    "topic '{}' depends on {:?} but no availability monitor was provided",
                    config.queue_name, config.dependent_systems
                ))
            })?;

            monitor.refresh(&config.dependent_systems).await;
            monitor.composite(&config.dependent_systems)
        };

        let strategy = ctx
            .strategy
            .clone()
            .unwrap_or_else(|| {
                Arc::new(HysteresisStrategy::new(config.clone())) as Arc<dyn ScalingStrategy>
            });

        let inner = Arc::new(ManagerInner {
            probe: QueueDepthProbe::new(ctx.broker.clone(), &config.queue_name),
            topic,
            broker: ctx.broker.clone(),
            metrics: ctx.metrics.clone(),
            availability: ctx.availability.clone(),
            gate,
            strategy,
            pool: Mutex::new(PoolState {
                workers: Vec::with_capacity(config.max_workers),
                retired: Vec::new(),
                stopping: false,
            }),
            scaling: Mutex::new(ScalingState::default()),
            shutdown: ctx.shutdown.clone(),
            background: Mutex::new(Vec::new()),
            config,
        });

        let queue = inner.config.queue_name.as_str();
        let initial = inner.config.initial_workers(ctx.peak_window);
        let started = inner.scale(initial, true).await?;

        if started < inner.config.min_workers || (initial > 0 && started == 0) {
            inner.stop(StopCause::Shutdown).await;
            inner.drain().await;

            return Err(RmqError::StartError {
                queue: queue.to_owned(),
                reason: format!("started {} of {} workers", started, initial),
            });
        }

        inner.metrics.set_worker_count(queue, started);

        let mut background = Vec::with_capacity(2);
        background.push(tokio::spawn(inner.clone().watch_shutdown()));

        if ctx.peak_window {
            info!(queue, workers = started, "Peak load window; autoscaling suspended");
        } else {
            background.push(tokio::spawn(inner.clone().monitor()));
        }
        *inner.background.lock().await = background;

        info!(queue, workers = started, "Topic started");

        Ok(PoolManager { inner })
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.config.queue_name
    }

    /// The resolved configuration the pool runs with.
    pub fn config(&self) -> &TopicConfig {
        &self.inner.config
    }

    pub fn topic(&self) -> &Topic {
        &self.inner.topic
    }

    /// Resizes the pool, clamping `target` to the topic's bounds. Returns the
    /// resulting size, which may fall short of `target` if workers fail to start.
    pub async fn scale_to(&self, target: usize) -> RmqResult<usize> {
        self.inner.scale(target, false).await
    }

    pub async fn current_size(&self) -> usize {
        self.inner.pool.lock().await.workers.len()
    }

    pub async fn worker_ids(&self) -> Vec<usize> {
        self.inner
            .pool
            .lock()
            .await
            .workers
            .iter()
            .map(|worker| worker.id())
            .collect()
    }

    pub async fn scaling_state(&self) -> ScalingState {
        self.inner.scaling.lock().await.clone()
    }

    /// Blocks until shutdown is signalled, then until every consumer task and
    /// background loop has exited.
    pub async fn wait_for_all_to_finish(&self) {
        let mut shutdown = self.inner.shutdown.clone();
        shutdown.cancelled().await;

        self.inner.stop(StopCause::Shutdown).await;
        self.inner.drain().await;

        let background: Vec<JoinHandle<()>> =
            self.inner.background.lock().await.drain(..).collect();
        for handle in background {
            if let Err(e) = handle.await {
                error!(queue = %self.queue_name(), error = %e, "Background loop failed");
            }
        }

        info!(queue = %self.queue_name(), "All workers finished");
    }
}

impl ManagerInner {
    async fn scale(&self, target: usize, initial: bool) -> RmqResult<usize> {
        let queue = self.config.queue_name.as_str();
        let target = target.clamp(self.config.min_workers, self.config.max_workers);

        let mut pool = self.pool.lock().await;

        if pool.stopping {
            return Err(RmqError::ShuttingDown);
        }

        let current = pool.workers.len();

        if target > current {
            for _ in current..target {
                // Failed slots are skipped, so the next id is always the pool length
                let id = pool.workers.len();

                match self.start_worker(id).await {
                    Ok(worker) => pool.workers.push(worker),
                    Err(e) => {
                        warn!(queue, worker_id = id, error = %e, "Failed to start worker; skipping slot");
                    }
                }
            }
        } else {
            while pool.workers.len() > target {
                if let Some(worker) = pool.workers.pop() {
                    worker.scale_in();
                    pool.retired.push(worker);
                }
            }
        }

        pool.retired.retain(|worker| !worker.is_finished());

        let size = pool.workers.len();
        drop(pool);

        if !initial && size != current {
            if size > current {
                info!(queue, from = current, to = size, "Workers scaled up");
            } else {
                info!(queue, from = current, to = size, "Workers scaled down");
            }

            self.metrics.set_worker_count(queue, size);
        }

        Ok(size)
    }

    async fn start_worker(&self, id: usize) -> RmqResult<WorkerHandle> {
        let queue = self.config.queue_name.as_str();
        let channel = self.broker.open_channel().await?;

        let deliveries = match self.open_stream(channel.as_ref(), id).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    debug!(queue, worker_id = id, error = %close_err, "Failed to close channel");
                }

                return Err(e);
            }
        };

        let processor = self.topic.processor();
        let gate = self.gate.clone();
        let metrics = self.metrics.clone();

        Ok(ConsumerTask::spawn(id, queue, move |ctx| {
            ConsumerTask::new(ctx, channel, deliveries, processor, gate, metrics)
        }))
    }

    async fn open_stream(&self, channel: &dyn Channel, id: usize) -> RmqResult<DeliveryStream> {
        let queue = self.config.queue_name.as_str();

        channel.declare_queue(queue, true).await?;

        if self.config.keep_in_ready {
            channel.set_prefetch(self.config.prefetch_count.max(1)).await?;
        }

        let consumer_tag = format!("{}-{}-{}", queue, id, Uuid::now_v7());

        Ok(channel.consume(queue, &consumer_tag).await?)
    }

    /// Stops every live worker with `cause` and refuses further scaling. Idempotent.
    async fn stop(&self, cause: StopCause) {
        let mut pool = self.pool.lock().await;

        if !pool.stopping {
            pool.stopping = true;
            info!(
                queue = %self.config.queue_name,
                workers = pool.workers.len(),
                cause = %cause,
                "Stopping workers"
            );
        }

        for worker in &pool.workers {
            worker.cancel(cause);
        }
        drop(pool);

        self.probe.close().await;
    }

    /// Joins every worker handed out so far, including scaled-in ones.
    async fn drain(&self) {
        let handles: Vec<WorkerHandle> = {
            let mut pool = self.pool.lock().await;
            let mut handles: Vec<WorkerHandle> = pool.workers.drain(..).collect();
            handles.append(&mut pool.retired);

            handles
        };

        for handle in handles {
            handle.join().await;
        }
    }

    async fn watch_shutdown(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        shutdown.cancelled().await;

        self.stop(StopCause::Shutdown).await;
    }

    async fn monitor(self: Arc<Self>) {
        let period = self.config.check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        debug!(queue = %self.config.queue_name, "Monitor loop stopped");
    }

    async fn tick(&self) {
        let queue = self.config.queue_name.as_str();

        if let Some(monitor) = &self.availability {
            if !self.config.dependent_systems.is_empty() {
                monitor.refresh(&self.config.dependent_systems).await;
            }
        }

        let current = self.pool.lock().await.workers.len();

        let depth = match self.probe.probe().await {
            Ok(depth) => depth,
            Err(e) => {
                let cached = self
                    .probe
                    .cached()
                    .await
                    .and_then(|cached| cached.fresh(Instant::now(), self.config.depth_cache_ttl()));

                match cached {
                    Some(depth) => {
                        warn!(queue, queue_depth = depth, error = %e, "Using cached queue depth");
                        depth
                    }
                    None => {
                        warn!(queue, error = %e, "No usable queue depth; skipping scaling check");
                        self.metrics.set_worker_count(queue, current);

                        return;
                    }
                }
            }
        };

        self.metrics.set_queue_depth(queue, depth);
        self.metrics.set_worker_count(queue, current);

        let now = Instant::now();
        let action = {
            let mut state = self.scaling.lock().await;

            self.strategy.decide(
                &mut state,
                ScalingContext {
                    queue_depth: depth,
                    current_workers: current,
                    now,
                },
            )
        };

        let Some(target) = action.target() else {
            return;
        };
        let direction = action.direction();

        info!(
            queue,
            direction = %direction,
            current,
            target,
            queue_depth = depth,
            "Scaling decision"
        );
        self.metrics.inc_scaling_decision(queue, direction);

        match self.scale(target, false).await {
            Ok(_) => {
                self.scaling
                    .lock()
                    .await
                    .record_scale(now, direction, depth);
            }
            Err(e) => warn!(queue, target, error = %e, "Scaling failed"),
        }
    }
}

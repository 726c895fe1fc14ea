//! Blocking gates over upstream systems.
//!
//! A gate is raised (closed) while its system is unavailable; consumer tasks
//! wait on it before processing. Transitions are made by one actor at a time,
//! the [`AvailabilityMonitor`]; waiting is lock-free from the task's side.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    sync::{mpsc, watch, Mutex, Notify},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{errors::RmqResult, options::TopicDefaults, shutdown::ShutdownSignal};

/// Pending immediate-disable signals kept before new ones are dropped.
pub const SIGNAL_BUFFER: usize = 100;

/// Reports whether an upstream system currently accepts work.
#[async_trait]
pub trait HealthSource: Send + Sync + 'static {
    async fn is_system_enabled(&self, system: &str) -> RmqResult<bool>;
}

pub struct AvailabilityGate {
    system: String,
    available: watch::Sender<bool>,
}

impl AvailabilityGate {
    pub fn new(system: &str, available: bool) -> Self {
        let (available, _) = watch::channel(available);

        Self {
            system: system.to_owned(),
            available,
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    /// Blocks waiters. Returns `false` if the gate was already raised.
    pub fn raise(&self) -> bool {
        self.available.send_if_modified(|available| {
            let changed = *available;
            *available = false;

            changed
        })
    }

    /// Releases waiters. Returns `false` if the gate was already lowered.
    pub fn lower(&self) -> bool {
        self.available.send_if_modified(|available| {
            let changed = !*available;
            *available = true;

            changed
        })
    }

    /// Resolves once the system is available.
    pub async fn wait(&self) {
        let mut rx = self.available.subscribe();
        let _ = rx.wait_for(|available| *available).await;
    }
}

/// Blocks until every one of several systems is available at once.
#[derive(Clone)]
pub struct CompositeGate {
    gates: Vec<Arc<AvailabilityGate>>,
}

impl CompositeGate {
    pub fn new(gates: Vec<Arc<AvailabilityGate>>) -> Self {
        Self { gates }
    }

    pub fn systems(&self) -> Vec<&str> {
        self.gates.iter().map(|gate| gate.system()).collect()
    }

    pub fn is_available(&self) -> bool {
        self.gates.iter().all(|gate| gate.is_available())
    }

    pub async fn wait(&self) {
        loop {
            for gate in &self.gates {
                gate.wait().await;
            }

            // An earlier gate may have been raised while a later one was awaited
            if self.is_available() {
                return;
            }
        }
    }
}

/// Process-wide registry of gates, keyed by system name, and the poller that
/// owns their transitions.
pub struct AvailabilityMonitor {
    source: Arc<dyn HealthSource>,
    gates: DashMap<String, Arc<AvailabilityGate>>,
    poll_interval: Duration,
    update_lock: Mutex<()>,
    signal_tx: mpsc::Sender<String>,
    signal_rx: Mutex<Option<mpsc::Receiver<String>>>,
    registered: Notify,
}

impl AvailabilityMonitor {
    pub fn new(source: Arc<dyn HealthSource>) -> Arc<Self> {
        Self::with_poll_interval(source, TopicDefaults::HEALTH_POLL_INTERVAL)
    }

    pub fn with_poll_interval(source: Arc<dyn HealthSource>, poll_interval: Duration) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);

        Arc::new(Self {
            source,
            gates: DashMap::new(),
            poll_interval,
            update_lock: Mutex::new(()),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            registered: Notify::new(),
        })
    }

    /// Returns the gate for `system`, creating it raised on first use.
    pub fn gate(&self, system: &str) -> Arc<AvailabilityGate> {
        if let Some(gate) = self.gates.get(system) {
            return gate.clone();
        }

        let mut created = false;
        let gate = self
            .gates
            .entry(system.to_owned())
            .or_insert_with(|| {
                created = true;
                Arc::new(AvailabilityGate::new(system, false))
            })
            .clone();

        if created {
            debug!(system, "Registered availability gate");
            // Late registrants get checked right away instead of on the next poll
            self.registered.notify_one();
        }

        gate
    }

    pub fn composite(&self, systems: &[String]) -> Option<CompositeGate> {
        if systems.is_empty() {
            return None;
        }

        Some(CompositeGate::new(
            systems.iter().map(|system| self.gate(system)).collect(),
        ))
    }

    pub fn is_available(&self, system: &str) -> bool {
        self.gates
            .get(system)
            .map(|gate| gate.is_available())
            .unwrap_or(false)
    }

    /// Best-effort request to raise `system`'s gate without waiting for a poll.
    pub fn signal_disabled(&self, system: &str) {
        if let Err(e) = self.signal_tx.try_send(system.to_owned()) {
            debug!(system, error = %e, "Dropped disable signal; next poll will catch it");
        }
    }

    /// Polls `systems` and moves their gates accordingly.
    pub async fn refresh(&self, systems: &[String]) {
        let _guard = self.update_lock.lock().await;

        for system in systems {
            let gate = self.gate(system);

            match self.source.is_system_enabled(system).await {
                Ok(true) => {
                    if gate.lower() {
                        info!(system = %system, action = "unblocking_workers", "Upstream system enabled");
                    }
                }
                Ok(false) => {
                    if gate.raise() {
                        info!(system = %system, action = "blocking_workers", "Upstream system disabled");
                    }
                }
                Err(e) => {
                    warn!(system = %system, error = %e, "Upstream health check failed");
                }
            }
        }
    }

    pub async fn refresh_all(&self) {
        let systems: Vec<String> = self.gates.iter().map(|entry| entry.key().clone()).collect();

        self.refresh(&systems).await;
    }

    async fn block_immediately(&self, system: &str) {
        let _guard = self.update_lock.lock().await;

        let gate = match self.gates.get(system) {
            Some(gate) => gate.clone(),
            None => return,
        };

        if gate.raise() {
            info!(
                system,
                action = "blocking_workers",
                source = "system_disabled_signal",
                "Upstream system disabled"
            );
        }
    }

    /// Runs the poller until shutdown. Only one poller may run per monitor.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut signals = match self.signal_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("Availability monitor already running");

                return;
            }
        };

        self.refresh_all().await;

        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.refresh_all().await,
                Some(system) = signals.recv() => self.block_immediately(&system).await,
                _ = self.registered.notified() => self.refresh_all().await,
            }
        }

        debug!("Availability monitor stopped");
    }

    pub fn spawn(self: &Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(shutdown))
    }
}

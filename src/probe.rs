use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, RwLock},
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    broker::{Broker, Channel},
    errors::{BrokerResult, RmqError, RmqResult},
};

pub const PROBE_ATTEMPTS: u32 = 3;
pub const PROBE_BASE_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedDepth {
    pub depth: u64,
    pub at: Instant,
}

impl CachedDepth {
    /// The cached depth, if it is non-zero and younger than `max_age`.
    pub fn fresh(&self, now: Instant, max_age: Duration) -> Option<u64> {
        if self.depth > 0 && now.saturating_duration_since(self.at) < max_age {
            Some(self.depth)
        } else {
            None
        }
    }
}

/// Reads queue depth over a dedicated, lazily (re)created channel that is
/// never used for consuming.
pub struct QueueDepthProbe {
    broker: Arc<dyn Broker>,
    queue: String,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    cache: Mutex<Option<CachedDepth>>,
}

impl QueueDepthProbe {
    pub fn new(broker: Arc<dyn Broker>, queue: &str) -> Self {
        Self {
            broker,
            queue: queue.to_owned(),
            channel: RwLock::new(None),
            cache: Mutex::new(None),
        }
    }

    async fn channel(&self) -> BrokerResult<Arc<dyn Channel>> {
        if let Some(channel) = self.channel.read().await.as_ref() {
            if !channel.is_closed() {
                return Ok(channel.clone());
            }
        }

        let mut slot = self.channel.write().await;

        // Another caller may have replaced it while we waited for the write lock
        if let Some(channel) = slot.as_ref() {
            if !channel.is_closed() {
                return Ok(channel.clone());
            }
        }

        let channel: Arc<dyn Channel> = Arc::from(self.broker.open_channel().await?);
        *slot = Some(channel.clone());

        Ok(channel)
    }

    async fn invalidate(&self) {
        self.channel.write().await.take();
    }

    async fn depth_once(&self) -> BrokerResult<u64> {
        let channel = self.channel().await?;

        let result = channel.queue_depth(&self.queue).await;
        if matches!(&result, Err(e) if e.is_channel_closed()) {
            self.invalidate().await;
        }

        result
    }

    /// Queue depth with up to three attempts, backing off 100ms then 200ms.
    pub async fn probe(&self) -> RmqResult<u64> {
        for attempt in 0..PROBE_ATTEMPTS {
            match self.depth_once().await {
                Ok(depth) => {
                    if attempt > 0 {
                        info!(queue = %self.queue, attempt = attempt + 1, "Queue depth retry succeeded");
                    }

                    *self.cache.lock().await = Some(CachedDepth {
                        depth,
                        at: Instant::now(),
                    });

                    return Ok(depth);
                }
                Err(e) => {
                    if attempt + 1 < PROBE_ATTEMPTS {
                        let delay = PROBE_BASE_DELAY * 2u32.pow(attempt);

                        warn!(
                            queue = %self.queue,
                            attempt = attempt + 1,
                            max_retries = PROBE_ATTEMPTS,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Queue depth retry"
                        );

                        sleep(delay).await;
                    } else {
                        warn!(queue = %self.queue, attempt = attempt + 1, error = %e, "Queue depth probe failed");
                    }
                }
            }
        }

        Err(RmqError::ProbeExhausted {
            queue: self.queue.clone(),
            attempts: PROBE_ATTEMPTS,
        })
    }

    pub async fn cached(&self) -> Option<CachedDepth> {
        *self.cache.lock().await
    }

    pub async fn close(&self) {
        if let Some(channel) = self.channel.write().await.take() {
            if let Err(e) = channel.close().await {
                debug!(queue = %self.queue, error = %e, "Failed to close depth probe channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    #[tokio::test(start_paused = true)]
    async fn test_probe_retries_then_gives_up() {
        let broker = InMemoryBroker::new();
        let probe = QueueDepthProbe::new(Arc::new(broker.clone()), "missing");

        let started = Instant::now();
        let result = probe.probe().await;

        assert!(matches!(
            result,
            Err(RmqError::ProbeExhausted { attempts: 3, .. })
        ));
        // 100ms + 200ms between the three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(310));
        assert!(probe.cached().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_caches_and_reuses_channel() {
        let broker = InMemoryBroker::new();
        broker.publish("jobs", "a").await.unwrap();
        broker.publish("jobs", "b").await.unwrap();

        let probe = QueueDepthProbe::new(Arc::new(broker.clone()), "jobs");

        assert_eq!(probe.probe().await.unwrap(), 2);
        assert_eq!(probe.probe().await.unwrap(), 2);
        assert_eq!(broker.open_channels(), 1);

        let cached = probe.cached().await.unwrap();
        let ttl = Duration::from_secs(600);
        assert_eq!(cached.fresh(Instant::now(), ttl), Some(2));
        assert_eq!(cached.fresh(cached.at + ttl, ttl), None);

        probe.close().await;
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_recreates_closed_channel() {
        let broker = InMemoryBroker::new();
        broker.publish("jobs", "a").await.unwrap();

        let probe = QueueDepthProbe::new(Arc::new(broker.clone()), "jobs");
        assert_eq!(probe.probe().await.unwrap(), 1);

        let channel = probe.channel.read().await.clone().unwrap();
        channel.close().await.unwrap();

        assert_eq!(probe.probe().await.unwrap(), 1);
        assert_eq!(broker.open_channels(), 1);
    }

    #[test]
    fn test_zero_depth_is_never_served_from_cache() {
        let cached = CachedDepth {
            depth: 0,
            at: Instant::now(),
        };

        assert_eq!(cached.fresh(cached.at, Duration::from_secs(600)), None);
    }
}

use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use fred::{
    error::Error,
    prelude::{Client, ClientLike, Config, LuaInterface, StreamsInterface},
};
use tokio::{
    sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore},
    time::sleep,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    broker::{Broker, Channel, DeliveryStream, QueueInfo},
    delivery::{Acker, Delivery},
    errors::{BrokerError, BrokerResult, RmqResult},
};

#[derive(Clone, Debug)]
pub struct RedisBrokerOptions {
    pub group: String,                      // Consumer group shared by every channel
    pub poll_interval: u64,                 // Milliseconds between fetches on an empty stream
    pub pending_timeout: Option<u64>,       // Idle milliseconds after which a pending entry is reclaimed
    pub dead_letter_suffix: Option<String>, // Rejected entries go to `{queue}{suffix}`
    pub fetch_window: u32,                  // Unacked entries per consumer when no prefetch is set
}

impl Default for RedisBrokerOptions {
    fn default() -> Self {
        Self {
            group: "default_group".to_string(),
            poll_interval: 100,
            pending_timeout: Some(300_000),
            dead_letter_suffix: Some(":dlq".to_string()),
            fetch_window: 100,
        }
    }
}

/// Upper bound on the fetch retry backoff, as a power of two of `poll_interval`.
const MAX_BACKOFF_SHIFT: u32 = 5;

/// Redis Streams transport: one stream per queue, one consumer group per
/// broker, one group consumer per channel.
#[derive(Clone)]
pub struct RedisBroker {
    client: Arc<Client>,
    options: RedisBrokerOptions,
    scripts: Scripts,
}

#[derive(Clone)]
struct Scripts {
    fetch: String,
    depth: String,
    requeue: String,
}

impl RedisBroker {
    pub async fn new(client: Arc<Client>, options: RedisBrokerOptions) -> RmqResult<Self> {
        let fetch = include_str!("../../scripts/fetch.lua");
        let depth = include_str!("../../scripts/depth.lua");
        let requeue = include_str!("../../scripts/requeue.lua");

        let scripts = if client.is_clustered() {
            Scripts {
                fetch: client.script_load_cluster(fetch).await?,
                depth: client.script_load_cluster(depth).await?,
                requeue: client.script_load_cluster(requeue).await?,
            }
        } else {
            Scripts {
                fetch: client.script_load(fetch).await?,
                depth: client.script_load(depth).await?,
                requeue: client.script_load(requeue).await?,
            }
        };

        Ok(Self {
            client,
            options,
            scripts,
        })
    }

    pub async fn from_url(url: &str, options: RedisBrokerOptions) -> RmqResult<Self> {
        let config = Config::from_url(url)?;
        let client = Arc::new(Client::new(config, None, None, None));
        client.connect();
        client.wait_for_connect().await?;

        Self::new(client, options).await
    }

    pub fn client(&self) -> Arc<Client> {
        self.client.clone()
    }

    pub fn dead_letter_queue(&self, queue: &str) -> Option<String> {
        self.options
            .dead_letter_suffix
            .as_ref()
            .map(|suffix| format!("{}{}", queue, suffix))
    }

    pub async fn publish(&self, queue: &str, body: &str) -> RmqResult<()> {
        self.client
            .xadd::<(), _, _, _, _>(queue, false, None, "*", ("data", body))
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn open_channel(&self) -> BrokerResult<Box<dyn Channel>> {
        if !self.client.is_connected() {
            return Err(BrokerError::ChannelClosed);
        }

        let (closed, _) = watch::channel(false);

        Ok(Box::new(RedisChannel {
            client: self.client.clone(),
            options: self.options.clone(),
            scripts: self.scripts.clone(),
            consumer: format!("{}-{}", self.options.group, Uuid::now_v7()),
            prefetch: AtomicU32::new(0),
            closed: Arc::new(closed),
            next_tag: Arc::new(AtomicU64::new(0)),
            unsettled: Arc::new(DashSet::new()),
        }))
    }
}

/// `(stream, entry id)` pairs fetched into a consumer's pending list but not
/// yet acked or rejected.
type Unsettled = Arc<DashSet<(String, String)>>;

struct RedisChannel {
    client: Arc<Client>,
    options: RedisBrokerOptions,
    scripts: Scripts,
    consumer: String,
    prefetch: AtomicU32,
    closed: Arc<watch::Sender<bool>>,
    next_tag: Arc<AtomicU64>,
    unsettled: Unsettled,
}

impl RedisChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(BrokerError::ChannelClosed);
        }

        Ok(())
    }
}

#[async_trait]
impl Channel for RedisChannel {
    async fn declare_queue(&self, name: &str, _durable: bool) -> BrokerResult<QueueInfo> {
        self.ensure_open()?;

        let stream = name.to_owned();

        self.client
            .xgroup_create::<(), _, _, _>(&stream, &self.options.group, "0", true)
            .await
            .or_else(|e| {
                if e.details().contains("BUSYGROUP") {
                    debug!(
                        "Consumer group '{}' for stream '{}' already exists. Ignoring error.",
                        self.options.group, stream
                    );
                    Ok(())
                } else {
                    Err(e)
                }
            })?;

        let depth = self.queue_depth(name).await?;

        Ok(QueueInfo {
            name: stream,
            depth,
        })
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.ensure_open()?;
        self.prefetch.store(u32::from(count), Ordering::SeqCst);

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        self.ensure_open()?;

        let window = match self.prefetch.load(Ordering::SeqCst) {
            0 => self.options.fetch_window.max(1),
            count => count,
        } as usize;
        let (tx, rx) = mpsc::channel(window);

        let fetcher = Fetcher {
            client: self.client.clone(),
            stream: queue.to_owned(),
            group: self.options.group.clone(),
            consumer: self.consumer.clone(),
            fetch_hash: self.scripts.fetch.clone(),
            requeue_hash: self.scripts.requeue.clone(),
            poll_interval: Duration::from_millis(self.options.poll_interval),
            pending_timeout: self.options.pending_timeout,
            dead_letter: self
                .options
                .dead_letter_suffix
                .as_ref()
                .map(|suffix| format!("{}{}", queue, suffix)),
            window: Arc::new(Semaphore::new(window)),
            next_tag: self.next_tag.clone(),
            closed: self.closed.subscribe(),
            unsettled: self.unsettled.clone(),
        };

        debug!(
            "Consumer '{}' ({}) reading stream '{}' with window {}",
            self.consumer, consumer_tag, queue, window
        );

        tokio::spawn(fetcher.run(tx));

        Ok(rx)
    }

    async fn queue_depth(&self, queue: &str) -> BrokerResult<u64> {
        self.ensure_open()?;

        let stream = queue.to_owned();
        let depth = self
            .client
            .evalsha::<i64, _, _, _>(&self.scripts.depth, &[&stream], &[&self.options.group])
            .await?;

        Ok(depth.max(0) as u64)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow() || !self.client.is_connected()
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.send_replace(true);

        let requeued = requeue_unsettled(
            &self.client,
            &self.scripts.requeue,
            &self.options.group,
            &self.unsettled,
        )
        .await?;

        if requeued > 0 {
            debug!(
                "Consumer '{}' handed back {} unsettled entries",
                self.consumer, requeued
            );
        }

        Ok(())
    }
}

/// Re-adds every unsettled entry to its stream and drops the original from
/// the group's pending list. Entries whose stream is unreachable stay pending
/// and fall to `pending_timeout` reclaiming.
async fn requeue_unsettled(
    client: &Client,
    requeue_hash: &str,
    group: &str,
    unsettled: &DashSet<(String, String)>,
) -> BrokerResult<usize> {
    let keys: Vec<(String, String)> = unsettled.iter().map(|key| key.key().clone()).collect();

    let mut by_stream: Vec<(String, Vec<String>)> = Vec::new();
    for key in keys {
        // Settled concurrently, or taken by another caller
        let Some((stream, entry_id)) = unsettled.remove(&key) else {
            continue;
        };

        match by_stream.iter_mut().find(|(name, _)| *name == stream) {
            Some((_, ids)) => ids.push(entry_id),
            None => by_stream.push((stream, vec![entry_id])),
        }
    }

    let mut requeued = 0;
    let mut failure = None;

    for (stream, ids) in by_stream {
        let mut args = Vec::with_capacity(ids.len() + 1);
        args.push(group.to_owned());
        args.extend(ids);

        match client
            .evalsha::<i64, _, _, _>(requeue_hash, vec![stream.clone()], args)
            .await
        {
            Ok(count) => requeued += count.max(0) as usize,
            Err(e) => {
                warn!("Failed to requeue unsettled entries of stream '{}': {}", stream, e);
                failure = Some(BrokerError::from(e));
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(requeued),
    }
}

struct Fetcher {
    client: Arc<Client>,
    stream: String,
    group: String,
    consumer: String,
    fetch_hash: String,
    requeue_hash: String,
    poll_interval: Duration,
    pending_timeout: Option<u64>,
    dead_letter: Option<String>,
    window: Arc<Semaphore>,
    next_tag: Arc<AtomicU64>,
    closed: watch::Receiver<bool>,
    unsettled: Unsettled,
}

async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Delay before the next fetch after `failures` consecutive errors.
fn retry_delay(poll_interval: Duration, failures: u32) -> Duration {
    poll_interval * 2u32.pow(failures.saturating_sub(1).min(MAX_BACKOFF_SHIFT))
}

/// A fetch error the stream cannot recover from.
fn ends_stream(error: &BrokerError, connected: bool) -> bool {
    error.is_channel_closed() || !connected
}

impl Fetcher {
    async fn run(mut self, tx: mpsc::Sender<Delivery>) {
        let pending_timeout_arg = match self.pending_timeout {
            Some(timeout) => timeout.to_string(),
            None => "nil".to_string(),
        };
        let mut failures: u32 = 0;

        'fetch: loop {
            let first = tokio::select! {
                biased;

                _ = closed_signal(&mut self.closed) => break,
                permit = self.window.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let batch_size = (1 + self.window.available_permits()).to_string();

            let result: Result<Vec<(String, String, u32)>, Error> = self
                .client
                .evalsha::<Vec<(String, String, u32)>, _, _, _>(
                    &self.fetch_hash,
                    &[&self.stream],
                    &[&self.group, &self.consumer, &batch_size, &pending_timeout_arg],
                )
                .await;

            let entries = match result {
                Ok(entries) => {
                    failures = 0;
                    entries
                }
                Err(e) => {
                    let error = BrokerError::from(e);

                    if ends_stream(&error, self.client.is_connected()) {
                        error!(
                            "Lost connection fetching from stream '{}': {}",
                            self.stream, error
                        );
                        break;
                    }

                    failures += 1;
                    let delay = retry_delay(self.poll_interval, failures);

                    if failures == 1 {
                        error!("Error fetching from stream '{}': {}", self.stream, error);
                    } else {
                        debug!(
                            "Fetch from stream '{}' failed {} times in a row, retrying in {:?}: {}",
                            self.stream, failures, delay, error
                        );
                    }

                    drop(first);

                    tokio::select! {
                        biased;

                        _ = closed_signal(&mut self.closed) => break,
                        _ = sleep(delay) => continue,
                    }
                }
            };

            for (entry_id, _, _) in &entries {
                self.unsettled
                    .insert((self.stream.clone(), entry_id.clone()));
            }

            // Closed mid-fetch: the requeue below hands these back
            if *self.closed.borrow() {
                break;
            }

            if entries.is_empty() {
                drop(first);

                tokio::select! {
                    biased;

                    _ = closed_signal(&mut self.closed) => break,
                    _ = sleep(self.poll_interval) => continue,
                }
            }

            let mut first = Some(first);

            for (entry_id, data, redelivered) in entries {
                let permit = match first.take() {
                    Some(permit) => permit,
                    None => tokio::select! {
                        biased;

                        _ = closed_signal(&mut self.closed) => break 'fetch,
                        permit = self.window.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break 'fetch,
                        },
                    },
                };

                let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                let acker = RedisAcker {
                    client: self.client.clone(),
                    stream: self.stream.clone(),
                    group: self.group.clone(),
                    entry_id,
                    body: data.clone(),
                    dead_letter: self.dead_letter.clone(),
                    closed: self.closed.clone(),
                    unsettled: self.unsettled.clone(),
                    _permit: permit,
                };
                let delivery = Delivery::new(tag, Bytes::from(data), redelivered > 0, Box::new(acker));

                if tx.send(delivery).await.is_err() {
                    debug!("Consumer '{}' receiver dropped", self.consumer);

                    break 'fetch;
                }
            }
        }

        // Fetched but never handed out, or handed to a consumer that is gone
        match requeue_unsettled(
            &self.client,
            &self.requeue_hash,
            &self.group,
            &self.unsettled,
        )
        .await
        {
            Ok(0) => {}
            Ok(requeued) => debug!(
                "Consumer '{}' handed back {} unsettled entries",
                self.consumer, requeued
            ),
            Err(e) => debug!(
                "Consumer '{}' could not hand back unsettled entries: {}",
                self.consumer, e
            ),
        }

        debug!("Consumer '{}' fetcher terminated.", self.consumer);
    }
}

struct RedisAcker {
    client: Arc<Client>,
    stream: String,
    group: String,
    entry_id: String,
    body: String,
    dead_letter: Option<String>,
    closed: watch::Receiver<bool>,
    unsettled: Unsettled,
    _permit: OwnedSemaphorePermit,
}

impl RedisAcker {
    /// Takes the entry out of the unsettled set. Fails once the channel has
    /// closed or its requeue already handed the entry back.
    fn claim(&self) -> BrokerResult<(String, String)> {
        if *self.closed.borrow() {
            return Err(BrokerError::ChannelClosed);
        }

        self.unsettled
            .remove(&(self.stream.clone(), self.entry_id.clone()))
            .ok_or(BrokerError::ChannelClosed)
    }

    async fn remove(&self) -> BrokerResult<()> {
        self.client
            .xack::<(), _, _, _>(&self.stream, &self.group, &self.entry_id)
            .await?;
        self.client
            .xdel::<(), _, _>(&self.stream, self.entry_id.as_str())
            .await?;

        Ok(())
    }

    async fn reject(&self, requeue: bool) -> BrokerResult<()> {
        if requeue {
            self.client
                .xadd::<(), _, _, _, _>(
                    &self.stream,
                    true,
                    None,
                    "*",
                    vec![("data", self.body.as_str()), ("redelivered", "1")],
                )
                .await?;
        } else if let Some(dead_letter) = &self.dead_letter {
            self.client
                .xadd::<(), _, _, _, _>(
                    dead_letter,
                    false,
                    None,
                    "*",
                    vec![("data", self.body.as_str()), ("source", self.stream.as_str())],
                )
                .await?;
        }

        self.remove().await
    }
}

#[async_trait]
impl Acker for RedisAcker {
    async fn ack(&self) -> BrokerResult<()> {
        let key = self.claim()?;

        let result = self.remove().await;
        if result.is_err() {
            self.unsettled.insert(key);
        }

        result
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        let key = self.claim()?;

        let result = self.reject(requeue).await;
        if result.is_err() {
            self.unsettled.insert(key);
        }

        result
    }
}

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::{
    broker::{Broker, Channel, DeliveryStream, QueueInfo},
    delivery::{Acker, Delivery},
    errors::{BrokerError, BrokerResult},
};

/// Unacknowledged deliveries allowed per consumer when no prefetch is set.
pub const DEFAULT_WINDOW: usize = 100;

/// In-process broker with durable named queues, per-channel prefetch windows,
/// redelivery of unacknowledged messages and dead-letter routing.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    queues: DashMap<String, Arc<MemoryQueue>>,
    dead_letters: DashMap<String, String>, // queue -> dead-letter queue
    channels: DashMap<u64, Arc<watch::Sender<bool>>>,
    next_channel: AtomicU64,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl BrokerState {
    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(MemoryQueue::default()))
            .clone()
    }

    fn existing_queue(&self, name: &str) -> BrokerResult<Arc<MemoryQueue>> {
        self.queues
            .get(name)
            .map(|queue| queue.clone())
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_owned()))
    }
}

#[derive(Clone)]
struct Message {
    body: Bytes,
    redelivered: bool,
}

struct Unacked {
    body: Bytes,
    channel_id: u64,
}

#[derive(Default)]
struct MemoryQueue {
    ready: Mutex<VecDeque<Message>>,
    unacked: Mutex<HashMap<u64, Unacked>>,
    notify: Notify,
}

impl MemoryQueue {
    async fn push(&self, message: Message) {
        self.ready.lock().await.push_back(message);
        self.notify.notify_one();
    }

    async fn push_front(&self, message: Message) {
        self.ready.lock().await.push_front(message);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Message {
        loop {
            {
                let mut ready = self.ready.lock().await;

                if let Some(message) = ready.pop_front() {
                    // Hand the wakeup on so sibling consumers drain the rest
                    if !ready.is_empty() {
                        self.notify.notify_one();
                    }

                    return message;
                }
            }

            self.notify.notified().await;
        }
    }

    async fn depth(&self) -> u64 {
        self.ready.lock().await.len() as u64
    }

    async fn track(&self, tag: u64, unacked: Unacked) {
        self.unacked.lock().await.insert(tag, unacked);
    }

    async fn settle(&self, tag: u64) -> Option<Unacked> {
        self.unacked.lock().await.remove(&tag)
    }

    async fn requeue(&self, tag: u64) {
        if let Some(entry) = self.settle(tag).await {
            self.push_front(Message {
                body: entry.body,
                redelivered: true,
            })
            .await;
        }
    }

    async fn requeue_channel(&self, channel_id: u64) -> usize {
        let returned: Vec<Bytes> = {
            let mut unacked = self.unacked.lock().await;
            let mut tags: Vec<u64> = unacked
                .iter()
                .filter(|(_, entry)| entry.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable();

            tags.into_iter()
                .filter_map(|tag| unacked.remove(&tag))
                .map(|entry| entry.body)
                .collect()
        };

        let count = returned.len();

        if count > 0 {
            let mut ready = self.ready.lock().await;

            for body in returned.into_iter().rev() {
                ready.push_front(Message {
                    body,
                    redelivered: true,
                });
            }
            drop(ready);

            self.notify.notify_one();
        }

        count
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes messages of `queue` rejected without requeue to `dead_letter_queue`.
    pub fn dead_letter(&self, queue: &str, dead_letter_queue: &str) -> &Self {
        self.state
            .dead_letters
            .insert(queue.to_owned(), dead_letter_queue.to_owned());
        self.state.queue(dead_letter_queue);

        self
    }

    pub async fn publish(&self, queue: &str, body: impl Into<Bytes>) -> BrokerResult<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }

        self.state
            .queue(queue)
            .push(Message {
                body: body.into(),
                redelivered: false,
            })
            .await;

        Ok(())
    }

    /// Messages ready for delivery.
    pub async fn depth(&self, queue: &str) -> u64 {
        match self.state.existing_queue(queue) {
            Ok(queue) => queue.depth().await,
            Err(_) => 0,
        }
    }

    /// Messages delivered but not yet settled.
    pub async fn unacked(&self, queue: &str) -> usize {
        match self.state.existing_queue(queue) {
            Ok(queue) => queue.unacked.lock().await.len(),
            Err(_) => 0,
        }
    }

    /// Bodies currently ready on `queue`, oldest first.
    pub async fn ready_bodies(&self, queue: &str) -> Vec<Bytes> {
        match self.state.existing_queue(queue) {
            Ok(queue) => queue
                .ready
                .lock()
                .await
                .iter()
                .map(|message| message.body.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn open_channels(&self) -> usize {
        self.state.channels.len()
    }

    /// Fails every open channel and refuses new ones, as a lost connection would.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);

        for entry in self.state.channels.iter() {
            entry.value().send_replace(true);
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_channel(&self) -> BrokerResult<Box<dyn Channel>> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }

        let id = self.state.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        self.state.channels.insert(id, closed.clone());

        Ok(Box::new(MemoryChannel {
            id,
            state: self.state.clone(),
            closed,
            prefetch: AtomicU32::new(0),
            consumed: Mutex::new(Vec::new()),
        }))
    }
}

struct MemoryChannel {
    id: u64,
    state: Arc<BrokerState>,
    closed: Arc<watch::Sender<bool>>,
    prefetch: AtomicU32, // 0 = unbounded (DEFAULT_WINDOW)
    consumed: Mutex<Vec<Arc<MemoryQueue>>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(BrokerError::ChannelClosed);
        }

        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, name: &str, _durable: bool) -> BrokerResult<QueueInfo> {
        self.ensure_open()?;

        let queue = self.state.queue(name);

        Ok(QueueInfo {
            name: name.to_owned(),
            depth: queue.depth().await,
        })
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.ensure_open()?;
        self.prefetch.store(u32::from(count), Ordering::SeqCst);

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        self.ensure_open()?;

        let memory_queue = self.state.existing_queue(queue)?;
        let window = match self.prefetch.load(Ordering::SeqCst) {
            0 => DEFAULT_WINDOW,
            count => count as usize,
        };
        let (tx, rx) = mpsc::channel(window);

        self.consumed.lock().await.push(memory_queue.clone());

        let pump = Pump {
            queue_name: queue.to_owned(),
            queue: memory_queue,
            state: self.state.clone(),
            window: Arc::new(Semaphore::new(window)),
            channel_id: self.id,
            closed: self.closed.subscribe(),
        };

        debug!(queue, consumer_tag, window, "In-memory consumer started");

        tokio::spawn(pump.run(tx));

        Ok(rx)
    }

    async fn queue_depth(&self, queue: &str) -> BrokerResult<u64> {
        self.ensure_open()?;

        Ok(self.state.existing_queue(queue)?.depth().await)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.state.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.send_replace(true);
        self.state.channels.remove(&self.id);

        let consumed: Vec<Arc<MemoryQueue>> = self.consumed.lock().await.drain(..).collect();

        for queue in consumed {
            let returned = queue.requeue_channel(self.id).await;

            if returned > 0 {
                debug!(channel = self.id, returned, "Requeued unacknowledged deliveries");
            }
        }

        Ok(())
    }
}

struct Pump {
    queue_name: String,
    queue: Arc<MemoryQueue>,
    state: Arc<BrokerState>,
    window: Arc<Semaphore>,
    channel_id: u64,
    closed: watch::Receiver<bool>,
}

async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

impl Pump {
    async fn run(mut self, tx: mpsc::Sender<Delivery>) {
        loop {
            let permit = tokio::select! {
                _ = closed_signal(&mut self.closed) => break,
                permit = self.window.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let message = tokio::select! {
                _ = closed_signal(&mut self.closed) => break,
                message = self.queue.pop() => message,
            };

            let tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            self.queue
                .track(
                    tag,
                    Unacked {
                        body: message.body.clone(),
                        channel_id: self.channel_id,
                    },
                )
                .await;

            // The channel may have closed between pop and track
            if *self.closed.borrow() {
                self.queue.requeue(tag).await;

                break;
            }

            let acker = MemoryAcker {
                queue_name: self.queue_name.clone(),
                queue: self.queue.clone(),
                state: self.state.clone(),
                closed: self.closed.clone(),
                tag,
                _permit: permit,
            };
            let delivery = Delivery::new(tag, message.body, message.redelivered, Box::new(acker));

            if tx.send(delivery).await.is_err() {
                self.queue.requeue(tag).await;

                break;
            }
        }

        debug!(queue = %self.queue_name, channel = self.channel_id, "In-memory consumer stopped");
    }
}

struct MemoryAcker {
    queue_name: String,
    queue: Arc<MemoryQueue>,
    state: Arc<BrokerState>,
    closed: watch::Receiver<bool>,
    tag: u64,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    async fn take(&self) -> BrokerResult<Unacked> {
        if *self.closed.borrow() {
            return Err(BrokerError::ChannelClosed);
        }

        self.queue
            .settle(self.tag)
            .await
            .ok_or(BrokerError::ChannelClosed)
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.take().await.map(|_| ())
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        let entry = self.take().await?;

        if requeue {
            self.queue
                .push_front(Message {
                    body: entry.body,
                    redelivered: true,
                })
                .await;

            return Ok(());
        }

        let dead_letter = self
            .state
            .dead_letters
            .get(&self.queue_name)
            .map(|name| name.clone());

        match dead_letter {
            Some(dead_letter) => {
                self.state
                    .queue(&dead_letter)
                    .push(Message {
                        body: entry.body,
                        redelivered: false,
                    })
                    .await;
            }
            None => {
                debug!(queue = %self.queue_name, tag = self.tag, "Dropped rejected delivery");
            }
        }

        Ok(())
    }
}

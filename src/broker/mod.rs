//! Transport abstraction the pool consumes. The pool never speaks a broker
//! protocol itself; it opens channels, declares queues, consumes deliveries
//! and reads queue depth through these traits.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{delivery::Delivery, errors::BrokerResult};

pub mod memory;
pub mod redis;

pub use memory::InMemoryBroker;
pub use redis::{RedisBroker, RedisBrokerOptions};

/// Deliveries pushed by the broker to one consumer. The stream ending means
/// the channel went away.
pub type DeliveryStream = mpsc::Receiver<Delivery>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub depth: u64, // Messages ready for delivery
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn open_channel(&self) -> BrokerResult<Box<dyn Channel>>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Declares a queue. Idempotent.
    async fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<QueueInfo>;

    /// Limits unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    /// Read-only depth lookup; never consumes.
    async fn queue_depth(&self, queue: &str) -> BrokerResult<u64>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> BrokerResult<()>;
}

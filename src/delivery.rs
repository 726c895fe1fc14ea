use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::errors::{BrokerResult, RmqError, RmqResult};

/// Settles one delivery with the broker it came from.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;

    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// A message handed to a consumer task. The body is opaque to the pool.
pub struct Delivery {
    delivery_tag: u64,
    body: Bytes,
    redelivered: bool,
    acker: Box<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: Bytes, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            delivery_tag,
            body,
            redelivered,
            acker,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Removes the message from the queue.
    pub async fn ack(self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    /// Rejects the message. Without requeue the broker dead-letters or drops it.
    pub async fn reject(self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }

    pub fn text(&self) -> RmqResult<&str> {
        if self.body.is_empty() {
            return Err(RmqError::DeserializationError(
                "empty message body".to_string(),
            ));
        }

        std::str::from_utf8(&self.body).map_err(|e| RmqError::DeserializationError(e.to_string()))
    }

    pub fn json<T: DeserializeOwned>(&self) -> RmqResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn parse_i64(&self) -> RmqResult<i64> {
        let text = self.text()?;

        text.trim().parse::<i64>().map_err(|e| {
            RmqError::DeserializationError(format!("invalid integer body '{}': {}", text, e))
        })
    }
}

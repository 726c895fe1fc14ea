use std::{error::Error as StdError, fmt, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("channel closed")]
    ChannelClosed,

    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("broker transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, BrokerError::ChannelClosed)
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl From<fred::error::Error> for BrokerError {
    fn from(err: fred::error::Error) -> Self {
        match err.kind() {
            fred::error::ErrorKind::IO | fred::error::ErrorKind::Canceled => {
                BrokerError::ChannelClosed
            }
            _ => BrokerError::Transport(err.to_string()),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum RmqError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(String),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("topic '{queue}' failed to start: {reason}")]
    StartError { queue: String, reason: String },

    #[error("failed to get depth of queue '{queue}' after {attempts} attempts")]
    ProbeExhausted { queue: String, attempts: u32 },

    #[error("pool is shutting down")]
    ShuttingDown,

    #[error("health check failed: {0}")]
    Health(String),
}

pub type RmqResult<T> = Result<T, RmqError>;

impl From<fred::error::Error> for RmqError {
    fn from(err: fred::error::Error) -> Self {
        RmqError::ConnectionError(err.to_string())
    }
}

impl From<serde_json::Error> for RmqError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            serde_json::error::Category::Io => RmqError::SerializationError(err.to_string()),
            serde_json::error::Category::Syntax | serde_json::error::Category::Data => {
                RmqError::DeserializationError(err.to_string())
            }
            serde_json::error::Category::Eof => RmqError::DeserializationError(err.to_string()),
        }
    }
}

/// Error returned by a processing function. Any value of this type makes the
/// delivery fail permanently.
#[derive(Debug, Clone)]
pub struct ConsumerError(Arc<dyn StdError + Send + Sync>);

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl StdError for ConsumerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl ConsumerError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ConsumerError(Arc::new(error))
    }

    pub fn msg(message: impl Into<String>) -> Self {
        ConsumerError(Arc::new(MessageError(message.into())))
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for MessageError {}

impl From<RmqError> for ConsumerError {
    fn from(error: RmqError) -> Self {
        ConsumerError(Arc::new(error))
    }
}

impl From<BrokerError> for ConsumerError {
    fn from(error: BrokerError) -> Self {
        ConsumerError(Arc::new(error))
    }
}

#[cfg(feature = "anyhow")]
impl From<anyhow::Error> for ConsumerError {
    fn from(error: anyhow::Error) -> Self {
        let boxed: Box<dyn StdError + Send + Sync> = error.into();
        ConsumerError(Arc::from(boxed))
    }
}

#[cfg(feature = "eyre")]
impl From<eyre::Report> for ConsumerError {
    fn from(error: eyre::Report) -> Self {
        let boxed: Box<dyn StdError + Send + Sync> = error.into();
        ConsumerError(Arc::from(boxed))
    }
}

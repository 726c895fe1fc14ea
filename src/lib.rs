mod builder;
mod consumer;
mod delivery;
mod errors;
mod manager;
mod options;
mod probe;
mod shutdown;
mod telemetry;
mod worker;

pub mod availability;
pub mod broker;
pub mod observability;
pub mod scaling;

pub use availability::{AvailabilityGate, AvailabilityMonitor, CompositeGate, HealthSource};
pub use broker::{
    Broker, Channel, DeliveryStream, InMemoryBroker, QueueInfo, RedisBroker, RedisBrokerOptions,
};
pub use builder::{Topic, TopicBuilder};
pub use consumer::{from_fn, FnProcessor, Processor};
pub use delivery::{Acker, Delivery};
pub use errors::{BrokerError, BrokerResult, ConsumerError, RmqError, RmqResult};
pub use manager::{PoolContext, PoolManager};
pub use observability::{FacadeMetrics, NoopMetrics, Outcome, QueueMetrics};
pub use options::{LogFormat, PoolSettings, TopicConfig, TopicDefaults};
pub use probe::{CachedDepth, QueueDepthProbe, PROBE_ATTEMPTS, PROBE_BASE_DELAY};
pub use scaling::{
    HysteresisStrategy, ScaleAction, ScaleDirection, ScalingContext, ScalingState, ScalingStrategy,
};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use telemetry::init_tracing;
pub use worker::{ConsumerTask, StopCause, TaskContext, WorkerHandle};

use std::{future::Future, marker::PhantomData};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{delivery::Delivery, errors::ConsumerError, worker::TaskContext};

/// Business logic run for every delivery of a topic.
///
/// Returning `Ok` acks the delivery. Any error rejects it without requeue;
/// retrying, if wanted, is up to the implementation (for instance by
/// re-publishing to a retry queue).
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, ctx: &TaskContext, delivery: &Delivery) -> Result<(), ConsumerError>;
}

pub struct FnProcessor<F, Fut> {
    f: F,
    marker: PhantomData<fn() -> Fut>,
}

/// Wraps an async closure taking the task context and the message body.
pub fn from_fn<F, Fut>(f: F) -> FnProcessor<F, Fut>
where
    F: Fn(TaskContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ConsumerError>> + Send + 'static,
{
    FnProcessor {
        f,
        marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F, Fut>
where
    F: Fn(TaskContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ConsumerError>> + Send + 'static,
{
    async fn process(&self, ctx: &TaskContext, delivery: &Delivery) -> Result<(), ConsumerError> {
        (self.f)(ctx.clone(), delivery.body().clone()).await
    }
}

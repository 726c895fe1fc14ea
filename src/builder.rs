use std::{fmt, sync::Arc, time::Duration};

use crate::{
    consumer::Processor,
    errors::{RmqError, RmqResult},
    options::TopicConfig,
};

/// A queue descriptor paired with the function that processes its messages.
/// Created once at startup and never mutated.
#[derive(Clone)]
pub struct Topic {
    config: TopicConfig,
    processor: Arc<dyn Processor>,
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Topic {
    pub fn new<P: Processor>(config: TopicConfig, processor: P) -> Self {
        Self {
            config,
            processor: Arc::new(processor),
        }
    }

    pub fn from_shared(config: TopicConfig, processor: Arc<dyn Processor>) -> Self {
        Self { config, processor }
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    pub fn processor(&self) -> Arc<dyn Processor> {
        self.processor.clone()
    }
}

pub struct TopicBuilder {
    config: TopicConfig,
    processor: Option<Arc<dyn Processor>>,
}

impl TopicBuilder {
    pub fn new(queue_name: &str) -> Self {
        Self {
            config: TopicConfig::new(queue_name),
            processor: None,
        }
    }

    pub fn config(mut self, config: TopicConfig) -> Self {
        self.config = config;

        self
    }

    /// Convenience: set min, desired and max in one call.
    pub fn workers(mut self, min: usize, desired: usize, max: usize) -> Self {
        self.config.min_workers = min;
        self.config.desired_workers = desired;
        self.config.max_workers = max;

        self
    }

    pub fn peak_workers(mut self, peak: usize) -> Self {
        self.config.peak_workers = peak;

        self
    }

    /// Bound in-flight deliveries per consumer to `prefetch`.
    pub fn keep_in_ready(mut self, prefetch: u16) -> Self {
        self.config.keep_in_ready = true;
        self.config.prefetch_count = prefetch;

        self
    }

    pub fn thresholds(mut self, scale_up: u64, scale_down: u64) -> Self {
        self.config.scale_up_threshold = scale_up;
        self.config.scale_down_threshold = scale_down;

        self
    }

    pub fn scale_percents(mut self, up: f64, down: f64) -> Self {
        self.config.scale_up_percent = up;
        self.config.scale_down_percent = down;

        self
    }

    pub fn step_workers(mut self, min: usize, max: usize) -> Self {
        self.config.min_step_workers = min;
        self.config.max_step_workers = max;

        self
    }

    pub fn consecutive_checks(mut self, up: u32, down: u32) -> Self {
        self.config.consecutive_checks_up = up;
        self.config.consecutive_checks_down = down;

        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;

        self
    }

    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.config.check_interval = interval;

        self
    }

    pub fn depends_on(mut self, system: &str) -> Self {
        self.config.dependent_systems.push(system.to_owned());

        self
    }

    pub fn processor<P: Processor>(mut self, processor: P) -> Self {
        self.processor = Some(Arc::new(processor));

        self
    }

    pub fn build(self) -> RmqResult<Topic> {
        let processor = self
            .processor
            .ok_or_else(|| RmqError::ConfigError("`processor` not specified".to_string()))?;

        self.config.validate()?;

        Ok(Topic::from_shared(self.config, processor))
    }
}

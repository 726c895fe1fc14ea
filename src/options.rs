use std::time::Duration;

use crate::errors::{RmqError, RmqResult};

pub struct TopicDefaults;

impl TopicDefaults {
    pub const SCALE_UP_THRESHOLD: u64 = 100;
    pub const SCALE_DOWN_THRESHOLD: u64 = 10;
    pub const SCALE_UP_PERCENT: f64 = 0.2;
    pub const SCALE_DOWN_PERCENT: f64 = 0.1;
    pub const CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
    pub const COOLDOWN: Duration = Duration::from_secs(2 * 60);
    pub const CONSECUTIVE_CHECKS_UP: u32 = 2;
    pub const CONSECUTIVE_CHECKS_DOWN: u32 = 3;
    pub const MIN_STEP_WORKERS: usize = 1;
    pub const MAX_STEP_WORKERS: usize = 10;
    pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(60);
}

/// Static description of one queue and how its consumer pool may grow.
///
/// Zero-valued scaling parameters mean "use the default"; see [`TopicConfig::resolved`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TopicConfig {
    pub queue_name: String,
    pub min_workers: usize,
    pub max_workers: usize,
    pub desired_workers: usize,
    pub peak_workers: usize,          // Desired count during a peak-load window
    pub keep_in_ready: bool,          // Bound in-flight work with QoS; the rest stays ready on the broker
    pub prefetch_count: u16,          // QoS window when keep_in_ready is set (at least 1)
    pub scale_up_threshold: u64,      // Queue depth above which the pool grows
    pub scale_down_threshold: u64,    // Queue depth below which the pool shrinks
    pub scale_up_percent: f64,        // Fraction of the pool added per scale-up
    pub scale_down_percent: f64,      // Fraction of the pool removed per scale-down
    pub min_step_workers: usize,      // Lower clamp of a single scaling step
    pub max_step_workers: usize,      // Upper clamp of a single scaling step
    pub consecutive_checks_up: u32,   // Ticks above threshold before growing
    pub consecutive_checks_down: u32, // Ticks below threshold before shrinking
    pub cooldown: Duration,           // Minimum time between scaling actions
    pub check_interval: Duration,     // Monitor tick period
    pub dependent_systems: Vec<String>,
}

impl TopicConfig {
    pub fn new(queue_name: &str) -> Self {
        Self {
            queue_name: queue_name.to_owned(),
            ..Default::default()
        }
    }

    /// Returns a copy with every zero-valued scaling parameter replaced by its default.
    pub fn resolved(&self) -> Self {
        let mut config = self.clone();

        if config.scale_up_threshold == 0 {
            config.scale_up_threshold = TopicDefaults::SCALE_UP_THRESHOLD;
        }
        if config.scale_down_threshold == 0 {
            config.scale_down_threshold = TopicDefaults::SCALE_DOWN_THRESHOLD;
        }
        if config.scale_up_percent == 0.0 {
            config.scale_up_percent = TopicDefaults::SCALE_UP_PERCENT;
        }
        if config.scale_down_percent == 0.0 {
            config.scale_down_percent = TopicDefaults::SCALE_DOWN_PERCENT;
        }
        if config.check_interval.is_zero() {
            config.check_interval = TopicDefaults::CHECK_INTERVAL;
        }
        if config.cooldown.is_zero() {
            config.cooldown = TopicDefaults::COOLDOWN;
        }
        if config.consecutive_checks_up == 0 {
            config.consecutive_checks_up = TopicDefaults::CONSECUTIVE_CHECKS_UP;
        }
        if config.consecutive_checks_down == 0 {
            config.consecutive_checks_down = TopicDefaults::CONSECUTIVE_CHECKS_DOWN;
        }
        if config.min_step_workers == 0 {
            config.min_step_workers = TopicDefaults::MIN_STEP_WORKERS;
        }
        if config.max_step_workers == 0 {
            config.max_step_workers = TopicDefaults::MAX_STEP_WORKERS;
        }

        config
    }

    pub fn validate(&self) -> RmqResult<()> {
        let fail = |reason: String| {
            Err(RmqError::ConfigError(format!(
                "topic '{}': {}",
                self.queue_name, reason
            )))
        };

        if self.queue_name.is_empty() {
            return fail("`queue_name` not specified".to_string());
        }
        if self.max_workers == 0 {
            return fail("`max_workers` must be greater than zero".to_string());
        }
        if self.min_workers > self.max_workers {
            return fail(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            ));
        }
        if self.desired_workers < self.min_workers || self.desired_workers > self.max_workers {
            return fail(format!(
                "desired_workers ({}) outside [{}, {}]",
                self.desired_workers, self.min_workers, self.max_workers
            ));
        }
        if self.peak_workers > self.max_workers {
            return fail(format!(
                "peak_workers ({}) exceeds max_workers ({})",
                self.peak_workers, self.max_workers
            ));
        }
        if self.min_step_workers > self.max_step_workers && self.max_step_workers != 0 {
            return fail(format!(
                "min_step_workers ({}) exceeds max_step_workers ({})",
                self.min_step_workers, self.max_step_workers
            ));
        }

        // Zero thresholds resolve to their defaults
        let thresholds = self.resolved();
        if thresholds.scale_down_threshold >= thresholds.scale_up_threshold {
            return fail(format!(
                "scale_down_threshold ({}) must be below scale_up_threshold ({})",
                thresholds.scale_down_threshold, thresholds.scale_up_threshold
            ));
        }
        for (name, value) in [
            ("scale_up_percent", self.scale_up_percent),
            ("scale_down_percent", self.scale_down_percent),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("{name} ({value}) outside [0, 1]"));
            }
        }

        Ok(())
    }

    /// Pool size a freshly started manager fills to.
    pub fn initial_workers(&self, peak_window: bool) -> usize {
        let wanted = if peak_window {
            self.peak_workers
        } else {
            self.desired_workers
        };

        wanted.clamp(self.min_workers, self.max_workers)
    }

    /// Age after which a cached queue depth is no longer trusted.
    pub fn depth_cache_ttl(&self) -> Duration {
        self.check_interval * 2
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Process-level knobs read from the environment.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolSettings {
    pub peak_window: bool,
    pub health_poll_interval: Duration,
    pub log_format: LogFormat,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            peak_window: false,
            health_poll_interval: TopicDefaults::HEALTH_POLL_INTERVAL,
            log_format: LogFormat::Pretty,
        }
    }
}

impl PoolSettings {
    pub const PEAK_LOAD_WINDOW: &'static str = "PEAK_LOAD_WINDOW";
    pub const HEALTH_POLL_INTERVAL_SECS: &'static str = "HEALTH_POLL_INTERVAL_SECS";
    pub const LOG_FORMAT: &'static str = "LOG_FORMAT";

    pub fn from_env() -> RmqResult<Self> {
        let mut settings = Self::default();

        if let Ok(value) = std::env::var(Self::PEAK_LOAD_WINDOW) {
            settings.peak_window = matches!(value.trim(), "true" | "1");
        }

        if let Ok(value) = std::env::var(Self::HEALTH_POLL_INTERVAL_SECS) {
            let secs: u64 = value.trim().parse().map_err(|_| {
                RmqError::ConfigError(format!(
                    "{} must be a whole number of seconds, got '{}'",
                    Self::HEALTH_POLL_INTERVAL_SECS,
                    value
                ))
            })?;
            if secs == 0 {
                return Err(RmqError::ConfigError(format!(
                    "{} must be greater than zero",
                    Self::HEALTH_POLL_INTERVAL_SECS
                )));
            }
            settings.health_poll_interval = Duration::from_secs(secs);
        }

        if let Ok(value) = std::env::var(Self::LOG_FORMAT) {
            settings.log_format = match value.trim() {
                "json" => LogFormat::Json,
                "pretty" | "" => LogFormat::Pretty,
                other => {
                    return Err(RmqError::ConfigError(format!(
                        "unknown {} '{}'",
                        Self::LOG_FORMAT,
                        other
                    )))
                }
            };
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_pick_up_defaults() {
        let config = TopicConfig::new("player_crawl").resolved();

        assert_eq!(config.scale_up_threshold, 100);
        assert_eq!(config.scale_down_threshold, 10);
        assert_eq!(config.scale_up_percent, 0.2);
        assert_eq!(config.scale_down_percent, 0.1);
        assert_eq!(config.check_interval, Duration::from_secs(300));
        assert_eq!(config.cooldown, Duration::from_secs(120));
        assert_eq!(config.consecutive_checks_up, 2);
        assert_eq!(config.consecutive_checks_down, 3);
        assert_eq!(config.min_step_workers, 1);
        assert_eq!(config.max_step_workers, 10);
    }

    #[test]
    fn explicit_values_survive_resolution() {
        let config = TopicConfig {
            scale_up_percent: 0.5,
            min_step_workers: 3,
            max_step_workers: 25,
            consecutive_checks_up: 1,
            cooldown: Duration::from_secs(30),
            ..TopicConfig::new("player_crawl")
        }
        .resolved();

        assert_eq!(config.scale_up_percent, 0.5);
        assert_eq!(config.min_step_workers, 3);
        assert_eq!(config.max_step_workers, 25);
        assert_eq!(config.consecutive_checks_up, 1);
        assert_eq!(config.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn bounds_are_validated() {
        let config = TopicConfig {
            min_workers: 5,
            desired_workers: 3,
            max_workers: 10,
            ..TopicConfig::new("clan_crawl")
        };

        assert!(matches!(config.validate(), Err(RmqError::ConfigError(_))));

        let config = TopicConfig {
            min_workers: 1,
            desired_workers: 3,
            max_workers: 10,
            ..TopicConfig::new("clan_crawl")
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn thresholds_must_leave_a_dead_zone() {
        let base = TopicConfig {
            min_workers: 1,
            desired_workers: 2,
            max_workers: 4,
            ..TopicConfig::new("clan_crawl")
        };

        let overlapping = TopicConfig {
            scale_up_threshold: 50,
            scale_down_threshold: 50,
            ..base.clone()
        };
        assert!(matches!(
            overlapping.validate(),
            Err(RmqError::ConfigError(_))
        ));

        // Only the down threshold is set; up resolves to 100
        let above_default = TopicConfig {
            scale_down_threshold: 150,
            ..base.clone()
        };
        assert!(matches!(
            above_default.validate(),
            Err(RmqError::ConfigError(_))
        ));

        let below_default = TopicConfig {
            scale_down_threshold: 99,
            ..base.clone()
        };
        assert!(below_default.validate().is_ok());
        assert!(base.validate().is_ok());
    }

    #[test]
    fn peak_window_uses_peak_workers() {
        let config = TopicConfig {
            min_workers: 2,
            desired_workers: 4,
            peak_workers: 12,
            max_workers: 20,
            ..TopicConfig::new("pgcr_crawl")
        };

        assert_eq!(config.initial_workers(false), 4);
        assert_eq!(config.initial_workers(true), 12);
    }
}

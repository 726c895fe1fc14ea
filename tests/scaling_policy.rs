use std::time::Duration;

use rmq_pool::{
    HysteresisStrategy, ScaleAction, ScaleDirection, ScalingContext, ScalingState,
    ScalingStrategy, TopicConfig,
};
use tokio::time::Instant;

fn config() -> TopicConfig {
    TopicConfig {
        min_workers: 5,
        max_workers: 70,
        desired_workers: 20,
        scale_up_threshold: 100,
        scale_down_threshold: 10,
        scale_up_percent: 0.5,
        scale_down_percent: 0.1,
        min_step_workers: 3,
        max_step_workers: 25,
        consecutive_checks_up: 1,
        consecutive_checks_down: 3,
        cooldown: Duration::from_secs(120),
        check_interval: Duration::from_secs(300),
        ..TopicConfig::new("test_queue")
    }
    .resolved()
}

struct Harness {
    strategy: HysteresisStrategy,
    state: ScalingState,
    now: Instant,
}

impl Harness {
    fn new(config: TopicConfig) -> Self {
        Self {
            strategy: HysteresisStrategy::new(config),
            state: ScalingState::default(),
            now: Instant::now(),
        }
    }

    /// One monitor tick, `check_interval` after the previous one.
    fn tick(&mut self, depth: u64, workers: usize) -> ScaleAction {
        self.now += Duration::from_secs(300);

        self.strategy.decide(
            &mut self.state,
            ScalingContext {
                queue_depth: depth,
                current_workers: workers,
                now: self.now,
            },
        )
    }

    fn apply(&mut self, action: ScaleAction, depth: u64) {
        self.state.record_scale(self.now, action.direction(), depth);
    }
}

#[test]
fn test_single_tick_scale_up() {
    let mut harness = Harness::new(config());

    // 20 + clamp(round(20 * 0.5), 3, 25)
    let action = harness.tick(150, 20);
    assert_eq!(action, ScaleAction::ScaleUp(30));
    assert_eq!(action.target(), Some(30));
    assert_eq!(harness.state.last_direction, ScaleDirection::Up);

    assert_eq!(ScaleAction::Hold.target(), None);
}

#[test]
fn test_scale_down_needs_three_ticks() {
    let mut harness = Harness::new(TopicConfig {
        min_step_workers: 1,
        max_step_workers: 10,
        ..config()
    });

    assert_eq!(harness.tick(5, 30), ScaleAction::Hold);
    assert_eq!(harness.state.consecutive_down, 1);
    assert_eq!(harness.tick(8, 30), ScaleAction::Hold);
    assert_eq!(harness.state.consecutive_down, 2);

    // 30 - clamp(round(30 * 0.1), 1, 10)
    assert_eq!(harness.tick(9, 30), ScaleAction::ScaleDown(27));
}

#[test]
fn test_debounce_never_fires_short_of_required_ticks() {
    let mut harness = Harness::new(TopicConfig {
        consecutive_checks_up: 3,
        ..config()
    });

    assert_eq!(harness.tick(150, 20), ScaleAction::Hold);
    assert_eq!(harness.tick(180, 20), ScaleAction::Hold);
    // Back into the dead zone
    assert_eq!(harness.tick(50, 20), ScaleAction::Hold);
    assert_eq!(harness.state.consecutive_up, 0);
    assert_eq!(harness.state.last_direction, ScaleDirection::Neutral);

    assert_eq!(harness.tick(150, 20), ScaleAction::Hold);
    assert_eq!(harness.tick(150, 20), ScaleAction::Hold);
    assert_eq!(harness.tick(150, 20), ScaleAction::ScaleUp(30));
}

#[test]
fn test_depth_at_threshold_resets_up_counter() {
    let mut harness = Harness::new(TopicConfig {
        consecutive_checks_up: 2,
        ..config()
    });

    assert_eq!(harness.tick(150, 20), ScaleAction::Hold);
    assert_eq!(harness.state.consecutive_up, 1);

    // Exactly at the threshold is not above it
    assert_eq!(harness.tick(100, 20), ScaleAction::Hold);
    assert_eq!(harness.state.consecutive_up, 0);

    assert_eq!(harness.tick(150, 20), ScaleAction::Hold);
    assert_eq!(harness.state.consecutive_up, 1);
    assert_eq!(harness.tick(150, 20), ScaleAction::ScaleUp(30));
}

#[test]
fn test_direction_flip_resets_counter() {
    let mut harness = Harness::new(TopicConfig {
        consecutive_checks_up: 2,
        ..config()
    });

    assert_eq!(harness.tick(5, 20), ScaleAction::Hold);
    assert_eq!(harness.state.consecutive_down, 1);
    assert_eq!(harness.tick(500, 20), ScaleAction::Hold);
    assert_eq!(harness.state.consecutive_up, 1);
    assert_eq!(harness.state.last_direction, ScaleDirection::Up);
}

#[test]
fn test_cooldown_blocks_actions() {
    let mut harness = Harness::new(config());

    let action = harness.tick(150, 20);
    assert_eq!(action, ScaleAction::ScaleUp(30));
    harness.apply(action, 150);

    let last = harness.now;
    let inside = ScalingContext {
        queue_depth: 1_000,
        current_workers: 30,
        now: last + Duration::from_secs(119),
    };
    assert_eq!(
        harness.strategy.decide(&mut harness.state, inside),
        ScaleAction::Hold
    );
    // Cooldown ticks leave the counters alone
    assert_eq!(harness.state.consecutive_up, 0);

    let after = ScalingContext {
        now: last + Duration::from_secs(120),
        ..inside
    };
    assert_eq!(
        harness.strategy.decide(&mut harness.state, after),
        ScaleAction::ScaleUp(45)
    );
}

#[test]
fn test_step_is_clamped() {
    let config = config();
    let strategy = HysteresisStrategy::new(config.clone());

    for workers in config.min_workers..config.max_workers {
        let mut state = ScalingState::default();
        let action = strategy.decide(
            &mut state,
            ScalingContext {
                queue_depth: 10_000,
                current_workers: workers,
                now: Instant::now(),
            },
        );

        let target = match action {
            ScaleAction::ScaleUp(target) => target,
            other => panic!("expected scale up at {} workers, got {:?}", workers, other),
        };
        let step = target - workers;

        assert!(target <= config.max_workers);
        assert!(step <= config.max_step_workers);
        assert!(
            step >= config.min_step_workers || target == config.max_workers,
            "step {} below minimum at {} workers",
            step,
            workers
        );
    }
}

#[test]
fn test_small_pool_uses_min_step() {
    let mut harness = Harness::new(config());

    assert_eq!(harness.tick(150, 6), ScaleAction::ScaleUp(9));

    let mut harness = Harness::new(TopicConfig {
        scale_up_percent: 0.1,
        ..config()
    });
    // round(0.5) is 1, raised to the minimum step of 3
    assert_eq!(harness.tick(150, 5), ScaleAction::ScaleUp(8));
}

#[test]
fn test_bounds_stop_scaling() {
    let mut harness = Harness::new(config());

    // At max there is nothing to grow into
    assert_eq!(harness.tick(10_000, 70), ScaleAction::Hold);
    assert_eq!(harness.state.last_direction, ScaleDirection::Neutral);

    let mut harness = Harness::new(TopicConfig {
        consecutive_checks_down: 1,
        ..config()
    });
    assert_eq!(harness.tick(0, 5), ScaleAction::Hold);
    // 6 - clamp(round(0.6), 3, 25) would fall below min
    assert_eq!(harness.tick(0, 6), ScaleAction::ScaleDown(5));
}

#[test]
fn test_zero_values_fall_back_to_defaults() {
    let config = TopicConfig {
        min_workers: 1,
        desired_workers: 1,
        max_workers: 50,
        ..TopicConfig::new("defaults")
    }
    .resolved();
    let mut harness = Harness::new(config);

    // Default threshold 100 and two confirmations
    assert_eq!(harness.tick(101, 10), ScaleAction::Hold);
    // round(10 * 0.2) = 2
    assert_eq!(harness.tick(101, 10), ScaleAction::ScaleUp(12));
}

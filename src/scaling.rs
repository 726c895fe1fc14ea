use std::fmt;

use tokio::time::Instant;

use crate::options::TopicConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ScaleDirection {
    Up,
    Down,
    #[default]
    Neutral,
}

impl ScaleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleDirection::Up => "up",
            ScaleDirection::Down => "down",
            ScaleDirection::Neutral => "none",
        }
    }
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleAction {
    ScaleUp(usize),   // Target pool size
    ScaleDown(usize), // Target pool size
    Hold,
}

impl ScaleAction {
    pub fn direction(&self) -> ScaleDirection {
        match self {
            ScaleAction::ScaleUp(_) => ScaleDirection::Up,
            ScaleAction::ScaleDown(_) => ScaleDirection::Down,
            ScaleAction::Hold => ScaleDirection::Neutral,
        }
    }

    pub fn target(&self) -> Option<usize> {
        match self {
            ScaleAction::ScaleUp(target) | ScaleAction::ScaleDown(target) => Some(*target),
            ScaleAction::Hold => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ScalingContext {
    pub queue_depth: u64,
    pub current_workers: usize,
    pub now: Instant,
}

/// Rolling state carried between monitor ticks. Only the monitor loop touches it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScalingState {
    pub last_scale_time: Option<Instant>,
    pub last_queue_depth: u64,
    pub last_direction: ScaleDirection,
    pub consecutive_up: u32,
    pub consecutive_down: u32,
}

impl ScalingState {
    /// Records a scaling action that was carried out.
    pub fn record_scale(&mut self, now: Instant, direction: ScaleDirection, queue_depth: u64) {
        self.last_scale_time = Some(now);
        self.last_direction = direction;
        self.last_queue_depth = queue_depth;
        self.consecutive_up = 0;
        self.consecutive_down = 0;
    }
}

pub trait ScalingStrategy: Send + Sync + 'static {
    /// Decides the scaling action for one monitor tick, updating `state`.
    fn decide(&self, state: &mut ScalingState, context: ScalingContext) -> ScaleAction;
}

/// Threshold scaling damped three ways: a dead zone between the two
/// thresholds, a consecutive-tick debounce per direction, and a hard cooldown
/// after every action.
#[derive(Clone, Debug)]
pub struct HysteresisStrategy {
    config: TopicConfig,
}

impl HysteresisStrategy {
    /// `config` should already be resolved so no parameter is zero.
    pub fn new(config: TopicConfig) -> Self {
        Self { config }
    }

    fn step(&self, current: usize, percent: f64) -> usize {
        let raw = (current as f64 * percent).round() as usize;

        raw.max(self.config.min_step_workers)
            .min(self.config.max_step_workers)
    }
}

impl ScalingStrategy for HysteresisStrategy {
    fn decide(&self, state: &mut ScalingState, context: ScalingContext) -> ScaleAction {
        let config = &self.config;
        let depth = context.queue_depth;
        let current = context.current_workers;

        if let Some(last) = state.last_scale_time {
            if context.now.saturating_duration_since(last) < config.cooldown {
                return ScaleAction::Hold;
            }
        }

        // --- Scale Up Logic ---
        if depth > config.scale_up_threshold && current < config.max_workers {
            if state.last_direction != ScaleDirection::Up
                || state.last_queue_depth <= config.scale_up_threshold
            {
                state.consecutive_up = 1;
            } else {
                state.consecutive_up += 1;
            }
            state.last_queue_depth = depth;
            state.last_direction = ScaleDirection::Up;

            if state.consecutive_up >= config.consecutive_checks_up {
                let step = self.step(current, config.scale_up_percent);

                return ScaleAction::ScaleUp((current + step).min(config.max_workers));
            }

            return ScaleAction::Hold;
        }

        // --- Scale Down Logic ---
        if depth < config.scale_down_threshold && current > config.min_workers {
            if state.last_direction != ScaleDirection::Down
                || state.last_queue_depth >= config.scale_down_threshold
            {
                state.consecutive_down = 1;
            } else {
                state.consecutive_down += 1;
            }
            state.last_queue_depth = depth;
            state.last_direction = ScaleDirection::Down;

            if state.consecutive_down >= config.consecutive_checks_down {
                let step = self.step(current, config.scale_down_percent);

                return ScaleAction::ScaleDown(
                    current.saturating_sub(step).max(config.min_workers),
                );
            }

            return ScaleAction::Hold;
        }

        // --- Dead Zone ---
        state.consecutive_up = 0;
        state.consecutive_down = 0;
        state.last_queue_depth = depth;
        state.last_direction = ScaleDirection::Neutral;

        ScaleAction::Hold
    }
}

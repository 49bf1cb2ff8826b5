//! Chaos decisions.

use crate::config::ChaosConfig;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

const DEFAULT_ERROR_STATUS: u16 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaosDecision {
    /// Injected latency, applied before anything else
    pub delay: Duration,
    /// Status to fail with; None lets the request through
    pub failure: Option<u16>,
}

/// Decide what chaos to apply. None when chaos is disabled.
pub fn decide_chaos(config: &ChaosConfig, rng: &mut impl Rng) -> Option<ChaosDecision> {
    if !config.enabled {
        return None;
    }

    let delay = if config.latency_max_ms > 0 {
        let ms = if config.latency_max_ms > config.latency_min_ms {
            rng.gen_range(config.latency_min_ms..=config.latency_max_ms)
        } else {
            config.latency_min_ms
        };
        Duration::from_millis(ms)
    } else {
        Duration::ZERO
    };

    let failure = if should_inject(config.failure_rate, rng) {
        Some(
            config
                .error_codes
                .choose(rng)
                .copied()
                .unwrap_or(DEFAULT_ERROR_STATUS),
        )
    } else {
        None
    };

    Some(ChaosDecision { delay, failure })
}

fn should_inject(probability: f64, rng: &mut impl Rng) -> bool {
    rng.gen::<f64>() < probability
}

//! Latency sampling.

use crate::config::LatencyConfig;
use rand::Rng;
use std::time::Duration;

pub fn sample_latency(config: &LatencyConfig, rng: &mut impl Rng) -> Duration {
    let ms = match config {
        LatencyConfig::Fixed { delay_ms } => *delay_ms,
        LatencyConfig::Random { min_ms, max_ms } => uniform(*min_ms, *max_ms, rng),
        LatencyConfig::Percentile { p50, p95, p99 } => sample_percentile(*p50, *p95, *p99, rng),
    };
    Duration::from_millis(ms)
}

/// Piecewise-uniform draw over four bands: 50% in [0, p50], 45% in
/// (p50, p95], 4% in (p95, p99] and the last 1% in a tail above p99 as wide
/// as the p95..p99 band.
pub fn sample_percentile(p50: u64, p95: u64, p99: u64, rng: &mut impl Rng) -> u64 {
    let band: f64 = rng.gen();
    if band < 0.50 {
        uniform(0, p50, rng)
    } else if band < 0.95 {
        uniform(p50, p95, rng)
    } else if band < 0.99 {
        uniform(p95, p99, rng)
    } else {
        uniform(p99, p99.saturating_add(p99.saturating_sub(p95)), rng)
    }
}

fn uniform(min: u64, max: u64, rng: &mut impl Rng) -> u64 {
    if max <= min {
        min
    } else {
        rng.gen_range(min..=max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn quantile(sorted: &[u64], q: f64) -> u64 {
        let index = ((sorted.len() as f64) * q) as usize;
        sorted[index.min(sorted.len() - 1)]
    }

    #[test]
    fn test_fixed_and_random() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(
            sample_latency(&LatencyConfig::Fixed { delay_ms: 25 }, &mut rng),
            Duration::from_millis(25)
        );
        for _ in 0..1000 {
            let d = sample_latency(&LatencyConfig::Random { min_ms: 10, max_ms: 20 }, &mut rng);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        assert_eq!(
            sample_latency(&LatencyConfig::Random { min_ms: 5, max_ms: 5 }, &mut rng),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn test_percentile_distribution() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut samples: Vec<u64> = (0..20_000)
            .map(|_| sample_percentile(100, 500, 1000, &mut rng))
            .collect();
        samples.sort_unstable();

        let p50 = quantile(&samples, 0.50) as i64;
        let p95 = quantile(&samples, 0.95) as i64;
        let p99 = quantile(&samples, 0.99) as i64;
        assert!((p50 - 100).abs() <= 10, "p50 was {p50}");
        assert!((p95 - 500).abs() <= 50, "p95 was {p95}");
        assert!((p99 - 1000).abs() <= 100, "p99 was {p99}");
        assert!(*samples.last().unwrap() <= 1500);
    }
}

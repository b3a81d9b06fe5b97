//! Periodic ticker with optional jitter.

use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

/// Period and jitter of a [`Ticker`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickerConfig {
    /// Nominal time between ticks.
    pub period: Duration,
    /// Fraction of the period, in `[0, 1]`, by which each wait may randomly deviate.
    pub jitter_pct: f64,
}

impl TickerConfig {
    /// Ticks every `period` without jitter.
    #[must_use]
    pub const fn new(period: Duration) -> Self {
        Self {
            period,
            jitter_pct: 0.0,
        }
    }

    /// Sets the jitter fraction. Values are clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter(mut self, jitter_pct: f64) -> Self {
        self.jitter_pct = jitter_pct.clamp(0.0, 1.0);
        self
    }
}

/// Yields once per period. The first tick fires one period after creation.
#[derive(Debug)]
pub struct Ticker {
    config: TickerConfig,
    interval: Option<Interval>,
}

impl Ticker {
    /// Creates a ticker.
    ///
    /// # Panics
    ///
    /// Panics if the period is zero.
    #[must_use]
    pub fn new(config: TickerConfig) -> Self {
        assert!(!config.period.is_zero(), "ticker period must be non-zero");

        let interval = (config.jitter_pct <= 0.0).then(|| {
            let mut interval = interval_at(Instant::now() + config.period, config.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        Self { config, interval }
    }

    /// Shorthand for a ticker without jitter.
    #[must_use]
    pub fn every(period: Duration) -> Self {
        Self::new(TickerConfig::new(period))
    }

    /// The configuration this ticker was built from.
    #[must_use]
    pub const fn config(&self) -> TickerConfig {
        self.config
    }

    /// Waits for the next tick.
    pub async fn tick(&mut self) {
        match &mut self.interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => tokio::time::sleep(self.next_delay()).await,
        }
    }

    fn next_delay(&self) -> Duration {
        let period = self.config.period.as_secs_f64();
        let spread = period * self.config.jitter_pct;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((period + offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_is_clamped() {
        let config = TickerConfig::new(Duration::from_secs(1)).with_jitter(3.0);
        assert!((config.jitter_pct - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_period() {
        let start = Instant::now();
        let mut ticker = Ticker::every(Duration::from_secs(10));

        ticker.tick().await;
        let first = start.elapsed();
        assert!(first >= Duration::from_secs(10) && first < Duration::from_secs(11));

        ticker.tick().await;
        let second = start.elapsed();
        assert!(second >= Duration::from_secs(20) && second < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jittered_delay_stays_in_bounds() {
        let ticker = Ticker::new(TickerConfig::new(Duration::from_secs(10)).with_jitter(0.1));

        for _ in 0..100 {
            let delay = ticker.next_delay();
            assert!(delay >= Duration::from_secs(9));
            assert!(delay <= Duration::from_secs(11));
        }
    }
}

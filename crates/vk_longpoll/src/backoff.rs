#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;

/// Smallest first delay whenever `max_delay` is non-zero.
pub const MIN_DELAY_FLOOR: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
	pub min_delay: Duration,
	pub max_delay: Duration,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			min_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(30),
		}
	}
}

impl BackoffConfig {
	/// No delay at all. Useful for tests and scripted transports.
	pub const fn none() -> Self {
		Self {
			min_delay: Duration::ZERO,
			max_delay: Duration::ZERO,
		}
	}
}

/// Capped exponential backoff with jitter between failed cycles.
#[derive(Debug, Clone)]
pub struct Backoff {
	cfg: BackoffConfig,
	attempt: u32,
}

impl Backoff {
	pub fn new(cfg: BackoffConfig) -> Self {
		Self { cfg, attempt: 0 }
	}

	pub fn attempt(&self) -> u32 {
		self.attempt
	}

	pub fn reset(&mut self) {
		self.attempt = 0;
	}

	/// Record a failure and return how long to wait before the next cycle.
	pub fn next_delay(&mut self) -> Duration {
		self.attempt = self.attempt.saturating_add(1);
		let base = Self::base_delay(self.attempt, self.cfg.min_delay, self.cfg.max_delay);
		jitter(base)
	}

	/// `min * 2^(attempt-1)`, clamped to `[min, max]`. Zero attempts wait zero.
	///
	/// `min` is raised to [`MIN_DELAY_FLOOR`] (itself capped by `max`), so only a
	/// zero `max` disables waiting.
	pub fn base_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		if attempt == 0 {
			return Duration::ZERO;
		}
		let min = min.max(MIN_DELAY_FLOOR.min(max));
		let pow = attempt.saturating_sub(1).min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max).max(min.min(max))
	}
}

/// +/-10% around `base`.
fn jitter(base: Duration) -> Duration {
	let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
	if base_ms == 0 {
		return Duration::ZERO;
	}
	let window = (base_ms / 10).max(1);
	let offset = rand::rng().random_range(0..=(window * 2));
	Duration::from_millis(base_ms.saturating_sub(window).saturating_add(offset))
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::{Backoff, BackoffConfig, MIN_DELAY_FLOOR};

	#[test]
	fn base_delay_doubles_and_caps() {
		let min = Duration::from_millis(500);
		let max = Duration::from_secs(30);
		assert_eq!(Backoff::base_delay(0, min, max), Duration::ZERO);
		assert_eq!(Backoff::base_delay(1, min, max), Duration::from_millis(500));
		assert_eq!(Backoff::base_delay(2, min, max), Duration::from_millis(1000));
		assert_eq!(Backoff::base_delay(4, min, max), Duration::from_millis(4000));
		assert_eq!(Backoff::base_delay(30, min, max), max);
	}

	#[test]
	fn jittered_delay_stays_within_ten_percent() {
		let mut b = Backoff::new(BackoffConfig {
			min_delay: Duration::from_millis(1000),
			max_delay: Duration::from_secs(10),
		});
		for _ in 0..20 {
			b.reset();
			let d = b.next_delay();
			assert!(d >= Duration::from_millis(900) && d <= Duration::from_millis(1100), "{d:?}");
		}
	}

	#[test]
	fn reset_returns_to_first_attempt() {
		let mut b = Backoff::new(BackoffConfig::default());
		b.next_delay();
		b.next_delay();
		assert_eq!(b.attempt(), 2);
		b.reset();
		assert_eq!(b.attempt(), 0);
	}

	#[test]
	fn zero_min_delay_still_grows_toward_max() {
		let max = Duration::from_secs(30);
		assert_eq!(Backoff::base_delay(1, Duration::ZERO, max), MIN_DELAY_FLOOR);
		assert_eq!(Backoff::base_delay(3, Duration::ZERO, max), MIN_DELAY_FLOOR * 4);
		assert_eq!(Backoff::base_delay(30, Duration::ZERO, max), max);
		assert_eq!(Backoff::base_delay(1, Duration::ZERO, Duration::from_millis(10)), Duration::from_millis(10));

		let mut b = Backoff::new(BackoffConfig {
			min_delay: Duration::ZERO,
			max_delay: max,
		});
		let mut last = Duration::ZERO;
		for _ in 0..5 {
			let d = b.next_delay();
			assert!(d > last, "{d:?} after {last:?}");
			last = d;
		}
	}

	#[test]
	fn disabled_backoff_never_waits() {
		let mut b = Backoff::new(BackoffConfig::none());
		for _ in 0..5 {
			assert_eq!(b.next_delay(), Duration::ZERO);
		}
	}
}

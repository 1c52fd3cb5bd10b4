#![forbid(unsafe_code)]

use std::time::Duration;

/// Bounded exponential backoff. The attempt counter lives on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
	pub initial_backoff: Duration,
	pub max_backoff: Duration,
	/// Retries per disconnect episode.
	pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			initial_backoff: Duration::from_secs(1),
			max_backoff: Duration::from_secs(60),
			max_attempts: 5,
		}
	}
}

impl ReconnectPolicy {
	/// `min(initial * 2^attempt, max)`.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let mut d = self.initial_backoff;
		for _ in 0..attempt {
			if d.is_zero() || d >= self.max_backoff {
				break;
			}
			d = d.saturating_mul(2);
		}
		d.min(self.max_backoff)
	}

	/// Delay before retry number `attempt`, or `None` once retries are exhausted.
	pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
		(attempt < self.max_attempts).then(|| self.delay_for(attempt))
	}
}

//! Wall-clock abstraction so token expiry can be driven deterministically in tests.

// std
use std::sync::atomic::{AtomicI64, Ordering};
// self
use crate::_prelude::*;

/// Source of the current UTC instant.
pub trait Clock
where
	Self: 'static + Send + Sync,
{
	/// Returns the current instant.
	fn now(&self) -> OffsetDateTime;
}

/// Clock backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn now(&self) -> OffsetDateTime {
		OffsetDateTime::now_utc()
	}
}

/// Manually driven clock with whole-second resolution.
///
/// Clones share the same instant, so a test can keep one handle while the broker owns another.
#[derive(Clone, Debug, Default)]
pub struct ManualClock(Arc<AtomicI64>);
impl ManualClock {
	/// Creates a clock frozen at `epoch_seconds`.
	pub fn at(epoch_seconds: i64) -> Self {
		Self(Arc::new(AtomicI64::new(epoch_seconds)))
	}

	/// Moves the clock to `epoch_seconds`.
	pub fn set(&self, epoch_seconds: i64) {
		self.0.store(epoch_seconds, Ordering::SeqCst);
	}

	/// Moves the clock forward by `seconds`.
	pub fn advance(&self, seconds: i64) {
		self.0.fetch_add(seconds, Ordering::SeqCst);
	}

	/// Current reading in epoch seconds.
	pub fn epoch_seconds(&self) -> i64 {
		self.0.load(Ordering::SeqCst)
	}
}
impl Clock for ManualClock {
	fn now(&self) -> OffsetDateTime {
		OffsetDateTime::from_unix_timestamp(self.epoch_seconds())
			.unwrap_or(OffsetDateTime::UNIX_EPOCH)
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn manual_clock_clones_share_state() {
		let clock = ManualClock::at(1_000);
		let handle = clock.clone();

		handle.advance(10);

		assert_eq!(clock.now().unix_timestamp(), 1_010);

		clock.set(4_600);

		assert_eq!(handle.epoch_seconds(), 4_600);
	}
}

// std
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for token lookups.
#[derive(Debug, Default)]
pub struct ExchangeMetrics {
	exchanges: AtomicU64,
	reuses: AtomicU64,
	failures: AtomicU64,
}
impl ExchangeMetrics {
	/// Returns the number of token exchanges sent to the endpoint.
	pub fn exchanges(&self) -> u64 {
		self.exchanges.load(Ordering::Relaxed)
	}

	/// Returns the number of lookups served from the cache.
	pub fn reuses(&self) -> u64 {
		self.reuses.load(Ordering::Relaxed)
	}

	/// Returns the number of failed exchanges.
	pub fn failures(&self) -> u64 {
		self.failures.load(Ordering::Relaxed)
	}

	pub(crate) fn record_exchange(&self) {
		self.exchanges.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_reuse(&self) {
		self.reuses.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_failure(&self) {
		self.failures.fetch_add(1, Ordering::Relaxed);
	}
}

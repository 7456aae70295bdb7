//! Tunables shared by the token and commit flows (deadlines, safety margin, retry policy).

// self
use crate::_prelude::*;

/// Smallest safety margin the broker accepts before a token's expiry.
pub const MIN_SAFETY_MARGIN: Duration = Duration::seconds(60);
/// Default deadline for one token exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::seconds(10);
/// Default deadline for one document commit.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::seconds(15);
/// Default name of the text field written by [`DocumentWriteRequest::new`](crate::flows::DocumentWriteRequest::new).
pub const DEFAULT_TEXT_FIELD: &str = "text";
/// Default name of the field stamped with the server's request time.
pub const DEFAULT_CREATED_AT_FIELD: &str = "createdAt";

/// Broker-wide settings applied to every flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerOptions {
	/// Tokens are refreshed once `now >= expires_at - safety_margin`.
	pub safety_margin: Duration,
	/// Deadline for each token exchange attempt.
	pub exchange_timeout: Duration,
	/// Deadline for each commit attempt.
	pub commit_timeout: Duration,
	/// Replay policy for 5xx responses.
	pub retry: RetryPolicy,
	/// Field that receives the (truncated) document text.
	pub text_field: String,
	/// Field set to the server's request time by the commit transform.
	pub created_at_field: String,
}
impl BrokerOptions {
	/// Returns `margin`, raised to [`MIN_SAFETY_MARGIN`] when smaller.
	pub fn clamp_safety_margin(margin: Duration) -> Duration {
		margin.max(MIN_SAFETY_MARGIN)
	}
}
impl Default for BrokerOptions {
	fn default() -> Self {
		Self {
			safety_margin: MIN_SAFETY_MARGIN,
			exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
			commit_timeout: DEFAULT_COMMIT_TIMEOUT,
			retry: RetryPolicy::disabled(),
			text_field: DEFAULT_TEXT_FIELD.into(),
			created_at_field: DEFAULT_CREATED_AT_FIELD.into(),
		}
	}
}

/// Bounded exponential backoff for upstream 5xx replies.
///
/// Client errors (4xx), transport failures and timeouts are never replayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Additional attempts after the first one.
	pub max_retries: u32,
	/// Pause before the first retry; doubled for each subsequent one.
	pub initial_backoff: Duration,
	/// Upper bound for any single pause, including `Retry-After` hints.
	pub max_backoff: Duration,
}
impl RetryPolicy {
	const DEFAULT_INITIAL_BACKOFF: Duration = Duration::milliseconds(200);
	const DEFAULT_MAX_BACKOFF: Duration = Duration::seconds(5);

	/// Policy that never retries.
	pub const fn disabled() -> Self {
		Self {
			max_retries: 0,
			initial_backoff: Self::DEFAULT_INITIAL_BACKOFF,
			max_backoff: Self::DEFAULT_MAX_BACKOFF,
		}
	}

	/// Policy allowing `max_retries` replays with the default backoff curve.
	pub const fn new(max_retries: u32) -> Self {
		Self { max_retries, ..Self::disabled() }
	}

	/// Overrides the first pause.
	pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
		self.initial_backoff = backoff.max(Duration::ZERO);

		self
	}

	/// Overrides the pause ceiling.
	pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
		self.max_backoff = backoff.max(Duration::ZERO);

		self
	}

	/// Pause before retry number `attempt` (zero-based), honoring an upstream hint.
	pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
		let exponential = 2_i32
			.checked_pow(attempt)
			.and_then(|factor| self.initial_backoff.checked_mul(factor))
			.unwrap_or(self.max_backoff);
		let pause = match hint {
			Some(hint) => hint.max(exponential),
			None => exponential,
		};

		pause.clamp(Duration::ZERO, self.max_backoff)
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self::disabled()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn safety_margin_never_drops_below_minimum() {
		assert_eq!(BrokerOptions::clamp_safety_margin(Duration::seconds(5)), MIN_SAFETY_MARGIN);
		assert_eq!(
			BrokerOptions::clamp_safety_margin(Duration::seconds(300)),
			Duration::seconds(300)
		);
		assert_eq!(BrokerOptions::default().safety_margin, MIN_SAFETY_MARGIN);
	}

	#[test]
	fn backoff_doubles_and_respects_ceiling() {
		let policy = RetryPolicy::new(5)
			.with_initial_backoff(Duration::milliseconds(100))
			.with_max_backoff(Duration::milliseconds(350));

		assert_eq!(policy.backoff(0, None), Duration::milliseconds(100));
		assert_eq!(policy.backoff(1, None), Duration::milliseconds(200));
		assert_eq!(policy.backoff(2, None), Duration::milliseconds(350));
		assert_eq!(policy.backoff(40, None), Duration::milliseconds(350));
	}

	#[test]
	fn retry_after_hint_is_honored_up_to_ceiling() {
		let policy = RetryPolicy::new(1);

		assert_eq!(policy.backoff(0, Some(Duration::seconds(2))), Duration::seconds(2));
		assert_eq!(policy.backoff(0, Some(Duration::seconds(60))), Duration::seconds(5));
		assert_eq!(RetryPolicy::default().max_retries, 0);
	}
}

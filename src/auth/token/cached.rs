//! Cached bearer token and the expiry states derived from it.

// self
use crate::{
	_prelude::*,
	auth::{ScopeSet, TokenSecret},
	error::AuthError,
};

/// Freshness of the cached token for a scope at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenState {
	/// No token has been obtained yet.
	Absent,
	/// A token exists and stays usable past the safety margin.
	Valid,
	/// A token exists but is inside the safety margin (or past expiry); a refresh is due.
	Expiring,
}
impl TokenState {
	/// Evaluates the state of an optional cache entry.
	pub fn of(token: Option<&CachedToken>, now: OffsetDateTime, margin: Duration) -> Self {
		match token {
			None => Self::Absent,
			Some(token) if token.is_usable_at(now, margin) => Self::Valid,
			Some(_) => Self::Expiring,
		}
	}

	/// Returns `true` when the state requires a token exchange.
	pub fn needs_refresh(self) -> bool {
		!matches!(self, Self::Valid)
	}
}

/// Bearer token obtained from one exchange; replaced whole on refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct CachedToken {
	/// Token value.
	pub value: TokenSecret,
	/// Scopes the token was minted for.
	pub scope: ScopeSet,
	/// Instant the exchange completed.
	pub issued_at: OffsetDateTime,
	/// `issued_at` plus the reported lifetime.
	pub expires_at: OffsetDateTime,
}
impl CachedToken {
	/// Creates an entry that expires `lifetime` after `issued_at`.
	///
	/// Fails with [`AuthError::ExpiresInOutOfRange`] when the expiry is not representable.
	pub fn new(
		value: TokenSecret,
		scope: ScopeSet,
		issued_at: OffsetDateTime,
		lifetime: Duration,
	) -> Result<Self, AuthError> {
		let expires_at = issued_at.checked_add(lifetime).ok_or(
			AuthError::ExpiresInOutOfRange { expires_in: lifetime.whole_seconds() },
		)?;

		Ok(Self { value, scope, issued_at, expires_at })
	}

	/// Expiry as epoch seconds.
	pub fn expires_at_epoch(&self) -> i64 {
		self.expires_at.unix_timestamp()
	}

	/// Returns `true` while `now < expires_at - margin`.
	pub fn is_usable_at(&self, now: OffsetDateTime, margin: Duration) -> bool {
		self.expires_at.checked_sub(margin).is_some_and(|edge| now < edge)
	}
}
impl Debug for CachedToken {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CachedToken")
			.field("value", &self.value)
			.field("scope", &self.scope)
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn at(epoch: i64) -> OffsetDateTime {
		OffsetDateTime::from_unix_timestamp(epoch).expect("Fixture epoch should be valid.")
	}

	#[test]
	fn state_tracks_the_safety_margin() {
		let margin = Duration::seconds(60);
		let token = CachedToken::new(
			TokenSecret::new("tok1"),
			ScopeSet::datastore(),
			at(1_000),
			Duration::seconds(3_600),
		)
		.expect("A one-hour lifetime should be representable.");

		assert_eq!(token.expires_at_epoch(), 4_600);
		assert_eq!(TokenState::of(None, at(1_000), margin), TokenState::Absent);
		assert_eq!(TokenState::of(Some(&token), at(1_010), margin), TokenState::Valid);
		assert_eq!(TokenState::of(Some(&token), at(4_539), margin), TokenState::Valid);
		assert_eq!(TokenState::of(Some(&token), at(4_540), margin), TokenState::Expiring);
		assert_eq!(TokenState::of(Some(&token), at(9_999), margin), TokenState::Expiring);
		assert!(TokenState::Expiring.needs_refresh());
		assert!(TokenState::Absent.needs_refresh());
		assert!(!TokenState::Valid.needs_refresh());
	}

	#[test]
	fn unrepresentable_expiry_is_rejected() {
		let err = CachedToken::new(
			TokenSecret::new("tok1"),
			ScopeSet::datastore(),
			at(1_000),
			Duration::seconds(i64::MAX),
		)
		.expect_err("An expiry past the supported calendar range must be rejected.");

		assert!(matches!(err, AuthError::ExpiresInOutOfRange { expires_in: i64::MAX }));
	}

	#[test]
	fn oversized_margin_marks_the_token_expiring() {
		let token = CachedToken::new(
			TokenSecret::new("tok1"),
			ScopeSet::datastore(),
			at(1_000),
			Duration::seconds(3_600),
		)
		.expect("A one-hour lifetime should be representable.");

		assert!(!token.is_usable_at(at(1_000), Duration::MAX));
	}
}

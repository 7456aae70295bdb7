//! Bearer token lookup with a per-scope cache and single-flight refresh.
//!
//! [`Broker::get_token`] serves cached tokens while they sit outside the safety margin and
//! otherwise joins (or starts) the refresh for that scope. A refresh is a shared future stored in
//! a per-scope slot and driven by a spawned Tokio task: every concurrent caller awaits the same
//! exchange, and a caller giving up only drops its own handle, so the exchange runs to completion
//! even with no one waiting.
//! The refresh installs its token before clearing its slot, and callers re-check the cache
//! while holding the slot lock, so a finished refresh is never repeated.

mod metrics;

pub use metrics::ExchangeMetrics;

// std
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
use futures::future::{BoxFuture, FutureExt, Shared};
use oauth2::http::{
	Method, Request,
	header::{ACCEPT, CONTENT_TYPE},
};
use url::form_urlencoded;
// self
use crate::{
	_prelude::*,
	auth::{Assertion, CachedToken, CredentialLoader, ScopeSet, TokenSecret, TokenState},
	clock::Clock,
	error::{AuthError, ConfigError},
	flows::{Broker, RetryPolicy},
	http::HttpTransport,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	transport::{self, TransportErrorMapper},
};

/// Grant type sent with every assertion exchange.
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

const KIND: FlowKind = FlowKind::TokenExchange;

type RefreshFuture = Shared<BoxFuture<'static, Result<TokenSecret>>>;

/// Lifecycle of the broker for one scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerState {
	/// The service identity has not been loaded yet.
	Unloaded,
	/// The identity is loaded; the token cache is in the given state.
	Loaded(TokenState),
}

struct InflightRefresh {
	generation: u64,
	refresh: RefreshFuture,
}

/// Per-scope token cache and the refresh slots guarding it.
#[derive(Default)]
pub(crate) struct TokenCache {
	entries: RwLock<HashMap<ScopeSet, CachedToken>>,
	inflight: Mutex<HashMap<ScopeSet, InflightRefresh>>,
	generation: AtomicU64,
}
impl TokenCache {
	fn snapshot(&self, scope: &ScopeSet) -> Option<CachedToken> {
		self.entries.read().get(scope).cloned()
	}

	fn usable(&self, scope: &ScopeSet, now: OffsetDateTime, margin: Duration) -> Option<TokenSecret> {
		self.entries
			.read()
			.get(scope)
			.filter(|token| token.is_usable_at(now, margin))
			.map(|token| token.value.clone())
	}

	fn install(&self, token: CachedToken) {
		self.entries.write().insert(token.scope.clone(), token);
	}

	fn release(&self, scope: &ScopeSet, generation: u64) {
		let mut inflight = self.inflight.lock();

		if inflight.get(scope).is_some_and(|slot| slot.generation == generation) {
			inflight.remove(scope);
		}
	}

	fn is_refreshing(&self, scope: &ScopeSet) -> bool {
		self.inflight.lock().contains_key(scope)
	}
}
impl Debug for TokenCache {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenCache")
			.field("cached_scopes", &self.entries.read().len())
			.field("inflight_scopes", &self.inflight.lock().len())
			.finish()
	}
}

impl<C, M> Broker<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Returns a bearer token for `scope`, exchanging a fresh assertion only when needed.
	///
	/// Concurrent callers for the same scope share one exchange and all receive its result,
	/// including its failure. Failures are never cached; the next call starts a new exchange.
	///
	/// The exchange runs on a spawned task, so this must be called from within a Tokio runtime.
	pub async fn get_token(&self, scope: &ScopeSet) -> Result<TokenSecret> {
		let span = FlowSpan::new(KIND, "get_token");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span
			.instrument(async move {
				if let Some(token) = self.usable_token(scope) {
					return Ok(token);
				}

				let refresh = {
					let mut inflight = self.tokens.inflight.lock();

					if let Some(slot) = inflight.get(scope) {
						slot.refresh.clone()
					} else {
						// A refresh may have installed a token and released its slot meanwhile.
						if let Some(token) = self.usable_token(scope) {
							return Ok(token);
						}

						let slot = self.start_refresh(scope);
						let refresh = slot.refresh.clone();

						inflight.insert(scope.clone(), slot);

						refresh
					}
				};

				refresh.await
			})
			.await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	/// Reports whether the identity is loaded and how fresh the token for `scope` is.
	pub fn state(&self, scope: &ScopeSet) -> BrokerState {
		if !self.credentials.is_loaded() {
			return BrokerState::Unloaded;
		}

		BrokerState::Loaded(TokenState::of(
			self.tokens.snapshot(scope).as_ref(),
			self.clock.now(),
			self.options.safety_margin,
		))
	}

	/// Snapshot of the cached token for `scope`, valid or not.
	pub fn cached_token(&self, scope: &ScopeSet) -> Option<CachedToken> {
		self.tokens.snapshot(scope)
	}

	/// Returns `true` while an exchange for `scope` is installed in its refresh slot.
	pub fn is_refreshing(&self, scope: &ScopeSet) -> bool {
		self.tokens.is_refreshing(scope)
	}

	fn usable_token(&self, scope: &ScopeSet) -> Option<TokenSecret> {
		let token = self.tokens.usable(scope, self.clock.now(), self.options.safety_margin)?;

		self.exchange_metrics.record_reuse();
		obs::record_flow_outcome(KIND, FlowOutcome::Reused);

		Some(token)
	}

	fn start_refresh(&self, scope: &ScopeSet) -> InflightRefresh {
		let generation = self.tokens.generation.fetch_add(1, Ordering::Relaxed);
		let exchange = Exchange {
			http_client: Arc::clone(&self.http_client),
			transport_mapper: Arc::clone(&self.transport_mapper),
			token_endpoint: self.endpoints.token.clone(),
			credentials: Arc::clone(&self.credentials),
			clock: Arc::clone(&self.clock),
			tokens: Arc::clone(&self.tokens),
			metrics: Arc::clone(&self.exchange_metrics),
			timeout: self.options.exchange_timeout,
			retry: self.options.retry,
			scope: scope.clone(),
			generation,
		};

		let refresh = exchange.run().boxed().shared();

		// Driven by its own task so the exchange completes even when every caller gives up.
		tokio::spawn(refresh.clone());

		InflightRefresh { generation, refresh }
	}
}

/// Owned inputs of one refresh, detached from the broker borrow.
struct Exchange<C, M>
where
	C: ?Sized,
	M: ?Sized,
{
	http_client: Arc<C>,
	transport_mapper: Arc<M>,
	token_endpoint: Url,
	credentials: Arc<CredentialLoader>,
	clock: Arc<dyn Clock>,
	tokens: Arc<TokenCache>,
	metrics: Arc<ExchangeMetrics>,
	timeout: Duration,
	retry: RetryPolicy,
	scope: ScopeSet,
	generation: u64,
}
impl<C, M> Exchange<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	async fn run(self) -> Result<TokenSecret> {
		let span = FlowSpan::new(KIND, "exchange");
		let result = span.instrument(self.exchange()).await;

		// Runs after a successful exchange has installed its token.
		self.tokens.release(&self.scope, self.generation);

		if let Err(e) = &result {
			self.metrics.record_failure();
			obs::log_failure(KIND, "exchange", e);
		}

		result
	}

	async fn exchange(&self) -> Result<TokenSecret> {
		let identity = self.credentials.load().await?;
		let issued_at = self.clock.now();
		let assertion = Assertion::sign(&identity, &self.token_endpoint, &self.scope, issued_at)?;
		let form = form_urlencoded::Serializer::new(String::new())
			.append_pair("grant_type", JWT_BEARER_GRANT)
			.append_pair("assertion", &assertion.compact())
			.finish();

		self.metrics.record_exchange();

		let reply = transport::send(
			self.http_client.as_ref(),
			self.transport_mapper.as_ref(),
			KIND,
			self.timeout,
			&self.retry,
			|| {
				Request::builder()
					.method(Method::POST)
					.uri(self.token_endpoint.as_str())
					.header(CONTENT_TYPE, "application/x-www-form-urlencoded")
					.header(ACCEPT, "application/json")
					.body(form.clone().into_bytes())
					.map_err(ConfigError::from)
			},
		)
		.await?;

		if !reply.is_success() {
			return Err(reply.into_rejection(KIND));
		}

		let token = token_from_response(&self.scope, issued_at, reply.status, &reply.body)?;
		let value = token.value.clone();

		self.tokens.install(token);

		Ok(value)
	}
}

fn token_from_response(
	scope: &ScopeSet,
	issued_at: OffsetDateTime,
	status: u16,
	body: &[u8],
) -> Result<CachedToken, AuthError> {
	let (access_token, expires_in) = parse_token_response(status, body)?;

	CachedToken::new(
		TokenSecret::new(access_token),
		scope.clone(),
		issued_at,
		Duration::seconds(expires_in),
	)
}

#[derive(Deserialize)]
struct TokenResponse {
	#[serde(default)]
	access_token: Option<String>,
	#[serde(default)]
	expires_in: Option<i64>,
}

fn parse_token_response(status: u16, body: &[u8]) -> Result<(String, i64), AuthError> {
	let mut de = serde_json::Deserializer::from_slice(body);
	let response: TokenResponse = serde_path_to_error::deserialize(&mut de)
		.map_err(|e| AuthError::MalformedResponse { status, source: Arc::new(e) })?;
	let access_token = response
		.access_token
		.filter(|token| !token.is_empty())
		.ok_or(AuthError::MissingField { field: "access_token" })?;
	let expires_in = response.expires_in.ok_or(AuthError::MissingField { field: "expires_in" })?;

	if expires_in <= 0 {
		return Err(AuthError::NonPositiveExpiresIn { expires_in });
	}

	Ok((access_token, expires_in))
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn token_response_requires_both_fields() {
		let (token, lifetime) =
			parse_token_response(200, br#"{"access_token":"tok1","expires_in":3600}"#)
				.expect("Complete response should parse.");

		assert_eq!(token, "tok1");
		assert_eq!(lifetime, 3600);
		assert!(matches!(
			parse_token_response(200, br#"{"access_token":"tok1"}"#),
			Err(AuthError::MissingField { field: "expires_in" })
		));
		assert!(matches!(
			parse_token_response(200, br#"{"expires_in":3600}"#),
			Err(AuthError::MissingField { field: "access_token" })
		));
	}

	#[test]
	fn token_response_rejects_bad_lifetimes_and_json() {
		assert!(matches!(
			parse_token_response(200, br#"{"access_token":"t","expires_in":0}"#),
			Err(AuthError::NonPositiveExpiresIn { expires_in: 0 })
		));
		assert!(matches!(
			parse_token_response(200, br#"{"access_token":"t","expires_in":"soon"}"#),
			Err(AuthError::MalformedResponse { status: 200, .. })
		));
		assert!(matches!(
			parse_token_response(200, b"<html>"),
			Err(AuthError::MalformedResponse { .. })
		));
	}

	#[test]
	fn unrepresentable_lifetime_is_an_auth_error() {
		let issued_at = OffsetDateTime::from_unix_timestamp(1_000).expect("Epoch 1000 is valid.");
		let body = format!("{{\"access_token\":\"tok\",\"expires_in\":{}}}", i64::MAX);
		let err = token_from_response(&ScopeSet::datastore(), issued_at, 200, body.as_bytes())
			.expect_err("An expiry past the calendar range must be rejected.");

		assert!(matches!(err, AuthError::ExpiresInOutOfRange { expires_in: i64::MAX }));

		let token = token_from_response(
			&ScopeSet::datastore(),
			issued_at,
			200,
			br#"{"access_token":"tok","expires_in":3600}"#,
		)
		.expect("A one-hour lifetime should be accepted.");

		assert_eq!(token.expires_at_epoch(), 4_600);
	}
}

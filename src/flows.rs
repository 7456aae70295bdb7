//! The broker service object and the flows it runs: token lookup and document commits.

pub mod commit;
pub mod common;
pub mod token;

pub use commit::*;
pub use common::*;
pub use token::*;

// self
use crate::{
	_prelude::*,
	auth::CredentialLoader,
	clock::{Clock, SystemClock},
	endpoint::EndpointDescriptor,
	http::HttpTransport,
	transport::TransportErrorMapper,
};
#[cfg(feature = "reqwest")]
use crate::{error::ConfigError, http::ReqwestHttpClient, transport::ReqwestTransportErrorMapper};

#[cfg(feature = "reqwest")]
/// Broker specialized for the crate's default reqwest transport stack.
pub type ReqwestBroker = Broker<ReqwestHttpClient, ReqwestTransportErrorMapper>;

/// Service object that proves the application's identity and writes documents with it.
///
/// The broker owns the transport, the credential loader, and the per-scope token cache, so one
/// instance is built per process and shared by reference. Clones share the same cache and
/// refresh slots.
#[derive(Clone)]
pub struct Broker<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// HTTP client wrapper used for every outbound request.
	pub http_client: Arc<C>,
	/// Mapper applied to transport-layer errors before surfacing them to callers.
	pub transport_mapper: Arc<M>,
	/// Token exchange and document store endpoints.
	pub endpoints: EndpointDescriptor,
	/// Loader holding the service identity once parsed.
	pub credentials: Arc<CredentialLoader>,
	/// Counters for token exchanges and cache reuse.
	pub exchange_metrics: Arc<ExchangeMetrics>,
	options: BrokerOptions,
	clock: Arc<dyn Clock>,
	tokens: Arc<TokenCache>,
}
impl<C, M> Broker<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a broker that reuses the caller-provided transport + mapper pair.
	pub fn with_http_client(
		endpoints: EndpointDescriptor,
		credentials: CredentialLoader,
		http_client: impl Into<Arc<C>>,
		mapper: impl Into<Arc<M>>,
	) -> Self {
		Self {
			http_client: http_client.into(),
			transport_mapper: mapper.into(),
			endpoints,
			credentials: Arc::new(credentials),
			exchange_metrics: Default::default(),
			options: Default::default(),
			clock: Arc::new(SystemClock),
			tokens: Default::default(),
		}
	}

	/// Replaces the wall clock used for token expiry and assertion timestamps.
	pub fn with_clock(mut self, clock: impl Clock) -> Self {
		self.clock = Arc::new(clock);

		self
	}

	/// Sets the refresh margin before expiry; values below [`MIN_SAFETY_MARGIN`] are raised.
	pub fn with_safety_margin(mut self, margin: Duration) -> Self {
		self.options.safety_margin = BrokerOptions::clamp_safety_margin(margin);

		self
	}

	/// Sets the per-attempt deadlines of the token exchange and the commit.
	pub fn with_timeouts(mut self, exchange: Duration, commit: Duration) -> Self {
		self.options.exchange_timeout = exchange.max(Duration::ZERO);
		self.options.commit_timeout = commit.max(Duration::ZERO);

		self
	}

	/// Sets the replay policy for 5xx responses.
	pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.options.retry = retry;

		self
	}

	/// Renames the field that receives document text.
	pub fn with_text_field(mut self, field: impl Into<String>) -> Self {
		self.options.text_field = field.into();

		self
	}

	/// Renames the field stamped with the server's request time.
	///
	/// The name is taken literally; names that are not simple identifiers are backtick-quoted in
	/// the transform's field path.
	pub fn with_created_at_field(mut self, field: impl Into<String>) -> Self {
		self.options.created_at_field = field.into();

		self
	}

	/// Effective settings.
	pub fn options(&self) -> &BrokerOptions {
		&self.options
	}
}
#[cfg(feature = "reqwest")]
impl Broker<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates a broker over a reqwest transport with redirects disabled.
	pub fn new(
		endpoints: EndpointDescriptor,
		credentials: CredentialLoader,
	) -> Result<Self, ConfigError> {
		Ok(Self::with_http_client(
			endpoints,
			credentials,
			ReqwestHttpClient::try_new()?,
			Arc::new(ReqwestTransportErrorMapper),
		))
	}
}
impl<C, M> Debug for Broker<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Broker")
			.field("endpoints", &self.endpoints)
			.field("credentials", &self.credentials)
			.field("options", &self.options)
			.field("tokens", &self.tokens)
			.finish()
	}
}

//! Request dispatch shared by the token exchange and the document commit.
//!
//! Both flows hand a fully built [`HttpRequest`] to [`send`], which races the transport against
//! the flow deadline, replays 5xx responses according to the broker's [`RetryPolicy`], and
//! classifies transport failures through a [`TransportErrorMapper`]. Status interpretation stays
//! with the caller.

// crates.io
use oauth2::{AsyncHttpClient, HttpClientError, HttpRequest};
// self
use crate::{
	_prelude::*,
	error::ConfigError,
	flows::RetryPolicy,
	http::{HttpTransport, RequestDeadline, ResponseMetadata, ResponseMetadataSlot},
	obs::FlowKind,
};

/// Maps HTTP transport failures into broker [`Error`] values.
pub trait TransportErrorMapper<E>
where
	Self: 'static + Send + Sync,
	E: 'static + Send + Sync + StdError,
{
	/// Converts an [`HttpClientError`] emitted by the transport into a broker error.
	fn map_transport_error(
		&self,
		kind: FlowKind,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<E>,
	) -> Error;
}

/// Default mapper for reqwest-backed transports.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransportErrorMapper;
#[cfg(feature = "reqwest")]
impl TransportErrorMapper<ReqwestError> for ReqwestTransportErrorMapper {
	fn map_transport_error(
		&self,
		kind: FlowKind,
		meta: Option<&ResponseMetadata>,
		err: HttpClientError<ReqwestError>,
	) -> Error {
		match err {
			HttpClientError::Reqwest(inner) => map_reqwest_error(kind, *inner),
			other => map_generic_client_error(kind, meta, other),
		}
	}
}

/// Failure reported by a transport as a bare message.
#[derive(Clone, Debug, ThisError)]
#[error("HTTP client error: {message}.")]
pub struct ClientFailure {
	/// Message supplied by the transport.
	pub message: String,
	/// Status captured before the failure, if any.
	pub status: Option<u16>,
}

/// Transport-agnostic classification usable by custom [`TransportErrorMapper`]s.
///
/// Request construction problems become [`ConfigError::HttpRequest`]; everything else is a
/// transport failure of the flow identified by `kind`.
pub fn map_generic_client_error<E>(
	kind: FlowKind,
	meta: Option<&ResponseMetadata>,
	err: HttpClientError<E>,
) -> Error
where
	E: 'static + Send + Sync + StdError,
{
	let status = meta.and_then(|m| m.status);

	match err {
		HttpClientError::Reqwest(inner) => Error::transport(kind, *inner),
		HttpClientError::Http(inner) => ConfigError::from(inner).into(),
		HttpClientError::Io(inner) => Error::transport(kind, inner),
		HttpClientError::Other(message) => Error::transport(kind, ClientFailure { message, status }),
		_ => Error::transport(
			kind,
			ClientFailure { message: "unrecognized transport failure".into(), status },
		),
	}
}

#[cfg(feature = "reqwest")]
fn map_reqwest_error(kind: FlowKind, err: ReqwestError) -> Error {
	if err.is_builder() {
		return ConfigError::from(err).into();
	}
	if err.is_timeout() {
		return Error::timeout(kind, None);
	}

	Error::transport(kind, err)
}

/// Status, body and retry hint of a completed exchange.
#[derive(Clone, Debug)]
pub(crate) struct Reply {
	pub(crate) status: u16,
	pub(crate) body: Vec<u8>,
	pub(crate) retry_after: Option<Duration>,
}
impl Reply {
	pub(crate) fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}

	pub(crate) fn body_text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}

	/// Converts a non-success reply into the flow's rejection error.
	pub(crate) fn into_rejection(self, kind: FlowKind) -> Error {
		let body = self.body_text();

		Error::rejected(kind, self.status, body, self.retry_after)
	}
}

/// Sends the request produced by `build`, retrying 5xx replies per `policy`.
///
/// `build` runs once per attempt, so every attempt carries an identical request. Transport
/// failures and timeouts end the call immediately.
pub(crate) async fn send<C, M, F>(
	client: &C,
	mapper: &M,
	kind: FlowKind,
	deadline: Duration,
	policy: &RetryPolicy,
	build: F,
) -> Result<Reply>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
	F: Fn() -> Result<HttpRequest, ConfigError>,
{
	let mut attempt = 0;

	loop {
		let reply = dispatch(client, mapper, kind, deadline, build()?).await?;

		if !(500..600).contains(&reply.status) || attempt >= policy.max_retries {
			return Ok(reply);
		}

		let pause = policy.backoff(attempt, reply.retry_after);

		#[cfg(feature = "tracing")]
		tracing::debug!(
			flow = kind.as_str(),
			status = reply.status,
			attempt,
			pause_ms = pause.whole_milliseconds() as u64,
			"retrying after server error"
		);

		tokio::time::sleep(pause.unsigned_abs()).await;

		attempt += 1;
	}
}

async fn dispatch<C, M>(
	client: &C,
	mapper: &M,
	kind: FlowKind,
	deadline: Duration,
	mut request: HttpRequest,
) -> Result<Reply>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	let slot = ResponseMetadataSlot::default();
	let handle = client.with_metadata(slot.clone());
	let limit = deadline.unsigned_abs();

	request.extensions_mut().insert(RequestDeadline(limit));

	let response = match tokio::time::timeout(limit, handle.call(request)).await {
		Ok(Ok(response)) => response,
		Ok(Err(err)) => return Err(mapper.map_transport_error(kind, slot.take().as_ref(), err)),
		Err(_) => return Err(Error::timeout(kind, Some(deadline))),
	};
	let retry_after = slot.take().and_then(|meta| meta.retry_after);

	Ok(Reply { status: response.status().as_u16(), body: response.into_body(), retry_after })
}

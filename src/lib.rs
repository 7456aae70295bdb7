//! Service-identity token broker and guarded atomic document writes for REST document stores.
//!
//! The crate signs short-lived assertions with a service account key, exchanges them for
//! bearer tokens behind a single-flight cache, and commits create-only documents whose
//! creation timestamp is stamped by the store's own clock.

#![deny(clippy::all, missing_docs)]

pub mod auth;
pub mod clock;
pub mod endpoint;
pub mod error;
pub mod flows;
pub mod http;
pub mod obs;
pub mod transport;
#[cfg(all(any(test, feature = "test"), feature = "reqwest"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::{
		collections::VecDeque,
		sync::atomic::{AtomicUsize, Ordering},
	};
	// crates.io
	use oauth2::{AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse};
	// self
	use crate::{
		auth::CredentialLoader,
		clock::ManualClock,
		endpoint::EndpointDescriptor,
		flows::Broker,
		http::{HttpTransport, ReqwestHttpClient, ResponseMetadata, ResponseMetadataSlot},
		transport::{ReqwestTransportErrorMapper, TransportErrorMapper},
	};

	/// PKCS#8 RSA private key used to sign assertions in tests.
	pub const TEST_PRIVATE_KEY: &str =
		include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/service_key.pem"));
	/// Public half of [`TEST_PRIVATE_KEY`], used to verify signatures.
	pub const TEST_PUBLIC_KEY: &str =
		include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/service_key.pub.pem"));
	/// Realm identifier baked into [`test_credential_json`].
	pub const TEST_REALM: &str = "demo-realm";
	/// Principal email baked into [`test_credential_json`].
	pub const TEST_PRINCIPAL: &str = "svc-writer@demo-realm.iam.gserviceaccount.com";

	/// Broker type alias used by reqwest-backed integration tests.
	pub type ReqwestTestBroker = Broker<ReqwestHttpClient, ReqwestTransportErrorMapper>;
	/// Broker type alias used by tests that script HTTP responses in-process.
	pub type ScriptedBroker = Broker<ScriptedTransport, ScriptedTransportErrorMapper>;

	/// Returns a service account JSON document for the test key.
	pub fn test_credential_json() -> String {
		serde_json::json!({
			"type": "service_account",
			"project_id": TEST_REALM,
			"private_key_id": "test-key-1",
			"private_key": TEST_PRIVATE_KEY,
			"client_email": TEST_PRINCIPAL,
		})
		.to_string()
	}

	/// Builds a reqwest HTTP client that accepts the self-signed certificates produced by
	/// `httpmock` during tests.
	pub fn test_reqwest_http_client() -> ReqwestHttpClient {
		let client = ReqwestClient::builder()
			.danger_accept_invalid_certs(true)
			.danger_accept_invalid_hostnames(true)
			.build()
			.expect("Failed to build insecure Reqwest client for tests.");

		ReqwestHttpClient::with_client(client)
	}

	/// Builds endpoints that point at a mock server's `/token` and `/v1/` paths.
	pub fn test_endpoints(base: &str) -> EndpointDescriptor {
		let base = base.trim_end_matches('/');

		EndpointDescriptor::builder()
			.token_endpoint(
				Url::parse(&format!("{base}/token")).expect("Mock token endpoint should parse."),
			)
			.document_base(
				Url::parse(&format!("{base}/v1/")).expect("Mock document base should parse."),
			)
			.build()
			.expect("Mock endpoint descriptor should build.")
	}

	/// Constructs a [`Broker`] backed by the reqwest transport and the test credential.
	pub fn build_reqwest_test_broker(endpoints: EndpointDescriptor) -> ReqwestTestBroker {
		Broker::with_http_client(
			endpoints,
			CredentialLoader::inline(test_credential_json()),
			test_reqwest_http_client(),
			Arc::new(ReqwestTransportErrorMapper),
		)
	}

	/// Constructs a [`Broker`] over a [`ScriptedTransport`] and a [`ManualClock`].
	pub fn build_scripted_broker(
		transport: ScriptedTransport,
		clock: ManualClock,
	) -> ScriptedBroker {
		Broker::with_http_client(
			test_endpoints("https://docstore.test"),
			CredentialLoader::inline(test_credential_json()),
			transport,
			Arc::new(ScriptedTransportErrorMapper),
		)
		.with_clock(clock)
	}

	/// Canned response returned by a [`ScriptedTransport`].
	#[derive(Clone, Debug)]
	pub struct ScriptedResponse {
		/// HTTP status code.
		pub status: u16,
		/// Response body.
		pub body: String,
		/// Artificial latency applied before the response resolves.
		pub delay: Option<std::time::Duration>,
	}
	impl ScriptedResponse {
		/// JSON response with the provided status.
		pub fn json(status: u16, body: impl Into<String>) -> Self {
			Self { status, body: body.into(), delay: None }
		}

		/// Successful token exchange response.
		pub fn token(access_token: &str, expires_in: i64) -> Self {
			Self::json(
				200,
				format!(
					"{{\"access_token\":\"{access_token}\",\"expires_in\":{expires_in},\"token_type\":\"Bearer\"}}"
				),
			)
		}

		/// Delays the response by `delay`.
		pub fn delayed(mut self, delay: std::time::Duration) -> Self {
			self.delay = Some(delay);

			self
		}
	}

	/// Captured request seen by a [`ScriptedTransport`].
	#[derive(Clone, Debug)]
	pub struct RecordedRequest {
		/// Request URI.
		pub uri: String,
		/// `Authorization` header, when present.
		pub authorization: Option<String>,
		/// `Content-Type` header, when present.
		pub content_type: Option<String>,
		/// Raw request body.
		pub body: Vec<u8>,
	}
	impl RecordedRequest {
		/// Request body decoded as UTF-8.
		pub fn body_text(&self) -> String {
			String::from_utf8_lossy(&self.body).into_owned()
		}

		/// Request body decoded as JSON.
		pub fn body_json(&self) -> serde_json::Value {
			serde_json::from_slice(&self.body).expect("Recorded request body should be JSON.")
		}
	}

	#[derive(Debug, Default)]
	struct ScriptState {
		token: Mutex<VecDeque<ScriptedResponse>>,
		commit: Mutex<VecDeque<ScriptedResponse>>,
		requests: Mutex<Vec<RecordedRequest>>,
		token_calls: AtomicUsize,
		commit_calls: AtomicUsize,
	}

	/// In-process [`HttpTransport`] that replays queued responses and records every request.
	///
	/// Requests whose URI ends in `/token` consume the token queue; everything else consumes the
	/// commit queue. The last queued response of each queue is reused once the queue drains.
	#[derive(Clone, Debug, Default)]
	pub struct ScriptedTransport(Arc<ScriptState>);
	impl ScriptedTransport {
		/// Queues a response for the token endpoint.
		pub fn push_token(&self, response: ScriptedResponse) -> &Self {
			self.0.token.lock().push_back(response);

			self
		}

		/// Queues a response for the commit endpoint.
		pub fn push_commit(&self, response: ScriptedResponse) -> &Self {
			self.0.commit.lock().push_back(response);

			self
		}

		/// Number of token exchanges dispatched so far.
		pub fn token_calls(&self) -> usize {
			self.0.token_calls.load(Ordering::SeqCst)
		}

		/// Number of commits dispatched so far.
		pub fn commit_calls(&self) -> usize {
			self.0.commit_calls.load(Ordering::SeqCst)
		}

		/// Every request seen so far, in dispatch order.
		pub fn requests(&self) -> Vec<RecordedRequest> {
			self.0.requests.lock().clone()
		}

		fn next(&self, is_token: bool) -> Option<ScriptedResponse> {
			let queue = if is_token { &self.0.token } else { &self.0.commit };
			let mut queue = queue.lock();

			if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() }
		}
	}
	impl HttpTransport for ScriptedTransport {
		type Handle = ScriptedHandle;
		type TransportError = ScriptedTransportError;

		fn with_metadata(&self, slot: ResponseMetadataSlot) -> Self::Handle {
			ScriptedHandle { transport: self.clone(), slot }
		}
	}

	/// Handle returned by [`ScriptedTransport::with_metadata`].
	pub struct ScriptedHandle {
		transport: ScriptedTransport,
		slot: ResponseMetadataSlot,
	}
	impl<'c> AsyncHttpClient<'c> for ScriptedHandle {
		type Error = HttpClientError<ScriptedTransportError>;
		type Future = Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'c + Send>>;

		fn call(&'c self, request: HttpRequest) -> Self::Future {
			let transport = self.transport.clone();
			let slot = self.slot.clone();

			Box::pin(async move {
				slot.take();

				let uri = request.uri().to_string();
				let is_token = uri.ends_with("/token");
				let header = |name: &str| {
					request.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_owned)
				};
				let recorded = RecordedRequest {
					authorization: header("authorization"),
					content_type: header("content-type"),
					body: request.body().clone(),
					uri,
				};

				transport.0.requests.lock().push(recorded);

				if is_token {
					transport.0.token_calls.fetch_add(1, Ordering::SeqCst);
				} else {
					transport.0.commit_calls.fetch_add(1, Ordering::SeqCst);
				}

				let scripted = transport
					.next(is_token)
					.ok_or(HttpClientError::Other("No scripted response queued.".into()))?;

				if let Some(delay) = scripted.delay {
					tokio::time::sleep(delay).await;
				}

				slot.store(ResponseMetadata { status: Some(scripted.status), retry_after: None });

				let mut response = HttpResponse::new(scripted.body.into_bytes());

				*response.status_mut() = oauth2::http::StatusCode::from_u16(scripted.status)
					.map_err(|e| HttpClientError::Other(e.to_string()))?;

				Ok::<_, Self::Error>(response)
			})
		}
	}

	/// Error type reported by [`ScriptedTransport`]; never constructed by the fake itself.
	#[derive(Debug, ThisError)]
	#[error("Scripted transport failure.")]
	pub struct ScriptedTransportError;

	/// Mapper paired with [`ScriptedTransport`].
	#[derive(Clone, Debug, Default)]
	pub struct ScriptedTransportErrorMapper;
	impl TransportErrorMapper<ScriptedTransportError> for ScriptedTransportErrorMapper {
		fn map_transport_error(
			&self,
			kind: crate::obs::FlowKind,
			meta: Option<&ResponseMetadata>,
			err: HttpClientError<ScriptedTransportError>,
		) -> Error {
			crate::transport::map_generic_client_error(kind, meta, err)
		}
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use async_lock::OnceCell;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

pub use oauth2;
#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;

//! Demonstrates registering a custom HTTP transport and mapper that emit non-reqwest errors.
//!
//! 1. Implement [`HttpTransport`] so the transport records [`ResponseMetadata`] via the provided
//!    [`ResponseMetadataSlot`].
//! 2. Provide a [`TransportErrorMapper`] that understands both the transport error type and the
//!    captured metadata.
//! 3. Pass both to [`Broker::with_http_client`].
//! 4. Map the resulting [`HttpClientError`] variants back into the broker's [`Error`] type.

// std
use std::{
	error::Error as StdError,
	fmt::{Display, Formatter, Result as FmtResult},
	future::Future,
	pin::Pin,
	sync::Arc,
};
// crates.io
use color_eyre::Result;
use time::Duration;
use url::Url;
// self
use docstore_broker::{
	auth::CredentialLoader,
	endpoint::EndpointDescriptor,
	error::{Error, WriteError},
	flows::Broker,
	http::{HttpTransport, ResponseMetadata, ResponseMetadataSlot},
	obs::FlowKind,
	oauth2::{AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse},
	transport::{TransportErrorMapper, map_generic_client_error},
};

const DEMO_KEY: &str = include_str!("../tests/fixtures/service_key.pem");

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let endpoints = EndpointDescriptor::builder()
		.token_endpoint(Url::parse("https://auth.example.com/token")?)
		.document_base(Url::parse("https://docs.example.com/v1/")?)
		.build()?;
	let mapper = Arc::new(MockTransportErrorMapper);
	let broker: Broker<MockHttpClient, MockTransportErrorMapper> = Broker::with_http_client(
		endpoints.clone(),
		CredentialLoader::inline(demo_credential()),
		MockHttpClient::default(),
		Arc::clone(&mapper),
	);
	let name = broker.persist_assistant_message("demo-user", "demo-session", "Hello!").await?;

	println!("Document committed through the mock transport: {name}.");

	let failing_broker: Broker<MockHttpClient, MockTransportErrorMapper> =
		Broker::with_http_client(
			endpoints.clone(),
			CredentialLoader::inline(demo_credential()),
			MockHttpClient::transport_error(MockTransportError::DnsFailure {
				host: "auth.example.com",
			}),
			Arc::clone(&mapper),
		);

	match failing_broker.persist_assistant_message("demo-user", "demo-session", "Hi.").await {
		Ok(_) => println!("Mock transport unexpectedly succeeded."),
		Err(e) => println!("Transport error mapped by the broker: {e}."),
	}

	let other_broker: Broker<MockHttpClient, MockTransportErrorMapper> = Broker::with_http_client(
		endpoints,
		CredentialLoader::inline(demo_credential()),
		MockHttpClient::other_error("upstream connection closed"),
		mapper,
	);

	match other_broker.persist_or_notice("demo-user", "demo-session", "Hi again.").await {
		Ok(_) => println!("Mock transport unexpectedly stored the message."),
		Err(notice) => println!("The end user would see: {notice}"),
	}

	Ok(())
}

fn demo_credential() -> String {
	serde_json::json!({
		"project_id": "demo-realm",
		"client_email": "svc-writer@demo-realm.iam.gserviceaccount.com",
		"private_key": DEMO_KEY,
	})
	.to_string()
}

#[derive(Clone, Debug)]
enum MockTransportError {
	DnsFailure { host: &'static str },
}
impl Display for MockTransportError {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			Self::DnsFailure { host } => write!(f, "DNS lookup failed for {host}"),
		}
	}
}
impl StdError for MockTransportError {}

#[derive(Clone)]
enum MockBehavior {
	Success,
	TransportError(MockTransportError),
	Other(&'static str),
}

#[derive(Clone)]
struct MockHttpClient {
	behavior: MockBehavior,
}
impl MockHttpClient {
	fn success() -> Self {
		Self { behavior: MockBehavior::Success }
	}

	fn transport_error(error: MockTransportError) -> Self {
		Self { behavior: MockBehavior::TransportError(error) }
	}

	fn other_error(message: &'static str) -> Self {
		Self { behavior: MockBehavior::Other(message) }
	}
}
impl Default for MockHttpClient {
	fn default() -> Self {
		Self::success()
	}
}
impl HttpTransport for MockHttpClient {
	type Handle = MockHttpHandle;
	type TransportError = MockTransportError;

	fn with_metadata(&self, slot: ResponseMetadataSlot) -> Self::Handle {
		MockHttpHandle { slot, behavior: self.behavior.clone() }
	}
}

struct MockHttpHandle {
	slot: ResponseMetadataSlot,
	behavior: MockBehavior,
}
impl<'a> AsyncHttpClient<'a> for MockHttpHandle {
	type Error = HttpClientError<MockTransportError>;
	type Future =
		Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'a + Send + Sync>>;

	fn call(&'a self, request: HttpRequest) -> Self::Future {
		let slot = self.slot.clone();
		let behavior = self.behavior.clone();
		let is_token = request.uri().path().ends_with("/token");

		Box::pin(async move {
			slot.take();

			match behavior {
				MockBehavior::Success => {
					slot.store(ResponseMetadata { status: Some(200), retry_after: None });

					let body: &[u8] = if is_token {
						b"{\"access_token\":\"mock-access\",\"token_type\":\"Bearer\",\"expires_in\":900}"
					} else {
						b"{\"writeResults\":[{},{}]}"
					};

					Ok(HttpResponse::new(body.to_vec()))
				},
				MockBehavior::TransportError(error) => {
					slot.store(ResponseMetadata {
						status: Some(503),
						retry_after: Some(Duration::seconds(2)),
					});

					// `Reqwest` is only a variant name; the boxed payload is any transport error.
					Err(HttpClientError::Reqwest(Box::new(error)))
				},
				MockBehavior::Other(message) => {
					slot.store(ResponseMetadata { status: None, retry_after: None });

					Err(HttpClientError::Other(message.to_owned()))
				},
			}
		})
	}
}

#[derive(Clone, Default)]
struct MockTransportErrorMapper;
impl TransportErrorMapper<MockTransportError> for MockTransportErrorMapper {
	fn map_transport_error(
		&self,
		kind: FlowKind,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<MockTransportError>,
	) -> Error {
		match (kind, error) {
			(FlowKind::DocumentCommit, HttpClientError::Reqwest(inner)) => WriteError::Rejected {
				status: metadata.and_then(|meta| meta.status).unwrap_or(503),
				body: inner.to_string(),
				retry_after: metadata.and_then(|meta| meta.retry_after),
			}
			.into(),
			(kind, error) => map_generic_client_error(kind, metadata, error),
		}
	}
}

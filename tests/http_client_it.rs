// crates.io
use httpmock::prelude::*;
// self
use docstore_broker::{
	_preludet::*,
	auth::{CredentialLoader, ScopeSet},
	error::AuthError,
	flows::Broker,
	http::{HttpTransport, RequestDeadline, ResponseMetadata, ResponseMetadataSlot},
	obs::FlowKind,
	oauth2::{AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse},
	transport::TransportErrorMapper,
};

#[derive(Debug)]
enum FakeTransportError {
	Throttled,
}
impl Display for FakeTransportError {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			Self::Throttled => write!(f, "Transport throttled."),
		}
	}
}
impl StdError for FakeTransportError {}

#[derive(Clone, Default)]
struct FakeHttpClient {
	retry_after: Duration,
	deadlines: Arc<Mutex<Vec<Option<RequestDeadline>>>>,
}
impl FakeHttpClient {
	fn throttled(retry_after: Duration) -> Self {
		Self { retry_after, deadlines: Default::default() }
	}

	fn recorded_deadlines(&self) -> Vec<Option<RequestDeadline>> {
		self.deadlines.lock().clone()
	}
}
impl HttpTransport for FakeHttpClient {
	type Handle = FakeHttpHandle;
	type TransportError = FakeTransportError;

	fn with_metadata(&self, slot: ResponseMetadataSlot) -> Self::Handle {
		FakeHttpHandle { slot, client: self.clone() }
	}
}

struct FakeHttpHandle {
	slot: ResponseMetadataSlot,
	client: FakeHttpClient,
}
impl<'a> AsyncHttpClient<'a> for FakeHttpHandle {
	type Error = HttpClientError<FakeTransportError>;
	type Future =
		Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'a + Send + Sync>>;

	fn call(&'a self, request: HttpRequest) -> Self::Future {
		let slot = self.slot.clone();
		let retry_after = self.client.retry_after;

		self.client.deadlines.lock().push(request.extensions().get::<RequestDeadline>().copied());

		Box::pin(async move {
			assert!(
				slot.take().is_none(),
				"ResponseMetadataSlot must be clear before dispatching a request."
			);
			slot.store(ResponseMetadata { status: Some(429), retry_after: Some(retry_after) });

			Err::<HttpResponse, _>(HttpClientError::Reqwest(Box::new(FakeTransportError::Throttled)))
		})
	}
}

#[derive(Clone, Default)]
struct RecordingTransportErrorMapper {
	metadata: Arc<Mutex<Vec<(FlowKind, Option<ResponseMetadata>)>>>,
}
impl RecordingTransportErrorMapper {
	fn recorded(&self) -> Vec<(FlowKind, Option<ResponseMetadata>)> {
		self.metadata.lock().clone()
	}
}
impl TransportErrorMapper<FakeTransportError> for RecordingTransportErrorMapper {
	fn map_transport_error(
		&self,
		kind: FlowKind,
		meta: Option<&ResponseMetadata>,
		err: HttpClientError<FakeTransportError>,
	) -> Error {
		self.metadata.lock().push((kind, meta.cloned()));

		AuthError::TokenEndpoint {
			status: meta.and_then(|value| value.status).unwrap_or_default(),
			body: err.to_string(),
			retry_after: meta.and_then(|value| value.retry_after),
		}
		.into()
	}
}

fn fake_broker(
	http_client: FakeHttpClient,
	mapper: RecordingTransportErrorMapper,
) -> Broker<FakeHttpClient, RecordingTransportErrorMapper> {
	Broker::with_http_client(
		test_endpoints("https://mock.example.com"),
		CredentialLoader::inline(test_credential_json()),
		http_client,
		mapper,
	)
}

#[tokio::test]
async fn fake_transport_surfaces_metadata_through_the_mapper() {
	let http_client = FakeHttpClient::throttled(Duration::seconds(30));
	let mapper = RecordingTransportErrorMapper::default();
	let broker = fake_broker(http_client.clone(), mapper.clone());
	let err = broker
		.get_token(&ScopeSet::datastore())
		.await
		.expect_err("Request should be throttled with HTTP 429.");

	match err {
		Error::Auth(AuthError::TokenEndpoint { status, retry_after, .. }) => {
			assert_eq!(status, 429);
			assert_eq!(retry_after, Some(Duration::seconds(30)));
		},
		other => panic!("Unexpected error variant: {other:?}."),
	}

	let observed = mapper.recorded();

	assert_eq!(observed.len(), 1, "Mapper must record a single request.");

	let (kind, meta) = observed.first().cloned().expect("One mapping should be recorded.");
	let meta = meta.expect("Response metadata should be recorded.");

	assert_eq!(kind, FlowKind::TokenExchange);
	assert_eq!(meta.status, Some(429));
	assert_eq!(meta.retry_after, Some(Duration::seconds(30)));
}

#[tokio::test]
async fn requests_carry_the_flow_deadline() {
	let http_client = FakeHttpClient::throttled(Duration::seconds(1));
	let broker = fake_broker(http_client.clone(), RecordingTransportErrorMapper::default())
		.with_timeouts(Duration::seconds(4), Duration::seconds(9));
	let _ = broker.get_token(&ScopeSet::datastore()).await;

	assert_eq!(
		http_client.recorded_deadlines(),
		vec![Some(RequestDeadline(std::time::Duration::from_secs(4)))],
	);
}

#[tokio::test]
async fn reqwest_transport_reports_retry_after_hints() {
	let server = MockServer::start_async().await;
	let mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(503).header("retry-after", "7").body("temporarily unavailable");
		})
		.await;
	let broker = build_reqwest_test_broker(test_endpoints(&server.base_url()));
	let err = broker
		.get_token(&ScopeSet::datastore())
		.await
		.expect_err("A 503 reply must fail the exchange.");

	assert_eq!(err.status(), Some(503));
	assert_eq!(err.retry_after(), Some(Duration::seconds(7)));
	assert!(err.is_retryable());

	mock.assert_calls_async(1).await;
}

#[tokio::test]
async fn reqwest_transport_honors_the_exchange_deadline() {
	let server = MockServer::start_async().await;
	let _mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(200)
				.header("content-type", "application/json")
				.body("{\"access_token\":\"slow\",\"expires_in\":3600}")
				.delay(std::time::Duration::from_millis(800));
		})
		.await;
	let broker = build_reqwest_test_broker(test_endpoints(&server.base_url()))
		.with_timeouts(Duration::milliseconds(100), Duration::seconds(15));
	let err = broker
		.get_token(&ScopeSet::datastore())
		.await
		.expect_err("The exchange should exceed its deadline.");

	assert!(matches!(err, Error::Auth(AuthError::Timeout { .. })), "Unexpected error: {err:?}.");
	assert!(broker.cached_token(&ScopeSet::datastore()).is_none());
}

// crates.io
use base64::{
	Engine as _,
	engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use jsonwebtoken::{Algorithm, DecodingKey};
// self
use docstore_broker::{
	_preludet::*,
	auth::{AssertionClaims, CredentialLoader, ScopeSet},
	clock::ManualClock,
	error::WriteError,
	flows::{Broker, DocumentPath, DocumentWriteRequest},
};

#[tokio::test]
async fn base64_credential_exchange_reuse_commit_and_collision() {
	let transport = ScriptedTransport::default();
	let clock = ManualClock::at(1_000);
	let broker: ScriptedBroker = Broker::with_http_client(
		test_endpoints("https://docstore.test"),
		CredentialLoader::inline(STANDARD.encode(test_credential_json())),
		transport.clone(),
		Arc::new(ScriptedTransportErrorMapper),
	)
	.with_clock(clock.clone());
	let scope = ScopeSet::datastore();

	transport.push_token(ScriptedResponse::token("tok1", 3_600));
	transport.push_commit(ScriptedResponse::json(200, "{}"));
	transport.push_commit(ScriptedResponse::json(409, "{\"error\":{\"status\":\"ALREADY_EXISTS\"}}"));

	let token = broker.get_token(&scope).await.expect("Exchange at epoch 1000 should succeed.");
	let cached = broker.cached_token(&scope).expect("Exchange should populate the cache.");

	assert_eq!(token.expose(), "tok1");
	assert_eq!(cached.value.expose(), "tok1");
	assert_eq!(cached.expires_at_epoch(), 4_600);

	clock.set(1_010);

	let path = DocumentPath::messages("u1", "s1").expect("Path should be valid.");
	let written = broker
		.write_document(DocumentWriteRequest::new(path.clone(), "first reply"))
		.await
		.expect("First commit should succeed.");

	assert_eq!(transport.token_calls(), 1, "The cached token must be reused at epoch 1010.");

	let err = broker
		.write_document(DocumentWriteRequest::new(path, "second reply"))
		.await
		.expect_err("The second commit should report a collision.");

	assert!(matches!(err, Error::Write(WriteError::AlreadyExists { status: 409, .. })));
	assert_eq!(transport.token_calls(), 1);
	assert_eq!(transport.commit_calls(), 2);
	assert!(written.as_str().starts_with("projects/demo-realm/databases/(default)/documents/"));

	let requests = transport.requests();
	let exchange = requests.first().expect("The exchange should be the first request.");
	let assertion = url::form_urlencoded::parse(&exchange.body)
		.find(|(key, _)| key == "assertion")
		.map(|(_, value)| value.into_owned())
		.expect("The exchange form should carry an assertion.");
	let segments = assertion.split('.').collect::<Vec<_>>();
	let claims: AssertionClaims = serde_json::from_slice(
		&URL_SAFE_NO_PAD.decode(segments[1]).expect("Payload should be base64url."),
	)
	.expect("Payload should hold the assertion claims.");

	assert_eq!(claims.iss, TEST_PRINCIPAL);
	assert_eq!(claims.sub, TEST_PRINCIPAL);
	assert_eq!(claims.aud, "https://docstore.test/token");
	assert_eq!(claims.iat, 1_000);
	assert_eq!(claims.exp, 4_600);

	let key = DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY.as_bytes())
		.expect("Fixture public key should parse.");
	let verified = jsonwebtoken::crypto::verify(
		segments[2],
		format!("{}.{}", segments[0], segments[1]).as_bytes(),
		&key,
		Algorithm::RS256,
	)
	.expect("Signature verification should run.");

	assert!(verified);
}

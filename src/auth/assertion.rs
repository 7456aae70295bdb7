//! Self-signed JWT-bearer assertions presented to the token exchange endpoint.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey};
// self
use crate::{
	_prelude::*,
	auth::{ScopeSet, ServiceIdentity},
	error::AuthError,
};

/// Lifetime stamped into every assertion.
pub const ASSERTION_TTL: Duration = Duration::seconds(3600);

const ALGORITHM: Algorithm = Algorithm::RS256;

#[derive(Serialize)]
struct AssertionHeader<'a> {
	alg: &'static str,
	typ: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	kid: Option<&'a str>,
}

/// Claims carried by an assertion, serialized in this field order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
	/// Issuer; the principal email.
	pub iss: String,
	/// Subject; the principal email.
	pub sub: String,
	/// Audience; the token exchange endpoint.
	pub aud: String,
	/// Issued-at, epoch seconds.
	pub iat: i64,
	/// Expiry, epoch seconds.
	pub exp: i64,
	/// Space-delimited requested scopes.
	pub scope: String,
}

/// Signed `header.payload.signature` assertion. Built per refresh and never reused.
#[derive(Clone, PartialEq, Eq)]
pub struct Assertion {
	header: String,
	payload: String,
	signature: String,
}
impl Assertion {
	/// Signs a fresh assertion for `scope`, valid from `now` for [`ASSERTION_TTL`].
	///
	/// Pure: the only failure is key material that cannot be parsed or used.
	pub fn sign(
		identity: &ServiceIdentity,
		audience: &Url,
		scope: &ScopeSet,
		now: OffsetDateTime,
	) -> Result<Self, AuthError> {
		let iat = now.unix_timestamp();
		let header =
			AssertionHeader { alg: "RS256", typ: "JWT", kid: identity.private_key_id() };
		let claims = AssertionClaims {
			iss: identity.principal_email().to_owned(),
			sub: identity.principal_email().to_owned(),
			aud: audience.as_str().to_owned(),
			iat,
			exp: iat + ASSERTION_TTL.whole_seconds(),
			scope: scope.normalized(),
		};
		let header = encode_segment(&header)?;
		let payload = encode_segment(&claims)?;
		let key = EncodingKey::from_rsa_pem(identity.private_key().expose().as_bytes())
			.map_err(|e| AuthError::Signing { source: Arc::new(e) })?;
		let signature = jsonwebtoken::crypto::sign(
			format!("{header}.{payload}").as_bytes(),
			&key,
			ALGORITHM,
		)
		.map_err(|e| AuthError::Signing { source: Arc::new(e) })?;

		Ok(Self { header, payload, signature })
	}

	/// Encoded header segment.
	pub fn header(&self) -> &str {
		&self.header
	}

	/// Encoded payload segment.
	pub fn payload(&self) -> &str {
		&self.payload
	}

	/// Encoded signature segment.
	pub fn signature(&self) -> &str {
		&self.signature
	}

	/// `header.payload`, the bytes covered by the signature.
	pub fn signing_input(&self) -> String {
		format!("{}.{}", self.header, self.payload)
	}

	/// Compact serialization sent as the `assertion` form field.
	pub fn compact(&self) -> String {
		format!("{}.{}.{}", self.header, self.payload, self.signature)
	}
}
impl Debug for Assertion {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Assertion")
			.field("header", &self.header)
			.field("payload", &self.payload)
			.field("signature", &"<redacted>")
			.finish()
	}
}

fn encode_segment<T>(value: &T) -> Result<String, AuthError>
where
	T: Serialize,
{
	let json = serde_json::to_vec(value).map_err(|e| AuthError::Encoding { source: Arc::new(e) })?;

	Ok(URL_SAFE_NO_PAD.encode(json))
}

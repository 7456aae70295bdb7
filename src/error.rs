//! Broker-level error types shared across the credential, token, and commit flows.
//!
//! Every variant is `Clone` so a single in-flight token refresh can hand the same failure to
//! all of its waiters.

// self
use crate::{_prelude::*, obs::FlowKind};

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shareable boxed error used for transport and builder failures.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

type JsonPathError = serde_path_to_error::Error<serde_json::Error>;

/// Canonical broker error exposed by public APIs.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
	/// Local configuration problem; permanent for the lifetime of the process.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Assertion signing or token exchange failure.
	#[error(transparent)]
	Auth(#[from] AuthError),
	/// Document commit failure.
	#[error(transparent)]
	Write(#[from] WriteError),
}
impl Error {
	/// HTTP status returned by the upstream endpoint, when the failure carries one.
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Auth(AuthError::TokenEndpoint { status, .. })
			| Self::Auth(AuthError::MalformedResponse { status, .. })
			| Self::Write(WriteError::Rejected { status, .. })
			| Self::Write(WriteError::AlreadyExists { status, .. }) => Some(*status),
			_ => None,
		}
	}

	/// Returns `true` for upstream 5xx responses, the only failures worth retrying.
	pub fn is_retryable(&self) -> bool {
		self.status().is_some_and(|status| (500..600).contains(&status))
	}

	/// `Retry-After` hint captured from the upstream response, if any.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::Auth(AuthError::TokenEndpoint { retry_after, .. })
			| Self::Write(WriteError::Rejected { retry_after, .. }) => *retry_after,
			_ => None,
		}
	}

	pub(crate) fn rejected(
		kind: FlowKind,
		status: u16,
		body: String,
		retry_after: Option<Duration>,
	) -> Self {
		match kind {
			FlowKind::TokenExchange => AuthError::TokenEndpoint { status, body, retry_after }.into(),
			FlowKind::DocumentCommit => WriteError::Rejected { status, body, retry_after }.into(),
		}
	}

	pub(crate) fn timeout(kind: FlowKind, after: Option<Duration>) -> Self {
		match kind {
			FlowKind::TokenExchange => AuthError::Timeout { after }.into(),
			FlowKind::DocumentCommit => WriteError::Timeout { after }.into(),
		}
	}

	pub(crate) fn transport(kind: FlowKind, src: impl 'static + Send + Sync + StdError) -> Self {
		let source: SharedError = Arc::new(src);

		match kind {
			FlowKind::TokenExchange => AuthError::Transport { source }.into(),
			FlowKind::DocumentCommit => WriteError::Transport { source }.into(),
		}
	}
}

/// Configuration and validation failures raised by the broker.
#[derive(Clone, Debug, ThisError)]
pub enum ConfigError {
	/// The environment variable holding the credential is unset or empty.
	#[error("Credential variable `{variable}` is not set.")]
	MissingCredential {
		/// Name of the environment variable.
		variable: String,
	},
	/// The credential is neither a JSON object nor base64-encoded JSON.
	#[error("Credential is neither a JSON object nor base64-encoded JSON.")]
	UnreadableCredential,
	/// The credential JSON has fields of the wrong shape.
	#[error("Credential JSON is malformed.")]
	MalformedCredential {
		/// Structured decoding failure.
		#[source]
		source: Arc<JsonPathError>,
	},
	/// The credential JSON lacks a required field.
	#[error("Credential is missing the `{field}` field.")]
	MissingField {
		/// Name of the missing field.
		field: &'static str,
	},
	/// An identifier failed validation.
	#[error(transparent)]
	InvalidIdentifier(#[from] crate::auth::IdentifierError),
	/// Request scopes cannot be normalized.
	#[error("Requested scopes are invalid.")]
	InvalidScope(#[from] crate::auth::ScopeValidationError),
	/// A document path failed validation.
	#[error("Document path is invalid.")]
	InvalidPath(#[from] crate::flows::PathError),
	/// The endpoint descriptor failed validation.
	#[error("Endpoint descriptor is invalid.")]
	InvalidEndpoint(#[from] crate::endpoint::EndpointError),
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: SharedError,
	},
	/// HTTP request construction failed.
	#[error("HTTP request could not be constructed.")]
	HttpRequest {
		/// Underlying `http` builder failure.
		#[source]
		source: Arc<oauth2::http::Error>,
	},
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + StdError) -> Self {
		Self::HttpClientBuild { source: Arc::new(src) }
	}
}
impl From<oauth2::http::Error> for ConfigError {
	fn from(e: oauth2::http::Error) -> Self {
		Self::HttpRequest { source: Arc::new(e) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}
impl From<JsonPathError> for ConfigError {
	fn from(e: JsonPathError) -> Self {
		Self::MalformedCredential { source: Arc::new(e) }
	}
}

/// Assertion signing and token exchange failures.
#[derive(Clone, Debug, ThisError)]
pub enum AuthError {
	/// The private key could not be parsed or used for signing.
	#[error("Assertion could not be signed with the service key.")]
	Signing {
		/// Underlying signing failure.
		#[source]
		source: Arc<jsonwebtoken::errors::Error>,
	},
	/// Assertion segments could not be serialized.
	#[error("Assertion could not be serialized.")]
	Encoding {
		/// Underlying serialization failure.
		#[source]
		source: Arc<serde_json::Error>,
	},
	/// Token endpoint answered with a non-success status.
	#[error("Token endpoint returned HTTP {status}: {body}")]
	TokenEndpoint {
		/// HTTP status code.
		status: u16,
		/// Raw response body.
		body: String,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// Token endpoint responded with JSON that could not be parsed.
	#[error("Token endpoint returned malformed JSON.")]
	MalformedResponse {
		/// HTTP status code.
		status: u16,
		/// Structured parsing failure.
		#[source]
		source: Arc<JsonPathError>,
	},
	/// Token endpoint response omitted a required field.
	#[error("Token endpoint response is missing {field}.")]
	MissingField {
		/// Name of the missing field.
		field: &'static str,
	},
	/// Token endpoint returned a non-positive lifetime.
	#[error("The expires_in value must be positive, got {expires_in}.")]
	NonPositiveExpiresIn {
		/// Lifetime reported by the endpoint.
		expires_in: i64,
	},
	/// Token endpoint returned a lifetime whose expiry cannot be represented.
	#[error("The expires_in value {expires_in} exceeds the supported range.")]
	ExpiresInOutOfRange {
		/// Lifetime reported by the endpoint.
		expires_in: i64,
	},
	/// The exchange did not finish before its deadline.
	#[error("Token exchange timed out.")]
	Timeout {
		/// Deadline that elapsed, when known.
		after: Option<Duration>,
	},
	/// Network failure while calling the token endpoint.
	#[error("Network error occurred while calling the token endpoint.")]
	Transport {
		/// Transport-specific failure.
		#[source]
		source: SharedError,
	},
}

/// Document commit failures.
#[derive(Clone, Debug, ThisError)]
pub enum WriteError {
	/// Commit endpoint answered with a non-success status.
	#[error("Document commit failed with HTTP {status}: {body}")]
	Rejected {
		/// HTTP status code.
		status: u16,
		/// Raw response body.
		body: String,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// The create-only precondition failed because the document already exists.
	#[error("Document `{document}` already exists (HTTP {status}).")]
	AlreadyExists {
		/// Fully qualified document name.
		document: String,
		/// HTTP status code.
		status: u16,
		/// Raw response body.
		body: String,
	},
	/// The commit body could not be serialized.
	#[error("Commit body could not be serialized.")]
	Encoding {
		/// Underlying serialization failure.
		#[source]
		source: Arc<serde_json::Error>,
	},
	/// The commit did not finish before its deadline.
	#[error("Document commit timed out.")]
	Timeout {
		/// Deadline that elapsed, when known.
		after: Option<Duration>,
	},
	/// Network failure while calling the commit endpoint.
	#[error("Network error occurred while calling the commit endpoint.")]
	Transport {
		/// Transport-specific failure.
		#[source]
		source: SharedError,
	},
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn status_and_retryability_follow_upstream_codes() {
		let server = Error::rejected(FlowKind::DocumentCommit, 503, "busy".into(), None);
		let client = Error::rejected(FlowKind::TokenExchange, 400, "bad".into(), None);

		assert_eq!(server.status(), Some(503));
		assert!(server.is_retryable());
		assert!(matches!(server, Error::Write(WriteError::Rejected { .. })));
		assert_eq!(client.status(), Some(400));
		assert!(!client.is_retryable());
		assert!(matches!(client, Error::Auth(AuthError::TokenEndpoint { .. })));
	}

	#[test]
	fn timeouts_map_to_flow_family() {
		let auth = Error::timeout(FlowKind::TokenExchange, Some(Duration::seconds(3)));
		let write = Error::timeout(FlowKind::DocumentCommit, None);

		assert!(matches!(auth, Error::Auth(AuthError::Timeout { after: Some(_) })));
		assert!(matches!(write, Error::Write(WriteError::Timeout { after: None })));
		assert_eq!(auth.status(), None);
	}

	#[test]
	fn rejected_messages_embed_status_and_body() {
		let err = Error::rejected(FlowKind::DocumentCommit, 403, "PERMISSION_DENIED".into(), None);

		assert_eq!(err.to_string(), "Document commit failed with HTTP 403: PERMISSION_DENIED");
	}
}

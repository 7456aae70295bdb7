//! Bearer token wrapper that redacts sensitive material.

// self
use crate::_prelude::*;

/// Opaque bearer token; formatting never reveals the value.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSecret(Arc<str>);
impl TokenSecret {
	/// Wraps a new token string.
	pub fn new(value: impl AsRef<str>) -> Self {
		Self(Arc::from(value.as_ref()))
	}

	/// Returns the inner token value. Callers must avoid logging this string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	/// `Authorization` header value for this token.
	pub fn bearer_header(&self) -> String {
		format!("Bearer {}", self.0)
	}
}
impl Debug for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("TokenSecret").field(&"<redacted>").finish()
	}
}
impl Display for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}

//! Endpoint descriptor shared by the token exchange and commit flows.
//!
//! Endpoints are validated once at construction: both must use HTTPS, except loopback hosts
//! so local emulators and mock servers remain reachable.

// std
use std::net::IpAddr;
// self
use crate::{_prelude::*, auth::RealmId};

/// Default token exchange endpoint.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
/// Default document store REST base.
pub const DEFAULT_DOCUMENT_BASE: &str = "https://firestore.googleapis.com/v1/";
/// Default database within a realm.
pub const DEFAULT_DATABASE: &str = "(default)";

/// Errors raised while constructing or validating descriptors.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum EndpointError {
	/// A URL could not be parsed.
	#[error("The {endpoint} endpoint is not a valid URL.")]
	InvalidUrl {
		/// Which endpoint failed validation.
		endpoint: &'static str,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Endpoints must use HTTPS.
	#[error("The {endpoint} endpoint must use HTTPS: {url}.")]
	InsecureEndpoint {
		/// Which endpoint failed validation.
		endpoint: &'static str,
		/// Endpoint URL that failed validation.
		url: String,
	},
	/// The database id cannot be empty or contain `/`.
	#[error("Database id `{database}` is invalid.")]
	InvalidDatabase {
		/// Rejected database id.
		database: String,
	},
}

/// Validated endpoints consumed by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
	/// Token exchange endpoint; also the assertion audience.
	pub token: Url,
	/// REST base of the document store, always ending in `/`.
	pub document_base: Url,
	/// Database within the realm.
	pub database: String,
}
impl EndpointDescriptor {
	/// Creates a new builder seeded with the production defaults.
	pub fn builder() -> EndpointDescriptorBuilder {
		EndpointDescriptorBuilder::default()
	}

	/// `projects/{realm}/databases/{database}`, the prefix of every document name.
	pub fn database_path(&self, realm: &RealmId) -> String {
		format!("projects/{realm}/databases/{}", self.database)
	}

	/// Commit endpoint for `realm`.
	pub fn commit_url(&self, realm: &RealmId) -> Result<Url, EndpointError> {
		self.document_base
			.join(&format!("{}/documents:commit", self.database_path(realm)))
			.map_err(|source| EndpointError::InvalidUrl { endpoint: "commit", source })
	}

	fn validate(&self) -> Result<(), EndpointError> {
		validate_endpoint("token", &self.token)?;
		validate_endpoint("document", &self.document_base)?;

		if self.database.is_empty() || self.database.contains('/') {
			return Err(EndpointError::InvalidDatabase { database: self.database.clone() });
		}

		Ok(())
	}
}

/// Builder for [`EndpointDescriptor`] values.
#[derive(Debug, Default)]
pub struct EndpointDescriptorBuilder {
	token: Option<Url>,
	document_base: Option<Url>,
	database: Option<String>,
}
impl EndpointDescriptorBuilder {
	/// Overrides the token exchange endpoint.
	pub fn token_endpoint(mut self, url: Url) -> Self {
		self.token = Some(url);

		self
	}

	/// Overrides the document store base. A trailing `/` is added when missing.
	pub fn document_base(mut self, url: Url) -> Self {
		self.document_base = Some(url);

		self
	}

	/// Overrides the database id.
	pub fn database(mut self, database: impl Into<String>) -> Self {
		self.database = Some(database.into());

		self
	}

	/// Consumes the builder and validates the resulting descriptor.
	pub fn build(self) -> Result<EndpointDescriptor, EndpointError> {
		let token = match self.token {
			Some(url) => url,
			None => parse_default("token", DEFAULT_TOKEN_ENDPOINT)?,
		};
		let mut document_base = match self.document_base {
			Some(url) => url,
			None => parse_default("document", DEFAULT_DOCUMENT_BASE)?,
		};

		if !document_base.path().ends_with('/') {
			let path = format!("{}/", document_base.path());

			document_base.set_path(&path);
		}

		let descriptor = EndpointDescriptor {
			token,
			document_base,
			database: self.database.unwrap_or_else(|| DEFAULT_DATABASE.into()),
		};

		descriptor.validate()?;

		Ok(descriptor)
	}
}

fn parse_default(endpoint: &'static str, raw: &str) -> Result<Url, EndpointError> {
	Url::parse(raw).map_err(|source| EndpointError::InvalidUrl { endpoint, source })
}

fn validate_endpoint(name: &'static str, url: &Url) -> Result<(), EndpointError> {
	if url.scheme() == "https" || (url.scheme() == "http" && is_loopback(url)) {
		Ok(())
	} else {
		Err(EndpointError::InsecureEndpoint { endpoint: name, url: url.to_string() })
	}
}

fn is_loopback(url: &Url) -> bool {
	match url.host_str() {
		Some("localhost") => true,
		Some(host) => host
			.trim_start_matches('[')
			.trim_end_matches(']')
			.parse::<IpAddr>()
			.is_ok_and(|ip| ip.is_loopback()),
		None => false,
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn url(value: &str) -> Url {
		Url::parse(value).expect("Fixture URL should parse.")
	}

	#[test]
	fn defaults_point_at_production_endpoints() {
		let descriptor = EndpointDescriptor::builder().build().expect("Defaults should validate.");
		let realm = RealmId::new("demo-realm").expect("Realm fixture should be valid.");

		assert_eq!(descriptor.token.as_str(), DEFAULT_TOKEN_ENDPOINT);
		assert_eq!(
			descriptor.commit_url(&realm).expect("Commit URL should join.").as_str(),
			"https://firestore.googleapis.com/v1/projects/demo-realm/databases/(default)/documents:commit",
		);
		assert_eq!(descriptor.database_path(&realm), "projects/demo-realm/databases/(default)");
	}

	#[test]
	fn insecure_endpoints_are_rejected_except_loopback() {
		let err = EndpointDescriptor::builder()
			.token_endpoint(url("http://auth.example.com/token"))
			.build()
			.expect_err("Plain HTTP must be rejected for remote hosts.");

		assert!(matches!(err, EndpointError::InsecureEndpoint { endpoint: "token", .. }));

		let local = EndpointDescriptor::builder()
			.token_endpoint(url("http://127.0.0.1:8080/token"))
			.document_base(url("http://localhost:8080/v1"))
			.build()
			.expect("Loopback hosts may use plain HTTP.");

		assert_eq!(local.document_base.as_str(), "http://localhost:8080/v1/");
	}

	#[test]
	fn database_ids_cannot_split_paths() {
		let err = EndpointDescriptor::builder()
			.database("a/b")
			.build()
			.expect_err("Database ids with separators must be rejected.");

		assert!(matches!(err, EndpointError::InvalidDatabase { .. }));
	}
}

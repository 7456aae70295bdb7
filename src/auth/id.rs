//! Strongly typed identifiers for realms and documents.

// std
use std::{borrow::Borrow, ops::Deref};
// crates.io
use rand::{Rng, distr::Alphanumeric};
// self
use crate::_prelude::*;

macro_rules! def_id {
	($name:ident, $doc:literal, $kind:literal) => {
		#[doc = $doc]
		#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);
		impl $name {
			/// Creates a new identifier after validation.
			pub fn new(value: impl AsRef<str>) -> Result<Self, IdentifierError> {
				let view = value.as_ref();

				validate_view($kind, view)?;

				Ok(Self(view.to_owned()))
			}
		}
		impl Deref for $name {
			type Target = str;

			fn deref(&self) -> &Self::Target {
				&self.0
			}
		}
		impl AsRef<str> for $name {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}
		impl From<$name> for String {
			fn from(value: $name) -> Self {
				value.0
			}
		}
		impl TryFrom<String> for $name {
			type Error = IdentifierError;

			fn try_from(value: String) -> Result<Self, Self::Error> {
				validate_view($kind, &value)?;

				Ok(Self(value))
			}
		}
		impl Borrow<str> for $name {
			fn borrow(&self) -> &str {
				&self.0
			}
		}
		impl Debug for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				write!(f, concat!($kind, "({})"), self.0)
			}
		}
		impl Display for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				f.write_str(&self.0)
			}
		}
		impl FromStr for $name {
			type Err = IdentifierError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s)
			}
		}
	};
}

const IDENTIFIER_MAX_LEN: usize = 128;

/// Error returned when identifier validation fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ThisError)]
pub enum IdentifierError {
	/// The identifier was empty or whitespace.
	#[error("{kind} identifier cannot be empty.")]
	Empty {
		/// Kind of identifier (realm, document, path segment).
		kind: &'static str,
	},
	/// The identifier contains whitespace characters.
	#[error("{kind} identifier contains whitespace.")]
	ContainsWhitespace {
		/// Kind of identifier (realm, document, path segment).
		kind: &'static str,
	},
	/// The identifier contains a `/`, which would split a document path.
	#[error("{kind} identifier contains a path separator.")]
	ContainsSeparator {
		/// Kind of identifier (realm, document, path segment).
		kind: &'static str,
	},
	/// The identifier exceeded the allowed character count.
	#[error("{kind} identifier exceeds {max} characters.")]
	TooLong {
		/// Kind of identifier (realm, document, path segment).
		kind: &'static str,
		/// Maximum permitted character count.
		max: usize,
	},
}

def_id! { RealmId, "Project/realm identifier that owns the document store.", "Realm" }
def_id! { DocumentId, "Leaf identifier of a single document.", "Document" }

const DOCUMENT_ID_LEN: usize = 20;

impl DocumentId {
	/// Generates a fresh 20-character alphanumeric identifier.
	///
	/// 62^20 possibilities make collisions improbable; the commit's existence precondition turns
	/// the remaining risk into a hard failure instead of an overwrite.
	pub fn random() -> Self {
		let id = rand::rng()
			.sample_iter(&Alphanumeric)
			.take(DOCUMENT_ID_LEN)
			.map(char::from)
			.collect();

		Self(id)
	}
}

pub(crate) fn validate_view(kind: &'static str, view: &str) -> Result<(), IdentifierError> {
	if view.is_empty() {
		return Err(IdentifierError::Empty { kind });
	}
	if view.chars().any(char::is_whitespace) {
		return Err(IdentifierError::ContainsWhitespace { kind });
	}
	if view.contains('/') {
		return Err(IdentifierError::ContainsSeparator { kind });
	}
	if view.len() > IDENTIFIER_MAX_LEN {
		return Err(IdentifierError::TooLong { kind, max: IDENTIFIER_MAX_LEN });
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn identifiers_reject_whitespace_and_separators() {
		assert!(RealmId::new(" demo-realm").is_err(), "Leading whitespace must be rejected.");
		assert!(RealmId::new("demo-realm ").is_err(), "Trailing whitespace must be rejected.");
		assert_eq!(
			DocumentId::new("a/b").expect_err("Separators must be rejected."),
			IdentifierError::ContainsSeparator { kind: "Document" },
		);

		let realm = RealmId::new("demo-realm").expect("Realm fixture should be considered valid.");

		assert_eq!(realm.as_ref(), "demo-realm");
		assert!(RealmId::new("").is_err());
	}

	#[test]
	fn serde_round_trip_enforces_validation() {
		let realm: RealmId =
			serde_json::from_str("\"realm-42\"").expect("Realm should deserialize successfully.");

		assert_eq!(realm.as_ref(), "realm-42");
		assert!(serde_json::from_str::<RealmId>("\"with space\"").is_err());
	}

	#[test]
	fn unicode_whitespace_and_length_limits() {
		let nbsp = format!("realm{}id", '\u{00A0}');

		assert!(RealmId::new(&nbsp).is_err());

		let exact = "a".repeat(IDENTIFIER_MAX_LEN);

		RealmId::new(&exact).expect("Exact length should succeed.");

		let too_long = "a".repeat(IDENTIFIER_MAX_LEN + 1);

		assert!(RealmId::new(&too_long).is_err());
	}

	#[test]
	fn random_document_ids_are_valid_and_distinct() {
		let first = DocumentId::random();
		let second = DocumentId::random();

		assert_eq!(first.len(), DOCUMENT_ID_LEN);
		assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
		assert!(DocumentId::new(first.as_ref()).is_ok());
		assert_ne!(first, second);
	}
}

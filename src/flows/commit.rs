//! Atomic, create-only document commits.
//!
//! [`Broker::write_document`] sends one commit holding two ordered writes against a freshly
//! named document: an `update` guarded by `currentDocument.exists = false`, followed by a
//! `transform` that stamps the creation field with the store's own request time. The store
//! applies both or neither, so a failed call never leaves a half-written document behind.

// std
use std::borrow::Cow;
// crates.io
use oauth2::http::{
	Method, Request,
	header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
};
use serde::ser::{Error as _, SerializeMap, Serializer};
use time::{UtcOffset, format_description::well_known::Rfc3339};
// self
use crate::{
	_prelude::*,
	auth::{DocumentId, IdentifierError, ScopeSet, validate_view},
	error::{ConfigError, WriteError},
	flows::{Broker, BrokerOptions},
	http::HttpTransport,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	transport::{self, TransportErrorMapper},
};

/// Longest text, in characters, transmitted by a single write.
pub const MAX_TEXT_CHARS: usize = 10_000;
/// Notice shown to end users when [`Broker::persist_or_notice`] cannot save a message.
pub const PERSIST_FAILURE_NOTICE: &str =
	"Sorry, something went wrong while saving this reply. Please try again in a moment.";

const KIND: FlowKind = FlowKind::DocumentCommit;
const SEGMENT_KIND: &str = "Path segment";
const SERVER_REQUEST_TIME: &str = "REQUEST_TIME";

/// Errors raised while building a collection path.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum PathError {
	/// The path named no segments.
	#[error("Collection path cannot be empty.")]
	Empty,
	/// A segment failed identifier validation.
	#[error(transparent)]
	Segment(#[from] IdentifierError),
	/// Collection paths alternate collection/document segments and end on a collection.
	#[error("Collection path has {len} segments; an odd count is required.")]
	NotACollection {
		/// Number of segments supplied.
		len: usize,
	},
}

/// Ordered collection path under which new documents are created, e.g. `users/u1/sessions`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentPath(Vec<String>);
impl DocumentPath {
	/// Validates the segments of a collection path.
	pub fn new<I, S>(segments: I) -> Result<Self, PathError>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let segments = segments.into_iter().map(Into::into).collect::<Vec<String>>();

		if segments.is_empty() {
			return Err(PathError::Empty);
		}
		if segments.len() % 2 == 0 {
			return Err(PathError::NotACollection { len: segments.len() });
		}

		for segment in &segments {
			validate_view(SEGMENT_KIND, segment)?;
		}

		Ok(Self(segments))
	}

	/// `users/{user}/sessions/{session}/messages`, where chat replies are stored.
	pub fn messages(user: &str, session: &str) -> Result<Self, PathError> {
		Self::new(["users", user, "sessions", session, "messages"])
	}

	/// Iterator over the path segments.
	pub fn segments(&self) -> impl Iterator<Item = &str> {
		self.0.iter().map(String::as_str)
	}
}
impl Display for DocumentPath {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0.join("/"))
	}
}
impl FromStr for DocumentPath {
	type Err = PathError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s.trim_matches('/').split('/').filter(|segment| !segment.is_empty()))
	}
}

/// Typed document value in the store's JSON encoding.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
	/// `null`.
	Null,
	/// Boolean.
	Boolean(bool),
	/// 64-bit integer, transmitted as a decimal string.
	Integer(i64),
	/// IEEE-754 double; NaN and infinities are sent as `"NaN"`, `"Infinity"` and `"-Infinity"`.
	Double(f64),
	/// UTF-8 string.
	String(String),
	/// Instant, transmitted as RFC 3339 in UTC.
	Timestamp(OffsetDateTime),
	/// Ordered list of values.
	Array(Vec<FieldValue>),
	/// Nested fields.
	Map(BTreeMap<String, FieldValue>),
}
impl Serialize for FieldValue {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		#[derive(Serialize)]
		struct ArrayValue<'a> {
			values: &'a [FieldValue],
		}
		#[derive(Serialize)]
		struct MapValue<'a> {
			fields: &'a BTreeMap<String, FieldValue>,
		}

		let mut map = serializer.serialize_map(Some(1))?;

		match self {
			Self::Null => map.serialize_entry("nullValue", &())?,
			Self::Boolean(value) => map.serialize_entry("booleanValue", value)?,
			Self::Integer(value) => map.serialize_entry("integerValue", &value.to_string())?,
			Self::Double(value) if value.is_finite() => map.serialize_entry("doubleValue", value)?,
			Self::Double(value) => {
				let special = if value.is_nan() {
					"NaN"
				} else if value.is_sign_positive() {
					"Infinity"
				} else {
					"-Infinity"
				};

				map.serialize_entry("doubleValue", special)?
			},
			Self::String(value) => map.serialize_entry("stringValue", value)?,
			Self::Timestamp(value) => {
				let formatted =
					value.to_offset(UtcOffset::UTC).format(&Rfc3339).map_err(S::Error::custom)?;

				map.serialize_entry("timestampValue", &formatted)?
			},
			Self::Array(values) => map.serialize_entry("arrayValue", &ArrayValue { values })?,
			Self::Map(fields) => map.serialize_entry("mapValue", &MapValue { fields })?,
		}

		map.end()
	}
}
impl From<bool> for FieldValue {
	fn from(value: bool) -> Self {
		Self::Boolean(value)
	}
}
impl From<i64> for FieldValue {
	fn from(value: i64) -> Self {
		Self::Integer(value)
	}
}
impl From<i32> for FieldValue {
	fn from(value: i32) -> Self {
		Self::Integer(value.into())
	}
}
impl From<f64> for FieldValue {
	fn from(value: f64) -> Self {
		Self::Double(value)
	}
}
impl From<&str> for FieldValue {
	fn from(value: &str) -> Self {
		Self::String(value.to_owned())
	}
}
impl From<String> for FieldValue {
	fn from(value: String) -> Self {
		Self::String(value)
	}
}
impl From<OffsetDateTime> for FieldValue {
	fn from(value: OffsetDateTime) -> Self {
		Self::Timestamp(value)
	}
}
impl From<Vec<FieldValue>> for FieldValue {
	fn from(values: Vec<FieldValue>) -> Self {
		Self::Array(values)
	}
}
impl From<BTreeMap<String, FieldValue>> for FieldValue {
	fn from(fields: BTreeMap<String, FieldValue>) -> Self {
		Self::Map(fields)
	}
}

/// One document to create: a collection path, its text, and extra typed fields.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentWriteRequest {
	path: DocumentPath,
	text: String,
	fields: BTreeMap<String, FieldValue>,
}
impl DocumentWriteRequest {
	/// Creates a request for `text` under the collection `path`.
	pub fn new(path: DocumentPath, text: impl Into<String>) -> Self {
		Self { path, text: text.into(), fields: BTreeMap::new() }
	}

	/// Adds a typed field. The text and creation-time fields are owned by the broker and win
	/// over fields of the same name.
	pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
		self.fields.insert(name.into(), value.into());

		self
	}

	/// Collection path.
	pub fn path(&self) -> &DocumentPath {
		&self.path
	}

	/// Text as supplied, before truncation.
	pub fn text(&self) -> &str {
		&self.text
	}

	/// Extra typed fields.
	pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
		&self.fields
	}
}

/// Fully qualified name of a written document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentName {
	name: String,
	id: DocumentId,
}
impl DocumentName {
	fn new(database_path: &str, path: &DocumentPath, id: DocumentId) -> Self {
		Self { name: format!("{database_path}/documents/{path}/{id}"), id }
	}

	/// `projects/{realm}/databases/{database}/documents/{path}/{id}`.
	pub fn as_str(&self) -> &str {
		&self.name
	}

	/// Generated leaf identifier.
	pub fn id(&self) -> &DocumentId {
		&self.id
	}
}
impl AsRef<str> for DocumentName {
	fn as_ref(&self) -> &str {
		&self.name
	}
}
impl Display for DocumentName {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.name)
	}
}

#[derive(Serialize)]
struct CommitBody<'a> {
	writes: [Write<'a>; 2],
}

#[derive(Serialize)]
#[serde(untagged)]
enum Write<'a> {
	Update {
		update: Document<'a>,
		#[serde(rename = "currentDocument")]
		current_document: Precondition,
	},
	Transform {
		transform: DocumentTransform<'a>,
	},
}

#[derive(Serialize)]
struct Document<'a> {
	name: &'a str,
	fields: BTreeMap<String, FieldValue>,
}

#[derive(Serialize)]
struct Precondition {
	exists: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentTransform<'a> {
	document: &'a str,
	field_transforms: [FieldTransform<'a>; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FieldTransform<'a> {
	field_path: Cow<'a, str>,
	set_to_server_value: &'static str,
}

impl<C, M> Broker<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a new document under `request.path()` in one atomic, create-only commit.
	///
	/// The text is cut to [`MAX_TEXT_CHARS`] characters. A 409/412 reply surfaces as
	/// [`WriteError::AlreadyExists`]; the broker never retries a collision under a new id.
	pub async fn write_document(&self, request: DocumentWriteRequest) -> Result<DocumentName> {
		let span = FlowSpan::new(KIND, "write_document");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span
			.instrument(async move {
				let identity = self.credentials.load().await?;
				let realm = identity.realm_id();
				let url = self.endpoints.commit_url(realm).map_err(ConfigError::from)?;
				let name = DocumentName::new(
					&self.endpoints.database_path(realm),
					request.path(),
					DocumentId::random(),
				);
				let body = encode_commit(&name, request, &self.options)?;
				let token = self.get_token(&ScopeSet::datastore()).await?;
				let reply = transport::send(
					self.http_client.as_ref(),
					self.transport_mapper.as_ref(),
					KIND,
					self.options.commit_timeout,
					&self.options.retry,
					|| {
						Request::builder()
							.method(Method::POST)
							.uri(url.as_str())
							.header(AUTHORIZATION, token.bearer_header())
							.header(CONTENT_TYPE, "application/json")
							.header(ACCEPT, "application/json")
							.body(body.clone())
							.map_err(ConfigError::from)
					},
				)
				.await?;

				if reply.is_success() {
					return Ok(name);
				}
				if matches!(reply.status, 409 | 412) {
					return Err(WriteError::AlreadyExists {
						document: name.to_string(),
						status: reply.status,
						body: reply.body_text(),
					}
					.into());
				}

				Err(reply.into_rejection(KIND))
			})
			.await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(e) => {
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);
				obs::log_failure(KIND, "write_document", e);
			},
		}

		result
	}

	/// Stores an assistant reply under `users/{user}/sessions/{session}/messages`.
	pub async fn persist_assistant_message(
		&self,
		user: &str,
		session: &str,
		text: &str,
	) -> Result<DocumentName> {
		let path = DocumentPath::messages(user, session).map_err(ConfigError::from)?;

		self.write_document(DocumentWriteRequest::new(path, text).with_field("role", "assistant"))
			.await
	}

	/// Like [`persist_assistant_message`](Self::persist_assistant_message), but the failure side
	/// carries only [`PERSIST_FAILURE_NOTICE`], safe to show an end user.
	///
	/// The underlying error is logged through the `tracing` feature before it is discarded.
	pub async fn persist_or_notice(
		&self,
		user: &str,
		session: &str,
		text: &str,
	) -> Result<DocumentName, &'static str> {
		self.persist_assistant_message(user, session, text).await.map_err(|e| {
			obs::log_failure(KIND, "persist_or_notice", &e);

			PERSIST_FAILURE_NOTICE
		})
	}
}

/// Returns the longest prefix of `text` holding at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> &str {
	match text.char_indices().nth(max) {
		Some((end, _)) => &text[..end],
		None => text,
	}
}

/// Renders a top-level field name as a field path, backtick-quoting names that are not simple
/// identifiers so dots and other separators stay part of the name.
fn quote_field_path(name: &str) -> Cow<'_, str> {
	let mut chars = name.chars();
	let simple = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
		&& chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

	if simple {
		return Cow::Borrowed(name);
	}

	let mut quoted = String::with_capacity(name.len() + 2);

	quoted.push('`');

	for c in name.chars() {
		if matches!(c, '`' | '\\') {
			quoted.push('\\');
		}

		quoted.push(c);
	}

	quoted.push('`');

	Cow::Owned(quoted)
}

fn encode_commit(
	name: &DocumentName,
	request: DocumentWriteRequest,
	options: &BrokerOptions,
) -> Result<Vec<u8>, WriteError> {
	let DocumentWriteRequest { text, mut fields, .. } = request;

	fields.remove(&options.created_at_field);
	fields.insert(
		options.text_field.clone(),
		FieldValue::String(truncate_chars(&text, MAX_TEXT_CHARS).to_owned()),
	);

	let body = CommitBody {
		writes: [
			Write::Update {
				update: Document { name: name.as_str(), fields },
				current_document: Precondition { exists: false },
			},
			Write::Transform {
				transform: DocumentTransform {
					document: name.as_str(),
					field_transforms: [FieldTransform {
						field_path: quote_field_path(&options.created_at_field),
						set_to_server_value: SERVER_REQUEST_TIME,
					}],
				},
			},
		],
	};

	serde_json::to_vec(&body).map_err(|e| WriteError::Encoding { source: Arc::new(e) })
}

use crate::api::ApiError;
use crate::utils::current_time_millis;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier of a user account
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl From<&str> for UserId {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Opaque server-issued cursor. Only equality and presence are meaningful on the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl From<&str> for EventId {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

impl From<String> for EventId {
	fn from(value: String) -> Self {
		Self(value)
	}
}

impl fmt::Display for EventId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// One independent synchronization stream: a user and an event scope.
///
/// Scopes are written `kind` or `kind:qualifier`, e.g. `core` or `calendar:4f2a`. Handlers
/// register per kind; the qualifier selects the concrete remote stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventManagerConfig {
	pub user_id: UserId,
	pub scope_id: String,
}

impl EventManagerConfig {
	pub fn new(user_id: UserId, scope_id: impl Into<String>) -> Self {
		Self {
			user_id,
			scope_id: scope_id.into(),
		}
	}

	/// The core account stream of a user.
	pub fn core(user_id: UserId) -> Self {
		Self::new(user_id, "core")
	}

	pub fn kind(&self) -> &str {
		self.scope_id
			.split_once(':')
			.map_or(self.scope_id.as_str(), |(kind, _)| kind)
	}

	pub fn qualifier(&self) -> Option<&str> {
		self.scope_id
			.split_once(':')
			.map(|(_, qualifier)| qualifier)
			.filter(|q| !q.is_empty())
	}
}

impl fmt::Display for EventManagerConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.user_id, self.scope_id)
	}
}

/// Lifecycle state of a stream, persisted with its metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
	Idle,
	Fetching,
	Applying,
	Backoff,
	Resync,
	Cancelled,
}

/// Kind of change carried by a [`RawEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
	Delete,
	Create,
	Update,
	Partial,
}

impl Action {
	/// Map the server action code.
	pub fn from_code(code: u64) -> Option<Self> {
		match code {
			0 => Some(Action::Delete),
			1 => Some(Action::Create),
			2 => Some(Action::Update),
			3 => Some(Action::Partial),
			_ => None,
		}
	}
}

/// An entity-typed change record destined for the handlers of its `entity_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
	pub entity_type: String,
	pub action: Action,
	pub key: String,
	pub payload: serde_json::Value,
}

/// One fetched batch plus the cursor to continue from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsResponse {
	pub events: Vec<RawEvent>,
	pub next_event_id: EventId,
	/// The server holds further batches after this one.
	pub more: bool,
	/// The server asks for all local state of this stream to be discarded and reloaded.
	#[serde(default)]
	pub refresh: bool,
}

/// Sync state of one stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
	pub config: EventManagerConfig,
	/// Cursor already applied; `None` means never synced.
	pub current_event_id: Option<EventId>,
	/// Cursor of a cached batch that has not been applied yet.
	pub next_event_id: Option<EventId>,
	pub state: State,
	pub retry_count: u32,
	pub created_at_millis: i64,
	pub last_used_at_millis: i64,
}

impl EventMetadata {
	/// Fresh metadata for a stream that has never been synced.
	pub fn new(config: EventManagerConfig) -> Self {
		let now = current_time_millis();
		Self {
			config,
			current_event_id: None,
			next_event_id: None,
			state: State::Idle,
			retry_count: 0,
			created_at_millis: now,
			last_used_at_millis: now,
		}
	}
}

/// Persistence failures
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("Serialization error: {0}")]
	SerializationError(#[from] serde_json::Error),

	#[error("No metadata for {0}")]
	NotFound(EventManagerConfig),

	#[error("Cursor conflict for {config}: expected {expected:?}, found {actual:?}")]
	Conflict {
		config: EventManagerConfig,
		expected: Option<EventId>,
		actual: Option<EventId>,
	},
}

/// Classified failure of a remote fetch
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
	#[error("Transient transport error: {0}")]
	Transient(String),

	#[error("Fetch timed out after {0:?}")]
	Timeout(Duration),

	#[error("Unauthorized: {0}")]
	Unauthorized(String),

	#[error("Cursor no longer valid: {0}")]
	CursorInvalid(String),

	#[error("Stream cannot be fetched: {0}")]
	InvalidConfig(String),
}

impl FetchError {
	pub fn is_transient(&self) -> bool {
		matches!(self, FetchError::Transient(_) | FetchError::Timeout(_))
	}
}

impl From<ApiError> for FetchError {
	fn from(error: ApiError) -> Self {
		if let ApiError::UnknownEndpoint(_) = error {
			FetchError::InvalidConfig(error.to_string())
		} else if error.is_unauthorized() {
			FetchError::Unauthorized(error.to_string())
		} else if error.is_retryable() {
			FetchError::Transient(error.to_string())
		} else {
			// Anything the server refuses for good, including undecodable documents, means the
			// cursor cannot be continued from.
			FetchError::CursorInvalid(error.to_string())
		}
	}
}

/// Failure while applying a batch to local state
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
	#[error("Handler {handler} failed: {message}")]
	Handler {
		handler: &'static str,
		message: String,
	},

	#[error("Transaction failed: {0}")]
	Transaction(String),
}

/// Fatal and programmer errors; never retried
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum EventManagerError {
	#[error("Repository error: {0}")]
	RepositoryError(#[from] RepositoryError),

	#[error("Invalid config {0}: {1}")]
	InvalidConfig(EventManagerConfig, String),

	#[error("No event handler registered for scope {0}")]
	MissingHandler(String),

	#[error("Configuration error: {0}")]
	ConfigError(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scope_kind_and_qualifier() {
		let core = EventManagerConfig::core(UserId::from("u1"));
		assert_eq!(core.kind(), "core");
		assert_eq!(core.qualifier(), None);

		let calendar = EventManagerConfig::new(UserId::from("u1"), "calendar:cal-1");
		assert_eq!(calendar.kind(), "calendar");
		assert_eq!(calendar.qualifier(), Some("cal-1"));
		assert_eq!(calendar.to_string(), "u1/calendar:cal-1");
	}

	#[test]
	fn api_errors_are_classified() {
		let unauthorized = FetchError::from(ApiError::StatusError {
			status: 401,
			code: None,
			message: "expired".into(),
		});
		assert!(matches!(unauthorized, FetchError::Unauthorized(_)));

		let transient = FetchError::from(ApiError::StatusError {
			status: 503,
			code: None,
			message: "unavailable".into(),
		});
		assert!(transient.is_transient());

		let invalid = FetchError::from(ApiError::StatusError {
			status: 422,
			code: Some(2501),
			message: "invalid id".into(),
		});
		assert!(matches!(invalid, FetchError::CursorInvalid(_)));

		let malformed = FetchError::from(ApiError::MalformedResponse("missing EventID".into()));
		assert!(matches!(malformed, FetchError::CursorInvalid(_)));
	}

	#[test]
	fn unknown_action_codes_are_rejected() {
		assert_eq!(Action::from_code(0), Some(Action::Delete));
		assert_eq!(Action::from_code(3), Some(Action::Partial));
		assert_eq!(Action::from_code(4), None);
	}
}

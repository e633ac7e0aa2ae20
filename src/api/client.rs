//!
//! HTTP client for the remote event endpoints.
//!
//! This module provides an async client for the event API. It resolves the endpoint of a stream
//! from its scope, signs every request with the user's session, and decodes the events document
//! into an ordered [`EventsResponse`]. All methods are async and designed for use with Tokio.

use super::types::*;
use crate::event_manager::sync::fetcher::EventTransport;
use crate::event_manager::{Action, EventId, EventManagerConfig, EventsResponse, RawEvent, UserId};

use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Top-level keys of the events document that are not entity collections.
const RESERVED_KEYS: &[&str] = &["Code", "EventID", "More", "Refresh", "Notices"];

/// Configuration for the event API client
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
	/// Base URL of the API, without trailing slash.
	pub base_url: String,
	/// Per-request timeout enforced by the HTTP client.
	pub timeout_secs: u64,
	/// Endpoint template per scope kind. `{id}` is replaced by the scope qualifier.
	pub endpoints: HashMap<String, String>,
}

impl Default for ApiConfig {
	fn default() -> Self {
		let endpoints = [
			("core", "core/v4/events"),
			("calendar", "calendar/v1/{id}/modelevents"),
			("drive", "drive/shares/{id}/events"),
		]
		.into_iter()
		.map(|(kind, path)| (kind.to_string(), path.to_string()))
		.collect();

		Self {
			base_url: "https://localhost/api".to_string(),
			timeout_secs: 30,
			endpoints,
		}
	}
}

impl ApiConfig {
	/// Resolve the endpoint path serving the given stream.
	pub fn endpoint_for(&self, config: &EventManagerConfig) -> Result<String, ApiError> {
		let template = self
			.endpoints
			.get(config.kind())
			.ok_or_else(|| ApiError::UnknownEndpoint(config.scope_id.clone()))?;

		if template.contains("{id}") {
			let qualifier = config
				.qualifier()
				.ok_or_else(|| ApiError::UnknownEndpoint(config.scope_id.clone()))?;
			Ok(template.replace("{id}", qualifier))
		} else {
			Ok(template.clone())
		}
	}
}

/// Event API client
#[derive(Clone)]
pub struct ApiClient {
	/// The underlying HTTP client.
	http_client: Client,
	config: ApiConfig,
	sessions: Arc<dyn SessionProvider>,
}

impl ApiClient {
	/// Create a new API client.
	///
	/// # Arguments
	/// * `config` - Base URL, timeout and endpoint templates.
	/// * `sessions` - Provider of the per-user sessions used to sign requests.
	pub fn new(config: ApiConfig, sessions: Arc<dyn SessionProvider>) -> Result<Self, ApiError> {
		let http_client = Client::builder()
			.timeout(Duration::from_secs(config.timeout_secs))
			.build()?;

		Ok(Self {
			http_client,
			config,
			sessions,
		})
	}

	/// Perform an authenticated GET and return the body of a successful response.
	async fn get(&self, user_id: &UserId, path: &str) -> Result<String, ApiError> {
		let session = self
			.sessions
			.session(user_id)
			.await
			.ok_or_else(|| ApiError::NoSession(user_id.to_string()))?;

		let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
		debug!("GET {}", url);

		let response = self
			.http_client
			.get(&url)
			.header("x-pm-uid", &session.uid)
			.bearer_auth(&session.access_token)
			.send()
			.await?;

		let status = response.status();
		let body = response.text().await?;

		if !status.is_success() {
			let parsed = serde_json::from_str::<ApiErrorBody>(&body).ok();
			return Err(ApiError::StatusError {
				status: status.as_u16(),
				code: parsed.as_ref().map(|b| b.code),
				message: parsed
					.and_then(|b| b.error)
					.unwrap_or_else(|| status.to_string()),
			});
		}

		Ok(body)
	}
}

#[async_trait::async_trait]
impl EventTransport for ApiClient {
	async fn latest_event_id(&self, config: &EventManagerConfig) -> Result<EventId, ApiError> {
		let endpoint = self.config.endpoint_for(config)?;
		let body = self
			.get(&config.user_id, &format!("{}/latest", endpoint))
			.await?;

		let response: LatestEventIdResponse = serde_json::from_str(&body)?;
		if let Some(code) = response.code.filter(|c| *c != RESPONSE_CODE_OK) {
			return Err(ApiError::MalformedResponse(format!(
				"unexpected response code {}",
				code
			)));
		}

		Ok(EventId::from(response.event_id))
	}

	async fn events(
		&self,
		config: &EventManagerConfig,
		since: &EventId,
	) -> Result<EventsResponse, ApiError> {
		let endpoint = self.config.endpoint_for(config)?;
		let body = self
			.get(&config.user_id, &format!("{}/{}", endpoint, since))
			.await?;

		parse_events_response(&body)
	}

	fn supports(&self, config: &EventManagerConfig) -> bool {
		self.config.endpoint_for(config).is_ok()
	}
}

/// Decode an events document into an ordered batch.
///
/// Every non-reserved top-level array becomes one [`RawEvent`] per item, tagged with the array
/// name. Singleton objects and scalars become `Update` events. Items with an unknown action code
/// are skipped so newer servers can add actions without breaking older clients.
pub fn parse_events_response(body: &str) -> Result<EventsResponse, ApiError> {
	let document: Map<String, Value> = serde_json::from_str(body)?;

	let next_event_id = document
		.get("EventID")
		.and_then(Value::as_str)
		.ok_or_else(|| ApiError::MalformedResponse("missing EventID".to_string()))?;

	let mut events = Vec::new();
	for (entity_type, value) in &document {
		if RESERVED_KEYS.contains(&entity_type.as_str()) {
			continue;
		}

		match value {
			Value::Array(items) => {
				for item in items {
					let key = item
						.get("ID")
						.and_then(Value::as_str)
						.unwrap_or_default()
						.to_string();

					let Some(action) = item
						.get("Action")
						.and_then(Value::as_u64)
						.and_then(Action::from_code)
					else {
						warn!(
							"Skipping {} event {} with unknown action: {:?}",
							entity_type,
							key,
							item.get("Action")
						);
						continue;
					};

					events.push(RawEvent {
						entity_type: entity_type.clone(),
						action,
						key,
						payload: item.clone(),
					});
				}
			}
			other => events.push(RawEvent {
				entity_type: entity_type.clone(),
				action: Action::Update,
				key: other
					.get("ID")
					.and_then(Value::as_str)
					.unwrap_or_default()
					.to_string(),
				payload: other.clone(),
			}),
		}
	}

	Ok(EventsResponse {
		events,
		next_event_id: EventId::from(next_event_id),
		more: flag(document.get("More")),
		refresh: flag(document.get("Refresh")),
	})
}

/// The API encodes booleans as 0/1; accept real booleans too.
fn flag(value: Option<&Value>) -> bool {
	match value {
		Some(Value::Bool(b)) => *b,
		Some(v) => v.as_u64().is_some_and(|n| n != 0),
		None => false,
	}
}

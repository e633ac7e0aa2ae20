use crate::api::ApiError;
use crate::event_manager::{EventId, EventManagerConfig, EventsResponse, FetchError};

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Remote collaborator serving the event endpoints of a stream.
#[async_trait::async_trait]
pub trait EventTransport: Send + Sync {
	/// Current head cursor of the stream, used to bootstrap a stream that was never synced.
	async fn latest_event_id(&self, config: &EventManagerConfig) -> Result<EventId, ApiError>;

	/// One page of events following `since`.
	async fn events(
		&self,
		config: &EventManagerConfig,
		since: &EventId,
	) -> Result<EventsResponse, ApiError>;

	/// Whether this transport knows how to reach the stream at all.
	fn supports(&self, _config: &EventManagerConfig) -> bool {
		true
	}
}

/// Result of one fetch round trip
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
	/// Nothing new since the given cursor.
	UpToDate,
	/// A batch to cache and apply.
	Batch(EventsResponse),
}

/// Trait for fetching the next batch of a stream
#[async_trait::async_trait]
pub trait EventFetcher: Send + Sync {
	/// Fetch what changed since `since`; `None` bootstraps from the server's latest cursor.
	async fn fetch(
		&self,
		config: &EventManagerConfig,
		since: Option<&EventId>,
	) -> Result<FetchResult, FetchError>;

	/// Whether the stream can be fetched; unsupported streams are rejected at enqueue time.
	fn supports(&self, _config: &EventManagerConfig) -> bool {
		true
	}

	/// Get the name of this fetcher
	fn name(&self) -> &'static str;
}

/// Configuration for remote fetches
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
	/// Upper bound for every remote call; exceeding it counts as a transient failure.
	pub timeout_secs: u64,
}

impl FetcherConfig {
	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}
}

impl Default for FetcherConfig {
	fn default() -> Self {
		Self { timeout_secs: 30 }
	}
}

/// Fetcher backed by an [`EventTransport`]
pub struct RemoteEventFetcher<T> {
	transport: T,
	config: FetcherConfig,
}

impl<T: EventTransport> RemoteEventFetcher<T> {
	pub fn new(transport: T, config: FetcherConfig) -> Self {
		Self { transport, config }
	}

	async fn with_timeout<R>(
		&self,
		call: impl Future<Output = Result<R, ApiError>>,
	) -> Result<R, FetchError> {
		let timeout = self.config.timeout();
		match tokio::time::timeout(timeout, call).await {
			Ok(result) => result.map_err(FetchError::from),
			Err(_) => Err(FetchError::Timeout(timeout)),
		}
	}
}

#[async_trait::async_trait]
impl<T: EventTransport> EventFetcher for RemoteEventFetcher<T> {
	async fn fetch(
		&self,
		config: &EventManagerConfig,
		since: Option<&EventId>,
	) -> Result<FetchResult, FetchError> {
		let (since, bootstrap) = match since {
			Some(event_id) => (event_id.clone(), false),
			None => {
				let latest = self
					.with_timeout(self.transport.latest_event_id(config))
					.await?;
				info!("Bootstrapping {} from latest event {}", config, latest);
				(latest, true)
			}
		};

		let response = self
			.with_timeout(self.transport.events(config, &since))
			.await?;

		debug!(
			"Fetched {} events for {} since {} (next: {}, more: {}, refresh: {})",
			response.events.len(),
			config,
			since,
			response.next_event_id,
			response.more,
			response.refresh
		);

		// A bootstrap always yields a batch so the baseline cursor gets committed.
		if !bootstrap
			&& response.events.is_empty()
			&& !response.more
			&& !response.refresh
			&& response.next_event_id == since
		{
			return Ok(FetchResult::UpToDate);
		}

		Ok(FetchResult::Batch(response))
	}

	fn supports(&self, config: &EventManagerConfig) -> bool {
		self.transport.supports(config)
	}

	fn name(&self) -> &'static str {
		"RemoteEventFetcher"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event_manager::{Action, RawEvent, UserId};
	use std::sync::Mutex;

	#[derive(Default)]
	struct ScriptedTransport {
		latest: Mutex<Vec<Result<EventId, ApiError>>>,
		pages: Mutex<Vec<Result<EventsResponse, ApiError>>>,
		requested: Mutex<Vec<EventId>>,
		delay: Option<Duration>,
	}

	#[async_trait::async_trait]
	impl EventTransport for ScriptedTransport {
		async fn latest_event_id(&self, _: &EventManagerConfig) -> Result<EventId, ApiError> {
			self.latest.lock().unwrap().remove(0)
		}

		async fn events(
			&self,
			_: &EventManagerConfig,
			since: &EventId,
		) -> Result<EventsResponse, ApiError> {
			if let Some(delay) = self.delay {
				tokio::time::sleep(delay).await;
			}
			self.requested.lock().unwrap().push(since.clone());
			self.pages.lock().unwrap().remove(0)
		}
	}

	fn page(next: &str, events: usize) -> EventsResponse {
		EventsResponse {
			events: (0..events)
				.map(|i| RawEvent {
					entity_type: "Contacts".into(),
					action: Action::Update,
					key: format!("c{}", i),
					payload: serde_json::Value::Null,
				})
				.collect(),
			next_event_id: EventId::from(next),
			more: false,
			refresh: false,
		}
	}

	fn config() -> EventManagerConfig {
		EventManagerConfig::core(UserId::from("u1"))
	}

	#[tokio::test]
	async fn bootstrap_fetches_latest_cursor_first() {
		let transport = ScriptedTransport::default();
		transport.latest.lock().unwrap().push(Ok(EventId::from("e5")));
		transport.pages.lock().unwrap().push(Ok(page("e5", 0)));
		let fetcher = RemoteEventFetcher::new(transport, FetcherConfig::default());

		let result = fetcher.fetch(&config(), None).await.unwrap();

		assert_eq!(result, FetchResult::Batch(page("e5", 0)));
		assert_eq!(
			*fetcher.transport.requested.lock().unwrap(),
			vec![EventId::from("e5")]
		);
	}

	#[tokio::test]
	async fn unchanged_cursor_is_up_to_date() {
		let transport = ScriptedTransport::default();
		transport.pages.lock().unwrap().push(Ok(page("e1", 0)));
		let fetcher = RemoteEventFetcher::new(transport, FetcherConfig::default());

		let result = fetcher
			.fetch(&config(), Some(&EventId::from("e1")))
			.await
			.unwrap();

		assert_eq!(result, FetchResult::UpToDate);
	}

	#[tokio::test]
	async fn new_events_are_returned_as_batch() {
		let transport = ScriptedTransport::default();
		transport.pages.lock().unwrap().push(Ok(page("e2", 2)));
		let fetcher = RemoteEventFetcher::new(transport, FetcherConfig::default());

		let result = fetcher
			.fetch(&config(), Some(&EventId::from("e1")))
			.await
			.unwrap();

		assert_eq!(result, FetchResult::Batch(page("e2", 2)));
	}

	#[tokio::test]
	async fn server_rejection_invalidates_cursor() {
		let transport = ScriptedTransport::default();
		transport
			.pages
			.lock()
			.unwrap()
			.push(Err(ApiError::StatusError {
				status: 422,
				code: Some(2501),
				message: "invalid event id".into(),
			}));
		let fetcher = RemoteEventFetcher::new(transport, FetcherConfig::default());

		let err = fetcher
			.fetch(&config(), Some(&EventId::from("stale")))
			.await
			.unwrap_err();

		assert!(matches!(err, FetchError::CursorInvalid(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn slow_transport_times_out_as_transient() {
		let transport = ScriptedTransport {
			delay: Some(Duration::from_secs(120)),
			..Default::default()
		};
		transport.pages.lock().unwrap().push(Ok(page("e2", 1)));
		let fetcher = RemoteEventFetcher::new(transport, FetcherConfig { timeout_secs: 5 });

		let err = fetcher
			.fetch(&config(), Some(&EventId::from("e1")))
			.await
			.unwrap_err();

		assert!(matches!(err, FetchError::Timeout(d) if d == Duration::from_secs(5)));
		assert!(err.is_transient());
	}
}

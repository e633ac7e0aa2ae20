#![allow(dead_code)]

use event_sync::api::ApiError;
use event_sync::event_manager::sync::{
	BatchTransaction, EventApplier, EventHandler, EventManager, EventManagerSettings,
	EventMetadataRepository, EventTransport, FetcherConfig, RemoteEventFetcher,
};
use event_sync::event_manager::{
	Action, ApplyError, EventId, EventManagerConfig, EventsResponse, RawEvent, UserId,
};

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct ServerState {
	events: Vec<RawEvent>,
	/// Cursors below this position are no longer served.
	horizon: usize,
	page_size: usize,
	failures: VecDeque<ApiError>,
	latest_calls: usize,
	event_calls: usize,
}

/// In-process event server. Cursor `e{n}` stands for "the first n events applied".
#[derive(Clone)]
pub struct FakeServer {
	state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
	pub fn new(page_size: usize) -> Self {
		Self {
			state: Arc::new(Mutex::new(ServerState {
				page_size,
				..Default::default()
			})),
		}
	}

	pub fn cursor(n: usize) -> EventId {
		EventId(format!("e{}", n))
	}

	pub fn publish(&self, entity_type: &str, action: Action, key: &str, value: i64) {
		self.state.lock().unwrap().events.push(RawEvent {
			entity_type: entity_type.to_string(),
			action,
			key: key.to_string(),
			payload: serde_json::json!({ "ID": key, "Value": value }),
		});
	}

	/// Forget history up to the current head, invalidating every older cursor.
	pub fn expire_history(&self) {
		let mut state = self.state.lock().unwrap();
		state.horizon = state.events.len();
	}

	pub fn fail_next(&self, count: usize, status: u16) {
		let mut state = self.state.lock().unwrap();
		for _ in 0..count {
			state.failures.push_back(ApiError::StatusError {
				status,
				code: None,
				message: "injected".to_string(),
			});
		}
	}

	pub fn latest_calls(&self) -> usize {
		self.state.lock().unwrap().latest_calls
	}

	pub fn event_calls(&self) -> usize {
		self.state.lock().unwrap().event_calls
	}
}

pub fn position(event_id: &EventId) -> Option<usize> {
	event_id.0.strip_prefix('e')?.parse().ok()
}

#[async_trait::async_trait]
impl EventTransport for FakeServer {
	async fn latest_event_id(&self, _config: &EventManagerConfig) -> Result<EventId, ApiError> {
		let mut state = self.state.lock().unwrap();
		state.latest_calls += 1;
		if let Some(failure) = state.failures.pop_front() {
			return Err(failure);
		}
		Ok(FakeServer::cursor(state.events.len()))
	}

	async fn events(
		&self,
		_config: &EventManagerConfig,
		since: &EventId,
	) -> Result<EventsResponse, ApiError> {
		let mut state = self.state.lock().unwrap();
		state.event_calls += 1;
		if let Some(failure) = state.failures.pop_front() {
			return Err(failure);
		}

		let start = match position(since) {
			Some(n) if n >= state.horizon && n <= state.events.len() => n,
			_ => {
				return Err(ApiError::StatusError {
					status: 422,
					code: Some(2501),
					message: format!("unknown event id {}", since),
				});
			}
		};
		let end = (start + state.page_size).min(state.events.len());

		Ok(EventsResponse {
			events: state.events[start..end].to_vec(),
			next_event_id: FakeServer::cursor(end),
			more: end < state.events.len(),
			refresh: false,
		})
	}
}

#[derive(Default)]
struct HandlerState {
	store: BTreeMap<String, serde_json::Value>,
	/// Store as of the open transaction's start.
	snapshot: Option<BTreeMap<String, serde_json::Value>>,
	deliveries: Vec<String>,
	resets: usize,
	failures: usize,
}

/// Keyed store fed by the events of one entity type.
pub struct RecordingHandler {
	name: &'static str,
	entity_types: &'static [&'static str],
	order: u32,
	state: Mutex<HandlerState>,
}

impl RecordingHandler {
	pub fn new(name: &'static str, entity_types: &'static [&'static str], order: u32) -> Arc<Self> {
		Arc::new(Self {
			name,
			entity_types,
			order,
			state: Mutex::default(),
		})
	}

	pub fn fail_next(&self, count: usize) {
		self.state.lock().unwrap().failures = count;
	}

	pub fn store(&self) -> BTreeMap<String, serde_json::Value> {
		self.state.lock().unwrap().store.clone()
	}

	pub fn deliveries(&self) -> Vec<String> {
		self.state.lock().unwrap().deliveries.clone()
	}

	pub fn resets(&self) -> usize {
		self.state.lock().unwrap().resets
	}
}

#[async_trait::async_trait]
impl EventHandler for RecordingHandler {
	fn name(&self) -> &'static str {
		self.name
	}

	fn scope_kind(&self) -> &'static str {
		"core"
	}

	fn entity_types(&self) -> &[&'static str] {
		self.entity_types
	}

	fn order(&self) -> u32 {
		self.order
	}

	async fn apply(
		&self,
		_config: &EventManagerConfig,
		events: &[RawEvent],
	) -> Result<(), ApplyError> {
		let mut state = self.state.lock().unwrap();
		if state.failures > 0 {
			state.failures -= 1;
			return Err(ApplyError::Handler {
				handler: self.name,
				message: "injected".to_string(),
			});
		}
		for event in events {
			state.deliveries.push(event.key.clone());
			match event.action {
				Action::Delete => {
					state.store.remove(&event.key);
				}
				_ => {
					state.store.insert(event.key.clone(), event.payload.clone());
				}
			}
		}
		Ok(())
	}

	async fn on_reset_all(&self, _config: &EventManagerConfig) -> Result<(), ApplyError> {
		let mut state = self.state.lock().unwrap();
		state.store.clear();
		state.resets += 1;
		Ok(())
	}
}

/// Local database shared by the handlers: a failed batch leaves none of its writes behind.
struct LocalDatabase {
	handlers: Vec<Arc<RecordingHandler>>,
}

#[async_trait::async_trait]
impl BatchTransaction for LocalDatabase {
	async fn begin(&self, _config: &EventManagerConfig) -> Result<(), ApplyError> {
		for handler in &self.handlers {
			let mut state = handler.state.lock().unwrap();
			state.snapshot = Some(state.store.clone());
		}
		Ok(())
	}

	async fn commit(&self, _config: &EventManagerConfig) -> Result<(), ApplyError> {
		for handler in &self.handlers {
			handler.state.lock().unwrap().snapshot = None;
		}
		Ok(())
	}

	async fn rollback(&self, _config: &EventManagerConfig) -> Result<(), ApplyError> {
		for handler in &self.handlers {
			let mut state = handler.state.lock().unwrap();
			if let Some(snapshot) = state.snapshot.take() {
				state.store = snapshot;
			}
		}
		Ok(())
	}
}

pub fn core_config() -> EventManagerConfig {
	EventManagerConfig::core(UserId::from("user-1"))
}

pub fn manager(
	server: &FakeServer,
	repository: Arc<dyn EventMetadataRepository>,
	handlers: &[Arc<RecordingHandler>],
) -> Arc<EventManager> {
	let applier = handlers
		.iter()
		.fold(EventApplier::builder(), |builder, handler| {
			builder.register_shared(handler.clone())
		})
		.transaction(Arc::new(LocalDatabase {
			handlers: handlers.to_vec(),
		}))
		.build();

	Arc::new(EventManager::new(
		repository,
		Arc::new(RemoteEventFetcher::new(server.clone(), FetcherConfig::default())),
		Arc::new(applier),
		EventManagerSettings::default(),
	))
}

use event_sync::api::{ApiClient, ApiConfig, Session, StaticSessionProvider};
use event_sync::event_manager::sync::{
	AppState, EventApplier, EventHandler, EventManager, EventManagerSettings, EventWorkerManager,
	FetcherConfig, FileEventMetadataRepository, HostSignals, RemoteEventFetcher, WorkerConfig,
	WorkerEvent,
};
use event_sync::event_manager::{ApplyError, EventManagerConfig, RawEvent, UserId};

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Handler that only logs what it receives, one per scope kind
struct LoggingEventHandler {
	kind: &'static str,
	entity_types: &'static [&'static str],
}

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
	fn name(&self) -> &'static str {
		"LoggingEventHandler"
	}

	fn scope_kind(&self) -> &'static str {
		self.kind
	}

	fn entity_types(&self) -> &[&'static str] {
		self.entity_types
	}

	async fn apply(
		&self,
		config: &EventManagerConfig,
		events: &[RawEvent],
	) -> Result<(), ApplyError> {
		for event in events {
			info!(
				"{}: {:?} {} {}",
				config, event.action, event.entity_type, event.key
			);
			debug!("{}", event.payload);
		}
		Ok(())
	}

	async fn on_reset_all(&self, config: &EventManagerConfig) -> Result<(), ApplyError> {
		warn!("{}: all local state discarded", config);
		Ok(())
	}
}

/// Log worker events until the manager is gone; returns how many were seen.
async fn log_worker_events(mut events: broadcast::Receiver<WorkerEvent>) -> usize {
	let mut seen = 0;
	loop {
		let event = match events.recv().await {
			Ok(event) => event,
			Err(broadcast::error::RecvError::Lagged(skipped)) => {
				warn!("Skipped {} worker events", skipped);
				continue;
			}
			Err(broadcast::error::RecvError::Closed) => break,
		};
		seen += 1;
		match event {
			WorkerEvent::Completed { config, stats } => info!("{}: {}", config, stats.summary()),
			WorkerEvent::SyncDelayed {
				config,
				retry_count,
				delay,
			} => warn!(
				"{}: sync delayed by {:?} after {} failures",
				config, delay, retry_count
			),
			WorkerEvent::Failed { config, error } => error!("{}: {}", config, error),
			other => debug!("{:?}", other),
		}
	}
	seen
}

fn required_env(name: &str) -> Result<String, String> {
	std::env::var(name).map_err(|_| format!("{} must be set", name))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("{}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
	info!("Starting event sync service");

	let user_id = UserId(required_env("EVENT_SYNC_USER_ID")?);
	let session = Session {
		uid: required_env("EVENT_SYNC_UID")?,
		access_token: required_env("EVENT_SYNC_ACCESS_TOKEN")?,
	};
	let api_config = ApiConfig {
		base_url: required_env("EVENT_SYNC_API_URL")?,
		..Default::default()
	};
	let data_dir = std::env::var("EVENT_SYNC_DATA_DIR")
		.map(PathBuf::from)
		.unwrap_or_else(|_| PathBuf::from("event-sync-data"));
	let scopes = std::env::var("EVENT_SYNC_SCOPES").unwrap_or_else(|_| "core".to_string());

	let worker_config = match std::env::var("EVENT_SYNC_WORKER_CONFIG") {
		Ok(path) => WorkerConfig::from_json_file(&PathBuf::from(path)).await?,
		Err(_) => WorkerConfig::default(),
	};

	let sessions = StaticSessionProvider::new().with_session(user_id.clone(), session);
	let client = ApiClient::new(api_config, Arc::new(sessions))?;
	let fetcher = RemoteEventFetcher::new(client, FetcherConfig::default());
	info!("Created API client");

	let repository = FileEventMetadataRepository::new(data_dir).await?;

	let applier = EventApplier::builder()
		.register(LoggingEventHandler {
			kind: "core",
			entity_types: &[
				"User",
				"UserSettings",
				"Addresses",
				"Contacts",
				"ContactEmails",
				"Labels",
				"Messages",
				"Conversations",
			],
		})
		.register(LoggingEventHandler {
			kind: "calendar",
			entity_types: &["Calendars", "CalendarEvents", "CalendarAlarms"],
		})
		.register(LoggingEventHandler {
			kind: "drive",
			entity_types: &["Shares", "Links", "Volumes"],
		})
		.build();

	let manager = Arc::new(EventManager::new(
		Arc::new(repository),
		Arc::new(fetcher),
		Arc::new(applier),
		EventManagerSettings::default(),
	));

	// A headless host stays in the foreground for its whole life.
	let (_host, signals) = HostSignals::channel(AppState::Foreground);
	let workers = EventWorkerManager::new(manager, worker_config, signals);

	tokio::spawn(log_worker_events(workers.subscribe()));

	for scope in scopes.split(',').map(str::trim).filter(|s| !s.is_empty()) {
		workers.enqueue(&EventManagerConfig::new(user_id.clone(), scope), true)?;
	}

	tokio::signal::ctrl_c().await?;
	info!("Interrupted, stopping workers");
	workers.shutdown().await;
	Ok(())
}

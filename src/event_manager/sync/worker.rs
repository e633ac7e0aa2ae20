//! Scheduling of synchronization runs.
//!
//! The `EventWorkerManager` owns one long-lived task per stream. Each task sleeps until its next
//! deadline, runs [`EventManager::process`], and derives the following deadline from the outcome:
//! the repeat interval after success, an exponential delay after a transient failure, and an
//! immediate re-run after a first resynchronization, backing off if resyncs keep repeating. Host conditions arrive through [`HostSignals`];
//! battery and storage gates hold back background runs only, never foreground or immediate ones.

use crate::event_manager::sync::orchestrator::{EventManager, ProcessOutcome};
use crate::event_manager::sync::progress_tracker::SyncStats;
use crate::event_manager::{EventManagerConfig, EventManagerError};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduling configuration; durations in seconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
	pub immediate_minimum_initial_delay_secs: u64,
	pub repeat_interval_foreground_secs: u64,
	pub repeat_interval_background_secs: u64,
	/// Stretch the background interval by the host's standby bucket.
	pub repeat_interval_background_by_bucket: bool,
	pub backoff_delay_secs: u64,
	pub max_backoff_delay_secs: u64,
	/// Consecutive failures after which a stream waits for its next periodic run.
	pub max_backoff_retries: u32,
	pub requires_battery_not_low: bool,
	pub requires_storage_not_low: bool,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			immediate_minimum_initial_delay_secs: 0,
			repeat_interval_foreground_secs: 30,
			repeat_interval_background_secs: 30 * 60,
			repeat_interval_background_by_bucket: false,
			backoff_delay_secs: 30,
			max_backoff_delay_secs: 5 * 60 * 60,
			max_backoff_retries: 5,
			requires_battery_not_low: false,
			requires_storage_not_low: false,
		}
	}
}

impl WorkerConfig {
	/// Load a configuration from a JSON file; missing fields keep their defaults.
	pub async fn from_json_file(path: &Path) -> Result<Self, EventManagerError> {
		let content = tokio::fs::read_to_string(path).await.map_err(|e| {
			EventManagerError::ConfigError(format!("Failed to read {:?}: {}", path, e))
		})?;
		serde_json::from_str(&content).map_err(|e| {
			EventManagerError::ConfigError(format!("Failed to parse {:?}: {}", path, e))
		})
	}
}

/// Lifecycle state of the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AppState {
	Foreground,
	Background,
}

/// Usage bucket reported by the host; rarer buckets run background syncs less often
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum StandbyBucket {
	Active,
	WorkingSet,
	Frequent,
	Rare,
	Restricted,
}

impl StandbyBucket {
	fn throttle_factor(self) -> u32 {
		match self {
			StandbyBucket::Active => 1,
			StandbyBucket::WorkingSet => 2,
			StandbyBucket::Frequent => 4,
			StandbyBucket::Rare => 8,
			StandbyBucket::Restricted => 48,
		}
	}
}

/// Scheduling policy derived from a [`WorkerConfig`]
#[derive(Debug, Clone)]
pub struct WorkerPolicy {
	config: WorkerConfig,
}

impl WorkerPolicy {
	pub fn new(config: WorkerConfig) -> Self {
		Self { config }
	}

	pub fn immediate_minimum_initial_delay(&self) -> Duration {
		Duration::from_secs(self.config.immediate_minimum_initial_delay_secs)
	}

	pub fn repeat_interval_foreground(&self) -> Duration {
		Duration::from_secs(self.config.repeat_interval_foreground_secs)
	}

	pub fn repeat_interval_background(&self, bucket: StandbyBucket) -> Duration {
		let base = Duration::from_secs(self.config.repeat_interval_background_secs);
		if self.config.repeat_interval_background_by_bucket {
			base * bucket.throttle_factor()
		} else {
			base
		}
	}

	/// Interval between periodic runs for the given host state.
	pub fn repeat_interval(&self, app_state: AppState, bucket: StandbyBucket) -> Duration {
		match app_state {
			AppState::Foreground => self.repeat_interval_foreground(),
			AppState::Background => self.repeat_interval_background(bucket),
		}
	}

	pub fn backoff_delay(&self) -> Duration {
		Duration::from_secs(self.config.backoff_delay_secs)
	}

	/// Delay before the attempt following `retry_count` consecutive failures: the base delay
	/// doubled per failure, capped at the maximum.
	pub fn backoff_delay_for(&self, retry_count: u32) -> Duration {
		let max = Duration::from_secs(self.config.max_backoff_delay_secs);
		let mut backoff = ExponentialBackoffBuilder::new()
			.with_initial_interval(self.backoff_delay())
			.with_randomization_factor(0.0)
			.with_multiplier(2.0)
			.with_max_interval(max)
			.with_max_elapsed_time(None)
			.build();

		let mut delay = self.backoff_delay();
		for _ in 0..retry_count.max(1) {
			delay = backoff.next_backoff().unwrap_or(max);
		}
		// Drop the sub-millisecond jitter the backoff crate adds even without randomization.
		Duration::from_millis(delay.as_millis() as u64).min(max)
	}

	/// Delay before the run following the `resyncs`-th consecutive resynchronization.
	pub fn resync_delay_for(&self, resyncs: u32) -> Duration {
		if resyncs <= 1 {
			self.immediate_minimum_initial_delay()
		} else {
			self.backoff_delay_for(resyncs - 1)
		}
	}

	pub fn max_backoff_retries(&self) -> u32 {
		self.config.max_backoff_retries
	}

	pub fn requires_battery_not_low(&self) -> bool {
		self.config.requires_battery_not_low
	}

	pub fn requires_storage_not_low(&self) -> bool {
		self.config.requires_storage_not_low
	}

	fn gates_open(&self, signals: &HostSignals) -> bool {
		!(self.requires_battery_not_low() && signals.battery_low())
			&& !(self.requires_storage_not_low() && signals.storage_low())
	}
}

/// Read side of the host conditions, shared by every worker
#[derive(Debug, Clone)]
pub struct HostSignals {
	app_state: watch::Receiver<AppState>,
	standby_bucket: watch::Receiver<StandbyBucket>,
	battery_low: watch::Receiver<bool>,
	storage_low: watch::Receiver<bool>,
}

/// Write side of the host conditions, held by the embedding application
#[derive(Debug)]
pub struct HostSignalsController {
	app_state: watch::Sender<AppState>,
	standby_bucket: watch::Sender<StandbyBucket>,
	battery_low: watch::Sender<bool>,
	storage_low: watch::Sender<bool>,
}

impl HostSignals {
	/// Create a linked controller and signals, starting in the given app state with an active
	/// bucket and no resource pressure.
	pub fn channel(app_state: AppState) -> (HostSignalsController, HostSignals) {
		let (app_state_tx, app_state_rx) = watch::channel(app_state);
		let (bucket_tx, bucket_rx) = watch::channel(StandbyBucket::Active);
		let (battery_tx, battery_rx) = watch::channel(false);
		let (storage_tx, storage_rx) = watch::channel(false);
		(
			HostSignalsController {
				app_state: app_state_tx,
				standby_bucket: bucket_tx,
				battery_low: battery_tx,
				storage_low: storage_tx,
			},
			HostSignals {
				app_state: app_state_rx,
				standby_bucket: bucket_rx,
				battery_low: battery_rx,
				storage_low: storage_rx,
			},
		)
	}

	pub fn app_state(&self) -> AppState {
		*self.app_state.borrow()
	}

	pub fn standby_bucket(&self) -> StandbyBucket {
		*self.standby_bucket.borrow()
	}

	pub fn battery_low(&self) -> bool {
		*self.battery_low.borrow()
	}

	pub fn storage_low(&self) -> bool {
		*self.storage_low.borrow()
	}

	fn mark_seen(&mut self) {
		self.app_state.borrow_and_update();
		self.standby_bucket.borrow_and_update();
		self.battery_low.borrow_and_update();
		self.storage_low.borrow_and_update();
	}
}

impl HostSignalsController {
	pub fn set_app_state(&self, state: AppState) {
		self.app_state.send_replace(state);
	}

	pub fn set_standby_bucket(&self, bucket: StandbyBucket) {
		self.standby_bucket.send_replace(bucket);
	}

	pub fn set_battery_low(&self, low: bool) {
		self.battery_low.send_replace(low);
	}

	pub fn set_storage_low(&self, low: bool) {
		self.storage_low.send_replace(low);
	}
}

/// Resolve on the next transition into the foreground.
async fn foreground_entered(app_state: &mut watch::Receiver<AppState>) {
	loop {
		if app_state.changed().await.is_err() {
			std::future::pending::<()>().await;
		}
		if *app_state.borrow_and_update() == AppState::Foreground {
			return;
		}
	}
}

/// Resolve when battery or storage conditions change.
async fn resources_changed(
	battery_low: &mut watch::Receiver<bool>,
	storage_low: &mut watch::Receiver<bool>,
) {
	let changed = tokio::select! {
		changed = battery_low.changed() => changed,
		changed = storage_low.changed() => changed,
	};
	if changed.is_err() {
		std::future::pending::<()>().await;
	}
}

/// Diagnostics emitted by the workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
	Enqueued {
		config: EventManagerConfig,
		immediately: bool,
	},
	Started(EventManagerConfig),
	Completed {
		config: EventManagerConfig,
		stats: SyncStats,
	},
	Backoff {
		config: EventManagerConfig,
		retry_count: u32,
		delay: Duration,
	},
	/// Backoff is exhausted; the stream waits for its next periodic run.
	SyncDelayed {
		config: EventManagerConfig,
		retry_count: u32,
		delay: Duration,
	},
	Resync(EventManagerConfig),
	Unauthorized(EventManagerConfig),
	/// A background run is held back by a battery or storage gate.
	Blocked(EventManagerConfig),
	Cancelled(EventManagerConfig),
	Failed {
		config: EventManagerConfig,
		error: String,
	},
}

struct WorkerHandle {
	trigger: mpsc::UnboundedSender<()>,
	cancel: CancellationToken,
	running: Arc<AtomicBool>,
	task: JoinHandle<()>,
}

impl WorkerHandle {
	fn is_alive(&self) -> bool {
		!self.task.is_finished()
	}
}

#[derive(Clone)]
struct WorkerContext {
	manager: Arc<EventManager>,
	policy: Arc<WorkerPolicy>,
	signals: HostSignals,
	events: broadcast::Sender<WorkerEvent>,
}

impl WorkerContext {
	fn emit(&self, event: WorkerEvent) {
		// No subscribers is fine.
		let _ = self.events.send(event);
	}
}

/// Scheduler holding one worker task per stream
pub struct EventWorkerManager {
	context: WorkerContext,
	workers: std::sync::Mutex<HashMap<EventManagerConfig, WorkerHandle>>,
}

impl EventWorkerManager {
	pub fn new(manager: Arc<EventManager>, config: WorkerConfig, signals: HostSignals) -> Self {
		let (events, _) = broadcast::channel(256);
		Self {
			context: WorkerContext {
				manager,
				policy: Arc::new(WorkerPolicy::new(config)),
				signals,
				events,
			},
			workers: std::sync::Mutex::new(HashMap::new()),
		}
	}

	pub fn policy(&self) -> &WorkerPolicy {
		&self.context.policy
	}

	pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
		self.context.events.subscribe()
	}

	/// Schedule a stream.
	///
	/// A stream without a live worker gets one, starting after the immediate minimum delay when
	/// `immediately` is set and after the repeat interval otherwise. For a live worker an immediate
	/// request moves its next run forward; a periodic request changes nothing.
	pub fn enqueue(
		&self,
		config: &EventManagerConfig,
		immediately: bool,
	) -> Result<(), EventManagerError> {
		self.context.manager.validate(config)?;

		let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
		if let Some(handle) = workers.get(config).filter(|h| h.is_alive()) {
			if immediately {
				debug!("Triggering immediate run of {}", config);
				let _ = handle.trigger.send(());
				self.context.emit(WorkerEvent::Enqueued {
					config: config.clone(),
					immediately,
				});
			}
			return Ok(());
		}

		info!("Starting worker for {} (immediately: {})", config, immediately);
		let (trigger, triggers) = mpsc::unbounded_channel();
		let cancel = CancellationToken::new();
		let running = Arc::new(AtomicBool::new(false));
		let task = tokio::spawn(run_worker(
			self.context.clone(),
			config.clone(),
			triggers,
			cancel.clone(),
			running.clone(),
			immediately,
		));

		workers.insert(
			config.clone(),
			WorkerHandle {
				trigger,
				cancel,
				running,
				task,
			},
		);
		self.context.emit(WorkerEvent::Enqueued {
			config: config.clone(),
			immediately,
		});
		Ok(())
	}

	/// Stop the worker of a stream and mark it cancelled. A run in progress finishes its current
	/// step first.
	pub async fn cancel(&self, config: &EventManagerConfig) -> Result<(), EventManagerError> {
		let handle = self
			.workers
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(config);

		if let Some(handle) = handle {
			handle.cancel.cancel();
			if let Err(e) = handle.task.await {
				warn!("Worker for {} ended abnormally: {}", config, e);
			}
			info!("Cancelled worker for {}", config);
			self.context.emit(WorkerEvent::Cancelled(config.clone()));
		}

		self.context.manager.cancel(config).await
	}

	/// Cancel a stream and delete all of its sync state.
	pub async fn remove(&self, config: &EventManagerConfig) -> Result<(), EventManagerError> {
		self.cancel(config).await?;
		self.context.manager.remove(config).await
	}

	pub fn is_running(&self, config: &EventManagerConfig) -> bool {
		let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
		workers
			.get(config)
			.is_some_and(|h| h.is_alive() && h.running.load(Ordering::SeqCst))
	}

	/// Whether a live worker is waiting for its next run.
	pub fn is_enqueued(&self, config: &EventManagerConfig) -> bool {
		let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
		workers
			.get(config)
			.is_some_and(|h| h.is_alive() && !h.running.load(Ordering::SeqCst))
	}

	pub fn enqueued_configs(&self) -> Vec<EventManagerConfig> {
		let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
		workers
			.iter()
			.filter(|(_, h)| h.is_alive())
			.map(|(config, _)| config.clone())
			.collect()
	}

	/// Stop every worker and wait for them to exit.
	pub async fn shutdown(&self) {
		let handles: Vec<_> = self
			.workers
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.drain()
			.collect();

		info!("Shutting down {} workers", handles.len());
		for (_, handle) in &handles {
			handle.cancel.cancel();
		}
		for result in futures::future::join_all(handles.into_iter().map(|(_, h)| h.task)).await {
			if let Err(e) = result {
				warn!("Worker ended abnormally: {}", e);
			}
		}
	}
}

impl Drop for EventWorkerManager {
	fn drop(&mut self) {
		let workers = self.workers.get_mut().unwrap_or_else(PoisonError::into_inner);
		for handle in workers.values() {
			handle.cancel.cancel();
		}
	}
}

async fn run_worker(
	context: WorkerContext,
	config: EventManagerConfig,
	mut triggers: mpsc::UnboundedReceiver<()>,
	cancel: CancellationToken,
	running: Arc<AtomicBool>,
	immediately: bool,
) {
	let policy = context.policy.clone();
	let mut signals = context.signals.clone();
	signals.mark_seen();

	let mut immediate = immediately;
	// Resyncs since the last completed run.
	let mut resyncs: u32 = 0;
	let mut deadline = Instant::now()
		+ if immediately {
			policy.immediate_minimum_initial_delay()
		} else {
			policy.repeat_interval(signals.app_state(), signals.standby_bucket())
		};

	loop {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			Some(()) = triggers.recv() => {
				immediate = true;
				deadline = deadline.min(Instant::now() + policy.immediate_minimum_initial_delay());
				continue;
			}
			_ = foreground_entered(&mut signals.app_state) => {
				debug!("Foreground entered, running {} now", config);
				immediate = true;
				deadline = deadline.min(Instant::now() + policy.immediate_minimum_initial_delay());
				continue;
			}
			_ = sleep_until(deadline) => {}
		}

		if !immediate && signals.app_state() == AppState::Background && !policy.gates_open(&signals) {
			debug!("Background run of {} held back by resource gates", config);
			context.emit(WorkerEvent::Blocked(config.clone()));
			tokio::select! {
				biased;
				_ = cancel.cancelled() => break,
				Some(()) = triggers.recv() => immediate = true,
				_ = foreground_entered(&mut signals.app_state) => immediate = true,
				_ = resources_changed(&mut signals.battery_low, &mut signals.storage_low) => {}
			}
			continue;
		}

		running.store(true, Ordering::SeqCst);
		context.emit(WorkerEvent::Started(config.clone()));
		let outcome = context.manager.process(&config, &cancel).await;
		running.store(false, Ordering::SeqCst);

		// Requests that arrived during the run are satisfied by it.
		while triggers.try_recv().is_ok() {}
		immediate = false;

		let periodic = policy.repeat_interval(signals.app_state(), signals.standby_bucket());
		let delay = match outcome {
			Ok(ProcessOutcome::Completed(stats)) => {
				resyncs = 0;
				context.emit(WorkerEvent::Completed {
					config: config.clone(),
					stats,
				});
				periodic
			}
			Ok(ProcessOutcome::Backoff { retry_count }) if retry_count > policy.max_backoff_retries() => {
				warn!(
					"Sync of {} delayed after {} failed attempts",
					config, retry_count
				);
				context.emit(WorkerEvent::SyncDelayed {
					config: config.clone(),
					retry_count,
					delay: periodic,
				});
				periodic
			}
			Ok(ProcessOutcome::Backoff { retry_count }) => {
				let delay = policy.backoff_delay_for(retry_count);
				debug!("Retrying {} in {:?} (attempt {})", config, delay, retry_count);
				context.emit(WorkerEvent::Backoff {
					config: config.clone(),
					retry_count,
					delay,
				});
				delay
			}
			Ok(ProcessOutcome::Resync) => {
				resyncs += 1;
				context.emit(WorkerEvent::Resync(config.clone()));
				immediate = true;
				policy.resync_delay_for(resyncs)
			}
			Ok(ProcessOutcome::Unauthorized) => {
				context.emit(WorkerEvent::Unauthorized(config.clone()));
				periodic
			}
			Ok(ProcessOutcome::Coalesced) => periodic,
			Ok(ProcessOutcome::Cancelled) => break,
			Err(e) => {
				error!("Worker for {} stopped: {}", config, e);
				context.emit(WorkerEvent::Failed {
					config: config.clone(),
					error: e.to_string(),
				});
				break;
			}
		};
		deadline = Instant::now() + delay;
	}

	debug!("Worker for {} exited", config);
}

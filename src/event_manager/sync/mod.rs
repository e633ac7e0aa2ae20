//! Event Synchronization Module
//!
//! This module provides the core logic and services that keep per-user, per-scope local state
//! consistent with the remote event stream. It is composed of several submodules, each responsible
//! for one step of the sync process:
//!
//! - `orchestrator`: The per-stream state machine driving Fetch → Cache → Apply → Commit cycles.
//! - `fetcher`: Remote round trips with timeouts, failure classification and the bootstrap path.
//! - `applier`: The capability table dispatching a batch to the registered entity handlers.
//! - `repositories`: Durable metadata and cached batches, in memory or on disk.
//! - `progress_tracker`: Per-run statistics for logging and reporting.
//! - `worker`: The scheduler deciding when each stream runs.
//!
//! The worker triggers the orchestrator; the orchestrator persists progress after every step so a
//! run interrupted at any point resumes without losing or double-committing a batch.

/// Entity handler registry and batch dispatch
pub mod applier;
/// Remote fetch with classification and bootstrap
pub mod fetcher;
/// Per-stream sync state machine
pub mod orchestrator;
/// Per-run statistics
pub mod progress_tracker;
/// Metadata and cached batch persistence
pub mod repositories;
/// Scheduling of sync runs
pub mod worker;

pub use applier::{
	ApplyReport, BatchTransaction, EventApplier, EventApplierBuilder, EventHandler, NoTransaction,
};
pub use fetcher::{EventFetcher, EventTransport, FetchResult, FetcherConfig, RemoteEventFetcher};
pub use orchestrator::{EventManager, EventManagerSettings, ProcessOutcome};
pub use progress_tracker::{SyncProgressTracker, SyncStats};
pub use repositories::{
	EventMetadataRepository, FileEventMetadataRepository, InMemoryEventMetadataRepository,
};
pub use worker::{
	AppState, EventWorkerManager, HostSignals, HostSignalsController, StandbyBucket, WorkerConfig,
	WorkerEvent, WorkerPolicy,
};

//! Event manager orchestrator and integration point for all sync services.
//!
//! This module defines the `EventManager`, which drives the synchronization of one stream from its
//! persisted cursor to the server head. A run repeats fetch, cache, apply and commit until the
//! server reports no further batches, persisting progress after every step so that a run
//! interrupted at any point resumes where it stopped:
//! - a cached batch that was never committed is re-applied without another fetch
//! - an interrupted resynchronization is finished before anything else
//! - a cursor the server no longer knows triggers a full resynchronization
//!
//! Repeated failures escalate in two stages: past `retries_before_reset_all` a cached batch that
//! keeps failing is skipped after every handler dropped its local state, and past
//! `retries_before_reset` the cursor itself is discarded.
//!
//! Transient problems are reported as [`ProcessOutcome`] values for the scheduler to act on; only
//! configuration and storage failures surface as [`EventManagerError`].

use crate::event_manager::sync::{
    applier::EventApplier,
    fetcher::{EventFetcher, FetchResult},
    progress_tracker::{SyncProgressTracker, SyncStats},
    repositories::EventMetadataRepository,
};
use crate::event_manager::{
    EventManagerConfig, EventManagerError, EventMetadata, EventsResponse, FetchError, State,
};
use crate::utils::current_time_millis;

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Tunables of the orchestrator
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventManagerSettings {
    /// Failed attempts on a cached batch after which handlers reset their state and the batch is
    /// skipped; `None` never skips. Must stay below `retries_before_reset`.
    pub retries_before_reset_all: Option<u32>,
    /// Failed attempts after which the stream is resynchronized from scratch; `None` never resets.
    pub retries_before_reset: Option<u32>,
}

impl Default for EventManagerSettings {
    fn default() -> Self {
        Self {
            retries_before_reset_all: Some(3),
            retries_before_reset: Some(6),
        }
    }
}

/// Result of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Caught up with the server.
    Completed(SyncStats),
    /// A transient failure; the run should be retried after a backoff delay.
    Backoff { retry_count: u32 },
    /// Local state was discarded; the stream bootstraps on its next run.
    Resync,
    /// The session was rejected; retrying before it is renewed is pointless.
    Unauthorized,
    /// Another run of the same stream was in progress.
    Coalesced,
    /// The run observed its cancellation token.
    Cancelled,
}

/// Orchestrator for all streams sharing a repository, a fetcher and a handler table.
pub struct EventManager {
    repository: Arc<dyn EventMetadataRepository>,
    fetcher: Arc<dyn EventFetcher>,
    applier: Arc<EventApplier>,
    settings: EventManagerSettings,
    // Serializes runs per stream; different streams proceed concurrently.
    locks: std::sync::Mutex<HashMap<EventManagerConfig, Arc<Mutex<()>>>>,
}

impl EventManager {
    pub fn new(
        repository: Arc<dyn EventMetadataRepository>,
        fetcher: Arc<dyn EventFetcher>,
        applier: Arc<EventApplier>,
        settings: EventManagerSettings,
    ) -> Self {
        info!(
            "Creating event manager with fetcher {} (retries before reset all: {:?}, before reset: {:?})",
            fetcher.name(),
            settings.retries_before_reset_all,
            settings.retries_before_reset
        );
        Self {
            repository,
            fetcher,
            applier,
            settings,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn config_lock(&self, config: &EventManagerConfig) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(config.clone()).or_default().clone()
    }

    /// Reject streams that can never be processed.
    pub fn validate(&self, config: &EventManagerConfig) -> Result<(), EventManagerError> {
        if config.user_id.0.is_empty() || config.scope_id.is_empty() {
            return Err(EventManagerError::InvalidConfig(
                config.clone(),
                "user and scope must not be empty".to_string(),
            ));
        }
        if !self.applier.handles(config) {
            return Err(EventManagerError::MissingHandler(config.scope_id.clone()));
        }
        if !self.fetcher.supports(config) {
            return Err(EventManagerError::InvalidConfig(
                config.clone(),
                "no endpoint serves this scope".to_string(),
            ));
        }
        Ok(())
    }

    /// Current metadata of a stream, if it was ever processed.
    pub async fn metadata(
        &self,
        config: &EventManagerConfig,
    ) -> Result<Option<EventMetadata>, EventManagerError> {
        Ok(self.repository.get(config).await?)
    }

    /// Mark a stream cancelled. A run in progress stops at its next step boundary once its token
    /// is cancelled.
    pub async fn cancel(&self, config: &EventManagerConfig) -> Result<(), EventManagerError> {
        if self.repository.get(config).await?.is_some() {
            self.repository.update_state(config, State::Cancelled).await?;
        }
        Ok(())
    }

    /// Delete a stream's metadata and cached batches, waiting for any run in progress to finish.
    pub async fn remove(&self, config: &EventManagerConfig) -> Result<(), EventManagerError> {
        let lock = self.config_lock(config);
        let _guard = lock.lock().await;
        self.repository.delete_all(config).await?;
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(config);
        Ok(())
    }

    /// Bring one stream up to date with the server.
    #[instrument(skip_all, fields(config = %config))]
    pub async fn process(
        &self,
        config: &EventManagerConfig,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, EventManagerError> {
        self.validate(config)?;

        let Ok(_guard) = self.config_lock(config).try_lock_owned() else {
            debug!("Run already in progress, coalescing");
            return Ok(ProcessOutcome::Coalesced);
        };

        let mut metadata = self.repository.create(config).await?;

        if metadata.state == State::Resync {
            info!("Finishing interrupted resynchronization");
            return self.resync(config).await;
        }
        if let Some(limit) = self.settings.retries_before_reset {
            if metadata.retry_count > limit {
                warn!(
                    "Giving up after {} failed attempts at {:?}",
                    metadata.retry_count, metadata.current_event_id
                );
                return self.resync(config).await;
            }
        }

        let mut tracker = SyncProgressTracker::new(metadata.current_event_id.clone());
        let mut pending = None;
        let mut skip_pending = false;

        if let Some(next) = metadata.next_event_id.clone() {
            match self.repository.get_events(config, &next).await? {
                Some(batch) => {
                    info!("Resuming with cached batch {}", next);
                    tracker.record_resumed_from_cache();
                    pending = Some(batch);
                    if let Some(limit) = self.settings.retries_before_reset_all {
                        skip_pending = metadata.retry_count > limit;
                    }
                }
                None => {
                    warn!("Cached batch {} is missing, fetching again", next);
                    metadata.next_event_id = None;
                    self.save(&mut metadata, State::Idle).await?;
                }
            }
        }

        loop {
            if cancel.is_cancelled() {
                return self.cancelled(config).await;
            }

            let batch = match pending.take() {
                Some(batch) => {
                    self.save(&mut metadata, State::Applying).await?;
                    batch
                }
                None => match self.fetch(&mut metadata, cancel).await? {
                    Ok(batch) => batch,
                    Err(outcome) => {
                        if let ProcessOutcome::Completed(_) = outcome {
                            let stats = tracker.get_stats();
                            info!("{}", stats.summary());
                            return Ok(ProcessOutcome::Completed(stats));
                        }
                        return Ok(outcome);
                    }
                },
            };

            if cancel.is_cancelled() {
                return self.cancelled(config).await;
            }

            let previous = metadata.current_event_id.clone();
            let report = if std::mem::take(&mut skip_pending) {
                warn!(
                    "Skipping batch {} after {} failed attempts, resetting local state",
                    batch.next_event_id, metadata.retry_count
                );
                self.applier.reset_all(config).await.map(|_| None)
            } else if batch.refresh {
                info!("Server requested a full refresh at {}", batch.next_event_id);
                self.applier.reset_all(config).await.map(|_| None)
            } else {
                self.applier.apply(config, &batch.events).await.map(Some)
            };

            let report = match report {
                Ok(report) => report,
                Err(e) => {
                    metadata.retry_count += 1;
                    warn!(
                        "Failed to apply batch {} (attempt {}): {}",
                        batch.next_event_id, metadata.retry_count, e
                    );
                    self.save(&mut metadata, State::Backoff).await?;
                    return Ok(ProcessOutcome::Backoff {
                        retry_count: metadata.retry_count,
                    });
                }
            };

            self.repository
                .update_event_id(config, previous.as_ref(), &batch.next_event_id)
                .await?;
            metadata.current_event_id = Some(batch.next_event_id.clone());
            metadata.next_event_id = None;
            metadata.retry_count = 0;
            metadata.state = State::Idle;

            match &report {
                Some(report) => tracker.record_batch(&batch.next_event_id, report),
                None => tracker.record_refresh(&batch.next_event_id),
            }

            if !batch.more {
                break;
            }
            if previous.as_ref() == Some(&batch.next_event_id) {
                warn!(
                    "Server reported more events without advancing past {}",
                    batch.next_event_id
                );
                break;
            }
            tracker.record_catch_up();
            tracker.log_progress(false);
        }

        let stats = tracker.get_stats();
        info!("{}", stats.summary());
        Ok(ProcessOutcome::Completed(stats))
    }

    /// Fetch and cache the next batch.
    ///
    /// `Ok(Err(outcome))` ends the run with `outcome`; `Completed` there means already up to date.
    async fn fetch(
        &self,
        metadata: &mut EventMetadata,
        cancel: &CancellationToken,
    ) -> Result<Result<EventsResponse, ProcessOutcome>, EventManagerError> {
        let config = metadata.config.clone();
        self.save(metadata, State::Fetching).await?;

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.cancelled(&config).await.map(Err),
            fetched = self.fetcher.fetch(&config, metadata.current_event_id.as_ref()) => fetched,
        };

        match fetched {
            Ok(FetchResult::Batch(batch)) => {
                debug!(
                    "Caching batch {} with {} events",
                    batch.next_event_id,
                    batch.events.len()
                );
                metadata.state = State::Applying;
                self.repository.update(metadata, &batch).await?;
                metadata.next_event_id = Some(batch.next_event_id.clone());
                Ok(Ok(batch))
            }
            Ok(FetchResult::UpToDate) => {
                debug!("Up to date at {:?}", metadata.current_event_id);
                metadata.retry_count = 0;
                self.save(metadata, State::Idle).await?;
                Ok(Err(ProcessOutcome::Completed(SyncStats::default())))
            }
            Err(e) if e.is_transient() => {
                metadata.retry_count += 1;
                warn!("Fetch failed (attempt {}): {}", metadata.retry_count, e);
                self.save(metadata, State::Backoff).await?;
                Ok(Err(ProcessOutcome::Backoff {
                    retry_count: metadata.retry_count,
                }))
            }
            Err(FetchError::Unauthorized(message)) => {
                warn!("Fetch unauthorized: {}", message);
                self.save(metadata, State::Idle).await?;
                Ok(Err(ProcessOutcome::Unauthorized))
            }
            Err(FetchError::InvalidConfig(message)) => {
                error!("Stream cannot be fetched: {}", message);
                self.save(metadata, State::Idle).await?;
                Err(EventManagerError::InvalidConfig(config, message))
            }
            Err(e) if metadata.current_event_id.is_none() => {
                // Nothing to invalidate yet: the bootstrap itself failed.
                metadata.retry_count += 1;
                warn!("Bootstrap failed (attempt {}): {}", metadata.retry_count, e);
                self.save(metadata, State::Backoff).await?;
                Ok(Err(ProcessOutcome::Backoff {
                    retry_count: metadata.retry_count,
                }))
            }
            Err(e) => {
                warn!("Cursor {:?} rejected: {}", metadata.current_event_id, e);
                self.resync(&config).await.map(Err)
            }
        }
    }

    async fn save(&self, metadata: &mut EventMetadata, state: State) -> Result<(), EventManagerError> {
        metadata.state = state;
        metadata.last_used_at_millis = current_time_millis();
        self.repository.update_metadata(metadata).await?;
        Ok(())
    }

    async fn cancelled(
        &self,
        config: &EventManagerConfig,
    ) -> Result<ProcessOutcome, EventManagerError> {
        info!("Run cancelled");
        self.repository.update_state(config, State::Cancelled).await?;
        Ok(ProcessOutcome::Cancelled)
    }

    /// Discard the cursor and all local state of the stream.
    ///
    /// The stream stays in `Resync` until every handler has reset, so a failure here is retried
    /// on the next run.
    async fn resync(&self, config: &EventManagerConfig) -> Result<ProcessOutcome, EventManagerError> {
        warn!("Resynchronizing {}", config);
        self.repository.reset(config).await?;

        if let Err(e) = self.applier.reset_all(config).await {
            error!("Failed to reset local state of {}: {}", config, e);
            self.repository.update_retry(config, 1).await?;
            return Ok(ProcessOutcome::Backoff { retry_count: 1 });
        }

        self.repository.update_state(config, State::Idle).await?;
        Ok(ProcessOutcome::Resync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_manager::sync::applier::EventHandler;
    use crate::event_manager::sync::repositories::InMemoryEventMetadataRepository;
    use crate::event_manager::{Action, ApplyError, EventId, RawEvent, UserId};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedFetcher {
        results: std::sync::Mutex<VecDeque<Result<FetchResult, FetchError>>>,
        calls: std::sync::Mutex<Vec<Option<EventId>>>,
        /// Cancelled while the next fetch is in flight.
        cancel_during_fetch: std::sync::Mutex<Option<CancellationToken>>,
        hang: AtomicBool,
    }

    impl ScriptedFetcher {
        fn push(&self, result: Result<FetchResult, FetchError>) {
            self.results.lock().unwrap().push_back(result);
        }
    }

    #[async_trait::async_trait]
    impl EventFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _config: &EventManagerConfig,
            since: Option<&EventId>,
        ) -> Result<FetchResult, FetchError> {
            self.calls.lock().unwrap().push(since.cloned());
            let token = self.cancel_during_fetch.lock().unwrap().take();
            if let Some(token) = token {
                token.cancel();
            }
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(FetchResult::UpToDate))
        }

        fn name(&self) -> &'static str {
            "ScriptedFetcher"
        }
    }

    #[derive(Default)]
    struct Contacts {
        applied: std::sync::Mutex<Vec<String>>,
        resets: std::sync::Mutex<usize>,
        failures: std::sync::Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl EventHandler for Contacts {
        fn name(&self) -> &'static str {
            "contacts"
        }

        fn scope_kind(&self) -> &'static str {
            "core"
        }

        fn entity_types(&self) -> &[&'static str] {
            &["Contacts"]
        }

        async fn apply(
            &self,
            _config: &EventManagerConfig,
            events: &[RawEvent],
        ) -> Result<(), ApplyError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ApplyError::Handler {
                    handler: "contacts",
                    message: "locked".into(),
                });
            }
            let mut applied = self.applied.lock().unwrap();
            applied.extend(events.iter().map(|e| e.key.clone()));
            Ok(())
        }

        async fn on_reset_all(&self, _config: &EventManagerConfig) -> Result<(), ApplyError> {
            *self.resets.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn batch(next: &str, keys: &[&str], more: bool) -> EventsResponse {
        EventsResponse {
            events: keys
                .iter()
                .map(|k| RawEvent {
                    entity_type: "Contacts".into(),
                    action: Action::Update,
                    key: k.to_string(),
                    payload: serde_json::Value::Null,
                })
                .collect(),
            next_event_id: EventId::from(next),
            more,
            refresh: false,
        }
    }

    struct Harness {
        repository: Arc<InMemoryEventMetadataRepository>,
        fetcher: Arc<ScriptedFetcher>,
        contacts: Arc<Contacts>,
        manager: EventManager,
        config: EventManagerConfig,
    }

    fn harness() -> Harness {
        let repository = Arc::new(InMemoryEventMetadataRepository::new());
        let fetcher = Arc::new(ScriptedFetcher::default());
        let contacts = Arc::new(Contacts::default());
        let applier = EventApplier::builder()
            .register_shared(contacts.clone())
            .build();
        let manager = EventManager::new(
            repository.clone(),
            fetcher.clone(),
            Arc::new(applier),
            EventManagerSettings::default(),
        );
        Harness {
            repository,
            fetcher,
            contacts,
            manager,
            config: EventManagerConfig::core(UserId::from("u1")),
        }
    }

    #[tokio::test]
    async fn bootstrap_then_catch_up() {
        let h = harness();
        h.fetcher.push(Ok(FetchResult::Batch(batch("e1", &[], false))));
        let token = CancellationToken::new();

        let outcome = h.manager.process(&h.config, &token).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed(_)));

        h.fetcher.push(Ok(FetchResult::Batch(batch("e2", &["c1"], true))));
        h.fetcher.push(Ok(FetchResult::Batch(batch("e3", &["c2"], false))));
        let ProcessOutcome::Completed(stats) = h.manager.process(&h.config, &token).await.unwrap()
        else {
            panic!("expected completion");
        };

        assert_eq!(stats.batches_applied, 2);
        assert_eq!(stats.catch_up_iterations, 1);
        assert_eq!(*h.contacts.applied.lock().unwrap(), vec!["c1", "c2"]);
        assert_eq!(
            *h.fetcher.calls.lock().unwrap(),
            vec![None, Some(EventId::from("e1")), Some(EventId::from("e2"))]
        );

        let metadata = h.manager.metadata(&h.config).await.unwrap().unwrap();
        assert_eq!(metadata.current_event_id, Some(EventId::from("e3")));
        assert_eq!(metadata.state, State::Idle);
    }

    #[tokio::test]
    async fn apply_failure_keeps_cached_batch() {
        let h = harness();
        h.fetcher.push(Ok(FetchResult::Batch(batch("e1", &[], false))));
        let token = CancellationToken::new();
        h.manager.process(&h.config, &token).await.unwrap();

        *h.contacts.failures.lock().unwrap() = 1;
        h.fetcher.push(Ok(FetchResult::Batch(batch("e2", &["c1"], false))));
        let outcome = h.manager.process(&h.config, &token).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Backoff { retry_count: 1 });

        let metadata = h.repository.get(&h.config).await.unwrap().unwrap();
        assert_eq!(metadata.current_event_id, Some(EventId::from("e1")));
        assert_eq!(metadata.next_event_id, Some(EventId::from("e2")));
        assert_eq!(metadata.state, State::Backoff);

        // The retry applies the cached batch without fetching again.
        let outcome = h.manager.process(&h.config, &token).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed(ref s) if s.resumed_from_cache));
        assert_eq!(h.fetcher.calls.lock().unwrap().len(), 2);
        assert_eq!(*h.contacts.applied.lock().unwrap(), vec!["c1"]);
    }

    #[tokio::test]
    async fn invalid_cursor_resyncs() {
        let h = harness();
        h.fetcher.push(Ok(FetchResult::Batch(batch("e1", &[], false))));
        let token = CancellationToken::new();
        h.manager.process(&h.config, &token).await.unwrap();

        h.fetcher
            .push(Err(FetchError::CursorInvalid("event id expired".into())));
        let outcome = h.manager.process(&h.config, &token).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Resync);
        assert_eq!(*h.contacts.resets.lock().unwrap(), 1);
        let metadata = h.repository.get(&h.config).await.unwrap().unwrap();
        assert_eq!(metadata.current_event_id, None);
        assert_eq!(metadata.state, State::Idle);
    }

    #[tokio::test]
    async fn refresh_resets_handlers_and_commits() {
        let h = harness();
        h.fetcher.push(Ok(FetchResult::Batch(batch("e1", &[], false))));
        let token = CancellationToken::new();
        h.manager.process(&h.config, &token).await.unwrap();

        let mut refresh = batch("e2", &["c1"], false);
        refresh.refresh = true;
        h.fetcher.push(Ok(FetchResult::Batch(refresh)));
        let outcome = h.manager.process(&h.config, &token).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::Completed(ref s) if s.refreshes == 1));
        assert_eq!(*h.contacts.resets.lock().unwrap(), 1);
        assert!(h.contacts.applied.lock().unwrap().is_empty());
        let metadata = h.repository.get(&h.config).await.unwrap().unwrap();
        assert_eq!(metadata.current_event_id, Some(EventId::from("e2")));
    }

    #[tokio::test]
    async fn unauthorized_does_not_count_as_retry() {
        let h = harness();
        h.fetcher
            .push(Err(FetchError::Unauthorized("session expired".into())));

        let outcome = h
            .manager
            .process(&h.config, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Unauthorized);
        let metadata = h.repository.get(&h.config).await.unwrap().unwrap();
        assert_eq!(metadata.retry_count, 0);
        assert_eq!(metadata.state, State::Idle);
    }

    #[tokio::test]
    async fn too_many_failures_force_resync() {
        let h = harness();
        let mut metadata = h.repository.create(&h.config).await.unwrap();
        metadata.current_event_id = Some(EventId::from("e4"));
        metadata.retry_count = 7;
        h.repository.update_metadata(&metadata).await.unwrap();

        let outcome = h
            .manager
            .process(&h.config, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Resync);
        assert!(h.fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_run_is_coalesced() {
        let h = harness();
        let lock = h.manager.config_lock(&h.config);
        let _held = lock.lock().await;

        let outcome = h
            .manager
            .process(&h.config, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Coalesced);
        assert!(h.fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_fetch() {
        let h = harness();
        let token = CancellationToken::new();
        token.cancel();

        let outcome = h.manager.process(&h.config, &token).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Cancelled);
        let metadata = h.repository.get(&h.config).await.unwrap().unwrap();
        assert_eq!(metadata.state, State::Cancelled);
    }

    #[tokio::test]
    async fn unknown_scope_is_rejected() {
        let h = harness();
        let drive = EventManagerConfig::new(UserId::from("u1"), "drive:s1");

        let err = h
            .manager
            .process(&drive, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EventManagerError::MissingHandler(_)));
    }

    #[tokio::test]
    async fn rejected_bootstrap_backs_off_instead_of_resyncing() {
        let h = harness();
        h.fetcher
            .push(Err(FetchError::CursorInvalid("HTTP 404".into())));
        h.fetcher
            .push(Err(FetchError::CursorInvalid("HTTP 404".into())));
        let token = CancellationToken::new();

        assert_eq!(
            h.manager.process(&h.config, &token).await.unwrap(),
            ProcessOutcome::Backoff { retry_count: 1 }
        );
        assert_eq!(
            h.manager.process(&h.config, &token).await.unwrap(),
            ProcessOutcome::Backoff { retry_count: 2 }
        );

        assert_eq!(*h.contacts.resets.lock().unwrap(), 0);
        let metadata = h.repository.get(&h.config).await.unwrap().unwrap();
        assert_eq!(metadata.current_event_id, None);
        assert_eq!(metadata.state, State::Backoff);
    }

    #[tokio::test]
    async fn failing_batch_is_skipped_after_reset_all() {
        let h = harness();
        h.fetcher.push(Ok(FetchResult::Batch(batch("e1", &[], false))));
        let token = CancellationToken::new();
        h.manager.process(&h.config, &token).await.unwrap();

        *h.contacts.failures.lock().unwrap() = 10;
        h.fetcher.push(Ok(FetchResult::Batch(batch("e2", &["c1"], false))));
        for attempt in 1..=4 {
            assert_eq!(
                h.manager.process(&h.config, &token).await.unwrap(),
                ProcessOutcome::Backoff {
                    retry_count: attempt
                }
            );
        }
        assert_eq!(*h.contacts.resets.lock().unwrap(), 0);

        let outcome = h.manager.process(&h.config, &token).await.unwrap();
        assert!(matches!(
            outcome,
            ProcessOutcome::Completed(ref s) if s.refreshes == 1 && s.resumed_from_cache
        ));
        assert_eq!(*h.contacts.resets.lock().unwrap(), 1);
        assert!(h.contacts.applied.lock().unwrap().is_empty());
        assert_eq!(h.fetcher.calls.lock().unwrap().len(), 2);

        // The cursor moved past the skipped batch.
        let metadata = h.repository.get(&h.config).await.unwrap().unwrap();
        assert_eq!(metadata.current_event_id, Some(EventId::from("e2")));
        assert_eq!(metadata.next_event_id, None);
        assert_eq!(metadata.retry_count, 0);
    }

    #[tokio::test]
    async fn cancel_after_caching_keeps_batch_for_next_run() {
        let h = harness();
        h.fetcher.push(Ok(FetchResult::Batch(batch("e1", &[], false))));
        h.manager
            .process(&h.config, &CancellationToken::new())
            .await
            .unwrap();

        let token = CancellationToken::new();
        *h.fetcher.cancel_during_fetch.lock().unwrap() = Some(token.clone());
        h.fetcher.push(Ok(FetchResult::Batch(batch("e2", &["c1"], false))));

        let outcome = h.manager.process(&h.config, &token).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Cancelled);
        assert!(h.contacts.applied.lock().unwrap().is_empty());

        let metadata = h.repository.get(&h.config).await.unwrap().unwrap();
        assert_eq!(metadata.state, State::Cancelled);
        assert_eq!(metadata.current_event_id, Some(EventId::from("e1")));
        assert_eq!(metadata.next_event_id, Some(EventId::from("e2")));

        let outcome = h
            .manager
            .process(&h.config, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed(ref s) if s.resumed_from_cache));
        assert_eq!(*h.contacts.applied.lock().unwrap(), vec!["c1"]);
        assert_eq!(h.fetcher.calls.lock().unwrap().len(), 2);
        let metadata = h.repository.get(&h.config).await.unwrap().unwrap();
        assert_eq!(metadata.current_event_id, Some(EventId::from("e2")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_fetch_leaves_cursor_untouched() {
        let h = harness();
        h.fetcher.push(Ok(FetchResult::Batch(batch("e1", &[], false))));
        h.manager
            .process(&h.config, &CancellationToken::new())
            .await
            .unwrap();

        h.fetcher.hang.store(true, Ordering::SeqCst);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let outcome = h.manager.process(&h.config, &token).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Cancelled);

        let metadata = h.repository.get(&h.config).await.unwrap().unwrap();
        assert_eq!(metadata.state, State::Cancelled);
        assert_eq!(metadata.current_event_id, Some(EventId::from("e1")));
        assert_eq!(metadata.next_event_id, None);
    }
}

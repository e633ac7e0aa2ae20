//! Progress tracking for one synchronization run.
//!
//! This module provides the `SyncProgressTracker`, which records every batch applied during a run
//! of the orchestrator: how many events were dispatched or ignored, how many catch-up iterations
//! the server asked for, and which cursor the run finished on. The resulting `SyncStats` are
//! logged at the end of the run and returned to the scheduler in the outcome.

use crate::event_manager::sync::applier::ApplyReport;
use crate::event_manager::EventId;

use std::time::Instant;
use tracing::info;

/// Service for tracking the progress of a run
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
    /// Cursor the run started from
    start_event_id: Option<EventId>,
    /// Last committed cursor
    last_event_id: Option<EventId>,
    /// Batches committed during this run
    batches_applied: usize,
    /// Events handed to handlers
    events_applied: usize,
    /// Events without a handler
    events_ignored: usize,
    /// Batches fetched because the previous one had `more` set
    catch_up_iterations: usize,
    /// Whether a cached batch from an earlier run was replayed
    resumed_from_cache: bool,
    /// Number of full resets requested by the server
    refreshes: usize,
    started: Instant,
}

impl SyncProgressTracker {
    /// Create a new progress tracker starting from the given cursor.
    pub fn new(start_event_id: Option<EventId>) -> Self {
        Self {
            last_event_id: start_event_id.clone(),
            start_event_id,
            batches_applied: 0,
            events_applied: 0,
            events_ignored: 0,
            catch_up_iterations: 0,
            resumed_from_cache: false,
            refreshes: 0,
            started: Instant::now(),
        }
    }

    /// Record a committed batch
    pub fn record_batch(&mut self, event_id: &EventId, report: &ApplyReport) {
        self.batches_applied += 1;
        self.events_applied += report.dispatched;
        self.events_ignored += report.unhandled;
        self.last_event_id = Some(event_id.clone());
    }

    /// Record a committed batch that reset the stream instead of applying events
    pub fn record_refresh(&mut self, event_id: &EventId) {
        self.batches_applied += 1;
        self.refreshes += 1;
        self.last_event_id = Some(event_id.clone());
    }

    pub fn record_catch_up(&mut self) {
        self.catch_up_iterations += 1;
    }

    pub fn record_resumed_from_cache(&mut self) {
        self.resumed_from_cache = true;
    }

    /// Log progress of a long catch-up every 10 batches or when forced
    pub fn log_progress(&self, force: bool) {
        if force || (self.batches_applied > 0 && self.batches_applied % 10 == 0) {
            info!(
                "Sync progress: {} batches, {} events applied up to {:?}",
                self.batches_applied, self.events_applied, self.last_event_id
            );
        }
    }

    /// Get run statistics as a SyncStats struct
    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            start_event_id: self.start_event_id.clone(),
            final_event_id: self.last_event_id.clone(),
            batches_applied: self.batches_applied,
            events_applied: self.events_applied,
            events_ignored: self.events_ignored,
            catch_up_iterations: self.catch_up_iterations,
            resumed_from_cache: self.resumed_from_cache,
            refreshes: self.refreshes,
            elapsed_millis: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// Statistics about one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub start_event_id: Option<EventId>,
    pub final_event_id: Option<EventId>,
    pub batches_applied: usize,
    pub events_applied: usize,
    pub events_ignored: usize,
    pub catch_up_iterations: usize,
    pub resumed_from_cache: bool,
    pub refreshes: usize,
    pub elapsed_millis: u64,
}

impl SyncStats {
    /// Get a human-readable summary of the run statistics
    pub fn summary(&self) -> String {
        let cursor = |id: &Option<EventId>| {
            id.as_ref()
                .map_or_else(|| "<none>".to_string(), EventId::to_string)
        };
        format!(
            "Sync from {} to {}: {} batches, {} events applied, {} ignored, {} catch-up iterations{}{}",
            cursor(&self.start_event_id),
            cursor(&self.final_event_id),
            self.batches_applied,
            self.events_applied,
            self.events_ignored,
            self.catch_up_iterations,
            if self.resumed_from_cache {
                " (resumed from cache)"
            } else {
                ""
            },
            if self.refreshes > 0 {
                format!(" ({} refreshes)", self.refreshes)
            } else {
                String::new()
            }
        )
    }
}

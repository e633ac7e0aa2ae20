//! Dispatch of fetched batches to entity handlers.
//!
//! This module defines the `EventHandler` trait implemented by product modules, and the
//! `EventApplier` which holds the static capability table built at startup. Each handler declares
//! the scope kind it serves and the entity-type tags it consumes; the applier hands every handler
//! the matching subset of a batch, in server order, and handlers run in ascending `order`.
//!
//! A batch goes through three phases: `on_prepare` for every handler outside any transaction,
//! `apply` for every handler inside one [`BatchTransaction`], then `on_complete` with the result.
//! A failing handler rolls the whole batch back.
//!
//! Handlers must tolerate receiving the same batch twice: a batch is re-applied whenever the run
//! that applied it failed or was interrupted before its cursor was committed.

use crate::event_manager::{Action, ApplyError, EventManagerConfig, RawEvent};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Product-side consumer of applied events.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;

    /// Scope kind this handler serves, e.g. `core` or `calendar`.
    fn scope_kind(&self) -> &'static str;

    /// Entity-type tags this handler consumes.
    fn entity_types(&self) -> &[&'static str];

    /// Degrees of separation from the user entity; lower values are applied first so that
    /// parents exist before their children.
    fn order(&self) -> u32 {
        0
    }

    /// Called before the batch transaction with the created and updated entities of this
    /// handler's types, e.g. to fetch foreign entities. Not called when there are none.
    async fn on_prepare(
        &self,
        _config: &EventManagerConfig,
        _events: &[RawEvent],
    ) -> Result<(), ApplyError> {
        Ok(())
    }

    /// Apply the events of this handler's types, in server order.
    ///
    /// Runs inside the batch transaction and should return quickly.
    async fn apply(
        &self,
        config: &EventManagerConfig,
        events: &[RawEvent],
    ) -> Result<(), ApplyError>;

    /// Drop every local entity of this handler's types for the stream.
    async fn on_reset_all(&self, _config: &EventManagerConfig) -> Result<(), ApplyError> {
        Ok(())
    }

    /// Called after every batch or reset, whether it succeeded or not.
    async fn on_complete(
        &self,
        _config: &EventManagerConfig,
        _success: bool,
    ) -> Result<(), ApplyError> {
        Ok(())
    }
}

/// Unit of work spanning every handler's writes for one batch.
#[async_trait::async_trait]
pub trait BatchTransaction: Send + Sync {
    async fn begin(&self, config: &EventManagerConfig) -> Result<(), ApplyError>;

    async fn commit(&self, config: &EventManagerConfig) -> Result<(), ApplyError>;

    async fn rollback(&self, config: &EventManagerConfig) -> Result<(), ApplyError>;
}

/// For handlers whose writes need no coordination.
pub struct NoTransaction;

#[async_trait::async_trait]
impl BatchTransaction for NoTransaction {
    async fn begin(&self, _config: &EventManagerConfig) -> Result<(), ApplyError> {
        Ok(())
    }

    async fn commit(&self, _config: &EventManagerConfig) -> Result<(), ApplyError> {
        Ok(())
    }

    async fn rollback(&self, _config: &EventManagerConfig) -> Result<(), ApplyError> {
        Ok(())
    }
}

struct Registration {
    handler: Arc<dyn EventHandler>,
    entity_types: HashSet<&'static str>,
}

impl Registration {
    fn accepts(&self, event: &RawEvent) -> bool {
        self.entity_types.contains(event.entity_type.as_str())
    }
}

/// Summary of one applied batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Events handed to at least one handler.
    pub dispatched: usize,
    /// Events no registered handler consumes; ignored.
    pub unhandled: usize,
    /// Handlers that received a non-empty subset.
    pub handlers_invoked: usize,
}

/// Builder for the capability table.
#[derive(Default)]
pub struct EventApplierBuilder {
    handlers: Vec<Arc<dyn EventHandler>>,
    transaction: Option<Arc<dyn BatchTransaction>>,
}

impl EventApplierBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    pub fn register(self, handler: impl EventHandler + 'static) -> Self {
        self.register_shared(Arc::new(handler))
    }

    /// Register a handler that is also used elsewhere.
    pub fn register_shared(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Wrap every batch in `transaction`; defaults to [`NoTransaction`].
    pub fn transaction(mut self, transaction: Arc<dyn BatchTransaction>) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn build(self) -> EventApplier {
        let mut by_kind: HashMap<&'static str, Vec<Registration>> = HashMap::new();

        for handler in self.handlers {
            info!(
                "Registering event handler {} for {} ({:?})",
                handler.name(),
                handler.scope_kind(),
                handler.entity_types()
            );
            by_kind
                .entry(handler.scope_kind())
                .or_default()
                .push(Registration {
                    entity_types: handler.entity_types().iter().copied().collect(),
                    handler,
                });
        }

        // Stable: handlers of equal order keep registration order.
        for registrations in by_kind.values_mut() {
            registrations.sort_by_key(|r| r.handler.order());
        }

        EventApplier {
            by_kind,
            transaction: self.transaction.unwrap_or_else(|| Arc::new(NoTransaction)),
        }
    }
}

/// Static capability table mapping scope kinds and entity types to handlers.
pub struct EventApplier {
    by_kind: HashMap<&'static str, Vec<Registration>>,
    transaction: Arc<dyn BatchTransaction>,
}

impl EventApplier {
    pub fn builder() -> EventApplierBuilder {
        EventApplierBuilder::new()
    }

    fn registrations(&self, config: &EventManagerConfig) -> &[Registration] {
        self.by_kind
            .get(config.kind())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether any handler serves the stream's scope kind.
    pub fn handles(&self, config: &EventManagerConfig) -> bool {
        !self.registrations(config).is_empty()
    }

    /// Apply one batch atomically.
    ///
    /// The first handler failure rolls back every write of the batch and is returned, leaving the
    /// batch to be re-applied as a whole.
    pub async fn apply(
        &self,
        config: &EventManagerConfig,
        events: &[RawEvent],
    ) -> Result<ApplyReport, ApplyError> {
        let registrations = self.registrations(config);
        let subsets: Vec<(&Registration, Vec<RawEvent>)> = registrations
            .iter()
            .map(|registration| {
                let subset = events
                    .iter()
                    .filter(|e| registration.accepts(e))
                    .cloned()
                    .collect::<Vec<_>>();
                (registration, subset)
            })
            .filter(|(_, subset)| !subset.is_empty())
            .collect();

        let result = self.apply_subsets(config, &subsets).await;
        self.complete(config, result.is_ok()).await;
        result?;

        let mut report = ApplyReport {
            handlers_invoked: subsets.len(),
            ..Default::default()
        };
        for event in events {
            if registrations.iter().any(|r| r.accepts(event)) {
                report.dispatched += 1;
            } else {
                report.unhandled += 1;
            }
        }

        if report.unhandled > 0 {
            debug!(
                "Ignored {} events without handler for {}",
                report.unhandled, config
            );
        }

        Ok(report)
    }

    async fn apply_subsets(
        &self,
        config: &EventManagerConfig,
        subsets: &[(&Registration, Vec<RawEvent>)],
    ) -> Result<(), ApplyError> {
        for (registration, subset) in subsets {
            let upserts: Vec<RawEvent> = subset
                .iter()
                .filter(|e| e.action != Action::Delete)
                .cloned()
                .collect();
            if upserts.is_empty() {
                continue;
            }
            if let Err(e) = registration.handler.on_prepare(config, &upserts).await {
                error!(
                    "Handler {} failed to prepare batch for {}: {}",
                    registration.handler.name(),
                    config,
                    e
                );
                return Err(e);
            }
        }

        self.transaction.begin(config).await?;
        for (registration, subset) in subsets {
            debug!(
                "Handler {} applying {} events for {}",
                registration.handler.name(),
                subset.len(),
                config
            );
            if let Err(e) = registration.handler.apply(config, subset).await {
                error!(
                    "Handler {} failed to apply batch for {}: {}",
                    registration.handler.name(),
                    config,
                    e
                );
                if let Err(rollback) = self.transaction.rollback(config).await {
                    error!("Failed to roll back batch for {}: {}", config, rollback);
                }
                return Err(e);
            }
        }
        self.transaction.commit(config).await
    }

    async fn complete(&self, config: &EventManagerConfig, success: bool) {
        for registration in self.registrations(config) {
            if let Err(e) = registration.handler.on_complete(config, success).await {
                warn!(
                    "Handler {} failed to complete for {}: {}",
                    registration.handler.name(),
                    config,
                    e
                );
            }
        }
    }

    /// Ask every handler of the stream to drop its local state, in handler order.
    pub async fn reset_all(&self, config: &EventManagerConfig) -> Result<(), ApplyError> {
        for registration in self.registrations(config) {
            info!(
                "Handler {} resetting all entities for {}",
                registration.handler.name(),
                config
            );
            registration.handler.on_reset_all(config).await?;
        }
        self.complete(config, false).await;
        Ok(())
    }
}

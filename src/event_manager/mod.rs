pub mod sync;
pub mod types;

pub use sync::{
	EventApplier, EventApplierBuilder, EventFetcher, EventHandler, EventManager,
	EventManagerSettings, EventMetadataRepository, EventWorkerManager, ProcessOutcome,
};
pub use types::*;

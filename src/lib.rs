//! Incremental event synchronization.
//!
//! Keeps per-user, per-scope local state consistent with a remote event stream by fetching
//! batches of changes after a persisted cursor and handing them to registered handlers. See
//! [`event_manager`] for the sync core and [`api`] for the HTTP transport.

pub mod api;
pub mod event_manager;
pub mod utils;

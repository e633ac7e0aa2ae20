//! HTTP transport for the remote event endpoints.
//!
//! This module provides the client and wire types used to talk to the event API. The API exposes,
//! per user and per event scope, a "latest cursor" endpoint and a paginated "events since cursor"
//! endpoint. Both are authenticated with the session of the user owning the stream.

/// Reqwest based client implementing the event transport
mod client;
/// Wire types, sessions and transport errors
mod types;

pub use client::{ApiClient, ApiConfig, parse_events_response};
pub use types::*;

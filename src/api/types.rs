//! Types for the event API transport

use crate::event_manager::UserId;

use serde::Deserialize;
use std::collections::HashMap;

/// Response code the API uses for a successful call.
pub const RESPONSE_CODE_OK: u32 = 1000;

/// Body of the "latest cursor" endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LatestEventIdResponse {
    #[serde(rename = "Code", default)]
    pub code: Option<u32>,
    /// The most recent cursor known to the server for this stream.
    #[serde(rename = "EventID")]
    pub event_id: String,
}

/// Error body returned alongside non-2xx statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(rename = "Code")]
    pub code: u32,
    #[serde(rename = "Error", default)]
    pub error: Option<String>,
}

/// Authenticated session used to sign requests for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub uid: String,
    pub access_token: String,
}

/// Source of sessions, owned by the authentication collaborator.
///
/// Returning `None` means the user has no valid session; requests for that user fail with
/// [`ApiError::NoSession`] and the sync core treats it as an authorization failure.
#[async_trait::async_trait]
pub trait SessionProvider: Send + Sync {
    async fn session(&self, user_id: &UserId) -> Option<Session>;
}

/// Session provider backed by a fixed map, used by the binary and by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionProvider {
    sessions: HashMap<UserId, Session>,
}

impl StaticSessionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, user_id: UserId, session: Session) -> Self {
        self.sessions.insert(user_id, session);
        self
    }
}

#[async_trait::async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn session(&self, user_id: &UserId) -> Option<Session> {
        self.sessions.get(user_id).cloned()
    }
}

/// Error types for event API calls
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("API returned status {status} (code {code:?}): {message}")]
    StatusError {
        status: u16,
        code: Option<u32>,
        message: String,
    },

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("No session for user {0}")]
    NoSession(String),

    #[error("No endpoint for scope {0}")]
    UnknownEndpoint(String),
}

impl ApiError {
    /// Connection issues, timeouts, throttling and 5xx responses are worth retrying later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::HttpError(e) => !e.is_decode() && !e.is_builder(),
            ApiError::StatusError { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }

    /// The session is missing or was rejected by the server.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            ApiError::NoSession(_) => true,
            ApiError::StatusError { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> ApiError {
        ApiError::StatusError {
            status,
            code: None,
            message: String::new(),
        }
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(422).is_retryable());
    }

    #[test]
    fn rejected_sessions_are_unauthorized() {
        assert!(status(401).is_unauthorized());
        assert!(status(403).is_unauthorized());
        assert!(ApiError::NoSession("u1".into()).is_unauthorized());
        assert!(!status(500).is_unauthorized());
    }

    #[tokio::test]
    async fn static_provider_returns_registered_session() {
        let provider = StaticSessionProvider::new().with_session(
            UserId::from("u1"),
            Session {
                uid: "uid-1".into(),
                access_token: "token".into(),
            },
        );

        assert!(provider.session(&UserId::from("u1")).await.is_some());
        assert!(provider.session(&UserId::from("u2")).await.is_none());
    }
}

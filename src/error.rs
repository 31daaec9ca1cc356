//! Error taxonomy for the client core.
//!
//! Every transport-level failure is normalized into [`ApiError`] (status, body,
//! originating URL) so callers can branch on the status code without
//! re-parsing reqwest or tungstenite error shapes. [`ClientError`] classifies
//! those failures into the categories the session layer reacts to.

use serde_json::Value;
use thiserror::Error;

/// Uniform failure shape produced by the request interceptor.
///
/// `status` is `None` when no HTTP response was received (DNS, connect,
/// timeout, body decode).
#[derive(Debug, Clone, Error)]
#[error("{method} {url} failed ({}): {message}", status_label(*.status))]
pub struct ApiError {
    pub status: Option<u16>,
    pub body: Value,
    pub url: String,
    pub method: String,
    pub message: String,
}

fn status_label(status: Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {code}"),
        None => "no response".to_string(),
    }
}

impl ApiError {
    /// Build from a non-success HTTP response body.
    pub fn from_status(method: &str, url: &str, status: u16, body_text: &str) -> Self {
        let body = serde_json::from_str::<Value>(body_text)
            .unwrap_or_else(|_| Value::String(body_text.to_string()));
        let message = body
            .get("error")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {status}"));
        Self {
            status: Some(status),
            body,
            url: url.to_string(),
            method: method.to_string(),
            message,
        }
    }

    /// Build from a transport failure where no response arrived.
    pub fn transport(method: &str, url: &str, err: &reqwest::Error) -> Self {
        Self {
            status: err.status().map(|s| s.as_u16()),
            body: Value::Null,
            url: url.to_string(),
            method: method.to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }

    pub fn is_forbidden(&self) -> bool {
        self.status == Some(403)
    }

    /// Network errors, timeouts and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(code) => code >= 500 || code == 408 || code == 429,
        }
    }
}

/// Outcome classification for the client core.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Network error, timeout or 5xx. Session state is untouched.
    #[error("transient failure: {0}")]
    Transient(ApiError),

    /// The refresh credential was rejected. The session is over.
    #[error("authentication failed: {0}")]
    Unauthenticated(ApiError),

    /// 403 on a scoped resource. Only that resource is affected.
    #[error("access to {url} forbidden", url = .0.url)]
    Forbidden(ApiError),

    /// Any other non-success response.
    #[error(transparent)]
    Api(ApiError),

    /// Local input rejected before any network traffic.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Operation requires an authenticated session.
    #[error("not logged in")]
    NotLoggedIn,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("request cancelled")]
    Cancelled,
}

impl ClientError {
    /// Classify a normalized API error.
    pub fn from_api(err: ApiError) -> Self {
        if err.is_unauthorized() {
            ClientError::Unauthenticated(err)
        } else if err.is_forbidden() {
            ClientError::Forbidden(err)
        } else if err.is_transient() {
            ClientError::Transient(err)
        } else {
            ClientError::Api(err)
        }
    }

    /// HTTP status carried by the underlying response, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Transient(e)
            | ClientError::Unauthenticated(e)
            | ClientError::Forbidden(e)
            | ClientError::Api(e) => e.status,
            _ => None,
        }
    }

    /// Whether a user-visible "try again" affordance makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}

impl From<crate::storage::StorageError> for ClientError {
    fn from(err: crate::storage::StorageError) -> Self {
        ClientError::Storage(err.to_string())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

//! Refresh endpoint client and failure classification.
//!
//! `POST /auth/refresh` carries no body. The refresh credential is the
//! `refresh_token` cookie (`HttpOnly; SameSite=Lax; Path=/`) that the backend
//! set at login; it lives in the shared reqwest cookie jar and is never read
//! by this code.
//!
//! Classification:
//! - 401 → the refresh credential is invalid, the session must end
//! - anything else (network, timeout, 5xx, other 4xx) → transient, the
//!   existing session is preserved

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::routes::REFRESH_PATH;
use crate::error::ApiError;

/// Cookie name the backend uses for the refresh credential.
pub const REFRESH_COOKIE_NAME: &str = "refresh_token";

/// Body of a successful refresh (and login) response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshResponse {
    pub token: String,
    #[serde(default, rename = "userID", alias = "userId", alias = "user_id")]
    pub user_id: Option<String>,
}

/// Why a refresh did not produce a token.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    /// 401 after the single retry: the refresh credential is gone.
    #[error("refresh rejected: {0}")]
    Rejected(ApiError),
    /// Network/server trouble after all attempts. Session stays intact.
    #[error("refresh failed transiently: {0}")]
    Transient(ApiError),
}

impl RefreshError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, RefreshError::Rejected(_))
    }

    pub fn api_error(&self) -> &ApiError {
        match self {
            RefreshError::Rejected(e) | RefreshError::Transient(e) => e,
        }
    }
}

/// Retry policy for the refresh call.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// Delay before the single retry of a 401 (cookie attachment can lag on
    /// some clients right after login).
    pub unauthorized_retry_delay: Duration,
    /// Total attempts for non-401 failures.
    pub max_attempts: u32,
    /// First backoff delay for non-401 failures; doubles per attempt.
    pub backoff_base: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            unauthorized_retry_delay: Duration::from_millis(500),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RefreshPolicy {
    /// Backoff before transient attempt `attempt` (1-based count of failures so far).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Performs the refresh network call.
#[derive(Clone)]
pub struct RefreshClient {
    http: reqwest::Client,
    url: String,
    policy: RefreshPolicy,
}

impl RefreshClient {
    /// `http` must be the cookie-enabled client shared with the API client.
    pub fn new(http: reqwest::Client, api_base_url: &str, policy: RefreshPolicy) -> Self {
        let url = format!("{}{}", api_base_url.trim_end_matches('/'), REFRESH_PATH);
        Self { http, url, policy }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Refresh with the retry policy applied.
    pub async fn refresh(&self) -> Result<RefreshResponse, RefreshError> {
        let mut retried_unauthorized = false;
        let mut transient_failures = 0u32;

        loop {
            match self.attempt().await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_unauthorized() => {
                    if retried_unauthorized {
                        warn!(url = %self.url, "Refresh rejected twice, credential invalid");
                        return Err(RefreshError::Rejected(err));
                    }
                    retried_unauthorized = true;
                    debug!(
                        delay_ms = self.policy.unauthorized_retry_delay.as_millis() as u64,
                        "Refresh returned 401, retrying once"
                    );
                    tokio::time::sleep(self.policy.unauthorized_retry_delay).await;
                }
                Err(err) => {
                    transient_failures += 1;
                    if transient_failures >= self.policy.max_attempts {
                        warn!(
                            attempts = transient_failures,
                            status = ?err.status,
                            "Refresh failed transiently, keeping session"
                        );
                        return Err(RefreshError::Transient(err));
                    }
                    let delay = self.policy.backoff_for(transient_failures);
                    debug!(
                        attempt = transient_failures,
                        delay_ms = delay.as_millis() as u64,
                        status = ?err.status,
                        "Refresh failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Exactly one network call.
    async fn attempt(&self) -> Result<RefreshResponse, ApiError> {
        let resp = self
            .http
            .post(&self.url)
            .send()
            .await
            .map_err(|e| ApiError::transport("POST", &self.url, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_status(
                "POST",
                &self.url,
                status.as_u16(),
                &body,
            ));
        }

        resp.json::<RefreshResponse>()
            .await
            .map_err(|e| ApiError::transport("POST", &self.url, &e))
    }
}

// ============================================================================
// Tests
// ============================================================================

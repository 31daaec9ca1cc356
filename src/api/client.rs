//! REST client with the request interceptor.
//!
//! Every request goes through [`ApiClient::request_json`]:
//! 1. Unauthenticated routes (login, register, refresh, public validation)
//!    are sent as-is and never trigger token logic.
//! 2. Other routes carry `Authorization: Bearer <token>`.
//! 3. A 401 on an authenticated route, when a session marker exists and the
//!    request has not been retried yet, waits on the coordinated refresh and
//!    retries once with the new token. If the refresh fails, the caller gets
//!    the original 401, not the refresh error.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::routes;
use crate::auth::SessionCoordinator;
use crate::error::{ApiError, ClientError, ClientResult};

/// Build the cookie-enabled HTTP client shared by the API and refresh clients.
pub fn build_http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;
    reqwest::Client::builder()
        .cookie_store(true)
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    coordinator: Arc<SessionCoordinator>,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, base_url: &str, coordinator: Arc<SessionCoordinator>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            coordinator,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and return the JSON body (`Value::Null` for empty bodies).
    pub async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ClientResult<Value> {
        let url = self.url(path);
        let public = routes::is_unauthenticated_route(path);
        let mut retried = false;

        loop {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .header(ACCEPT, "application/json");
            if !public {
                if let Some(token) = self.coordinator.get_token() {
                    req = req.bearer_auth(token);
                }
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| ClientError::from_api(ApiError::transport(method.as_str(), &url, &e)))?;

            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();

            if status.is_success() {
                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_str(&text).map_err(|e| {
                    ClientError::Api(ApiError {
                        status: Some(status.as_u16()),
                        body: Value::String(text.clone()),
                        url: url.clone(),
                        method: method.to_string(),
                        message: format!("invalid JSON body: {e}"),
                    })
                });
            }

            let err = ApiError::from_status(method.as_str(), &url, status.as_u16(), &text);

            if err.is_unauthorized()
                && !public
                && !retried
                && self.coordinator.tokens().has_session_marker()
            {
                retried = true;
                debug!(url = %url, "401 on authenticated route, awaiting refresh");
                match self.coordinator.refresh().await {
                    Ok(_) => continue,
                    Err(refresh_err) => {
                        debug!(url = %url, error = %refresh_err, "Refresh failed, surfacing original 401");
                        return Err(ClientError::from_api(err));
                    }
                }
            }

            return Err(ClientError::from_api(err));
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let value = self.request_json(Method::GET, path, None).await?;
        decode(value, "GET", &self.url(path))
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> ClientResult<T> {
        let body = encode(body)?;
        let value = self.request_json(Method::POST, path, Some(&body)).await?;
        decode(value, "POST", &self.url(path))
    }

    pub async fn patch<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> ClientResult<T> {
        let body = encode(body)?;
        let value = self.request_json(Method::PATCH, path, Some(&body)).await?;
        decode(value, "PATCH", &self.url(path))
    }

    pub async fn delete(&self, path: &str) -> ClientResult<()> {
        self.request_json(Method::DELETE, path, None).await?;
        Ok(())
    }
}

fn encode<B: Serialize>(body: &B) -> ClientResult<Value> {
    serde_json::to_value(body)
        .map_err(|e| ClientError::Validation(format!("unserializable request body: {e}")))
}

fn decode<T: DeserializeOwned>(value: Value, method: &str, url: &str) -> ClientResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| {
        ClientError::Api(ApiError {
            status: None,
            body: value,
            url: url.to_string(),
            method: method.to_string(),
            message: format!("unexpected response shape: {e}"),
        })
    })
}

//! Sprintdesk client core
//!
//! Session and cache plumbing for the Sprintdesk project-management backend:
//! - Access token lifecycle with single-flight refresh
//! - REST interceptor that recovers transparently from one 401
//! - Session state machine with an explicit, ordered logout
//! - Read-through query cache invalidated by a realtime WebSocket channel
//!
//! [`AppClient`] wires every piece together; one instance is one "tab".

pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod error;
pub mod realtime;
pub mod resource;
pub mod selection;
pub mod session;
pub mod storage;

pub use client::AppClient;
pub use error::{ApiError, ClientError, ClientResult};
pub use session::{SessionBus, SessionEvent, SessionState};

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use auth::RefreshPolicy;
use realtime::RealtimeConfig;

/// Default location of the YAML config file.
pub const DEFAULT_CONFIG_FILE: &str = "sprintdesk.yaml";

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub api: ApiYamlConfig,
    pub session: SessionYamlConfig,
    pub realtime: RealtimeYamlConfig,
}

/// Backend endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiYamlConfig {
    pub base_url: String,
    /// Derived from `base_url` when absent.
    pub ws_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApiYamlConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            ws_url: None,
            request_timeout_secs: 30,
        }
    }
}

/// Token and refresh settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionYamlConfig {
    pub data_dir: Option<String>,
    /// Descriptive only; tokens are never validated locally.
    pub token_issuer: Option<String>,
    pub token_audience: Option<String>,
    pub expiry_buffer_secs: u64,
    pub refresh_401_retry_delay_ms: u64,
    pub refresh_max_attempts: u32,
    pub refresh_backoff_base_ms: u64,
}

impl Default for SessionYamlConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            token_issuer: None,
            token_audience: None,
            expiry_buffer_secs: 30,
            refresh_401_retry_delay_ms: 500,
            refresh_max_attempts: 3,
            refresh_backoff_base_ms: 500,
        }
    }
}

/// Realtime channel settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeYamlConfig {
    pub path: String,
    pub ws_refresh_lead_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub heartbeat_secs: u64,
}

impl Default for RealtimeYamlConfig {
    fn default() -> Self {
        Self {
            path: "/ws".into(),
            ws_refresh_lead_secs: 600,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 30_000,
            heartbeat_secs: 30,
        }
    }
}

// ============================================================================
// Runtime config (what the client actually uses)
// ============================================================================

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub ws_path: String,
    pub data_dir: PathBuf,
    pub token_issuer: Option<String>,
    pub token_audience: Option<String>,
    pub expiry_buffer_secs: u64,
    pub ws_refresh_lead_secs: u64,
    pub refresh_401_retry_delay_ms: u64,
    pub refresh_max_attempts: u32,
    pub refresh_backoff_base_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub heartbeat_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_yaml(YamlConfig::default())
    }
}

impl Config {
    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries `sprintdesk.yaml` in CWD. A missing file
    /// falls back to env vars / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let yaml = Self::load_yaml(yaml_path);
        let mut config = Self::from_yaml(yaml.clone());

        if let Ok(url) = std::env::var("SPRINTDESK_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
            // An explicit WS origin still wins; otherwise follow the new API origin.
            if yaml.api.ws_url.is_none() {
                config.ws_base_url = derive_ws_url(&config.api_base_url);
            }
        }
        if let Ok(url) = std::env::var("SPRINTDESK_WS_URL") {
            config.ws_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(dir) = std::env::var("SPRINTDESK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(issuer) = std::env::var("SPRINTDESK_TOKEN_ISSUER") {
            config.token_issuer = Some(issuer);
        }
        if let Ok(audience) = std::env::var("SPRINTDESK_TOKEN_AUDIENCE") {
            config.token_audience = Some(audience);
        }
        Ok(config)
    }

    fn from_yaml(yaml: YamlConfig) -> Self {
        let api_base_url = yaml.api.base_url.trim_end_matches('/').to_string();
        let ws_base_url = yaml
            .api
            .ws_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_ws_url(&api_base_url));
        let data_dir = yaml
            .session
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        Self {
            api_base_url,
            ws_base_url,
            ws_path: yaml.realtime.path,
            data_dir,
            token_issuer: yaml.session.token_issuer,
            token_audience: yaml.session.token_audience,
            expiry_buffer_secs: yaml.session.expiry_buffer_secs,
            ws_refresh_lead_secs: yaml.realtime.ws_refresh_lead_secs,
            refresh_401_retry_delay_ms: yaml.session.refresh_401_retry_delay_ms,
            refresh_max_attempts: yaml.session.refresh_max_attempts,
            refresh_backoff_base_ms: yaml.session.refresh_backoff_base_ms,
            reconnect_base_ms: yaml.realtime.reconnect_base_ms,
            reconnect_max_ms: yaml.realtime.reconnect_max_ms,
            heartbeat_secs: yaml.realtime.heartbeat_secs,
            request_timeout_secs: yaml.api.request_timeout_secs,
        }
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }

    pub fn expiry_buffer(&self) -> Duration {
        Duration::from_secs(self.expiry_buffer_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            unauthorized_retry_delay: Duration::from_millis(self.refresh_401_retry_delay_ms),
            max_attempts: self.refresh_max_attempts.max(1),
            backoff_base: Duration::from_millis(self.refresh_backoff_base_ms),
        }
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            ws_base_url: self.ws_base_url.clone(),
            path: self.ws_path.clone(),
            refresh_lead: Duration::from_secs(self.ws_refresh_lead_secs),
            reconnect_base: Duration::from_millis(self.reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
            heartbeat: Duration::from_secs(self.heartbeat_secs),
        }
    }
}

/// `http` → `ws`, `https` → `wss`; anything else is kept as is.
pub fn derive_ws_url(api_base_url: &str) -> String {
    if let Some(rest) = api_base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_base_url.to_string()
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("sprintdesk"))
        .unwrap_or_else(|| PathBuf::from(".sprintdesk"))
}

// ============================================================================
// Tests
// ============================================================================

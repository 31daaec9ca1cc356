//! Realtime connection scoped to one project.
//!
//! Lifecycle of one `connect`:
//! 1. `ensure_fresh(10 min)` on the coordinator, token appended to the URI
//! 2. on open: subscribe frame, heartbeat every `heartbeat` interval
//! 3. inbound frames parsed and applied to the cache
//! 4. on close: 4001 ends the session, 4003 (or a "forbidden" reason) revokes
//!    the project, anything else reconnects with exponential backoff
//!
//! Every connect and disconnect advances the generation. Each task, timer and
//! frame handler holds a [`Ticket`] issued at scheduling time and does nothing
//! once a newer generation exists.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::invalidation;
use super::message::{self, RealtimeEvent};
use crate::auth::SessionCoordinator;
use crate::cache::QueryCache;
use crate::session::SessionEvent;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Close code the backend sends when the token is not accepted.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Close code the backend sends when the user may not see the project.
pub const CLOSE_FORBIDDEN: u16 = 4003;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// `ws://` or `wss://` origin.
    pub ws_base_url: String,
    pub path: String,
    /// Refresh before connecting when the token expires within this window.
    pub refresh_lead: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub heartbeat: Duration,
}

impl RealtimeConfig {
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: ws_base_url.into(),
            path: "/ws".to_string(),
            refresh_lead: Duration::from_secs(600),
            reconnect_base: Duration::from_millis(1000),
            reconnect_max: Duration::from_secs(30),
            heartbeat: Duration::from_secs(30),
        }
    }

    /// Connection URI carrying the token; the transport has no headers.
    pub fn endpoint(&self, token: &str) -> anyhow::Result<Url> {
        let base = self.ws_base_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}{}", self.path))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }

    /// `min(base * 2^attempt, max)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.reconnect_base
            .saturating_mul(factor)
            .min(self.reconnect_max)
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Normal,
    AuthFailed,
    Forbidden,
    Transient,
}

impl CloseKind {
    /// No reconnect after these.
    pub fn is_terminal(self) -> bool {
        matches!(self, CloseKind::AuthFailed | CloseKind::Forbidden)
    }
}

/// Classify a close frame. The reason text wins over the code for forbidden.
pub fn classify_close(code: Option<u16>, reason: &str) -> CloseKind {
    let reason = reason.to_ascii_lowercase();
    if code == Some(CLOSE_FORBIDDEN) || reason.contains("forbidden") || reason.contains("not authorized") {
        return CloseKind::Forbidden;
    }
    match code {
        Some(CLOSE_AUTH_FAILED) => CloseKind::AuthFailed,
        Some(1000) => CloseKind::Normal,
        _ => CloseKind::Transient,
    }
}

/// Observable channel status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Idle,
    Connecting { project_id: String, attempt: u32 },
    Open { project_id: String },
    Reconnecting { project_id: String, attempt: u32, delay: Duration },
    Closed { project_id: String, kind: CloseKind },
}

/// Monotonic connection generation.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Start a new generation and return a ticket for it.
    pub fn advance(&self) -> Ticket {
        let issued = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ticket {
            issued,
            live: Arc::clone(&self.0),
        }
    }
}

/// Captured generation of a scheduled callback.
#[derive(Debug, Clone)]
pub struct Ticket {
    issued: u64,
    live: Arc<AtomicU64>,
}

impl Ticket {
    pub fn generation(&self) -> u64 {
        self.issued
    }

    pub fn is_current(&self) -> bool {
        self.live.load(Ordering::SeqCst) == self.issued
    }
}

struct ActiveConnection {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct RealtimeChannel {
    config: RealtimeConfig,
    coordinator: Arc<SessionCoordinator>,
    cache: Arc<QueryCache>,
    generation: Generation,
    active: Mutex<Option<ActiveConnection>>,
    status: watch::Sender<ChannelStatus>,
    connect_attempts: AtomicU64,
}

impl RealtimeChannel {
    pub fn new(config: RealtimeConfig, coordinator: Arc<SessionCoordinator>, cache: Arc<QueryCache>) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Idle);
        Self {
            config,
            coordinator,
            cache,
            generation: Generation::default(),
            active: Mutex::new(None),
            status,
            connect_attempts: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.generation.current()
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    /// WebSocket handshakes attempted since creation.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Connect to `project_id`, superseding any current connection.
    pub fn connect(self: &Arc<Self>, project_id: &str) -> Ticket {
        let ticket = self.generation.advance();
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let task_ticket = ticket.clone();
        let task_cancel = cancel.clone();
        let project_id = project_id.to_string();

        debug!(generation = ticket.generation(), project_id = %project_id, "Realtime connect");
        let handle = tokio::spawn(async move {
            this.run(task_ticket, project_id, task_cancel).await;
        });
        self.replace_active(Some(ActiveConnection { cancel, handle }));
        ticket
    }

    /// Stop the current connection and every timer it scheduled.
    pub fn disconnect(&self) {
        let ticket = self.generation.advance();
        debug!(generation = ticket.generation(), "Realtime disconnect");
        self.replace_active(None);
        self.status.send_replace(ChannelStatus::Idle);
    }

    fn replace_active(&self, next: Option<ActiveConnection>) {
        let previous = match self.active.lock() {
            Ok(mut active) => std::mem::replace(&mut *active, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
            drop(previous.handle);
        }
    }

    fn set_status(&self, ticket: &Ticket, status: ChannelStatus) {
        if ticket.is_current() {
            self.status.send_replace(status);
        }
    }

    // ========================================================================
    // Connection loop
    // ========================================================================

    async fn run(self: Arc<Self>, ticket: Ticket, project_id: String, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            if !ticket.is_current() || cancel.is_cancelled() {
                return;
            }
            self.set_status(
                &ticket,
                ChannelStatus::Connecting {
                    project_id: project_id.clone(),
                    attempt,
                },
            );

            let (kind, opened) = match self.coordinator.ensure_fresh(self.config.refresh_lead).await {
                Err(e) if e.is_rejected() => {
                    // The coordinator already published RefreshRejected.
                    debug!(generation = ticket.generation(), "No token for realtime, session ending");
                    self.set_status(
                        &ticket,
                        ChannelStatus::Closed {
                            project_id,
                            kind: CloseKind::AuthFailed,
                        },
                    );
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Token refresh before realtime connect failed");
                    (CloseKind::Transient, false)
                }
                Ok(token) => self.connect_once(&ticket, &project_id, &token, &cancel).await,
            };

            if !ticket.is_current() || cancel.is_cancelled() {
                return;
            }

            match kind {
                CloseKind::AuthFailed => {
                    warn!(project_id = %project_id, "Realtime authentication failed, ending session");
                    self.coordinator.session().publish(SessionEvent::RealtimeAuthFailed {
                        origin: self.coordinator.session().origin(),
                    });
                    self.set_status(&ticket, ChannelStatus::Closed { project_id, kind });
                    return;
                }
                CloseKind::Forbidden => {
                    warn!(project_id = %project_id, "Realtime access to project revoked");
                    self.coordinator.session().publish(SessionEvent::ScopeRevoked {
                        origin: self.coordinator.session().origin(),
                        project_id: project_id.clone(),
                    });
                    self.set_status(&ticket, ChannelStatus::Closed { project_id, kind });
                    return;
                }
                CloseKind::Normal | CloseKind::Transient => {}
            }

            if opened {
                attempt = 0;
            }
            let delay = self.config.backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(
                generation = ticket.generation(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Realtime reconnect scheduled"
            );
            self.set_status(
                &ticket,
                ChannelStatus::Reconnecting {
                    project_id: project_id.clone(),
                    attempt,
                    delay,
                },
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// One handshake plus the life of the resulting socket. The flag tells
    /// whether the socket opened at all.
    async fn connect_once(
        &self,
        ticket: &Ticket,
        project_id: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> (CloseKind, bool) {
        let url = match self.config.endpoint(token) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Invalid realtime URL");
                return (CloseKind::Transient, false);
            }
        };
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = cancel.cancelled() => return (CloseKind::Normal, false),
        };

        match connected {
            Ok((socket, _response)) => {
                if !ticket.is_current() {
                    return (CloseKind::Normal, true);
                }
                info!(generation = ticket.generation(), project_id = %project_id, "Realtime connected");
                self.set_status(
                    ticket,
                    ChannelStatus::Open {
                        project_id: project_id.to_string(),
                    },
                );
                (self.drive(socket, ticket, project_id, cancel).await, true)
            }
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                debug!(status, "Realtime upgrade rejected");
                let kind = match status {
                    401 => CloseKind::AuthFailed,
                    403 => CloseKind::Forbidden,
                    _ => CloseKind::Transient,
                };
                (kind, false)
            }
            Err(e) => {
                debug!(error = %e, "Realtime connect failed");
                (CloseKind::Transient, false)
            }
        }
    }

    async fn drive(
        &self,
        socket: Socket,
        ticket: &Ticket,
        project_id: &str,
        cancel: &CancellationToken,
    ) -> CloseKind {
        let (mut sink, mut stream) = socket.split();

        if sink
            .send(Message::Text(message::subscribe_frame(project_id)))
            .await
            .is_err()
        {
            return CloseKind::Transient;
        }

        let mut heartbeat = interval(self.config.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: Cow::Borrowed("client disconnect"),
                        })))
                        .await;
                    return CloseKind::Normal;
                }

                _ = heartbeat.tick() => {
                    if !ticket.is_current() {
                        return CloseKind::Normal;
                    }
                    if sink.send(Message::Text(message::heartbeat_frame())).await.is_err() {
                        debug!("Heartbeat send failed");
                        return CloseKind::Transient;
                    }
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(ticket, &text).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                                .unwrap_or((None, String::new()));
                            let kind = classify_close(code, &reason);
                            debug!(code = ?code, reason = %reason, kind = ?kind, "Realtime closed by server");
                            return kind;
                        }
                        // Ping/pong are answered by tungstenite
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "Realtime read error");
                            return CloseKind::Transient;
                        }
                        None => return CloseKind::Transient,
                    }
                }
            }
        }
    }

    /// Apply one inbound text frame. No-op for a superseded generation.
    pub async fn handle_frame(&self, ticket: &Ticket, text: &str) {
        if !ticket.is_current() {
            debug!(generation = ticket.generation(), "Dropping frame from stale generation");
            return;
        }
        match message::parse(text) {
            Ok(RealtimeEvent::Invalidate(inv)) => {
                invalidation::apply(&self.cache, &inv).await;
            }
            Ok(RealtimeEvent::Control(kind)) => {
                debug!(kind = %kind, "Realtime control frame");
            }
            Ok(RealtimeEvent::Error { code, message }) => {
                warn!(code = ?code, message = %message, "Realtime server error");
            }
            Ok(RealtimeEvent::Ignored(kind)) => {
                debug!(kind = %kind, "Ignoring realtime event");
            }
            Err(e) => {
                warn!(error = %e, "Malformed realtime frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let config = RealtimeConfig {
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_millis(1000),
            ..RealtimeConfig::new("ws://localhost")
        };
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_close_classification() {
        assert_eq!(classify_close(Some(1000), ""), CloseKind::Normal);
        assert_eq!(classify_close(Some(4001), "token expired"), CloseKind::AuthFailed);
        assert_eq!(classify_close(Some(4003), ""), CloseKind::Forbidden);
        assert_eq!(classify_close(Some(1008), "Not authorized for project"), CloseKind::Forbidden);
        assert_eq!(classify_close(Some(1006), ""), CloseKind::Transient);
        assert_eq!(classify_close(None, ""), CloseKind::Transient);
        assert!(CloseKind::Forbidden.is_terminal());
        assert!(!CloseKind::Normal.is_terminal());
    }

    #[test]
    fn test_endpoint_carries_token() {
        let config = RealtimeConfig::new("wss://api.example.com/");
        let url = config.endpoint("abc.def").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/ws");
        assert_eq!(url.query(), Some("token=abc.def"));
    }

    #[test]
    fn test_ticket_goes_stale_on_advance() {
        let generation = Generation::default();
        let first = generation.advance();
        assert!(first.is_current());
        let second = generation.advance();
        assert!(!first.is_current());
        assert!(second.is_current());
        assert_eq!(second.generation(), first.generation() + 1);
    }
}

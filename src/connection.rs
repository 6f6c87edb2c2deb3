//! Realtime connection lifecycle.
//!
//! [`ConnectionManager`] owns the WebSocket for the whole session:
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──open──► Open
//!       ▲                         │                 │
//!       │   backoff (d, 2d, 4d…)  │ error           │ error / close
//!       └────────◄────────────────┴────────◄────────┤
//!       │                                           │ idle timeout
//!   exhausted → ReconnectExhausted          SuspendedIdle ──activity──► Connecting
//! ```
//!
//! One spawned supervisor task drives the machine: it dials, splits the
//! stream, pumps outgoing frames from an mpsc channel, emits every inbound
//! text frame as a [`ConnectionEvent`], and handles reconnection with capped
//! exponential backoff. Prolonged *user* inactivity (not network silence)
//! suspends the transport deliberately; the next call to
//! [`ConnectionManager::notify_activity`] revives it. An explicit
//! [`ConnectionManager::disconnect`] cancels everything, pending backoff
//! timers included, and never auto-reconnects.
//!
//! The credential travels in the connection URL query; there is no in-band
//! auth frame after open.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientFrame, ProtocolError};

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    /// Transport closed on purpose after prolonged local inactivity.
    /// Left on the next user activity, not by the server.
    SuspendedIdle,
}

/// Exponential backoff parameters for automatic reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Attempt counter over a [`ReconnectPolicy`]; reset whenever a connection
/// reaches `Open`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Delay before the next attempt: `base * 2^n` capped at `max`, or
    /// `None` once the attempt cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let factor = 1u32 << self.attempts.min(16);
        let delay = self
            .policy
            .base
            .checked_mul(factor)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);
        self.attempts += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Events emitted by the connection supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Transport is open; subscriptions must be replayed now.
    Opened,
    /// One inbound text frame, undecoded.
    Frame(String),
    /// Idle timeout hit; transport closed until the next user activity.
    Suspended,
    /// Transport lost or failed to open; a reconnect is scheduled unless the
    /// attempt cap has been reached.
    Closed,
    /// Automatic retry has stopped. Fatal: a caller-level restart is the only
    /// way back.
    ReconnectExhausted,
}

/// Connection-surface errors.
#[derive(Debug)]
pub enum ConnectionError {
    /// No open transport to send on.
    NotConnected,
    Encode(ProtocolError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected"),
            Self::Encode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8081/ws`.
    pub endpoint: String,
    pub policy: ReconnectPolicy,
    /// User inactivity span after which the transport is suspended.
    pub idle_timeout: Duration,
}

/// How one open session ended.
enum SessionEnd {
    Lost,
    Idle,
    Shutdown,
}

/// Owns the WebSocket transport and its reconnect/idle lifecycle.
pub struct ConnectionManager {
    config: ConnectionConfig,
    token: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    event_rx: Option<mpsc::Receiver<ConnectionEvent>>,
    activity: Arc<Notify>,
    last_user_activity: Arc<RwLock<Instant>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            token: token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing: Arc::new(RwLock::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            activity: Arc::new(Notify::new()),
            last_user_activity: Arc::new(RwLock::new(Instant::now())),
            shutdown_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Queue a control frame on the open transport.
    pub async fn send(&self, frame: &ClientFrame) -> Result<(), ConnectionError> {
        let text = frame.encode().map_err(ConnectionError::Encode)?;
        let outgoing = self.outgoing.read().await;
        match outgoing.as_ref() {
            Some(tx) => tx
                .send(text)
                .await
                .map_err(|_| ConnectionError::NotConnected),
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// Record user activity. Refreshes the idle watermark and revives a
    /// suspended connection.
    pub async fn notify_activity(&self) {
        *self.last_user_activity.write().await = Instant::now();
        self.activity.notify_waiters();
    }

    /// Explicit caller-initiated disconnect. Cancels pending reconnect and
    /// idle timers; no auto-reconnect afterwards.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Start the connection supervisor.
    ///
    /// Runs until an explicit [`disconnect`](Self::disconnect) or until the
    /// reconnect attempt cap is exhausted. Calling it again after either
    /// starts a fresh lifecycle with a reset backoff.
    pub fn connect(&self) {
        // A previous disconnect leaves the shutdown flag raised; restart
        // clean so the new supervisor does not exit immediately.
        self.shutdown_tx.send_replace(false);

        let cfg = self.config.clone();
        let url = format!("{}?token={}", cfg.endpoint, self.token);
        let state = self.state.clone();
        let outgoing = self.outgoing.clone();
        let event_tx = self.event_tx.clone();
        let activity = self.activity.clone();
        let last_user = self.last_user_activity.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut backoff = Backoff::new(cfg.policy);
            let idle_check = (cfg.idle_timeout / 2).max(Duration::from_millis(25));

            'sessions: loop {
                *state.write().await = ConnectionState::Connecting;
                let dialed = tokio::select! {
                    r = tokio_tungstenite::connect_async(url.as_str()) => r,
                    _ = shutdown_rx.changed() => break 'sessions,
                };

                match dialed {
                    Ok((stream, _)) => {
                        let (mut writer, mut reader) = stream.split();
                        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
                        *outgoing.write().await = Some(out_tx);
                        backoff.reset();
                        *state.write().await = ConnectionState::Open;
                        log::info!("Connected to {}", cfg.endpoint);
                        let _ = event_tx.send(ConnectionEvent::Opened).await;

                        let mut idle_tick = tokio::time::interval(idle_check);
                        let end = loop {
                            tokio::select! {
                                msg = reader.next() => match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        let _ = event_tx
                                            .send(ConnectionEvent::Frame(text.to_string()))
                                            .await;
                                    }
                                    Some(Ok(Message::Close(_))) | None => break SessionEnd::Lost,
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        log::warn!("Transport error: {e}");
                                        break SessionEnd::Lost;
                                    }
                                },
                                queued = out_rx.recv() => match queued {
                                    Some(text) => {
                                        if writer.send(Message::Text(text.into())).await.is_err() {
                                            break SessionEnd::Lost;
                                        }
                                    }
                                    None => break SessionEnd::Lost,
                                },
                                _ = idle_tick.tick() => {
                                    if last_user.read().await.elapsed() >= cfg.idle_timeout {
                                        break SessionEnd::Idle;
                                    }
                                }
                                _ = shutdown_rx.changed() => break SessionEnd::Shutdown,
                            }
                        };
                        *outgoing.write().await = None;

                        match end {
                            SessionEnd::Shutdown => {
                                *state.write().await = ConnectionState::Closing;
                                let _ = writer.close().await;
                                break 'sessions;
                            }
                            SessionEnd::Idle => {
                                log::info!(
                                    "Idle for {:?}, suspending connection",
                                    cfg.idle_timeout
                                );
                                // Register the waiter before announcing the
                                // suspension so a revival racing the event
                                // cannot be missed.
                                let revived = activity.notified();
                                tokio::pin!(revived);
                                revived.as_mut().enable();
                                *state.write().await = ConnectionState::SuspendedIdle;
                                let _ = writer.close().await;
                                let _ = event_tx.send(ConnectionEvent::Suspended).await;
                                tokio::select! {
                                    _ = &mut revived => {
                                        backoff.reset();
                                        continue 'sessions;
                                    }
                                    _ = shutdown_rx.changed() => break 'sessions,
                                }
                            }
                            SessionEnd::Lost => {
                                *state.write().await = ConnectionState::Disconnected;
                                let _ = event_tx.send(ConnectionEvent::Closed).await;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("Connect failed: {e}");
                        *state.write().await = ConnectionState::Disconnected;
                        let _ = event_tx.send(ConnectionEvent::Closed).await;
                    }
                }

                match backoff.next_delay() {
                    Some(delay) => {
                        log::info!(
                            "Reconnecting in {:?} (attempt {})",
                            delay,
                            backoff.attempts()
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_rx.changed() => break 'sessions,
                        }
                    }
                    None => {
                        log::warn!("Reconnect attempts exhausted, giving up");
                        let _ = event_tx.send(ConnectionEvent::ReconnectExhausted).await;
                        break 'sessions;
                    }
                }
            }

            *outgoing.write().await = None;
            *state.write().await = ConnectionState::Disconnected;
        });
    }
}

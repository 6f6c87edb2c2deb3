//! The owning session object: one [`CanvasClient`] per signed-in session.
//!
//! Composes the grid store, reconciler, subscription manager, connection
//! manager, and HTTP api into a single engine with one outward event stream:
//!
//! ```text
//! server ──frames──► ConnectionManager ──► session loop ──► UpdateReconciler ──► GridStore
//!                          ▲                   │
//!   user edits ──draw()────┘ (HTTP)            └──► CanvasEvent stream (UI)
//!   viewport  ──set_visible() ──► SubscriptionManager ──frames──► ConnectionManager
//! ```
//!
//! The session loop task is the single consumer of connection events and the
//! coalescing timer, so reconciler and subscription state see strictly
//! sequential access. The grid sits behind one `RwLock` because optimistic
//! writes arrive on the caller's task.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::api::{ApiError, CanvasApi};
use crate::auth::StoredCredentials;
use crate::connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, ReconnectPolicy,
};
use crate::grid::{GridError, GridEvent, GridStore, Palette};
use crate::protocol::{
    decode_snapshot, ClientFrame, ColorIndex, DrawRequest, ProtocolError, Quadrant, ServerFrame,
};
use crate::reconcile::{Applied, UpdateReconciler, DEFAULT_COALESCE_WINDOW};
use crate::subscribe::SubscriptionManager;

/// Engine configuration. Defaults mirror the canonical deployment: a 100×100
/// grid, the 16-color palette, 5 reconnect attempts, 5-minute idle timeout.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ws_endpoint: String,
    pub api_base: String,
    pub grid_size: usize,
    pub palette: Palette,
    pub reconnect: ReconnectPolicy,
    pub idle_timeout: Duration,
    pub coalesce_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_endpoint: "ws://localhost:8081/ws".to_string(),
            api_base: "http://localhost:8081".to_string(),
            grid_size: 100,
            palette: Palette::default(),
            reconnect: ReconnectPolicy::default(),
            idle_timeout: Duration::from_secs(5 * 60),
            coalesce_window: DEFAULT_COALESCE_WINDOW,
        }
    }
}

/// Events emitted to the embedding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanvasEvent {
    /// Transport open, subscriptions replayed, snapshot refreshed.
    Connected,
    /// Transport lost; reconnection is in progress.
    Disconnected,
    /// Suspended after local inactivity; revived by the next activity.
    Suspended,
    /// Automatic reconnection gave up. Restart the engine to try again.
    ReconnectExhausted,
    /// Server enumerated its quadrants and reported the participant count.
    Configured {
        quadrants: Vec<Quadrant>,
        connected_clients: u32,
    },
    /// Participant count changed.
    ClientCount(u32),
    /// Coalesced redraw signal: the grid changed since the last one.
    /// Cell-level detail is on the [`GridStore`] event channel.
    Redraw,
    /// A snapshot load failed; the previous grid is retained.
    SnapshotFailed(String),
}

/// Session-surface errors.
#[derive(Debug)]
pub enum ClientError {
    /// `connect()` was already called on this client.
    AlreadyStarted,
    /// Snapshot fetch failed.
    SnapshotFetch(ApiError),
    /// Snapshot bytes did not match the grid dimensions.
    Snapshot(ProtocolError),
    Grid(GridError),
    /// The draw request failed; the optimistic pixel is left in place.
    DrawRequestFailed(ApiError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "Client already started"),
            Self::SnapshotFetch(e) => write!(f, "Snapshot fetch failed: {e}"),
            Self::Snapshot(e) => write!(f, "{e}"),
            Self::Grid(e) => write!(f, "{e}"),
            Self::DrawRequestFailed(e) => write!(f, "Draw request failed: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// The client-side synchronization engine.
pub struct CanvasClient {
    config: ClientConfig,
    api: CanvasApi,
    grid: Arc<RwLock<GridStore>>,
    reconciler: Arc<RwLock<UpdateReconciler>>,
    subscriptions: Arc<RwLock<SubscriptionManager>>,
    connection: Arc<ConnectionManager>,
    conn_events: Option<mpsc::Receiver<ConnectionEvent>>,
    event_tx: mpsc::UnboundedSender<CanvasEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<CanvasEvent>>,
}

impl CanvasClient {
    /// Build an engine from configuration and a stored session credential.
    /// Nothing touches the network until [`connect`](Self::connect).
    pub fn new(config: ClientConfig, credentials: &StoredCredentials) -> Self {
        let api = CanvasApi::new(config.api_base.clone(), credentials.token.clone());
        let mut connection = ConnectionManager::new(
            ConnectionConfig {
                endpoint: config.ws_endpoint.clone(),
                policy: config.reconnect,
                idle_timeout: config.idle_timeout,
            },
            credentials.token.clone(),
        );
        let conn_events = connection.take_event_rx();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            grid: Arc::new(RwLock::new(GridStore::new(
                config.grid_size,
                config.palette.clone(),
            ))),
            reconciler: Arc::new(RwLock::new(UpdateReconciler::new(config.coalesce_window))),
            subscriptions: Arc::new(RwLock::new(SubscriptionManager::new())),
            connection: Arc::new(connection),
            conn_events,
            event_tx,
            event_rx: Some(event_rx),
            api,
            config,
        }
    }

    /// Take the session event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<CanvasEvent>> {
        self.event_rx.take()
    }

    /// Take the cell-level grid change receiver (once), for the renderer.
    pub async fn take_grid_events(&self) -> Option<mpsc::UnboundedReceiver<GridEvent>> {
        self.grid.write().await.take_event_rx()
    }

    /// Shared handle to the canonical grid, for rendering reads.
    pub fn grid(&self) -> Arc<RwLock<GridStore>> {
        self.grid.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn quadrants(&self) -> Vec<Quadrant> {
        self.subscriptions.read().await.quadrants().to_vec()
    }

    /// Load the initial snapshot, open the realtime connection, and start the
    /// session loop. Single-shot: restart by building a fresh client.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.conn_events.is_none() {
            return Err(ClientError::AlreadyStarted);
        }

        // Fail before starting anything so a bad first snapshot leaves the
        // client reusable: the caller can fix the issue and call again.
        let bytes = self
            .api
            .fetch_snapshot()
            .await
            .map_err(ClientError::SnapshotFetch)?;
        let cells =
            decode_snapshot(&bytes, self.config.grid_size).map_err(ClientError::Snapshot)?;
        self.grid
            .write()
            .await
            .bulk_load(cells)
            .map_err(ClientError::Grid)?;
        let conn_events = self.conn_events.take().ok_or(ClientError::AlreadyStarted)?;
        log::info!(
            "Loaded {}×{} snapshot",
            self.config.grid_size,
            self.config.grid_size
        );

        self.connection.connect();
        self.spawn_session_loop(conn_events);
        Ok(())
    }

    /// Apply a pixel optimistically and submit the draw request.
    ///
    /// The local write happens before the request; on failure the pixel is
    /// left applied (the server's broadcast is the eventual source of truth)
    /// and the error is returned so the UI can report it.
    pub async fn draw(&self, x: u16, y: u16, color: ColorIndex) -> Result<(), ClientError> {
        let changed = {
            let mut reconciler = self.reconciler.write().await;
            let mut grid = self.grid.write().await;
            reconciler
                .apply_optimistic(&mut grid, x, y, color)
                .map_err(ClientError::Grid)?
        };
        if changed {
            let _ = self.event_tx.send(CanvasEvent::Redraw);
        }

        // Drawing is user activity; the keepalive is best-effort, the HTTP
        // request below works with or without an open transport.
        self.connection.notify_activity().await;
        let _ = self.connection.send(&ClientFrame::Activity).await;

        self.api
            .draw(&DrawRequest { x, y, color })
            .await
            .map_err(ClientError::DrawRequestFailed)
    }

    /// Reconcile subscriptions against the newly visible quadrant set.
    ///
    /// Send failures while disconnected are absorbed: the full replay on the
    /// next `Opened` restores the server's view.
    pub async fn set_visible(&self, visible: &BTreeSet<u32>) {
        let frames = self.subscriptions.write().await.set_visible(visible);
        self.connection.notify_activity().await;
        for frame in &frames {
            if self.connection.send(frame).await.is_err() {
                log::debug!("Subscription frame dropped while disconnected");
            }
        }
    }

    /// Record user activity: refreshes the idle watermark and revives a
    /// suspended connection.
    pub async fn notify_activity(&self) {
        self.connection.notify_activity().await;
        let _ = self.connection.send(&ClientFrame::Activity).await;
    }

    /// Explicit sign-out / shutdown. No auto-reconnect afterwards.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    fn spawn_session_loop(&self, mut conn_events: mpsc::Receiver<ConnectionEvent>) {
        let api = self.api.clone();
        let grid = self.grid.clone();
        let reconciler = self.reconciler.clone();
        let subscriptions = self.subscriptions.clone();
        let connection = self.connection.clone();
        let event_tx = self.event_tx.clone();
        let grid_size = self.config.grid_size;

        tokio::spawn(async move {
            let mut flush_at: Option<Instant> = None;

            loop {
                tokio::select! {
                    event = conn_events.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            ConnectionEvent::Opened => {
                                let frames = subscriptions.read().await.on_reconnected();
                                if !frames.is_empty() {
                                    log::info!("Replaying {} subscriptions", frames.len());
                                }
                                for frame in &frames {
                                    if connection.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                                refresh_snapshot(&api, &grid, grid_size, &event_tx).await;
                                let _ = event_tx.send(CanvasEvent::Connected);
                            }
                            ConnectionEvent::Frame(text) => match ServerFrame::decode(&text) {
                                Ok(ServerFrame::Update(update)) => {
                                    let mut rec = reconciler.write().await;
                                    let mut g = grid.write().await;
                                    match rec.on_remote_update(&mut g, &update) {
                                        Ok(Applied::Fresh { first_in_window: true, .. }) => {
                                            flush_at = Some(Instant::now() + rec.window());
                                        }
                                        Ok(_) => {}
                                        Err(e) => log::warn!("Rejected update: {e}"),
                                    }
                                }
                                Ok(ServerFrame::Configuration { quadrants, connected_clients }) => {
                                    subscriptions.write().await.set_quadrants(quadrants.clone());
                                    let _ = event_tx.send(CanvasEvent::Configured {
                                        quadrants,
                                        connected_clients,
                                    });
                                }
                                Ok(ServerFrame::ClientCount { count }) => {
                                    let _ = event_tx.send(CanvasEvent::ClientCount(count));
                                }
                                Ok(ServerFrame::Unknown) => {
                                    log::debug!("Ignoring unknown frame kind");
                                }
                                Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                            },
                            ConnectionEvent::Suspended => {
                                let _ = event_tx.send(CanvasEvent::Suspended);
                            }
                            ConnectionEvent::Closed => {
                                let _ = event_tx.send(CanvasEvent::Disconnected);
                            }
                            ConnectionEvent::ReconnectExhausted => {
                                let _ = event_tx.send(CanvasEvent::ReconnectExhausted);
                            }
                        }
                    }
                    _ = async {
                        match flush_at {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending().await,
                        }
                    } => {
                        flush_at = None;
                        if reconciler.write().await.flush() {
                            let _ = event_tx.send(CanvasEvent::Redraw);
                        }
                    }
                }
            }

            // A window left open at shutdown still flushes; applied updates
            // are never reverted.
            if reconciler.write().await.flush() {
                let _ = event_tx.send(CanvasEvent::Redraw);
            }
        });
    }
}

/// Re-fetch and load the snapshot on (re)connect; covers updates broadcast
/// while the transport was down. Failure keeps the previous grid.
async fn refresh_snapshot(
    api: &CanvasApi,
    grid: &Arc<RwLock<GridStore>>,
    grid_size: usize,
    event_tx: &mpsc::UnboundedSender<CanvasEvent>,
) {
    let loaded = match api.fetch_snapshot().await {
        Ok(bytes) => match decode_snapshot(&bytes, grid_size) {
            Ok(cells) => grid
                .write()
                .await
                .bulk_load(cells)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        },
        Err(e) => Err(e.to_string()),
    };
    match loaded {
        Ok(()) => {
            let _ = event_tx.send(CanvasEvent::Redraw);
        }
        Err(e) => {
            log::warn!("Snapshot refresh failed: {e}");
            let _ = event_tx.send(CanvasEvent::SnapshotFailed(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(api_base: &str) -> CanvasClient {
        let config = ClientConfig {
            ws_endpoint: "ws://127.0.0.1:1/ws".to_string(),
            api_base: api_base.to_string(),
            grid_size: 4,
            ..ClientConfig::default()
        };
        CanvasClient::new(config, &StoredCredentials::new("tok", api_base))
    }

    #[test]
    fn test_default_config() {
        let c = ClientConfig::default();
        assert_eq!(c.grid_size, 100);
        assert_eq!(c.palette.len(), 16);
        assert_eq!(c.reconnect.max_attempts, 5);
        assert_eq!(c.idle_timeout, Duration::from_secs(300));
        assert_eq!(c.coalesce_window, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_draw_failure_leaves_optimistic_pixel() {
        // No API server: the draw request fails, the pixel stays.
        let client = test_client("http://127.0.0.1:1");
        let err = client.draw(1, 2, 5).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::DrawRequestFailed(ApiError::Network(_))
        ));
        assert_eq!(client.grid().read().await.read(1, 2).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_draw_rejects_invalid_color_before_any_request() {
        let client = test_client("http://127.0.0.1:1");
        assert!(matches!(
            client.draw(0, 0, 16).await,
            Err(ClientError::Grid(GridError::InvalidColor { .. }))
        ));
    }

    #[tokio::test]
    async fn test_draw_emits_redraw_event() {
        let mut client = test_client("http://127.0.0.1:1");
        let mut events = client.take_event_rx().unwrap();
        let _ = client.draw(0, 0, 3).await;
        assert_eq!(events.try_recv().unwrap(), CanvasEvent::Redraw);
    }

    #[tokio::test]
    async fn test_failed_snapshot_leaves_client_reusable() {
        let mut client = test_client("http://127.0.0.1:1");
        // No API server: the snapshot fetch fails before anything starts,
        // so a later connect attempt is still possible.
        assert!(matches!(
            client.connect().await,
            Err(ClientError::SnapshotFetch(_))
        ));
        assert!(client.conn_events.is_some());
    }

    #[tokio::test]
    async fn test_set_visible_absorbed_while_disconnected() {
        let client = test_client("http://127.0.0.1:1");
        let visible: BTreeSet<u32> = [1, 2].into_iter().collect();
        client.set_visible(&visible).await;
        // State is tracked even though nothing could be sent.
        assert_eq!(
            client.subscriptions.read().await.subscribed(),
            &visible
        );
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = test_client("http://127.0.0.1:1");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}

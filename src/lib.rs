//! # plaza-collab — client synchronization engine for a shared pixel canvas
//!
//! Many participants edit one large indexed-color grid; every edit must
//! reach every other participant quickly, and a joining participant must
//! materialize the full current grid. This crate is the client-side engine
//! that makes that work over an unreliable, reconnecting realtime channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  WebSocket   ┌───────────────────┐
//! │   server   │ ◄──────────► │ ConnectionManager │  backoff, idle suspend
//! └─────┬──────┘  JSON frames └─────────┬─────────┘
//!       │ HTTP                          │ ConnectionEvent
//!       │ snapshot / draw               ▼
//! ┌─────┴──────┐               ┌───────────────────┐      ┌──────────────┐
//! │ CanvasApi  │──────────────►│   session loop    │◄────►│ Subscription │
//! └────────────┘               │  (CanvasClient)   │      │   Manager    │
//!                              └─────────┬─────────┘      └──────────────┘
//!                                        │ CellUpdate
//!                                        ▼
//!                              ┌───────────────────┐      ┌──────────────┐
//!                              │ UpdateReconciler  │─────►│  GridStore   │
//!                              │ watermark+coalesce│      │ (canonical)  │
//!                              └───────────────────┘      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — pure wire codec: packed snapshots, JSON delta/control frames
//! - [`grid`] — canonical grid state, palette, change notifications
//! - [`reconcile`] — staleness watermark, optimistic writes, redraw coalescing
//! - [`subscribe`] — quadrant subscription diffing and reconnect replay
//! - [`connection`] — transport lifecycle: backoff reconnect, idle suspension
//! - [`client`] — the owning session object and its event stream
//! - [`api`] — HTTP snapshot fetch and draw request
//! - [`auth`] — stored session credential
//!
//! ## Guarantees
//!
//! - The grid is mutated only through `bulk_load` and `apply_cell`; no reader
//!   ever observes a torn state.
//! - Stale and duplicate deliveries are dropped against a monotonic timestamp
//!   watermark, which is also the safety net across reconnects.
//! - Unknown inbound frame kinds are ignored, never fatal.
//! - Subscriptions are replayed in full on every fresh connection.

pub mod api;
pub mod auth;
pub mod client;
pub mod connection;
pub mod grid;
pub mod protocol;
pub mod reconcile;
pub mod subscribe;

// Re-exports for convenience
pub use api::{ApiError, CanvasApi};
pub use auth::{load_credentials, save_credentials, StoredCredentials};
pub use client::{CanvasClient, CanvasEvent, ClientConfig, ClientError};
pub use connection::{
    Backoff, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager,
    ConnectionState, ReconnectPolicy,
};
pub use grid::{GridError, GridEvent, GridStore, Palette};
pub use protocol::{
    decode_snapshot, encode_snapshot, CellUpdate, ClientFrame, ColorIndex, DrawRequest,
    ProtocolError, Quadrant, ServerFrame,
};
pub use reconcile::{Applied, UpdateReconciler};
pub use subscribe::SubscriptionManager;

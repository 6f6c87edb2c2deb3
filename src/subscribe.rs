//! Interest-based subscription to grid quadrants.
//!
//! The server only fans an update out to clients subscribed to the quadrant
//! containing its cell, so the client keeps its subscription set matched to
//! whatever is currently visible. The server holds no subscription state
//! across a severed connection, which is why [`SubscriptionManager::on_reconnected`]
//! is a full replay rather than a diff.
//!
//! This type is pure state-plus-frames: it never touches the transport, it
//! just returns the [`ClientFrame`]s the session should send.

use std::collections::BTreeSet;

use crate::protocol::{ClientFrame, Quadrant};

/// Tracks the subscribed quadrant set and the server's quadrant enumeration.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    subscribed: BTreeSet<u32>,
    quadrants: Vec<Quadrant>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt the quadrant list from a `configuration` frame. Replaced
    /// wholesale each time; held until the connection is replaced.
    pub fn set_quadrants(&mut self, quadrants: Vec<Quadrant>) {
        self.quadrants = quadrants;
    }

    /// The server's quadrant enumeration, empty before the first
    /// `configuration` frame.
    pub fn quadrants(&self) -> &[Quadrant] {
        &self.quadrants
    }

    /// Currently subscribed quadrant ids.
    pub fn subscribed(&self) -> &BTreeSet<u32> {
        &self.subscribed
    }

    /// Reconcile the subscription set against the newly visible quadrants.
    ///
    /// Emits one `Unsubscribe` per id that left the visible set, then one
    /// `Subscribe` per id that entered it, ascending by id within each batch.
    /// Unchanged ids produce no frames.
    pub fn set_visible(&mut self, visible: &BTreeSet<u32>) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        for &id in self.subscribed.difference(visible) {
            frames.push(ClientFrame::Unsubscribe { quadrant_id: id });
        }
        for &id in visible.difference(&self.subscribed) {
            frames.push(ClientFrame::Subscribe { quadrant_id: id });
        }
        self.subscribed = visible.clone();
        frames
    }

    /// Replay the full subscription set after a fresh connection.
    pub fn on_reconnected(&self) -> Vec<ClientFrame> {
        self.subscribed
            .iter()
            .map(|&id| ClientFrame::Subscribe { quadrant_id: id })
            .collect()
    }
}

//! Sequencing of inbound updates and optimistic local writes.
//!
//! The reconciler sits between the decoded wire frames and [`GridStore`]:
//! it drops stale or duplicate deliveries against a global timestamp
//! watermark, writes everything else through immediately, and throttles the
//! *presentation* signal so a burst of updates produces one coalesced redraw
//! per window instead of a redraw storm. Data correctness never waits on the
//! window — cells are applied the moment an update survives the watermark.
//!
//! The watermark is global rather than per-cell. A per-cell map would accept
//! a legitimately ordered update to one cell arriving just after a newer
//! update to an unrelated cell; this variant trades that corner for a single
//! monotonic i64, and survives reconnects unchanged because timestamps are
//! server-assigned epoch millis.

use std::time::Duration;

use crate::grid::{GridError, GridStore};
use crate::protocol::{CellUpdate, ColorIndex};

/// Default coalescing window for redraw notifications.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(50);

/// Outcome of feeding a remote update through the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Update passed the watermark and was written to the grid.
    Fresh {
        /// The cell actually took a new value.
        changed: bool,
        /// This update opened a new coalescing window; the caller should arm
        /// a flush timer for [`UpdateReconciler::window`] from now.
        first_in_window: bool,
    },
    /// Timestamp at or below the watermark; dropped, grid untouched.
    Stale,
}

/// Orders remote updates and applies optimistic local writes.
pub struct UpdateReconciler {
    last_applied_timestamp: i64,
    window: Duration,
    window_open: bool,
    dirty: bool,
}

impl UpdateReconciler {
    pub fn new(window: Duration) -> Self {
        Self {
            last_applied_timestamp: 0,
            window,
            window_open: false,
            dirty: false,
        }
    }

    /// The coalescing window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Highest update timestamp applied so far.
    pub fn watermark(&self) -> i64 {
        self.last_applied_timestamp
    }

    /// Apply a server-confirmed update.
    ///
    /// Duplicates and out-of-order deliveries (timestamp at or below the
    /// watermark) are dropped silently — across a reconnect this is the only
    /// ordering safety net, so the drop is not an error.
    pub fn on_remote_update(
        &mut self,
        grid: &mut GridStore,
        update: &CellUpdate,
    ) -> Result<Applied, GridError> {
        if update.timestamp <= self.last_applied_timestamp {
            log::debug!(
                "Dropping stale update ({}, {}) ts {} <= watermark {}",
                update.x,
                update.y,
                update.timestamp,
                self.last_applied_timestamp
            );
            return Ok(Applied::Stale);
        }

        let changed = grid.apply_cell(update.x, update.y, update.color)?;
        self.last_applied_timestamp = update.timestamp;
        self.dirty |= changed;

        let first_in_window = !self.window_open;
        self.window_open = true;
        Ok(Applied::Fresh {
            changed,
            first_in_window,
        })
    }

    /// Apply a local write before any server acknowledgement.
    ///
    /// The watermark is left alone: the server's own broadcast of this draw
    /// confirms it (or overwrites it if someone else won the cell). There is
    /// no rollback path — a failed draw request leaves the pixel in place and
    /// the server remains the eventual source of truth.
    pub fn apply_optimistic(
        &mut self,
        grid: &mut GridStore,
        x: u16,
        y: u16,
        color: ColorIndex,
    ) -> Result<bool, GridError> {
        grid.apply_cell(x, y, color)
    }

    /// Close the current coalescing window.
    ///
    /// Returns `true` if any applied update changed the grid since the last
    /// flush, i.e. one coalesced redraw notification is due. Safe to call
    /// after a disconnect; applied updates are never reverted.
    pub fn flush(&mut self) -> bool {
        self.window_open = false;
        std::mem::take(&mut self.dirty)
    }
}

impl Default for UpdateReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_COALESCE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Palette;

    fn setup() -> (UpdateReconciler, GridStore) {
        (
            UpdateReconciler::default(),
            GridStore::new(4, Palette::default()),
        )
    }

    fn update(x: u16, y: u16, color: u8, timestamp: i64) -> CellUpdate {
        CellUpdate { x, y, color, timestamp }
    }

    #[test]
    fn test_non_decreasing_timestamps_all_apply() {
        let (mut r, mut g) = setup();
        for (i, ts) in [10, 20, 20, 30].iter().enumerate() {
            // The duplicate ts 20 is stale, the rest apply.
            let _ = r.on_remote_update(&mut g, &update(i as u16, 0, 1, *ts));
        }
        assert_eq!(g.read(0, 0).unwrap(), 1);
        assert_eq!(g.read(1, 0).unwrap(), 1);
        assert_eq!(g.read(2, 0).unwrap(), 0); // duplicate ts, dropped
        assert_eq!(g.read(3, 0).unwrap(), 1);
        assert_eq!(r.watermark(), 30);
    }

    #[test]
    fn test_stale_update_dropped_grid_unchanged() {
        let (mut r, mut g) = setup();
        let a = r.on_remote_update(&mut g, &update(0, 0, 9, 100)).unwrap();
        assert!(matches!(a, Applied::Fresh { changed: true, .. }));

        let a = r.on_remote_update(&mut g, &update(0, 0, 2, 50)).unwrap();
        assert_eq!(a, Applied::Stale);
        assert_eq!(g.read(0, 0).unwrap(), 9);
        assert_eq!(r.watermark(), 100);
    }

    #[test]
    fn test_equal_timestamp_is_stale() {
        let (mut r, mut g) = setup();
        r.on_remote_update(&mut g, &update(0, 0, 1, 100)).unwrap();
        let a = r.on_remote_update(&mut g, &update(1, 1, 2, 100)).unwrap();
        assert_eq!(a, Applied::Stale);
        assert_eq!(g.read(1, 1).unwrap(), 0);
    }

    #[test]
    fn test_window_opens_once_per_burst() {
        let (mut r, mut g) = setup();

        let a = r.on_remote_update(&mut g, &update(0, 0, 1, 10)).unwrap();
        assert!(matches!(a, Applied::Fresh { first_in_window: true, .. }));

        let a = r.on_remote_update(&mut g, &update(1, 0, 2, 20)).unwrap();
        assert!(matches!(a, Applied::Fresh { first_in_window: false, .. }));

        assert!(r.flush());
        assert!(!r.flush()); // nothing new since

        // Next burst opens a fresh window.
        let a = r.on_remote_update(&mut g, &update(2, 0, 3, 30)).unwrap();
        assert!(matches!(a, Applied::Fresh { first_in_window: true, .. }));
    }

    #[test]
    fn test_flush_false_when_nothing_changed() {
        let (mut r, mut g) = setup();
        // Cell already holds 0; applying 0 changes nothing visually.
        let a = r.on_remote_update(&mut g, &update(0, 0, 0, 10)).unwrap();
        assert!(matches!(a, Applied::Fresh { changed: false, .. }));
        assert!(!r.flush());
    }

    #[test]
    fn test_optimistic_write_leaves_watermark() {
        let (mut r, mut g) = setup();
        r.on_remote_update(&mut g, &update(0, 0, 1, 100)).unwrap();

        assert!(r.apply_optimistic(&mut g, 2, 2, 7).unwrap());
        assert_eq!(g.read(2, 2).unwrap(), 7);
        assert_eq!(r.watermark(), 100);

        // The server's confirming broadcast still applies.
        let a = r.on_remote_update(&mut g, &update(2, 2, 7, 150)).unwrap();
        assert!(matches!(a, Applied::Fresh { changed: false, .. }));
        assert_eq!(r.watermark(), 150);
    }

    #[test]
    fn test_optimistic_write_overwritten_by_server() {
        let (mut r, mut g) = setup();
        r.apply_optimistic(&mut g, 1, 1, 3).unwrap();
        // Someone else won the cell.
        r.on_remote_update(&mut g, &update(1, 1, 8, 60)).unwrap();
        assert_eq!(g.read(1, 1).unwrap(), 8);
    }

    #[test]
    fn test_out_of_bounds_update_is_an_error() {
        let (mut r, mut g) = setup();
        assert!(r.on_remote_update(&mut g, &update(9, 9, 1, 10)).is_err());
        // A rejected update must not advance the watermark.
        assert_eq!(r.watermark(), 0);
    }
}

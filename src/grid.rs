//! Canonical in-memory grid and the palette it indexes into.
//!
//! [`GridStore`] is the single owner of the shared canvas state. It is
//! mutated through exactly two entry points — [`GridStore::bulk_load`] for a
//! snapshot and [`GridStore::apply_cell`] for a single delta — and emits a
//! [`GridEvent`] per mutation for the rendering layer to consume. Sequencing
//! across producers (remote updates, optimistic local writes, snapshot loads)
//! is the session's job; this type does no locking of its own.

use tokio::sync::mpsc;

use crate::protocol::ColorIndex;

/// The fixed, ordered set of selectable colors. Read-only after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<[u8; 3]>,
}

impl Palette {
    /// Build a palette from RGB triples. At most 16 entries fit the 4-bit
    /// wire encoding; longer palettes are truncated.
    pub fn new(colors: Vec<[u8; 3]>) -> Self {
        let mut colors = colors;
        colors.truncate(16);
        Self { colors }
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// RGB value for a color index, if in range.
    pub fn color(&self, index: ColorIndex) -> Option<[u8; 3]> {
        self.colors.get(index as usize).copied()
    }

    /// Whether `index` names a color in this palette.
    pub fn contains(&self, index: ColorIndex) -> bool {
        (index as usize) < self.colors.len()
    }
}

impl Default for Palette {
    /// The canonical 16-color palette.
    fn default() -> Self {
        Self::new(vec![
            [0xFF, 0xFF, 0xFF],
            [0xE4, 0xE4, 0xE4],
            [0x88, 0x88, 0x88],
            [0x22, 0x22, 0x22],
            [0xFF, 0xA7, 0xD1],
            [0xE5, 0x00, 0x00],
            [0xE5, 0x95, 0x00],
            [0xA0, 0x6A, 0x42],
            [0xE5, 0xD9, 0x00],
            [0x94, 0xE0, 0x44],
            [0x02, 0xBE, 0x01],
            [0x00, 0xD3, 0xDD],
            [0x00, 0x83, 0xC7],
            [0x00, 0x00, 0xEA],
            [0xCF, 0x6E, 0xE4],
            [0x82, 0x00, 0x80],
        ])
    }
}

/// Change notification emitted per mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridEvent {
    /// One cell took a new value.
    CellChanged { x: u16, y: u16, color: ColorIndex },
    /// The whole grid was replaced by a snapshot.
    Reloaded,
}

/// Grid access errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    /// Coordinate outside `[0, size)²`. Caller bug; fails that call only.
    OutOfBounds { x: u16, y: u16, size: usize },
    /// Color index not in the palette.
    InvalidColor { color: ColorIndex, palette_len: usize },
    /// Bulk load with the wrong number of cells. Previous grid retained.
    SizeMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for GridError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds { x, y, size } => {
                write!(f, "Coordinate ({x}, {y}) outside {size}×{size} grid")
            }
            Self::InvalidColor { color, palette_len } => {
                write!(f, "Color index {color} outside palette of {palette_len}")
            }
            Self::SizeMismatch { expected, actual } => {
                write!(f, "Grid load of {actual} cells, expected {expected}")
            }
        }
    }
}

impl std::error::Error for GridError {}

/// Owner of the canonical `size × size` cell array.
pub struct GridStore {
    size: usize,
    palette: Palette,
    cells: Vec<ColorIndex>,
    version: u64,
    event_tx: mpsc::UnboundedSender<GridEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<GridEvent>>,
}

impl GridStore {
    /// Create a grid of `size × size` cells, all color 0.
    pub fn new(size: usize, palette: Palette) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            size,
            palette,
            cells: vec![0; size * size],
            version: 0,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the change-notification receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<GridEvent>> {
        self.event_rx.take()
    }

    /// Atomically replace the entire grid from a decoded snapshot.
    ///
    /// Validates length and every color index before touching state, so a
    /// failed load leaves the previous grid fully intact. Readers never see
    /// a half-replaced grid: the swap is a single vector assignment under
    /// the caller's sequencing.
    pub fn bulk_load(&mut self, cells: Vec<ColorIndex>) -> Result<(), GridError> {
        let expected = self.size * self.size;
        if cells.len() != expected {
            return Err(GridError::SizeMismatch {
                expected,
                actual: cells.len(),
            });
        }
        if let Some(&bad) = cells.iter().find(|&&c| !self.palette.contains(c)) {
            return Err(GridError::InvalidColor {
                color: bad,
                palette_len: self.palette.len(),
            });
        }

        self.cells = cells;
        self.version += 1;
        let _ = self.event_tx.send(GridEvent::Reloaded);
        Ok(())
    }

    /// Set exactly one cell.
    ///
    /// Always bumps the version. Returns `true` and emits a change event only
    /// when the value actually changed, so redundant deliveries do not cause
    /// redundant redraw signaling.
    pub fn apply_cell(&mut self, x: u16, y: u16, color: ColorIndex) -> Result<bool, GridError> {
        let index = self.cell_index(x, y)?;
        if !self.palette.contains(color) {
            return Err(GridError::InvalidColor {
                color,
                palette_len: self.palette.len(),
            });
        }

        self.version += 1;
        if self.cells[index] == color {
            return Ok(false);
        }
        self.cells[index] = color;
        let _ = self.event_tx.send(GridEvent::CellChanged { x, y, color });
        Ok(true)
    }

    /// Read one cell's color index.
    pub fn read(&self, x: u16, y: u16) -> Result<ColorIndex, GridError> {
        let index = self.cell_index(x, y)?;
        Ok(self.cells[index])
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    /// The raw cell array in raster order, for the renderer.
    pub fn cells(&self) -> &[ColorIndex] {
        &self.cells
    }

    fn cell_index(&self, x: u16, y: u16) -> Result<usize, GridError> {
        if (x as usize) < self.size && (y as usize) < self.size {
            Ok(y as usize * self.size + x as usize)
        } else {
            Err(GridError::OutOfBounds {
                x,
                y,
                size: self.size,
            })
        }
    }
}

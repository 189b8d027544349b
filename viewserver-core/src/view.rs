//! Sparse per-view cell store.
//!
//! Cells live in a sharded concurrent map so writers on one view never
//! contend with readers or writers on another, and writers on the same view
//! only contend per shard. Snapshots are point-in-time copies: a write racing
//! with [`GridView::all_cells`] may or may not be included.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cell::{now_millis, Cell, CellCoord, CellValue};
use crate::error::GridError;

/// Estimated bytes per stored cell (value + timestamp + coordinates).
pub const CELL_BYTES_ESTIMATE: u64 = 100;
/// Estimated per-entry overhead of the map itself.
pub const MAP_ENTRY_BYTES_ESTIMATE: u64 = 64;
/// Soft ceiling for a single view's estimated footprint.
pub const MAX_VIEW_MEMORY_BYTES: u64 = 51 * 1024 * 1024;

/// Identity of a view: one user's named grid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ViewId(String);

impl ViewId {
    /// Compose the id for `view_name` owned by `user_id`.
    pub fn compose(user_id: &str, view_name: &str) -> Self {
        Self(format!("{user_id}_{view_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ViewId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for ViewId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One view's grid state: fixed dimensions, sparse cells.
pub struct GridView {
    id: ViewId,
    rows: u32,
    columns: u32,
    cells: DashMap<CellCoord, Cell>,
    last_modified: AtomicU64,
}

impl GridView {
    pub fn new(id: ViewId, rows: u32, columns: u32) -> Result<Self, GridError> {
        if rows == 0 || columns == 0 {
            return Err(GridError::InvalidDimensions { rows, columns });
        }
        Ok(Self {
            id,
            rows,
            columns,
            cells: DashMap::new(),
            last_modified: AtomicU64::new(now_millis()),
        })
    }

    pub fn id(&self) -> &ViewId {
        &self.id
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    /// Last write or clear, milliseconds since the Unix epoch.
    pub fn last_modified(&self) -> u64 {
        self.last_modified.load(Ordering::Relaxed)
    }

    fn check_bounds(&self, row: u32, column: u32) -> Result<CellCoord, GridError> {
        if row >= self.rows || column >= self.columns {
            return Err(GridError::OutOfBounds {
                row,
                column,
                rows: self.rows,
                columns: self.columns,
            });
        }
        Ok(CellCoord::new(row, column))
    }

    /// Replace the cell at (row, column) with `value`.
    pub fn set_cell(&self, row: u32, column: u32, value: CellValue) -> Result<(), GridError> {
        let coord = self.check_bounds(row, column)?;
        let now = now_millis();
        self.cells.insert(coord, Cell::new(row, column, value, now));
        self.last_modified.fetch_max(now, Ordering::Relaxed);
        Ok(())
    }

    /// Read one cell. Out-of-range coordinates read as absent.
    pub fn get_cell(&self, row: u32, column: u32) -> Option<Cell> {
        let coord = self.check_bounds(row, column).ok()?;
        self.cells.get(&coord).map(|c| c.value().clone())
    }

    /// Point-in-time copy of every stored cell, ordered by (row, column).
    ///
    /// Never hands out a live view of the map, so callers can iterate
    /// without holding any shard lock.
    pub fn all_cells(&self) -> Vec<Cell> {
        let mut cells: Vec<Cell> = self.cells.iter().map(|e| e.value().clone()).collect();
        cells.sort_unstable_by_key(Cell::coord);
        cells
    }

    /// Stored cells inside the inclusive rectangle, ordered by (row, column).
    pub fn cells_in_range(
        &self,
        start_row: u32,
        end_row: u32,
        start_column: u32,
        end_column: u32,
    ) -> Vec<Cell> {
        let end_row = end_row.min(self.rows.saturating_sub(1));
        let end_column = end_column.min(self.columns.saturating_sub(1));
        let mut cells = Vec::new();
        for row in start_row..=end_row {
            for column in start_column..=end_column {
                if let Some(cell) = self.cells.get(&CellCoord::new(row, column)) {
                    cells.push(cell.value().clone());
                }
            }
        }
        cells
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Heuristic footprint in bytes: a fixed cost per cell plus map overhead.
    pub fn estimate_memory(&self) -> u64 {
        self.cells.len() as u64 * (CELL_BYTES_ESTIMATE + MAP_ENTRY_BYTES_ESTIMATE)
    }

    pub fn is_within_memory_limits(&self) -> bool {
        self.estimate_memory() <= MAX_VIEW_MEMORY_BYTES
    }

    /// Drop every stored cell.
    pub fn clear(&self) {
        self.cells.clear();
        self.last_modified.fetch_max(now_millis(), Ordering::Relaxed);
    }

    /// Fill every coordinate with a deterministic mixed-type pattern.
    ///
    /// Column `c % 5` selects string, number, integer, timestamp, boolean.
    pub fn seed_demo_pattern(&self) {
        let base = now_millis() as i64;
        for row in 0..self.rows {
            for column in 0..self.columns {
                let value = match column % 5 {
                    0 => CellValue::String(format!("Row{row}Col{column}")),
                    1 => CellValue::Number(f64::from((row * 7 + column) % 100_000) / 100.0),
                    2 => CellValue::Integer(i64::from((row * 31 + column) % 1000)),
                    3 => CellValue::Timestamp(base + i64::from(row) * 1000),
                    _ => CellValue::Boolean((row + column) % 2 == 0),
                };
                let coord = CellCoord::new(row, column);
                self.cells.insert(coord, Cell::new(row, column, value, base as u64));
            }
        }
        self.last_modified.fetch_max(base as u64, Ordering::Relaxed);
        log::info!(
            "View {} seeded with {} cells, estimated memory: {} bytes",
            self.id,
            self.cell_count(),
            self.estimate_memory()
        );
    }
}

impl fmt::Debug for GridView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridView")
            .field("id", &self.id)
            .field("rows", &self.rows)
            .field("columns", &self.columns)
            .field("cells", &self.cells.len())
            .field("last_modified", &self.last_modified())
            .finish()
    }
}

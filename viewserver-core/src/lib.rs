//! # viewserver-core — In-memory grid state for the view server
//!
//! Holds the authoritative, sparse cell grid of every (user, view) pair and
//! the size rules that bound the batches flowing in and out of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐        ┌──────────────┐
//! │ GridRegistry │ ─────► │ GridView     │  (one per view, DashMap cells)
//! │ (bounded)    │        │ rows × cols  │
//! └──────────────┘        └──────────────┘
//!
//! ┌──────────────┐
//! │ SizeGovernor │  ingestion budget ─┐
//! │              │  egress budget ────┴─ validate / classify / split
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`cell`] — Typed cell values, coordinates, changes
//! - [`view`] — Per-view sparse cell store
//! - [`registry`] — Bounded, lazily populated set of views
//! - [`governor`] — Batch size budgets

pub mod cell;
pub mod error;
pub mod governor;
pub mod registry;
pub mod view;

pub use cell::{now_millis, Cell, CellChange, CellCoord, CellValue, DataType};
pub use error::GridError;
pub use governor::{Budget, BudgetViolation, SizeClass, SizeGovernor};
pub use registry::{GridRegistry, GridStats};
pub use view::{GridView, ViewId};

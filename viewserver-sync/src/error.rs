use thiserror::Error;
use viewserver_core::{BudgetViolation, GridError, ViewId};

use crate::protocol::ProtocolError;
use crate::subscription::HandleId;

/// Failure of a single send to a subscriber handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Handle {0} is closed")]
    Closed(HandleId),
    #[error("Handle {0} outbound buffer is full")]
    Backlogged(HandleId),
}

/// Errors surfaced by the view server pipeline.
#[derive(Error, Debug)]
pub enum ViewServerError {
    /// Batch exceeds a size or count budget.
    #[error("Batch for view {view} rejected: {violation}")]
    Validation {
        view: ViewId,
        violation: BudgetViolation,
    },
    /// Unknown view or subscriber.
    #[error("View not found: {0}")]
    NotFound(ViewId),
    #[error("View capacity exceeded: {max} views")]
    CapacityExceeded { max: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Unparseable upstream payload; `raw` keeps the original for diagnosis.
    #[error("Malformed input: {reason}")]
    MalformedInput { reason: String, raw: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Grid(GridError),
}

impl From<GridError> for ViewServerError {
    fn from(e: GridError) -> Self {
        match e {
            GridError::CapacityExceeded { max } => Self::CapacityExceeded { max },
            other => Self::Grid(other),
        }
    }
}

impl ViewServerError {
    pub fn malformed(reason: impl Into<String>, raw: &str) -> Self {
        Self::MalformedInput {
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }
}

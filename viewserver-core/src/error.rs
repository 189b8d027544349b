use thiserror::Error;

use crate::cell::DataType;

/// Errors raised by the grid data model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    #[error("Cell ({row}, {column}) out of bounds for {rows}×{columns} view")]
    OutOfBounds {
        row: u32,
        column: u32,
        rows: u32,
        columns: u32,
    },
    #[error("View capacity exceeded: registry already holds {max} views")]
    CapacityExceeded { max: usize },
    #[error("Invalid view dimensions: {rows}×{columns}")]
    InvalidDimensions { rows: u32, columns: u32 },
    #[error("Value does not match data type '{expected}': {found}")]
    TypeMismatch { expected: DataType, found: String },
    #[error("Unknown data type: {0}")]
    UnknownDataType(String),
}

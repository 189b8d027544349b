//! Cell values and coordinates.
//!
//! A cell is immutable: every write replaces the whole [`Cell`], including
//! its timestamp. Values are a closed sum type so a cell's data type is
//! always derivable from its value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

use crate::error::GridError;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Discriminator carried next to a value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Number,
    Integer,
    Timestamp,
    Boolean,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Timestamp => "timestamp",
            Self::Boolean => "boolean",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataType {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "number" => Ok(Self::Number),
            "integer" => Ok(Self::Integer),
            "timestamp" => Ok(Self::Timestamp),
            "boolean" => Ok(Self::Boolean),
            other => Err(GridError::UnknownDataType(other.to_string())),
        }
    }
}

/// A typed cell value.
///
/// Serializes untagged (the bare JSON value); the discriminator travels in a
/// sibling `dataType` field produced from [`CellValue::data_type`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    String(String),
    Number(f64),
    Integer(i64),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Boolean(bool),
}

impl CellValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::String(_) => DataType::String,
            Self::Number(_) => DataType::Number,
            Self::Integer(_) => DataType::Integer,
            Self::Timestamp(_) => DataType::Timestamp,
            Self::Boolean(_) => DataType::Boolean,
        }
    }

    /// Build a value from its wire representation.
    ///
    /// Integers are accepted where a number is expected; everything else
    /// must match the discriminator exactly.
    pub fn from_json(data_type: DataType, value: &serde_json::Value) -> Result<Self, GridError> {
        let parsed = match data_type {
            DataType::String => value.as_str().map(|s| Self::String(s.to_string())),
            DataType::Number => value.as_f64().map(Self::Number),
            DataType::Integer => value.as_i64().map(Self::Integer),
            DataType::Timestamp => value.as_i64().map(Self::Timestamp),
            DataType::Boolean => value.as_bool().map(Self::Boolean),
        };
        parsed.ok_or_else(|| GridError::TypeMismatch {
            expected: data_type,
            found: value.to_string(),
        })
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
            Self::Integer(i) | Self::Timestamp(i) => write!(f, "{i}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// (row, column) address inside a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellCoord {
    pub row: u32,
    pub column: u32,
}

impl CellCoord {
    pub fn new(row: u32, column: u32) -> Self {
        Self { row, column }
    }
}

/// A stored cell: coordinate, value and last-write timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub row: u32,
    pub column: u32,
    pub value: CellValue,
    pub data_type: DataType,
    /// Last-write time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Cell {
    pub fn new(row: u32, column: u32, value: CellValue, timestamp: u64) -> Self {
        let data_type = value.data_type();
        Self {
            row,
            column,
            value,
            data_type,
            timestamp,
        }
    }

    pub fn coord(&self) -> CellCoord {
        CellCoord::new(self.row, self.column)
    }
}

/// One requested cell write, as carried inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellChange {
    pub row: u32,
    pub column: u32,
    pub value: CellValue,
    pub data_type: DataType,
}

impl CellChange {
    pub fn new(row: u32, column: u32, value: CellValue) -> Self {
        let data_type = value.data_type();
        Self {
            row,
            column,
            value,
            data_type,
        }
    }
}

//! Leaf data types shared across the session and operation layers.

use std::collections::HashMap;

/// Logical type of a result column.
///
/// Deliberately small; the engine collaborator owns the full type system and
/// this layer only needs enough to describe result sets to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Int64,
    Float64,
    Utf8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> ColumnDef {
        ColumnDef {
            name: name.into(),
            data_type,
        }
    }
}

/// Schema of an operation's result set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    pub columns: Vec<ColumnDef>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDef>) -> Schema {
        Schema { columns }
    }

    pub fn empty() -> Schema {
        Schema {
            columns: Vec::new(),
        }
    }
}

/// A single result value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

/// One row of a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row(pub Vec<Value>);

/// A page of rows returned from a fetch call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowSet {
    pub rows: Vec<Row>,
}

impl RowSet {
    pub fn empty() -> RowSet {
        RowSet { rows: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Cursor mode for paginated fetch calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrientation {
    /// Restart from the beginning of the data.
    First,
    /// Continue from the current cursor position.
    Next,
}

/// How statement execution is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Block the caller until the operation reaches a terminal state.
    Sync,
    /// Run in the background; the caller polls status.
    Deferred,
}

/// Session or server metadata kinds for `get_info`.
///
/// `Other` carries unrecognized wire-level kinds so they can be rejected
/// with a typed error instead of a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    ServerName,
    EngineName,
    EngineVersion,
    Other(u16),
}

/// Client-provided configuration for a session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub options: HashMap<String, String>,
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig::default()
    }

    pub fn with_option(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> SessionConfig {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }
}

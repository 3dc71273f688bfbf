//! Metadata catalog for remote datarefs and commands.
//!
//! The simulator's web API identifies everything by a numeric id that is
//! only stable within one simulator session, so on every (re)connect the
//! client bulk-loads `/datarefs` and `/commands` and keeps the rows here,
//! indexed both ways: by path for building requests, by id for routing
//! inbound updates. Loading a page replaces the previous generation
//! wholesale; the catalog is never patched incrementally.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::variable::DataType;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can occur while loading a catalog page.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The page body is not valid JSON.
    #[error("catalog page is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// The page parsed but is not a `{"data": [...]}` wrapper.
    #[error("catalog page has no `data` array")]
    MissingData,
}

// ── Remote value types ────────────────────────────────────────────────────────

/// Value types the simulator reports for its datarefs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteValueType {
    Int,
    Float,
    Double,
    IntArray,
    FloatArray,
    /// Byte buffer; travels base64-encoded and decodes to text with
    /// trailing NULs stripped.
    Data,
}

impl RemoteValueType {
    /// The local storage type values of this remote type land in.
    pub fn data_type(self) -> DataType {
        match self {
            RemoteValueType::Int => DataType::Int,
            RemoteValueType::Float | RemoteValueType::Double => DataType::Float,
            RemoteValueType::IntArray => DataType::IntArray,
            RemoteValueType::FloatArray => DataType::FloatArray,
            RemoteValueType::Data => DataType::Text,
        }
    }

    /// Whether the remote value is an array that can be subscribed
    /// element-by-element.
    pub fn is_array(self) -> bool {
        matches!(self, RemoteValueType::IntArray | RemoteValueType::FloatArray)
    }

    /// The wire name of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteValueType::Int => "int",
            RemoteValueType::Float => "float",
            RemoteValueType::Double => "double",
            RemoteValueType::IntArray => "int_array",
            RemoteValueType::FloatArray => "float_array",
            RemoteValueType::Data => "data",
        }
    }
}

impl fmt::Display for RemoteValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Catalog rows ──────────────────────────────────────────────────────────────

/// One row of the `/datarefs` catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatarefMeta {
    pub id: u64,
    pub name: String,
    pub value_type: RemoteValueType,
    #[serde(default)]
    pub is_writable: bool,
}

/// One row of the `/commands` catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMeta {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ── Catalog ───────────────────────────────────────────────────────────────────

/// Both catalogs of one simulator session, indexed by name and by id.
#[derive(Debug, Default)]
pub struct Catalog {
    datarefs_by_name: HashMap<String, Arc<DatarefMeta>>,
    datarefs_by_id: HashMap<u64, Arc<DatarefMeta>>,
    commands_by_name: HashMap<String, Arc<CommandMeta>>,
    commands_by_id: HashMap<u64, Arc<CommandMeta>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the dataref catalog from a `{"data": [...]}` page body.
    /// Rows that do not parse (unknown value type, missing fields) are
    /// skipped with a warning. Returns the number of rows loaded.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if the body is not JSON or has no `data`
    /// array.
    pub fn load_datarefs(&mut self, body: &str) -> Result<usize, CatalogError> {
        let rows = parse_page(body)?;
        self.datarefs_by_name.clear();
        self.datarefs_by_id.clear();
        for row in &rows {
            match serde_json::from_value::<DatarefMeta>(row.clone()) {
                Ok(meta) => {
                    let meta = Arc::new(meta);
                    self.datarefs_by_id.insert(meta.id, Arc::clone(&meta));
                    self.datarefs_by_name.insert(meta.name.clone(), meta);
                }
                Err(err) => warn!(%err, %row, "skipping unreadable dataref row"),
            }
        }
        debug!(count = self.datarefs_by_name.len(), "dataref catalog loaded");
        Ok(self.datarefs_by_name.len())
    }

    /// Replaces the command catalog from a `{"data": [...]}` page body.
    /// Same tolerance and return value as [`Catalog::load_datarefs`].
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if the body is not JSON or has no `data`
    /// array.
    pub fn load_commands(&mut self, body: &str) -> Result<usize, CatalogError> {
        let rows = parse_page(body)?;
        self.commands_by_name.clear();
        self.commands_by_id.clear();
        for row in &rows {
            match serde_json::from_value::<CommandMeta>(row.clone()) {
                Ok(meta) => {
                    let meta = Arc::new(meta);
                    self.commands_by_id.insert(meta.id, Arc::clone(&meta));
                    self.commands_by_name.insert(meta.name.clone(), meta);
                }
                Err(err) => warn!(%err, %row, "skipping unreadable command row"),
            }
        }
        debug!(count = self.commands_by_name.len(), "command catalog loaded");
        Ok(self.commands_by_name.len())
    }

    pub fn dataref_by_name(&self, name: &str) -> Option<Arc<DatarefMeta>> {
        self.datarefs_by_name.get(name).cloned()
    }

    pub fn dataref_by_id(&self, id: u64) -> Option<Arc<DatarefMeta>> {
        self.datarefs_by_id.get(&id).cloned()
    }

    pub fn command_by_name(&self, name: &str) -> Option<Arc<CommandMeta>> {
        self.commands_by_name.get(name).cloned()
    }

    pub fn command_by_id(&self, id: u64) -> Option<Arc<CommandMeta>> {
        self.commands_by_id.get(&id).cloned()
    }

    pub fn dataref_count(&self) -> usize {
        self.datarefs_by_name.len()
    }

    pub fn command_count(&self) -> usize {
        self.commands_by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datarefs_by_name.is_empty() && self.commands_by_name.is_empty()
    }

    /// Drops both catalogs, e.g. when the simulator session ends.
    pub fn clear(&mut self) {
        self.datarefs_by_name.clear();
        self.datarefs_by_id.clear();
        self.commands_by_name.clear();
        self.commands_by_id.clear();
    }
}

fn parse_page(body: &str) -> Result<Vec<serde_json::Value>, CatalogError> {
    let page: serde_json::Value = serde_json::from_str(body)?;
    page.get("data")
        .and_then(serde_json::Value::as_array)
        .cloned()
        .ok_or(CatalogError::MissingData)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

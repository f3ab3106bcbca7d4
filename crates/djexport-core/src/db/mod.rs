//! Destination database on CozoDB
//!
//! The exported library is a small relational database next to the
//! exported media files:
//! - `tracks` with tags, audio properties and the media path relative to
//!   the database directory
//! - `beatgrids`, `hot_cues` and `loops` keyed by track
//! - `crates` (nested via `parent_id`) and `crate_tracks` membership
//!
//! [`EngineLibrary`] implements [`DestinationStore`](crate::export::DestinationStore)
//! on top of it, including staged writes.

mod schema;
mod store;

pub use store::{EngineLibrary, DATABASE_FILE};

use cozo::{DataValue, DbInstance, NamedRows};
use std::collections::BTreeMap;
use std::path::Path;

/// Database connection wrapper
pub struct EngineDb {
    db: DbInstance,
}

impl EngineDb {
    /// Open or create a database at the given path (SQLite backend)
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = DbInstance::new("sqlite", path, "").map_err(|e| StoreError::Open(e.to_string()))?;

        let engine_db = Self { db };
        engine_db.ensure_schema()?;

        Ok(engine_db)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = DbInstance::new("mem", "", "").map_err(|e| StoreError::Open(e.to_string()))?;

        let engine_db = Self { db };
        engine_db.ensure_schema()?;

        Ok(engine_db)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        schema::create_all_relations(&self.db)
    }

    /// Run a mutating CozoScript
    pub fn run_script(
        &self,
        script: &str,
        params: BTreeMap<String, DataValue>,
    ) -> Result<NamedRows, StoreError> {
        self.db
            .run_script(script, params, cozo::ScriptMutability::Mutable)
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// Run a read-only query
    pub fn run_query(
        &self,
        script: &str,
        params: BTreeMap<String, DataValue>,
    ) -> Result<NamedRows, StoreError> {
        self.db
            .run_script(script, params, cozo::ScriptMutability::Immutable)
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// Schema version recorded in the `information` relation
    pub fn schema_version(&self) -> Result<Option<String>, StoreError> {
        let result = self.run_query(
            "?[value] := *information{key, value}, key = 'schema_version'",
            BTreeMap::new(),
        )?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.get_str())
            .map(str::to_string))
    }
}

/// Destination store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Destination database is not open")]
    NotOpen,

    #[error("Unknown destination track {0}")]
    UnknownTrack(crate::types::DestTrackId),

    #[error("Unknown destination crate {0}")]
    UnknownCrate(crate::types::DestCrateId),
}

/// Helper macro for creating parameter maps
#[macro_export]
macro_rules! params {
    () => {
        std::collections::BTreeMap::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = std::collections::BTreeMap::new();
        $(
            map.insert($key.to_string(), cozo::DataValue::from($value));
        )+
        map
    }};
}

pub(crate) fn text(value: &str) -> DataValue {
    DataValue::Str(value.into())
}

pub(crate) fn nullable_text(value: Option<&str>) -> DataValue {
    value.map(text).unwrap_or(DataValue::Null)
}

pub(crate) fn nullable_int(value: Option<i64>) -> DataValue {
    value.map(DataValue::from).unwrap_or(DataValue::Null)
}

pub(crate) fn nullable_float(value: Option<f64>) -> DataValue {
    value.map(DataValue::from).unwrap_or(DataValue::Null)
}

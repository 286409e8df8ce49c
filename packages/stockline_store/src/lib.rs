//! Storage collaborator boundary for the Stockline sync service.
//!
//! The sync core never owns business data: every dataset read and every
//! mutation goes through the [`SyncStore`] trait. The full application
//! wires its CRUD database in here; [`MemoryStore`] is the in-process
//! reference implementation used by the demo server and the test suite.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Datasets the sync service can stream, in default sync order.
pub const DATASETS: [&str; 5] = ["inventory", "warehouses", "suppliers", "categories", "units"];

/// Mutation kind carried by a data-change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Outcome of a successfully applied mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedChange {
    /// Row id the change resolved to (assigned by the store on create).
    pub id: Option<Value>,
    /// Resulting row as stored; `None` after a delete.
    pub data: Option<Value>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("no such row: {entity}/{id}")]
    NotFound { entity: String, id: String },

    #[error("change is missing required field: {0}")]
    InvalidChange(&'static str),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Machine-readable code carried on the wire instead of the raw
    /// error text.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownEntity(_) => "unknown_entity",
            Self::NotFound { .. } => "not_found",
            Self::InvalidChange(_) => "invalid_change",
            Self::Backend(_) => "storage_failure",
        }
    }
}

/// Async data-access seam consumed by the sync core.
///
/// Every call is fallible and may suspend. Callers apply each mutation
/// exactly once; broadcast fan-out never reaches the store.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Fetch a full snapshot of a named dataset. `Ok(None)` means the
    /// name is not a dataset this store knows — the caller decides how
    /// to react.
    async fn fetch_dataset(&self, name: &str) -> Result<Option<Vec<Value>>, StoreError>;

    /// Apply one create/update/delete against an entity collection.
    async fn apply_change(
        &self,
        entity: &str,
        action: ChangeAction,
        id: Option<&Value>,
        data: Option<&Value>,
    ) -> Result<AppliedChange, StoreError>;
}

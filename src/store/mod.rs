//! Persistence gateway for tracking records.
//!
//! The tracking middleware writes through the narrow [`Store`] trait; the
//! backing implementation is interchangeable. [`SqliteStore`] persists to a
//! SQLite database on a dedicated worker thread, [`MemStore`] keeps records
//! in memory for tests and demos.

pub mod memory;
pub mod sqlite;

pub use memory::MemStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::model::{Call, CallStatus, Instance, View};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("store worker unavailable")]
    Unavailable,
}

/// Filter for [`Store::query_calls`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct CallFilter {
    /// Only calls caused by this parent call.
    pub parent_call_id: Option<i64>,
    /// Only calls attributed to this instance.
    pub instance: Option<i64>,
    /// Only calls whose completion was never observed.
    pub unfinished_only: bool,
    /// Maximum number of calls to return, newest first.
    pub limit: Option<usize>,
}

/// Filter for [`Store::query_views`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ViewFilter {
    /// Only views belonging to this instance.
    pub instance: Option<i64>,
    /// Maximum number of views to return, newest first.
    pub limit: Option<usize>,
}

/// The persistence operations the tracking core depends on.
///
/// Each write is a single atomic insert or update; the call graph is
/// reconstructed at read time, so no cross-record ordering is enforced here.
#[async_trait]
pub trait Store: Send + Sync {
    /// Allocate the next client identity. Issued values are never reused.
    async fn next_client_id(&self) -> Result<i64, StoreError>;

    /// Persist an instance record, returning its assigned ID.
    async fn insert_instance(&self, instance: &Instance) -> Result<i64, StoreError>;

    /// Persist a call "started" record, returning its assigned ID.
    async fn insert_call(&self, call: &Call) -> Result<i64, StoreError>;

    /// Persist the outcome of a call. At most one status per call.
    async fn set_call_status(&self, call_id: i64, status: &CallStatus) -> Result<(), StoreError>;

    /// Persist a view. An existing (instance, seq) row is overwritten.
    async fn insert_view(&self, view: &View) -> Result<(), StoreError>;

    async fn query_calls(&self, filter: &CallFilter) -> Result<Vec<Call>, StoreError>;

    async fn query_views(&self, filter: &ViewFilter) -> Result<Vec<View>, StoreError>;
}

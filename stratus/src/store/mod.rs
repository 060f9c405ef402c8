//! The request store: durable per-request records with an atomic
//! read-modify-write update protocol.
//!
//! The store is the only shared mutable resource between the server, its
//! workers, and the child processes. All mutation goes through
//! [`RequestStore::update`], which runs inside a transaction and rejects
//! status changes that violate the request state machine.

use async_trait::async_trait;

use crate::error::Result;
use crate::request::{RequestId, RequestRecord, RequestStatus};

pub mod sqlite;

/// Filter for [`RequestStore::list`]. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    /// Only records whose status is one of these.
    pub statuses: Option<Vec<RequestStatus>>,
    /// Only records submitted by this user hash.
    pub user_id: Option<String>,
}

impl RequestFilter {
    /// Records that are still live (PENDING or RUNNING).
    pub fn active() -> Self {
        RequestFilter {
            statuses: Some(vec![RequestStatus::Pending, RequestStatus::Running]),
            user_id: None,
        }
    }

    pub fn with_status(status: RequestStatus) -> Self {
        RequestFilter {
            statuses: Some(vec![status]),
            user_id: None,
        }
    }
}

/// Storage for request records.
///
/// Implementations must make `create_if_not_exists` atomic (first write
/// wins) and `update` transactional, so concurrent worker and abort updates
/// cannot lose writes.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new record. Returns false (and writes nothing) if a record
    /// with the same id already exists.
    async fn create_if_not_exists(&self, record: &RequestRecord) -> Result<bool>;

    /// Fetch one record.
    async fn get(&self, id: RequestId) -> Result<Option<RequestRecord>>;

    /// Fetch records matching the filter, oldest first.
    async fn list(&self, filter: &RequestFilter) -> Result<Vec<RequestRecord>>;

    /// Atomically mutate one record: load it inside a transaction, apply
    /// `mutate`, validate the status transition, and persist.
    ///
    /// The closure may be invoked more than once if the transaction is
    /// retried on transient contention.
    ///
    /// # Errors
    /// - [`StratusError::RequestNotFound`] if the id is unknown
    /// - [`StratusError::InvalidTransition`] if the mutation moved the
    ///   status against the state machine; nothing is persisted
    ///
    /// [`StratusError::RequestNotFound`]: crate::error::StratusError::RequestNotFound
    /// [`StratusError::InvalidTransition`]: crate::error::StratusError::InvalidTransition
    async fn update<F>(&self, id: RequestId, mutate: F) -> Result<RequestRecord>
    where
        F: FnMut(&mut RequestRecord) -> Result<()> + Send;
}

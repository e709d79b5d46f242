//! Collaborator interfaces consumed by the injector
//!
//! The engine never talks to the schema layer directly; it consumes these
//! narrow traits, implemented over the metadata database in production and
//! by in-memory fakes in tests. All boundaries are call-style service
//! interfaces assumed to be reliable and safely retryable.

use async_trait::async_trait;
use gridflow_metadata::{
    DidContent, DidRecord, DistanceEdge, ElementProtocol, NewTransferRequest, QuotaSnapshot,
    Replica, Rule, RuleState, StorageElement,
};
use std::time::Duration;
use uuid::Uuid;

pub type StoreResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// The durable rule store: pending-rule reads, state writes, and the lease
/// table used for partitioning.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Fetch a bounded batch of pending rules owned by this worker ordinal.
    async fn fetch_pending(
        &self,
        worker_ordinal: usize,
        worker_count: usize,
        limit: usize,
    ) -> StoreResult<Vec<Rule>>;

    async fn read(&self, rule_id: Uuid) -> StoreResult<Option<Rule>>;

    async fn update_state(
        &self,
        rule_id: Uuid,
        state: RuleState,
        reason: Option<&str>,
    ) -> StoreResult<()>;

    /// Increment the no-progress counter; returns the new value.
    async fn record_no_progress(&self, rule_id: Uuid, reason: &str) -> StoreResult<i32>;

    async fn reset_no_progress(&self, rule_id: Uuid) -> StoreResult<()>;

    /// Acquire the rule lease; returns the new epoch, or `None` when
    /// another worker holds an unexpired lease.
    async fn acquire_lease(
        &self,
        rule_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> StoreResult<Option<i64>>;

    async fn renew_lease(
        &self,
        rule_id: Uuid,
        worker_id: &str,
        epoch: i64,
        ttl: Duration,
    ) -> StoreResult<bool>;

    async fn release_lease(&self, rule_id: Uuid, worker_id: &str, epoch: i64)
        -> StoreResult<bool>;
}

/// Read-only inventory and topology access
#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn list_storage_elements(&self) -> StoreResult<Vec<StorageElement>>;

    async fn list_protocols(&self) -> StoreResult<Vec<ElementProtocol>>;

    async fn list_distances(&self) -> StoreResult<Vec<DistanceEdge>>;

    async fn get_did(&self, scope: &str, name: &str) -> StoreResult<Option<DidRecord>>;

    async fn list_children(&self, scope: &str, name: &str) -> StoreResult<Vec<DidContent>>;

    /// Replicas for a set of files keyed `scope:name`
    async fn list_replicas(&self, file_keys: &[String]) -> StoreResult<Vec<Replica>>;

    async fn list_quota_snapshots(&self, account: &str) -> StoreResult<Vec<QuotaSnapshot>>;

    /// (destination, scope, name) triples already requested for a rule
    async fn pending_destinations(&self, rule_id: Uuid) -> StoreResult<Vec<(Uuid, String, String)>>;
}

/// The transfer subsystem's intake
#[async_trait]
pub trait TransferSubmitter: Send + Sync {
    /// Submit a transfer request. De-duplicates by idempotency key;
    /// returns true if a new work item was created.
    async fn submit(&self, request: NewTransferRequest) -> StoreResult<bool>;
}

//! PostgreSQL-backed collaborator client
//!
//! Implements the RuleStore, InventoryClient, and TransferSubmitter traits
//! over `gridflow_metadata::Database`.

use crate::coordinator::owns;
use crate::store::{InventoryClient, RuleStore, StoreResult, TransferSubmitter};
use async_trait::async_trait;
use gridflow_metadata::{
    Database, DidContent, DidRecord, DistanceEdge, ElementProtocol, NewTransferRequest,
    QuotaSnapshot, Replica, Rule, RuleState, StorageElement,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

fn boxed<E: std::error::Error + Send + Sync + 'static>(
    e: E,
) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(e)
}

/// PostgreSQL store client
pub struct PostgresStoreClient {
    db: Arc<Database>,
}

impl PostgresStoreClient {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Get the underlying database reference
    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl RuleStore for PostgresStoreClient {
    /// The ownership predicate lives in Rust (`coordinator::owns`), so the
    /// query over-fetches by the worker count and the slice is filtered
    /// here; every worker sees a disjoint subset of the same ordering.
    #[instrument(skip(self))]
    async fn fetch_pending(
        &self,
        worker_ordinal: usize,
        worker_count: usize,
        limit: usize,
    ) -> StoreResult<Vec<Rule>> {
        let window = (limit.saturating_mul(worker_count.max(1))) as i64;
        let rules = self.db.list_pending_rules(window).await.map_err(boxed)?;

        let owned: Vec<Rule> = rules
            .into_iter()
            .filter(|r| owns(r.id, worker_ordinal, worker_count))
            .take(limit)
            .collect();

        debug!(count = owned.len(), "Fetched pending rules for partition");
        Ok(owned)
    }

    async fn read(&self, rule_id: Uuid) -> StoreResult<Option<Rule>> {
        self.db.get_rule(rule_id).await.map_err(boxed)
    }

    async fn update_state(
        &self,
        rule_id: Uuid,
        state: RuleState,
        reason: Option<&str>,
    ) -> StoreResult<()> {
        self.db
            .update_rule_state(rule_id, state, reason)
            .await
            .map_err(boxed)
    }

    async fn record_no_progress(&self, rule_id: Uuid, reason: &str) -> StoreResult<i32> {
        self.db
            .record_no_progress(rule_id, reason)
            .await
            .map_err(boxed)
    }

    async fn reset_no_progress(&self, rule_id: Uuid) -> StoreResult<()> {
        self.db.reset_no_progress(rule_id).await.map_err(boxed)
    }

    async fn acquire_lease(
        &self,
        rule_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> StoreResult<Option<i64>> {
        self.db
            .acquire_rule_lease(rule_id, worker_id, ttl)
            .await
            .map_err(boxed)
    }

    async fn renew_lease(
        &self,
        rule_id: Uuid,
        worker_id: &str,
        epoch: i64,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.db
            .renew_rule_lease(rule_id, worker_id, epoch, ttl)
            .await
            .map_err(boxed)
    }

    async fn release_lease(
        &self,
        rule_id: Uuid,
        worker_id: &str,
        epoch: i64,
    ) -> StoreResult<bool> {
        self.db
            .release_rule_lease(rule_id, worker_id, epoch)
            .await
            .map_err(boxed)
    }
}

#[async_trait]
impl InventoryClient for PostgresStoreClient {
    async fn list_storage_elements(&self) -> StoreResult<Vec<StorageElement>> {
        self.db.list_storage_elements().await.map_err(boxed)
    }

    async fn list_protocols(&self) -> StoreResult<Vec<ElementProtocol>> {
        self.db.list_element_protocols().await.map_err(boxed)
    }

    async fn list_distances(&self) -> StoreResult<Vec<DistanceEdge>> {
        self.db.list_distances().await.map_err(boxed)
    }

    async fn get_did(&self, scope: &str, name: &str) -> StoreResult<Option<DidRecord>> {
        self.db.get_did(scope, name).await.map_err(boxed)
    }

    async fn list_children(&self, scope: &str, name: &str) -> StoreResult<Vec<DidContent>> {
        self.db.list_did_content(scope, name).await.map_err(boxed)
    }

    async fn list_replicas(&self, file_keys: &[String]) -> StoreResult<Vec<Replica>> {
        self.db.list_replicas(file_keys).await.map_err(boxed)
    }

    async fn list_quota_snapshots(&self, account: &str) -> StoreResult<Vec<QuotaSnapshot>> {
        self.db.list_quota_snapshots(account).await.map_err(boxed)
    }

    async fn pending_destinations(
        &self,
        rule_id: Uuid,
    ) -> StoreResult<Vec<(Uuid, String, String)>> {
        self.db
            .list_rule_request_destinations(rule_id)
            .await
            .map_err(boxed)
    }
}

#[async_trait]
impl TransferSubmitter for PostgresStoreClient {
    async fn submit(&self, request: NewTransferRequest) -> StoreResult<bool> {
        self.db.insert_transfer_request(request).await.map_err(boxed)
    }
}

//! End-to-end tests for the rule injector against an in-memory store.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use gridflow_injector::{
    InjectorConfig, InjectorDaemon, InventoryClient, RuleStore, StoreResult, TransferSubmitter,
};
use gridflow_metadata::{
    DidContent, DidKind, DidRecord, DistanceEdge, ElementProtocol, NewTransferRequest,
    ProtocolDomain, QuotaSnapshot, Replica, ReplicaState, Rule, RuleGrouping, RuleState,
    StorageElement,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct MemoryStore {
    rules: Mutex<HashMap<Uuid, Rule>>,
    elements: Vec<StorageElement>,
    protocols: Vec<ElementProtocol>,
    distances: Vec<DistanceEdge>,
    dids: HashMap<(String, String), DidRecord>,
    contents: HashMap<(String, String), Vec<DidContent>>,
    replicas: Mutex<Vec<Replica>>,
    quotas: Vec<QuotaSnapshot>,
    requests: Mutex<Vec<NewTransferRequest>>,
    evaluations: Mutex<HashMap<Uuid, usize>>,
}

impl MemoryStore {
    fn add_element(&mut self, name: &str, multihop: bool) -> Uuid {
        let id = Uuid::new_v4();
        self.elements.push(StorageElement {
            id,
            name: name.to_string(),
            read_enabled: true,
            write_enabled: true,
            delete_enabled: true,
            multihop_eligible: multihop,
            blacklisted: false,
            attributes: serde_json::json!({"tier": "1"}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        self.protocols.push(ElementProtocol {
            id: Uuid::new_v4(),
            element_id: id,
            scheme: "https".to_string(),
            domain: ProtocolDomain::Wan,
            can_read: true,
            can_write: true,
            can_delete: true,
            can_third_party_copy: true,
            rank: 0,
        });
        id
    }

    fn add_edge(&mut self, src: Uuid, dst: Uuid, distance: i64) {
        self.distances.push(DistanceEdge {
            src_id: src,
            dst_id: dst,
            distance,
            ranking: 0,
        });
    }

    fn add_file(&mut self, scope: &str, name: &str, bytes: i64) {
        self.dids.insert(
            (scope.to_string(), name.to_string()),
            DidRecord {
                scope: scope.to_string(),
                name: name.to_string(),
                did_kind: DidKind::File,
                bytes: Some(bytes),
            },
        );
    }

    fn add_replica(&self, element_id: Uuid, scope: &str, name: &str, bytes: i64) {
        self.replicas.lock().unwrap().push(Replica {
            element_id,
            scope: scope.to_string(),
            name: name.to_string(),
            bytes,
            state: ReplicaState::Available,
        });
    }

    fn add_quota(&mut self, account: &str, element_id: Uuid, limit_bytes: i64) {
        self.quotas.push(QuotaSnapshot {
            account: account.to_string(),
            element_id,
            limit_bytes,
            used_bytes: 0,
        });
    }

    fn add_rule(&self, scope: &str, name: &str, expression: &str, copies: i32) -> Uuid {
        let rule = Rule {
            id: Uuid::new_v4(),
            account: "alice".to_string(),
            scope: scope.to_string(),
            name: name.to_string(),
            rse_expression: expression.to_string(),
            copies,
            grouping: RuleGrouping::None,
            priority: 3,
            expires_at: None,
            state: RuleState::Inject,
            error_reason: None,
            no_progress_count: 0,
            leased_by: None,
            lease_expires_at: None,
            lease_epoch: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let id = rule.id;
        self.rules.lock().unwrap().insert(id, rule);
        id
    }

    fn rule(&self, id: Uuid) -> Rule {
        self.rules.lock().unwrap().get(&id).unwrap().clone()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn fetch_pending(
        &self,
        worker_ordinal: usize,
        worker_count: usize,
        limit: usize,
    ) -> StoreResult<Vec<Rule>> {
        let now = Utc::now();
        let rules = self.rules.lock().unwrap();
        let mut pending: Vec<Rule> = rules
            .values()
            .filter(|r| matches!(r.state, RuleState::Inject | RuleState::Replicating))
            .filter(|r| r.expires_at.map(|t| t > now).unwrap_or(true))
            .filter(|r| {
                r.leased_by.is_none() || r.lease_expires_at.map(|t| t < now).unwrap_or(true)
            })
            .filter(|r| gridflow_injector::owns(r.id, worker_ordinal, worker_count))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn read(&self, rule_id: Uuid) -> StoreResult<Option<Rule>> {
        Ok(self.rules.lock().unwrap().get(&rule_id).cloned())
    }

    async fn update_state(
        &self,
        rule_id: Uuid,
        state: RuleState,
        reason: Option<&str>,
    ) -> StoreResult<()> {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.get_mut(&rule_id) {
            rule.state = state;
            if let Some(reason) = reason {
                rule.error_reason = Some(reason.to_string());
            }
        }
        Ok(())
    }

    async fn record_no_progress(&self, rule_id: Uuid, reason: &str) -> StoreResult<i32> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.get_mut(&rule_id).ok_or("rule not found")?;
        rule.no_progress_count += 1;
        rule.error_reason = Some(reason.to_string());
        Ok(rule.no_progress_count)
    }

    async fn reset_no_progress(&self, rule_id: Uuid) -> StoreResult<()> {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.get_mut(&rule_id) {
            rule.no_progress_count = 0;
            rule.error_reason = None;
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        rule_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> StoreResult<Option<i64>> {
        let now = Utc::now();
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.get_mut(&rule_id).ok_or("rule not found")?;
        let free =
            rule.leased_by.is_none() || rule.lease_expires_at.map(|t| t < now).unwrap_or(true);
        if !free {
            return Ok(None);
        }
        rule.leased_by = Some(worker_id.to_string());
        rule.lease_expires_at =
            Some(now + ChronoDuration::milliseconds(ttl.as_millis() as i64));
        rule.lease_epoch += 1;
        Ok(Some(rule.lease_epoch))
    }

    async fn renew_lease(
        &self,
        rule_id: Uuid,
        worker_id: &str,
        epoch: i64,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.get_mut(&rule_id).ok_or("rule not found")?;
        if rule.leased_by.as_deref() == Some(worker_id) && rule.lease_epoch == epoch {
            rule.lease_expires_at =
                Some(now + ChronoDuration::milliseconds(ttl.as_millis() as i64));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_lease(
        &self,
        rule_id: Uuid,
        worker_id: &str,
        epoch: i64,
    ) -> StoreResult<bool> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.get_mut(&rule_id).ok_or("rule not found")?;
        if rule.leased_by.as_deref() == Some(worker_id) && rule.lease_epoch == epoch {
            rule.leased_by = None;
            rule.lease_expires_at = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[async_trait]
impl InventoryClient for MemoryStore {
    async fn list_storage_elements(&self) -> StoreResult<Vec<StorageElement>> {
        Ok(self.elements.clone())
    }

    async fn list_protocols(&self) -> StoreResult<Vec<ElementProtocol>> {
        Ok(self.protocols.clone())
    }

    async fn list_distances(&self) -> StoreResult<Vec<DistanceEdge>> {
        Ok(self.distances.clone())
    }

    async fn get_did(&self, scope: &str, name: &str) -> StoreResult<Option<DidRecord>> {
        Ok(self.dids.get(&(scope.to_string(), name.to_string())).cloned())
    }

    async fn list_children(&self, scope: &str, name: &str) -> StoreResult<Vec<DidContent>> {
        Ok(self
            .contents
            .get(&(scope.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_replicas(&self, file_keys: &[String]) -> StoreResult<Vec<Replica>> {
        Ok(self
            .replicas
            .lock()
            .unwrap()
            .iter()
            .filter(|r| file_keys.contains(&format!("{}:{}", r.scope, r.name)))
            .cloned()
            .collect())
    }

    async fn list_quota_snapshots(&self, account: &str) -> StoreResult<Vec<QuotaSnapshot>> {
        Ok(self
            .quotas
            .iter()
            .filter(|q| q.account == account)
            .cloned()
            .collect())
    }

    async fn pending_destinations(
        &self,
        rule_id: Uuid,
    ) -> StoreResult<Vec<(Uuid, String, String)>> {
        *self
            .evaluations
            .lock()
            .unwrap()
            .entry(rule_id)
            .or_default() += 1;
        Ok(self
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.rule_id == rule_id)
            .map(|r| (r.dest_id, r.scope.clone(), r.name.clone()))
            .collect())
    }
}

#[async_trait]
impl TransferSubmitter for MemoryStore {
    async fn submit(&self, request: NewTransferRequest) -> StoreResult<bool> {
        let mut requests = self.requests.lock().unwrap();
        if requests
            .iter()
            .any(|r| r.idempotency_key == request.idempotency_key)
        {
            return Ok(false);
        }
        requests.push(request);
        Ok(true)
    }
}

fn test_config() -> InjectorConfig {
    InjectorConfig {
        database_url: String::new(),
        threads: 1,
        sleep_time_secs: 1,
        batch_size: 100,
        lease_ttl_secs: 60,
        no_progress_threshold: 2,
        max_sources: 4,
        retry_attempts: 1,
        retry_delay_ms: 1,
        dry_run: false,
    }
}

fn make_daemon(store: Arc<MemoryStore>, config: InjectorConfig) -> InjectorDaemon {
    InjectorDaemon::new(config, store.clone(), store.clone(), store)
}

#[tokio::test]
async fn test_single_pass_reaches_target_copies() {
    let mut store = MemoryStore::default();
    let x = store.add_element("X", false);
    let y = store.add_element("Y", false);
    let z = store.add_element("Z", false);
    store.add_edge(x, y, 1);
    store.add_edge(x, z, 5);
    store.add_file("s", "f1", 100);
    store.add_quota("alice", x, i64::MAX);
    store.add_quota("alice", y, i64::MAX);
    store.add_quota("alice", z, i64::MAX);
    let rule_id = store.add_rule("s", "f1", "tier=1", 2);
    store.add_replica(x, "s", "f1", 100);

    let store = Arc::new(store);
    make_daemon(store.clone(), test_config()).run(true).await;

    // One existing copy, target two: exactly one request, to the nearest
    // candidate.
    let requests = store.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].dest_id, y);
    assert_eq!(requests[0].source_ids, vec![x]);

    let rule = store.rule(rule_id);
    assert_eq!(rule.state, RuleState::Replicating);
    assert_eq!(rule.no_progress_count, 0);
    assert!(rule.leased_by.is_none(), "lease released after evaluation");
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let mut store = MemoryStore::default();
    let x = store.add_element("X", false);
    let y = store.add_element("Y", false);
    store.add_edge(x, y, 1);
    store.add_file("s", "f1", 100);
    store.add_quota("alice", x, i64::MAX);
    store.add_quota("alice", y, i64::MAX);
    let rule_id = store.add_rule("s", "f1", "tier=1", 2);
    store.add_replica(x, "s", "f1", 100);

    let store = Arc::new(store);
    make_daemon(store.clone(), test_config()).run(true).await;
    assert_eq!(store.request_count(), 1);

    // Unchanged inventory: nothing further is emitted and the rule does
    // not regress.
    make_daemon(store.clone(), test_config()).run(true).await;
    assert_eq!(store.request_count(), 1);
    let rule = store.rule(rule_id);
    assert_eq!(rule.state, RuleState::Replicating);
    assert_eq!(rule.no_progress_count, 0);

    // Transfer subsystem reports the replica; the rule completes.
    store.add_replica(y, "s", "f1", 100);
    make_daemon(store.clone(), test_config()).run(true).await;
    assert_eq!(store.request_count(), 1);
    assert_eq!(store.rule(rule_id).state, RuleState::Ok);
}

#[tokio::test]
async fn test_quota_exhaustion_sticks_rule_after_threshold() {
    let mut store = MemoryStore::default();
    let x = store.add_element("X", false);
    let y = store.add_element("Y", false);
    store.add_edge(x, y, 1);
    store.add_file("s", "f1", 100);
    store.add_quota("alice", x, i64::MAX);
    store.add_quota("alice", y, 0); // only candidate has zero headroom
    let rule_id = store.add_rule("s", "f1", "tier=1", 2);
    store.add_replica(x, "s", "f1", 100);

    let store = Arc::new(store);

    make_daemon(store.clone(), test_config()).run(true).await;
    let rule = store.rule(rule_id);
    assert_eq!(rule.state, RuleState::Inject);
    assert_eq!(rule.no_progress_count, 1);

    make_daemon(store.clone(), test_config()).run(true).await;
    let rule = store.rule(rule_id);
    assert_eq!(rule.state, RuleState::Stuck);
    assert_eq!(rule.no_progress_count, 2);
    let reason = rule.error_reason.expect("stuck rule records a reason");
    assert!(reason.contains("quota headroom"), "reason: {}", reason);
    assert_eq!(store.request_count(), 0);
}

#[tokio::test]
async fn test_workers_partition_rules_without_overlap() {
    let mut store = MemoryStore::default();
    let x = store.add_element("X", false);
    let y = store.add_element("Y", false);
    store.add_edge(x, y, 1);
    store.add_quota("alice", x, i64::MAX);
    store.add_quota("alice", y, i64::MAX);

    let mut rule_ids = Vec::new();
    for i in 0..10 {
        let name = format!("f{}", i);
        store.add_file("s", &name, 10);
        rule_ids.push(store.add_rule("s", &name, "tier=1", 2));
    }
    let store = Arc::new(store);
    for i in 0..10 {
        store.add_replica(x, "s", &format!("f{}", i), 10);
    }

    let config = InjectorConfig {
        threads: 3,
        ..test_config()
    };
    make_daemon(store.clone(), config).run(true).await;

    // Every rule evaluated exactly once across all workers.
    let evaluations = store.evaluations.lock().unwrap().clone();
    for rule_id in &rule_ids {
        assert_eq!(evaluations.get(rule_id), Some(&1), "rule {}", rule_id);
    }
    assert_eq!(store.request_count(), 10);
}

#[tokio::test]
async fn test_cancellation_stops_workers() {
    let store = Arc::new(MemoryStore::default());
    let daemon = make_daemon(store, test_config());
    let token = daemon.cancellation_token();

    let handle = tokio::spawn(async move { daemon.run(false).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("workers exit after cancellation")
        .unwrap();
}

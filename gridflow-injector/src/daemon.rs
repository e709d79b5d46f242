//! Scheduler loop
//!
//! Drives repeated evaluation passes per worker. Each worker claims a
//! bounded batch of rules it owns, rebuilds the topology view, evaluates
//! each rule, commits state changes, and sleeps only when a batch comes
//! back empty. Workers share no mutable state; the rule store's lease
//! table and the quota ledger are the only shared resources, reached
//! through the narrow collaborator traits.
//!
//! Cancellation is cooperative: the shared token is observed between rule
//! evaluations and before sleeping. A cancelled worker finishes the rule
//! it is evaluating, releases its lease, and exits.

use crate::closure::resolve_closure;
use crate::config::InjectorConfig;
use crate::coordinator::{owns, CoordinatorError, PartitionCoordinator, RuleLease};
use crate::emitter::RequestEmitter;
use crate::evaluator::{BlockedUnit, RuleEvaluator};
use crate::store::{InventoryClient, RuleStore, StoreResult, TransferSubmitter};
use gridflow_metadata::{Rule, RuleState, TopologyView};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// The rule-injection daemon: owns the cancellation token and spawns one
/// independent scheduler loop per worker.
pub struct InjectorDaemon {
    config: InjectorConfig,
    store: Arc<dyn RuleStore>,
    inventory: Arc<dyn InventoryClient>,
    submitter: Arc<dyn TransferSubmitter>,
    token: CancellationToken,
}

impl InjectorDaemon {
    pub fn new(
        config: InjectorConfig,
        store: Arc<dyn RuleStore>,
        inventory: Arc<dyn InventoryClient>,
        submitter: Arc<dyn TransferSubmitter>,
    ) -> Self {
        Self {
            config,
            store,
            inventory,
            submitter,
            token: CancellationToken::new(),
        }
    }

    /// Token handle for the signal handler; cancelling it stops every
    /// worker gracefully.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run all worker loops to completion. In `run_once` mode each worker
    /// performs exactly one fetch-and-evaluate cycle over its share of the
    /// pending set, then exits.
    pub async fn run(&self, run_once: bool) {
        info!(
            threads = self.config.threads,
            run_once,
            dry_run = self.config.dry_run,
            "Rule injector started"
        );

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let mut handles = Vec::new();

        for ordinal in 0..self.config.threads {
            let worker_id = format!("{}:{}:{}", hostname, std::process::id(), ordinal);
            let worker = Worker {
                config: self.config.clone(),
                ordinal,
                coordinator: PartitionCoordinator::new(
                    self.store.clone(),
                    worker_id,
                    self.config.lease_ttl(),
                ),
                evaluator: RuleEvaluator::new(self.config.max_sources),
                emitter: RequestEmitter::new(self.submitter.clone(), self.config.dry_run),
                store: self.store.clone(),
                inventory: self.inventory.clone(),
                token: self.token.clone(),
            };
            handles.push(tokio::spawn(worker.run(run_once)));
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }

        info!("Rule injector stopped");
    }
}

struct Worker {
    config: InjectorConfig,
    ordinal: usize,
    coordinator: PartitionCoordinator,
    evaluator: RuleEvaluator,
    emitter: RequestEmitter,
    store: Arc<dyn RuleStore>,
    inventory: Arc<dyn InventoryClient>,
    token: CancellationToken,
}

impl Worker {
    async fn run(self, run_once: bool) {
        info!(worker = self.ordinal, "Worker loop started");

        loop {
            if self.token.is_cancelled() {
                break;
            }

            let processed = match self.run_pass().await {
                Ok(processed) => processed,
                Err(e) => {
                    warn!(worker = self.ordinal, error = %e, "Evaluation pass failed");
                    0
                }
            };

            if run_once {
                break;
            }

            // Sleep only after an empty batch, never after doing work; a
            // busy backlog must not be starved.
            if processed == 0 {
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = tokio::time::sleep(self.config.sleep_time()) => {}
                }
            }
        }

        info!(worker = self.ordinal, "Worker loop exited");
    }

    /// One fetch-and-evaluate cycle. Returns the number of rules evaluated.
    #[instrument(skip(self), fields(worker = self.ordinal))]
    async fn run_pass(&self) -> StoreResult<usize> {
        let rules = self
            .with_retries(|| {
                self.store
                    .fetch_pending(self.ordinal, self.config.threads, self.config.batch_size)
            })
            .await?;

        if rules.is_empty() {
            debug!("No pending rules in this partition");
            return Ok(0);
        }

        // Fresh topology per pass: distances, quotas, and availability all
        // change externally.
        let topology = self.load_topology().await?;
        let mut processed = 0;

        for rule in rules {
            if self.token.is_cancelled() {
                break;
            }
            if !owns(rule.id, self.ordinal, self.config.threads) {
                continue;
            }

            let lease = match self.coordinator.acquire(rule.id).await {
                Ok(lease) => lease,
                Err(CoordinatorError::AlreadyOwned(_)) => continue,
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "Lease acquisition failed");
                    continue;
                }
            };

            match self.process_rule(&rule, &lease, &topology).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    // Transient failure: state untouched, retried next pass.
                    warn!(rule_id = %rule.id, error = %e, "Rule evaluation failed, retrying next pass");
                }
            }

            if let Err(e) = self.coordinator.release(lease).await {
                warn!(rule_id = %rule.id, error = %e, "Lease release failed");
            }
        }

        Ok(processed)
    }

    async fn load_topology(&self) -> StoreResult<TopologyView> {
        let elements = self
            .with_retries(|| self.inventory.list_storage_elements())
            .await?;
        let protocols = self.with_retries(|| self.inventory.list_protocols()).await?;
        let distances = self.with_retries(|| self.inventory.list_distances()).await?;
        Ok(TopologyView::from_parts(elements, protocols, distances))
    }

    async fn process_rule(
        &self,
        rule: &Rule,
        lease: &RuleLease,
        topology: &TopologyView,
    ) -> StoreResult<()> {
        let files = self
            .with_retries(|| resolve_closure(self.inventory.as_ref(), &rule.scope, &rule.name))
            .await?;
        let file_keys: Vec<String> = files
            .iter()
            .map(|f| format!("{}:{}", f.scope, f.name))
            .collect();

        let replicas = self
            .with_retries(|| self.inventory.list_replicas(&file_keys))
            .await?;
        let pending: HashSet<(Uuid, String, String)> = self
            .with_retries(|| self.inventory.pending_destinations(rule.id))
            .await?
            .into_iter()
            .collect();
        let mut quota: HashMap<Uuid, i64> = self
            .with_retries(|| self.inventory.list_quota_snapshots(&rule.account))
            .await?
            .into_iter()
            .map(|q| (q.element_id, q.remaining()))
            .collect();

        let evaluation = self.evaluator.evaluate(
            rule,
            &files,
            &replicas,
            &pending,
            &mut quota,
            topology,
        );

        // Inventory reads may have eaten into the TTL; refresh before the
        // write side, and stop if the lease was reclaimed meanwhile.
        self.coordinator
            .renew(lease)
            .await
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;

        let emitted = self
            .emitter
            .emit(rule, &evaluation.placements)
            .await
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;

        // Commit state and reason changes.
        if evaluation.satisfied {
            if rule.state != RuleState::Ok {
                self.store
                    .update_state(rule.id, RuleState::Ok, None)
                    .await?;
                info!(rule_id = %rule.id, "Rule satisfied");
            }
            return Ok(());
        }

        if evaluation.made_progress() {
            self.store.reset_no_progress(rule.id).await?;
            // Partial progress: blocked units stay annotated on the rule
            // without touching the no-progress counter.
            let reason = (!evaluation.blocked.is_empty())
                .then(|| summarize_blocked(&evaluation.blocked));
            if rule.state == RuleState::Inject || reason.is_some() {
                self.store
                    .update_state(rule.id, RuleState::Replicating, reason.as_deref())
                    .await?;
            }
            info!(
                rule_id = %rule.id,
                placements = evaluation.placements.len(),
                emitted,
                blocked = evaluation.blocked.len(),
                "Transfer requests emitted"
            );
            return Ok(());
        }

        if !evaluation.blocked.is_empty() {
            let reason = summarize_blocked(&evaluation.blocked);
            let count = self.store.record_no_progress(rule.id, &reason).await?;
            if count >= self.config.no_progress_threshold {
                self.store
                    .update_state(rule.id, RuleState::Stuck, Some(&reason))
                    .await?;
                warn!(rule_id = %rule.id, reason = %reason, passes = count, "Rule is stuck");
            } else {
                debug!(rule_id = %rule.id, reason = %reason, passes = count, "No progress this pass");
            }
            return Ok(());
        }

        // Nothing new to emit and nothing blocked: requests are in flight.
        if rule.state == RuleState::Inject {
            self.store
                .update_state(rule.id, RuleState::Replicating, None)
                .await?;
        }
        Ok(())
    }

    /// Retry a transient store call with exponential backoff and jitter.
    /// Rule state is never touched on a transient failure.
    async fn with_retries<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let attempts = self.config.retry_attempts.max(1);
        let mut delay = self.config.retry_delay();

        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=100));
                    warn!(error = %e, attempt, "Transient store error, backing off");
                    tokio::time::sleep(delay + jitter).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns")
    }
}

fn summarize_blocked(blocked: &[BlockedUnit]) -> String {
    match blocked {
        [] => String::new(),
        [only] => format!("{}: {}", only.unit, only.reason),
        [first, rest @ ..] => format!(
            "{}: {} (+{} more blocked units)",
            first.unit,
            first.reason,
            rest.len()
        ),
    }
}

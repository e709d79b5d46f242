//! Partition coordinator
//!
//! Divides the shared rule backlog across workers without duplicating or
//! starving work. Ownership has two layers:
//!
//! - `owns()` is a stable hash-bucket predicate mapping every rule id to
//!   exactly one worker ordinal for a given worker count, so concurrent
//!   workers fetch disjoint slices of the backlog.
//! - Leases with a TTL and a per-rule epoch counter make claims safe when
//!   worker counts change between passes or a worker crashes: an expired
//!   lease is reclaimable by anyone, and the epoch guards renew/release
//!   against stale claims under clock skew.

use crate::store::RuleStore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Rule {0} is already owned by another worker")]
    AlreadyOwned(Uuid),

    #[error("Lease on rule {0} was lost")]
    LeaseLost(Uuid),

    #[error("Store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Deterministic, stable ownership predicate.
///
/// For any `worker_count >= 1`, every rule id maps to exactly one ordinal;
/// the union over all ordinals covers every rule with no overlap. The
/// mapping uses the rule id's raw 128 bits, so it is identical across
/// processes and releases.
pub fn owns(rule_id: Uuid, worker_ordinal: usize, worker_count: usize) -> bool {
    if worker_count == 0 {
        return false;
    }
    rule_id.as_u128() % worker_count as u128 == worker_ordinal as u128
}

/// A held lease on one rule
#[derive(Debug, Clone)]
pub struct RuleLease {
    pub rule_id: Uuid,
    pub epoch: i64,
}

/// Lease-based claim manager for one worker
pub struct PartitionCoordinator {
    store: Arc<dyn RuleStore>,
    worker_id: String,
    lease_ttl: Duration,
}

impl PartitionCoordinator {
    pub fn new(store: Arc<dyn RuleStore>, worker_id: String, lease_ttl: Duration) -> Self {
        Self {
            store,
            worker_id,
            lease_ttl,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim a rule. Fails with `AlreadyOwned` if another worker holds an
    /// unexpired lease; an expired lease is reclaimed transparently.
    pub async fn acquire(&self, rule_id: Uuid) -> Result<RuleLease> {
        let epoch = self
            .store
            .acquire_lease(rule_id, &self.worker_id, self.lease_ttl)
            .await
            .map_err(|e| CoordinatorError::Store(e.to_string()))?;

        match epoch {
            Some(epoch) => {
                debug!(rule_id = %rule_id, epoch, worker = %self.worker_id, "Lease acquired");
                Ok(RuleLease { rule_id, epoch })
            }
            None => Err(CoordinatorError::AlreadyOwned(rule_id)),
        }
    }

    /// Extend a held lease for long evaluations
    pub async fn renew(&self, lease: &RuleLease) -> Result<()> {
        let renewed = self
            .store
            .renew_lease(lease.rule_id, &self.worker_id, lease.epoch, self.lease_ttl)
            .await
            .map_err(|e| CoordinatorError::Store(e.to_string()))?;

        if renewed {
            Ok(())
        } else {
            Err(CoordinatorError::LeaseLost(lease.rule_id))
        }
    }

    /// Release a held lease. A lease that already expired and was reclaimed
    /// elsewhere is logged, not an error: the work is done either way.
    pub async fn release(&self, lease: RuleLease) -> Result<()> {
        let released = self
            .store
            .release_lease(lease.rule_id, &self.worker_id, lease.epoch)
            .await
            .map_err(|e| CoordinatorError::Store(e.to_string()))?;

        if !released {
            warn!(
                rule_id = %lease.rule_id,
                epoch = lease.epoch,
                "Lease was reclaimed before release"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreResult;
    use async_trait::async_trait;
    use gridflow_metadata::{Rule, RuleState};
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn test_owns_covers_every_rule_exactly_once() {
        for worker_count in 1..=7 {
            for _ in 0..50 {
                let rule_id = Uuid::new_v4();
                let owners: Vec<usize> = (0..worker_count)
                    .filter(|w| owns(rule_id, *w, worker_count))
                    .collect();
                assert_eq!(owners.len(), 1, "rule must map to exactly one ordinal");
            }
        }
    }

    #[test]
    fn test_owns_is_stable() {
        let rule_id = Uuid::new_v4();
        let first = (0..4).position(|w| owns(rule_id, w, 4)).unwrap();
        for _ in 0..100 {
            assert_eq!((0..4).position(|w| owns(rule_id, w, 4)).unwrap(), first);
        }
    }

    proptest! {
        #[test]
        fn prop_partition_coverage(bytes in prop::array::uniform16(any::<u8>()), worker_count in 1usize..32) {
            let rule_id = Uuid::from_bytes(bytes);
            let owners = (0..worker_count).filter(|w| owns(rule_id, *w, worker_count)).count();
            prop_assert_eq!(owners, 1);
        }
    }

    #[derive(Default)]
    struct LeaseTable {
        // rule_id -> (owner, epoch)
        leases: Mutex<HashMap<Uuid, (String, i64)>>,
    }

    #[async_trait]
    impl RuleStore for LeaseTable {
        async fn fetch_pending(
            &self,
            _worker_ordinal: usize,
            _worker_count: usize,
            _limit: usize,
        ) -> StoreResult<Vec<Rule>> {
            Ok(Vec::new())
        }

        async fn read(&self, _rule_id: Uuid) -> StoreResult<Option<Rule>> {
            Ok(None)
        }

        async fn update_state(
            &self,
            _rule_id: Uuid,
            _state: RuleState,
            _reason: Option<&str>,
        ) -> StoreResult<()> {
            Ok(())
        }

        async fn record_no_progress(&self, _rule_id: Uuid, _reason: &str) -> StoreResult<i32> {
            Ok(0)
        }

        async fn reset_no_progress(&self, _rule_id: Uuid) -> StoreResult<()> {
            Ok(())
        }

        async fn acquire_lease(
            &self,
            rule_id: Uuid,
            worker_id: &str,
            _ttl: Duration,
        ) -> StoreResult<Option<i64>> {
            let mut leases = self.leases.lock().unwrap();
            if leases.contains_key(&rule_id) {
                return Ok(None);
            }
            let epoch = 1;
            leases.insert(rule_id, (worker_id.to_string(), epoch));
            Ok(Some(epoch))
        }

        async fn renew_lease(
            &self,
            rule_id: Uuid,
            worker_id: &str,
            epoch: i64,
            _ttl: Duration,
        ) -> StoreResult<bool> {
            let leases = self.leases.lock().unwrap();
            Ok(leases.get(&rule_id).map(|(owner, e)| owner == worker_id && *e == epoch)
                == Some(true))
        }

        async fn release_lease(
            &self,
            rule_id: Uuid,
            worker_id: &str,
            epoch: i64,
        ) -> StoreResult<bool> {
            let mut leases = self.leases.lock().unwrap();
            match leases.get(&rule_id) {
                Some((owner, e)) if owner == worker_id && *e == epoch => {
                    leases.remove(&rule_id);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn test_acquire_conflict_and_release() {
        let store = Arc::new(LeaseTable::default());
        let first =
            PartitionCoordinator::new(store.clone(), "w1".to_string(), Duration::from_secs(60));
        let second =
            PartitionCoordinator::new(store.clone(), "w2".to_string(), Duration::from_secs(60));

        let rule_id = Uuid::new_v4();
        let lease = first.acquire(rule_id).await.unwrap();

        match second.acquire(rule_id).await {
            Err(CoordinatorError::AlreadyOwned(id)) => assert_eq!(id, rule_id),
            other => panic!("expected AlreadyOwned, got {:?}", other.map(|l| l.rule_id)),
        }

        first.renew(&lease).await.unwrap();
        first.release(lease).await.unwrap();

        // Reclaimable after release
        second.acquire(rule_id).await.unwrap();
    }
}

//! Request emitter
//!
//! Converts resolved placements into transfer requests for the external
//! transfer subsystem. Emission is safe to retry: every request carries an
//! idempotency key (rule id, file, destination) and the intake
//! de-duplicates by key, so a crash between emissions leaves a unit
//! resumable, never duplicated.

use crate::evaluator::HopPlacement;
use crate::store::TransferSubmitter;
use gridflow_metadata::{NewTransferRequest, Rule};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Emitter errors
#[derive(Error, Debug)]
pub enum EmitterError {
    #[error("Submission failed: {0}")]
    Submit(String),
}

pub type Result<T> = std::result::Result<T, EmitterError>;

/// Request emitter
pub struct RequestEmitter {
    submitter: Arc<dyn TransferSubmitter>,
    dry_run: bool,
}

impl RequestEmitter {
    pub fn new(submitter: Arc<dyn TransferSubmitter>, dry_run: bool) -> Self {
        Self { submitter, dry_run }
    }

    /// Emit one transfer request per planned hop. Returns the number of new
    /// work items created downstream (re-submitted keys count as zero).
    #[instrument(skip(self, rule, placements), fields(rule_id = %rule.id))]
    pub async fn emit(&self, rule: &Rule, placements: &[HopPlacement]) -> Result<usize> {
        let mut created = 0;

        for placement in placements {
            let idempotency_key = NewTransferRequest::idempotency_key_for(
                rule.id,
                &placement.scope,
                &placement.name,
                placement.dest,
            );

            if self.dry_run {
                info!(
                    file = %format!("{}:{}", placement.scope, placement.name),
                    dest = %placement.dest,
                    hops = placement.route.len().saturating_sub(2),
                    "Dry run: would submit transfer request"
                );
                continue;
            }

            let request = NewTransferRequest {
                rule_id: rule.id,
                scope: placement.scope.clone(),
                name: placement.name.clone(),
                bytes: placement.bytes,
                source_ids: placement.sources.clone(),
                dest_id: placement.dest,
                hop_ids: placement.route.clone(),
                priority: rule.priority,
                idempotency_key,
            };

            let inserted = self
                .submitter
                .submit(request)
                .await
                .map_err(|e| EmitterError::Submit(e.to_string()))?;

            if inserted {
                created += 1;
            } else {
                debug!(
                    file = %format!("{}:{}", placement.scope, placement.name),
                    dest = %placement.dest,
                    "Transfer request already queued, skipped"
                );
            }
        }

        Ok(created)
    }
}

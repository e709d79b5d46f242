//! PostgreSQL database operations for GridFlow metadata
//!
//! Provides the rule store, replica inventory, and topology reads using SQLx.

use crate::models::*;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/gridflow".to_string(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// PostgreSQL database client
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(config: DbConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");
        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // =========================================================================
    // RULE OPERATIONS
    // =========================================================================

    /// Create a new rule in INJECT state
    #[instrument(skip(self, rule))]
    pub async fn create_rule(&self, rule: CreateRule) -> Result<Rule> {
        let result = sqlx::query_as::<_, Rule>(
            r#"
            INSERT INTO rules (account, scope, name, rse_expression, copies, grouping, priority, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&rule.account)
        .bind(&rule.scope)
        .bind(&rule.name)
        .bind(&rule.rse_expression)
        .bind(rule.copies)
        .bind(rule.grouping)
        .bind(rule.priority)
        .bind(rule.expires_at)
        .fetch_one(&self.pool)
        .await?;

        debug!(rule_id = %result.id, did = %format!("{}:{}", rule.scope, rule.name), "Rule created");
        Ok(result)
    }

    /// Get a rule by ID
    pub async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>> {
        let result = sqlx::query_as::<_, Rule>("SELECT * FROM rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(result)
    }

    /// List rules that need evaluation: INJECT or REPLICATING, not expired,
    /// not suspended, and with no unexpired lease held by another worker.
    pub async fn list_pending_rules(&self, limit: i64) -> Result<Vec<Rule>> {
        let result = sqlx::query_as::<_, Rule>(
            r#"
            SELECT * FROM rules
            WHERE state IN ('inject', 'replicating')
              AND (expires_at IS NULL OR expires_at > NOW())
              AND (leased_by IS NULL OR lease_expires_at < NOW())
            ORDER BY priority DESC, created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(result)
    }

    /// Update rule state, optionally recording a reason
    #[instrument(skip(self))]
    pub async fn update_rule_state(
        &self,
        rule_id: Uuid,
        state: RuleState,
        reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE rules
            SET state = $2, error_reason = COALESCE($3, error_reason), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(rule_id)
        .bind(state)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Increment the no-progress counter and record the blocking reason.
    /// Returns the new counter value.
    pub async fn record_no_progress(&self, rule_id: Uuid, reason: &str) -> Result<i32> {
        let (count,): (i32,) = sqlx::query_as(
            r#"
            UPDATE rules
            SET no_progress_count = no_progress_count + 1, error_reason = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING no_progress_count
            "#,
        )
        .bind(rule_id)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Reset the no-progress counter after a pass that made progress
    pub async fn reset_no_progress(&self, rule_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE rules SET no_progress_count = 0, error_reason = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(rule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // LEASE OPERATIONS
    // =========================================================================

    /// Acquire a lease on a rule if currently unowned or expired.
    ///
    /// The epoch counter increments on every successful acquisition; renew
    /// and release must present the matching epoch, which guards against
    /// stale-lease reclaim under clock skew. Returns the new epoch, or
    /// `None` if another worker holds an unexpired lease.
    #[instrument(skip(self))]
    pub async fn acquire_rule_lease(
        &self,
        rule_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Option<i64>> {
        let result: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE rules
            SET leased_by = $2,
                lease_expires_at = NOW() + make_interval(secs => $3),
                lease_epoch = lease_epoch + 1
            WHERE id = $1
              AND (leased_by IS NULL OR lease_expires_at < NOW())
            RETURNING lease_epoch
            "#,
        )
        .bind(rule_id)
        .bind(worker_id)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(result.map(|(epoch,)| epoch))
    }

    /// Extend a held lease. Returns false if the lease was lost.
    pub async fn renew_rule_lease(
        &self,
        rule_id: Uuid,
        worker_id: &str,
        epoch: i64,
        ttl: Duration,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE rules
            SET lease_expires_at = NOW() + make_interval(secs => $4)
            WHERE id = $1 AND leased_by = $2 AND lease_epoch = $3
            "#,
        )
        .bind(rule_id)
        .bind(worker_id)
        .bind(epoch)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Release a held lease. Returns false if the lease was already lost.
    pub async fn release_rule_lease(
        &self,
        rule_id: Uuid,
        worker_id: &str,
        epoch: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE rules
            SET leased_by = NULL, lease_expires_at = NULL
            WHERE id = $1 AND leased_by = $2 AND lease_epoch = $3
            "#,
        )
        .bind(rule_id)
        .bind(worker_id)
        .bind(epoch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // TOPOLOGY OPERATIONS
    // =========================================================================

    /// List all storage elements
    pub async fn list_storage_elements(&self) -> Result<Vec<StorageElement>> {
        let result = sqlx::query_as::<_, StorageElement>(
            "SELECT * FROM storage_elements ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(result)
    }

    /// List all element protocols
    pub async fn list_element_protocols(&self) -> Result<Vec<ElementProtocol>> {
        let result = sqlx::query_as::<_, ElementProtocol>(
            "SELECT * FROM element_protocols ORDER BY element_id, rank ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(result)
    }

    /// List the full directed distance graph
    pub async fn list_distances(&self) -> Result<Vec<DistanceEdge>> {
        let result = sqlx::query_as::<_, DistanceEdge>("SELECT * FROM distances")
            .fetch_all(&self.pool)
            .await?;
        Ok(result)
    }

    // =========================================================================
    // DID OPERATIONS
    // =========================================================================

    /// Get a data identifier record
    pub async fn get_did(&self, scope: &str, name: &str) -> Result<Option<DidRecord>> {
        let result = sqlx::query_as::<_, DidRecord>(
            "SELECT scope, name, did_kind, bytes FROM dids WHERE scope = $1 AND name = $2",
        )
        .bind(scope)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(result)
    }

    /// List the direct children of a container or dataset
    pub async fn list_did_content(&self, scope: &str, name: &str) -> Result<Vec<DidContent>> {
        let result = sqlx::query_as::<_, DidContent>(
            r#"
            SELECT scope, name, child_scope, child_name
            FROM did_contents
            WHERE scope = $1 AND name = $2
            ORDER BY child_scope, child_name
            "#,
        )
        .bind(scope)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(result)
    }

    // =========================================================================
    // REPLICA OPERATIONS
    // =========================================================================

    /// List replicas for a set of files, keyed by `scope:name`
    pub async fn list_replicas(&self, file_keys: &[String]) -> Result<Vec<Replica>> {
        let result = sqlx::query_as::<_, Replica>(
            r#"
            SELECT element_id, scope, name, bytes, state
            FROM replicas
            WHERE (scope || ':' || name) = ANY($1)
            "#,
        )
        .bind(file_keys)
        .fetch_all(&self.pool)
        .await?;
        Ok(result)
    }

    // =========================================================================
    // QUOTA OPERATIONS
    // =========================================================================

    /// Get the quota snapshot for an account on one element
    pub async fn quota_snapshot(
        &self,
        account: &str,
        element_id: Uuid,
    ) -> Result<Option<QuotaSnapshot>> {
        let result = sqlx::query_as::<_, QuotaSnapshot>(
            "SELECT account, element_id, limit_bytes, used_bytes FROM account_quotas WHERE account = $1 AND element_id = $2",
        )
        .bind(account)
        .bind(element_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(result)
    }

    /// List all quota snapshots for an account
    pub async fn list_quota_snapshots(&self, account: &str) -> Result<Vec<QuotaSnapshot>> {
        let result = sqlx::query_as::<_, QuotaSnapshot>(
            "SELECT account, element_id, limit_bytes, used_bytes FROM account_quotas WHERE account = $1",
        )
        .bind(account)
        .fetch_all(&self.pool)
        .await?;
        Ok(result)
    }

    // =========================================================================
    // TRANSFER REQUEST OPERATIONS
    // =========================================================================

    /// Insert a transfer request; the UNIQUE idempotency key makes
    /// re-submission a no-op. Returns true if a new request was created.
    #[instrument(skip(self, request))]
    pub async fn insert_transfer_request(&self, request: NewTransferRequest) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfer_requests (rule_id, scope, name, bytes, source_ids, dest_id, hop_ids, priority, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(request.rule_id)
        .bind(&request.scope)
        .bind(&request.name)
        .bind(request.bytes)
        .bind(serde_json::json!(request.source_ids))
        .bind(request.dest_id)
        .bind(serde_json::json!(request.hop_ids))
        .bind(request.priority)
        .bind(&request.idempotency_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// List (destination, file) pairs already requested for a rule
    pub async fn list_rule_request_destinations(
        &self,
        rule_id: Uuid,
    ) -> Result<Vec<(Uuid, String, String)>> {
        let result = sqlx::query_as::<_, (Uuid, String, String)>(
            "SELECT dest_id, scope, name FROM transfer_requests WHERE rule_id = $1",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(result)
    }
}

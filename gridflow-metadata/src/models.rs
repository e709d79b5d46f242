//! Database models for GridFlow metadata
//!
//! These structs map directly to PostgreSQL tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

/// Rule state enumeration
///
/// State advances monotonically except for STUCK↔REPLICATING revisits
/// after external intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum RuleState {
    Inject,
    Replicating,
    Ok,
    Stuck,
    Suspended,
}

impl std::fmt::Display for RuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inject => write!(f, "inject"),
            Self::Replicating => write!(f, "replicating"),
            Self::Ok => write!(f, "ok"),
            Self::Stuck => write!(f, "stuck"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

/// Grouping policy: how files within a rule share destination decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum RuleGrouping {
    /// The entire closure shares one destination set
    All,
    /// Each contained dataset's files share one destination set
    Dataset,
    /// Each file's placement is decided independently
    None,
}

impl std::fmt::Display for RuleGrouping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Dataset => write!(f, "dataset"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Replica state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum ReplicaState {
    Available,
    Copying,
    Unavailable,
    BeingDeleted,
}

/// Protocol domain enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ProtocolDomain {
    Wan,
    Lan,
}

/// Operation a protocol may permit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolOperation {
    Read,
    Write,
    Delete,
    ThirdPartyCopy,
}

/// DID kind enumeration (mirrors `gridflow_core::DidKind` at the table level)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum DidKind {
    Container,
    Dataset,
    File,
}

/// A replication rule
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub account: String,

    // Target data identifier
    pub scope: String,
    pub name: String,

    // Placement requirements
    pub rse_expression: String,
    pub copies: i32,
    pub grouping: RuleGrouping,
    pub priority: i32,
    pub expires_at: Option<DateTime<Utc>>,

    // Progress
    pub state: RuleState,
    pub error_reason: Option<String>,
    pub no_progress_count: i32,

    // Owner lease
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub lease_epoch: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a new rule
#[derive(Debug, Clone)]
pub struct CreateRule {
    pub account: String,
    pub scope: String,
    pub name: String,
    pub rse_expression: String,
    pub copies: i32,
    pub grouping: RuleGrouping,
    pub priority: i32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A storage element (storage endpoint with protocols, quotas, attributes)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StorageElement {
    pub id: Uuid,
    pub name: String,

    // Availability
    pub read_enabled: bool,
    pub write_enabled: bool,
    pub delete_enabled: bool,

    // Routing
    pub multihop_eligible: bool,
    pub blacklisted: bool,

    // Attribute mapping used for expression matching
    pub attributes: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StorageElement {
    /// Flatten the JSON attribute map to strings, with the element name
    /// injected under the implicit `name` key.
    pub fn attribute_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(obj) = self.attributes.as_object() {
            for (k, v) in obj {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    serde_json::Value::Number(n) => n.to_string(),
                    _ => continue,
                };
                map.insert(k.clone(), value);
            }
        }
        map.insert("name".to_string(), self.name.clone());
        map
    }
}

/// A protocol supported by a storage element
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ElementProtocol {
    pub id: Uuid,
    pub element_id: Uuid,
    pub scheme: String,
    pub domain: ProtocolDomain,
    pub can_read: bool,
    pub can_write: bool,
    pub can_delete: bool,
    pub can_third_party_copy: bool,
    pub rank: i32,
}

impl ElementProtocol {
    pub fn permits(&self, operation: ProtocolOperation) -> bool {
        match operation {
            ProtocolOperation::Read => self.can_read,
            ProtocolOperation::Write => self.can_write,
            ProtocolOperation::Delete => self.can_delete,
            ProtocolOperation::ThirdPartyCopy => self.can_third_party_copy,
        }
    }
}

/// A directed distance edge between two storage elements
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DistanceEdge {
    pub src_id: Uuid,
    pub dst_id: Uuid,
    /// Numeric transfer cost, used as the routing edge weight
    pub distance: i64,
    /// Tie-break integer when distances are equal
    pub ranking: i32,
}

/// A data identifier record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DidRecord {
    pub scope: String,
    pub name: String,
    pub did_kind: DidKind,
    pub bytes: Option<i64>,
}

/// A parent → child attachment in the DID hierarchy
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DidContent {
    pub scope: String,
    pub name: String,
    pub child_scope: String,
    pub child_name: String,
}

/// A file replica on a storage element
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Replica {
    pub element_id: Uuid,
    pub scope: String,
    pub name: String,
    pub bytes: i64,
    pub state: ReplicaState,
}

/// Per-account quota headroom on one storage element
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub account: String,
    pub element_id: Uuid,
    pub limit_bytes: i64,
    pub used_bytes: i64,
}

impl QuotaSnapshot {
    /// Remaining headroom in bytes
    pub fn remaining(&self) -> i64 {
        self.limit_bytes.saturating_sub(self.used_bytes)
    }
}

/// A transfer request handed to the external transfer subsystem
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub scope: String,
    pub name: String,
    pub bytes: i64,
    /// Ordered source-replica candidates (element ids)
    pub source_ids: serde_json::Value,
    pub dest_id: Uuid,
    /// Ordered hop list for multihop routes (element ids, empty if direct)
    pub hop_ids: serde_json::Value,
    pub priority: i32,
    /// (rule id, file, destination); prevents duplicate downstream work
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters for emitting a new transfer request
#[derive(Debug, Clone)]
pub struct NewTransferRequest {
    pub rule_id: Uuid,
    pub scope: String,
    pub name: String,
    pub bytes: i64,
    pub source_ids: Vec<Uuid>,
    pub dest_id: Uuid,
    pub hop_ids: Vec<Uuid>,
    pub priority: i32,
    pub idempotency_key: String,
}

impl NewTransferRequest {
    /// Stable idempotency key for a (rule, file, destination) triple
    pub fn idempotency_key_for(rule_id: Uuid, scope: &str, name: &str, dest_id: Uuid) -> String {
        format!("{}:{}:{}:{}", rule_id, scope, name, dest_id)
    }
}

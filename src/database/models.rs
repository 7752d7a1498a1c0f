use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::entry::{parse_timestamp, LogEntry};
use crate::error::{AuditError, AuditResult};

/// Ledger row as stored; `created_at` stays in its canonical text form.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LogEntryRow {
    pub id: i64,
    pub actor_id: String,
    pub actor_name: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub summary: Option<String>,
    pub changes: Vec<u8>,
    pub ip_address: Option<String>,
    pub is_sensitive: bool,
    pub created_at: String,
    pub immutable: bool,
    pub chain_digest: String,
}

impl TryFrom<LogEntryRow> for LogEntry {
    type Error = AuditError;

    fn try_from(row: LogEntryRow) -> AuditResult<Self> {
        let changes = String::from_utf8(row.changes).map_err(|e| {
            AuditError::Storage(format!("Entry {} has non UTF-8 changes: {}", row.id, e))
        })?;

        Ok(LogEntry {
            id: row.id,
            actor_id: row.actor_id,
            actor_name: row.actor_name,
            action: row.action,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            summary: row.summary,
            changes,
            ip_address: row.ip_address,
            is_sensitive: row.is_sensitive,
            created_at: parse_timestamp(&row.created_at)?,
            immutable: row.immutable,
            chain_digest: row.chain_digest,
        })
    }
}

/// Tail of the chain: the last id ever assigned and its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ChainHead {
    pub last_id: i64,
    pub last_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMetadata {
    pub partition_key: i32,
    pub first_id: Option<i64>,
    pub last_id: Option<i64>,
    pub row_count: u64,
    pub boundary_digest: Option<String>,
    pub storage_location: String,
    pub created_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
}

impl PartitionMetadata {
    pub fn is_sealed(&self) -> bool {
        self.sealed_at.is_some()
    }

    pub fn contains(&self, id: i64) -> bool {
        match (self.first_id, self.last_id) {
            (Some(first), Some(last)) => first <= id && id <= last,
            _ => false,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Partition {}: {} rows ({}..{}), {}",
            self.partition_key,
            self.row_count,
            self.first_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
            self.last_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
            if self.is_sealed() { "sealed" } else { "open" }
        )
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PartitionRow {
    pub partition_key: i64,
    pub first_id: Option<i64>,
    pub last_id: Option<i64>,
    pub row_count: i64,
    pub boundary_digest: Option<String>,
    pub storage_location: String,
    pub created_at: String,
    pub sealed_at: Option<String>,
}

impl TryFrom<PartitionRow> for PartitionMetadata {
    type Error = AuditError;

    fn try_from(row: PartitionRow) -> AuditResult<Self> {
        let sealed_at = match row.sealed_at {
            Some(raw) => Some(parse_timestamp(&raw)?),
            None => None,
        };

        Ok(PartitionMetadata {
            partition_key: row.partition_key as i32,
            first_id: row.first_id,
            last_id: row.last_id,
            row_count: row.row_count.max(0) as u64,
            boundary_digest: row.boundary_digest,
            storage_location: row.storage_location,
            created_at: parse_timestamp(&row.created_at)?,
            sealed_at,
        })
    }
}

//! Ledger statistics
//!
//! Read-only aggregation for dashboards. Partition row counts come from the
//! registry; the live count is cached against the chain head and the
//! partition generation, which together change on every append and every
//! archive move from any process.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::audit::query::EntryFilter;
use crate::audit::registry::PartitionRegistry;
use crate::audit::source::{EntrySource, TableSource};
use crate::audit::verify::VerificationResult;
use crate::database::models::ChainHead;
use crate::database::queries::Queries;
use crate::database::Database;
use crate::error::AuditResult;

/// Outcome of the last full verification, shared by the verifier and the
/// stats service.
#[derive(Clone, Debug, Default)]
pub struct ChainMonitor {
    inner: Arc<MonitorState>,
}

#[derive(Debug, Default)]
struct MonitorState {
    last_full_verification: RwLock<Option<LastVerification>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastVerification {
    pub result: VerificationResult,
    pub verified_at: DateTime<Utc>,
}

impl ChainMonitor {
    pub(crate) async fn record_full_verification(&self, result: &VerificationResult) {
        *self.inner.last_full_verification.write().await = Some(LastVerification {
            result: result.clone(),
            verified_at: Utc::now(),
        });
    }

    pub async fn last_full_verification(&self) -> Option<LastVerification> {
        self.inner.last_full_verification.read().await.clone()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionCount {
    pub partition_key: i32,
    pub row_count: u64,
    pub first_id: Option<i64>,
    pub last_id: Option<i64>,
    pub sealed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub total_live: u64,
    pub total_archived: u64,
    pub per_partition_counts: Vec<PartitionCount>,
    pub head: Option<ChainHead>,
    /// Outcome of the last full-ledger verification, if one has run.
    pub last_known_valid: Option<bool>,
    pub last_verification: Option<LastVerification>,
}

#[derive(Clone, Debug)]
pub struct StatsService {
    db: Database,
    registry: PartitionRegistry,
    monitor: ChainMonitor,
    live_count: Arc<RwLock<Option<(LiveCountKey, u64)>>>,
}

impl StatsService {
    pub fn new(db: Database, registry: PartitionRegistry, monitor: ChainMonitor) -> Self {
        Self {
            db,
            registry,
            monitor,
            live_count: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn get_stats(&self) -> AuditResult<LedgerStats> {
        let partitions = self.registry.snapshot().await?;
        let head = Queries::read_chain_head(self.db.pool()).await?;
        let key = LiveCountKey {
            head_id: head.as_ref().map(|h| h.last_id),
            partition_generation: partitions.generation(),
        };
        let total_live = self.live_count(key).await?;

        let per_partition_counts = partitions
            .iter()
            .map(|meta| PartitionCount {
                partition_key: meta.partition_key,
                row_count: meta.row_count,
                first_id: meta.first_id,
                last_id: meta.last_id,
                sealed: meta.is_sealed(),
            })
            .collect();

        let last_verification = self.monitor.last_full_verification().await;

        Ok(LedgerStats {
            total_live,
            total_archived: partitions.total_archived(),
            per_partition_counts,
            head,
            last_known_valid: last_verification.as_ref().map(|v| v.result.valid),
            last_verification,
        })
    }

    async fn live_count(&self, key: LiveCountKey) -> AuditResult<u64> {
        if let Some((cached_key, count)) = *self.live_count.read().await {
            if cached_key == key {
                return Ok(count);
            }
        }

        let count = TableSource::live(self.db.clone())
            .count(&EntryFilter::default())
            .await?;
        *self.live_count.write().await = Some((key, count));
        Ok(count)
    }
}

/// Live rows only change when the head moves or a partition move commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LiveCountKey {
    head_id: Option<i64>,
    partition_generation: i64,
}

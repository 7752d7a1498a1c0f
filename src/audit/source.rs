//! Ordered entry sources
//!
//! The live table and every archive partition implement [`EntrySource`];
//! [`LedgerView`] stitches them into one logical, id-ordered ledger so the
//! verifier and the query services never need to know which store holds an id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::audit::entry::{LogEntry, GENESIS_DIGEST};
use crate::audit::query::EntryFilter;
use crate::audit::registry::{PartitionRegistry, PartitionSet};
use crate::database::models::PartitionMetadata;
use crate::database::queries::Queries;
use crate::database::schema::LIVE_TABLE;
use crate::database::Database;
use crate::error::AuditResult;

/// Where an entry currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "store", rename_all = "camelCase")]
pub enum EntryLocation {
    Live,
    Archive {
        #[serde(rename = "partitionKey")]
        partition_key: i32,
    },
}

#[async_trait]
pub trait EntrySource: Send + Sync {
    fn location(&self) -> EntryLocation;

    async fn get(&self, id: i64) -> AuditResult<Option<LogEntry>>;

    /// Entries with `after < id <= until` matching `filter`, ascending, at most `limit`.
    async fn scan(
        &self,
        after: i64,
        until: i64,
        filter: &EntryFilter,
        limit: u32,
    ) -> AuditResult<Vec<LogEntry>>;

    async fn count(&self, filter: &EntryFilter) -> AuditResult<u64>;

    /// Newest-first page of entries matching `filter`.
    async fn page_newest_first(
        &self,
        filter: &EntryFilter,
        offset: u64,
        limit: u32,
    ) -> AuditResult<Vec<LogEntry>>;
}

/// A ledger table. Archive partitions are capped at their committed
/// `last_id`, which hides rows copied by an archival run that has not
/// finished yet (those rows are still served by the live table).
#[derive(Clone, Debug)]
pub struct TableSource {
    db: Database,
    table: String,
    location: EntryLocation,
    upper: i64,
}

impl TableSource {
    pub fn live(db: Database) -> Self {
        Self {
            db,
            table: LIVE_TABLE.to_string(),
            location: EntryLocation::Live,
            upper: i64::MAX,
        }
    }

    /// `None` while the partition has no committed rows.
    pub fn partition(db: Database, meta: &PartitionMetadata) -> Option<Self> {
        meta.last_id.map(|last_id| Self {
            db,
            table: meta.storage_location.clone(),
            location: EntryLocation::Archive {
                partition_key: meta.partition_key,
            },
            upper: last_id,
        })
    }

    /// Every row of a partition table, including rows an unfinished
    /// archival run has copied but not yet committed.
    pub fn partition_staging(db: Database, meta: &PartitionMetadata) -> Self {
        Self {
            db,
            table: meta.storage_location.clone(),
            location: EntryLocation::Archive {
                partition_key: meta.partition_key,
            },
            upper: i64::MAX,
        }
    }
}

#[async_trait]
impl EntrySource for TableSource {
    fn location(&self) -> EntryLocation {
        self.location
    }

    async fn get(&self, id: i64) -> AuditResult<Option<LogEntry>> {
        Queries::get_entry(self.db.pool(), &self.table, id, Some(self.upper)).await
    }

    async fn scan(
        &self,
        after: i64,
        until: i64,
        filter: &EntryFilter,
        limit: u32,
    ) -> AuditResult<Vec<LogEntry>> {
        if after >= self.upper {
            return Ok(Vec::new());
        }
        let until = until.min(self.upper);
        Queries::scan_ascending(self.db.pool(), &self.table, after, until, filter, limit).await
    }

    async fn count(&self, filter: &EntryFilter) -> AuditResult<u64> {
        Queries::count_entries(self.db.pool(), &self.table, self.upper, filter).await
    }

    async fn page_newest_first(
        &self,
        filter: &EntryFilter,
        offset: u64,
        limit: u32,
    ) -> AuditResult<Vec<LogEntry>> {
        Queries::page_descending(self.db.pool(), &self.table, self.upper, filter, offset, limit)
            .await
    }
}

/// Live store plus all committed archive partitions, in id order.
///
/// Each read walks the stores against one [`PartitionSet`] snapshot and is
/// repeated if an archive move committed meanwhile: a move deletes live rows
/// and raises a partition cap atomically, so a walk that straddled it could
/// miss the moved slice.
#[derive(Clone, Debug)]
pub struct LedgerView {
    db: Database,
    registry: PartitionRegistry,
}

impl LedgerView {
    pub fn new(db: Database, registry: PartitionRegistry) -> Self {
        Self { db, registry }
    }

    pub fn registry(&self) -> &PartitionRegistry {
        &self.registry
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Oldest partition first, live store last.
    pub fn sources_ascending(&self, partitions: &PartitionSet) -> Vec<Arc<dyn EntrySource>> {
        let mut sources: Vec<Arc<dyn EntrySource>> = partitions
            .iter()
            .filter_map(|meta| TableSource::partition(self.db.clone(), meta))
            .map(|source| Arc::new(source) as Arc<dyn EntrySource>)
            .collect();
        sources.push(Arc::new(TableSource::live(self.db.clone())));
        sources
    }

    /// Live store first, then partitions newest to oldest.
    pub fn sources_newest_first<'a>(
        &self,
        partitions: &'a PartitionSet,
    ) -> Vec<(Arc<dyn EntrySource>, Option<&'a PartitionMetadata>)> {
        let mut sources: Vec<(Arc<dyn EntrySource>, Option<&'a PartitionMetadata>)> =
            vec![(Arc::new(TableSource::live(self.db.clone())), None)];
        for meta in partitions.iter().rev() {
            if let Some(source) = TableSource::partition(self.db.clone(), meta) {
                sources.push((Arc::new(source), Some(meta)));
            }
        }
        sources
    }

    pub async fn get(&self, id: i64) -> AuditResult<Option<LogEntry>> {
        Ok(self.locate_entry(id).await?.map(|(entry, _)| entry))
    }

    /// Fetch an entry together with the store currently holding it.
    pub async fn locate_entry(&self, id: i64) -> AuditResult<Option<(LogEntry, EntryLocation)>> {
        loop {
            let partitions = self.registry.snapshot().await?;
            let found = self.locate_in(&partitions, id).await?;
            if self.registry.is_current(&partitions).await? {
                return Ok(found);
            }
            debug!(id, "Partitions changed during lookup, retrying");
        }
    }

    /// Next page of the logical ledger after `after`, up to `until`.
    pub async fn scan(
        &self,
        after: i64,
        until: i64,
        filter: &EntryFilter,
        limit: u32,
    ) -> AuditResult<Vec<LogEntry>> {
        loop {
            let partitions = self.registry.snapshot().await?;
            let page = self.scan_in(&partitions, after, until, filter, limit).await?;
            if self.registry.is_current(&partitions).await? {
                return Ok(page);
            }
            debug!(after, "Partitions changed during scan, retrying");
        }
    }

    /// Digest the entry `id` must chain from. `None` means the predecessor
    /// is missing from every store.
    pub async fn digest_before(&self, id: i64) -> AuditResult<Option<String>> {
        if id <= 1 {
            return Ok(Some(GENESIS_DIGEST.to_string()));
        }
        loop {
            let partitions = self.registry.snapshot().await?;
            let digest = match partitions.boundary_before(id) {
                Some(boundary) => Some(boundary.to_string()),
                None => self
                    .locate_in(&partitions, id - 1)
                    .await?
                    .map(|(entry, _)| entry.chain_digest),
            };
            if self.registry.is_current(&partitions).await? {
                return Ok(digest);
            }
        }
    }

    async fn locate_in(
        &self,
        partitions: &PartitionSet,
        id: i64,
    ) -> AuditResult<Option<(LogEntry, EntryLocation)>> {
        if let Some(source) = partitions
            .containing(id)
            .and_then(|meta| TableSource::partition(self.db.clone(), meta))
        {
            if let Some(entry) = source.get(id).await? {
                return Ok(Some((entry, source.location())));
            }
        }

        let live = TableSource::live(self.db.clone());
        Ok(live.get(id).await?.map(|entry| (entry, EntryLocation::Live)))
    }

    async fn scan_in(
        &self,
        partitions: &PartitionSet,
        after: i64,
        until: i64,
        filter: &EntryFilter,
        limit: u32,
    ) -> AuditResult<Vec<LogEntry>> {
        for source in self.sources_ascending(partitions) {
            let page = source.scan(after, until, filter, limit).await?;
            if !page.is_empty() {
                return Ok(page);
            }
        }
        Ok(Vec::new())
    }
}

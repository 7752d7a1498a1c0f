//! Archive Partitioner
//!
//! Moves the oldest live entries into per-year archive partitions without
//! ever re-hashing them. A run has three phases:
//!
//! 1. fix the boundary under the writer's tail lock (no append can land
//!    inside the slice being moved),
//! 2. copy the slice into the partition table in batches and re-verify the
//!    copies against the predecessor digest,
//! 3. delete the live rows and extend the partition metadata in a single
//!    transaction.
//!
//! Until phase 3 commits, readers keep seeing the rows in the live table:
//! partition reads are capped at the committed `last_id`. A crash between
//! phases leaves copied rows beyond that cap, which [`ArchivePartitioner::recover`]
//! either finishes or discards.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::entry::{format_timestamp, parse_timestamp};
use crate::audit::logger::LogWriter;
use crate::audit::query::EntryFilter;
use crate::audit::registry::PartitionRegistry;
use crate::audit::source::{EntrySource, LedgerView, TableSource};
use crate::audit::verify::ChainCheck;
use crate::database::models::PartitionMetadata;
use crate::database::queries::Queries;
use crate::database::schema::{archive_table_name, LIVE_TABLE};
use crate::database::Database;
use crate::error::{AuditError, AuditResult};

/// Which live entries are old enough to archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArchiveCutoff {
    /// Entries with `id <= cutoff`.
    Id(i64),
    /// Entries created at or before the instant.
    Date(DateTime<Utc>),
}

impl ArchiveCutoff {
    /// Everything older than `days` before `now`.
    pub fn retention(days: i64, now: DateTime<Utc>) -> Self {
        Self::Date(now - Duration::days(days))
    }
}

/// Slice chosen for one run: contiguous ids, all from one calendar year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArchivePlan {
    partition_key: i32,
    first_id: i64,
    last_id: i64,
}

impl ArchivePlan {
    fn len(&self) -> u64 {
        (self.last_id - self.first_id + 1) as u64
    }
}

/// Outcome of re-reading a copied slice from its partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CopyCheck {
    /// Digest of the last copied entry.
    Verified(String),
    Rejected(String),
}

#[derive(Clone)]
pub struct ArchivePartitioner {
    db: Database,
    registry: PartitionRegistry,
    ledger: LedgerView,
    writer: LogWriter,
    batch_size: u32,
    run_lock: Arc<Mutex<()>>,
}

impl ArchivePartitioner {
    pub fn new(ledger: LedgerView, writer: LogWriter, batch_size: u32) -> Self {
        Self {
            db: ledger.database().clone(),
            registry: ledger.registry().clone(),
            ledger,
            writer,
            batch_size: batch_size.max(1),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Archive the next eligible slice: the oldest live entries up to the
    /// cutoff, stopping at the end of their calendar year. Returns `None`
    /// when nothing is eligible.
    pub async fn archive_up_to(&self, cutoff: ArchiveCutoff) -> AuditResult<Option<PartitionMetadata>> {
        if let ArchiveCutoff::Id(id) = cutoff {
            if id < 1 {
                return Err(AuditError::invalid_id(id));
            }
        }

        let _run = self.run_lock.lock().await;
        self.recover_pending().await?;

        let plan = {
            let _tail = self.writer.lock_tail().await;
            self.plan(cutoff).await?
        };
        let Some(plan) = plan else {
            debug!(?cutoff, "No live entries eligible for archival");
            return Ok(None);
        };

        info!(
            partition = plan.partition_key,
            first_id = plan.first_id,
            last_id = plan.last_id,
            "Archiving audit entries"
        );

        let meta = self.open_partition(plan.partition_key).await?;
        self.copy_slice(&meta, &plan).await?;
        match self.verify_copied_slice(&meta, plan.first_id, plan.last_id).await? {
            CopyCheck::Verified(boundary) => {
                let updated = self.commit_move(&meta, plan.first_id, plan.last_id, boundary).await?;
                Ok(Some(updated))
            }
            CopyCheck::Rejected(reason) => Err(AuditError::Storage(reason)),
        }
    }

    /// Repeat [`archive_up_to`](Self::archive_up_to) until nothing older
    /// than the cutoff remains live.
    pub async fn archive_all_up_to(&self, cutoff: ArchiveCutoff) -> AuditResult<Vec<PartitionMetadata>> {
        let mut moved = Vec::new();
        while let Some(meta) = self.archive_up_to(cutoff).await? {
            moved.push(meta);
        }
        Ok(moved)
    }

    /// Finish or discard archival runs that stopped between copying and
    /// committing. Returns the partitions that were completed.
    pub async fn recover(&self) -> AuditResult<Vec<PartitionMetadata>> {
        let _run = self.run_lock.lock().await;
        self.recover_pending().await
    }

    async fn recover_pending(&self) -> AuditResult<Vec<PartitionMetadata>> {
        let pool = self.db.pool();
        let mut completed = Vec::new();

        for meta in self.registry.all().await? {
            if meta.is_sealed() {
                continue;
            }

            let committed = meta.last_id.unwrap_or(0);
            let pending = Queries::id_span(pool, &meta.storage_location, committed, i64::MAX).await?;
            let (Some(first), Some(last)) = (pending.min_id, pending.max_id) else {
                continue;
            };

            let expected = last - first + 1;
            let still_live = Queries::id_span(pool, LIVE_TABLE, first - 1, last).await?;
            if pending.row_count != expected || still_live.row_count != expected {
                return Err(AuditError::Storage(format!(
                    "Partition {} holds uncommitted rows {}..{} that no longer match the live ledger",
                    meta.partition_key, first, last
                )));
            }

            warn!(
                partition = meta.partition_key,
                first_id = first,
                last_id = last,
                "Resuming interrupted archival"
            );
            match self.verify_copied_slice(&meta, first, last).await? {
                CopyCheck::Verified(boundary) => {
                    completed.push(self.commit_move(&meta, first, last, boundary).await?)
                }
                // Copies were discarded; the live rows remain authoritative.
                CopyCheck::Rejected(reason) => {
                    warn!(partition = meta.partition_key, "Dropped unverifiable copies: {}", reason)
                }
            }
        }

        Ok(completed)
    }

    /// Pick the slice to move. Must run under the writer's tail lock.
    async fn plan(&self, cutoff: ArchiveCutoff) -> AuditResult<Option<ArchivePlan>> {
        let pool = self.db.pool();

        let live = Queries::id_span(pool, LIVE_TABLE, 0, i64::MAX).await?;
        let (Some(first_id), Some(max_id)) = (live.min_id, live.max_id) else {
            return Ok(None);
        };

        let expected_first = self.registry.last_archived_id().await?.unwrap_or(0) + 1;
        if first_id != expected_first {
            return Err(AuditError::Storage(format!(
                "Live ledger starts at entry {} but the archive ends at entry {}",
                first_id,
                expected_first - 1
            )));
        }

        let first_entry = TableSource::live(self.db.clone())
            .get(first_id)
            .await?
            .ok_or_else(|| AuditError::entry_not_found(first_id))?;
        let year = first_entry.created_at.year();

        let mut last_id = match cutoff {
            ArchiveCutoff::Id(id) => id.min(max_id),
            ArchiveCutoff::Date(ts) => {
                match Queries::first_live_id_created_after(pool, &format_timestamp(&ts)).await? {
                    Some(newer) => newer - 1,
                    None => max_id,
                }
            }
        };

        let (year_start, next_year_start) = year_bounds(year)?;
        if let Some(next_year) =
            Queries::first_live_id_outside(pool, first_id, &year_start, &next_year_start).await?
        {
            last_id = last_id.min(next_year - 1);
        }

        if last_id < first_id {
            return Ok(None);
        }

        let slice = Queries::id_span(pool, LIVE_TABLE, first_id - 1, last_id).await?;
        let plan = ArchivePlan {
            partition_key: year,
            first_id,
            last_id,
        };
        if slice.row_count as u64 != plan.len() {
            return Err(AuditError::Storage(format!(
                "Live entries {}..{} are not contiguous ({} rows)",
                first_id, last_id, slice.row_count
            )));
        }

        Ok(Some(plan))
    }

    /// The open partition for `year`, created on first use.
    async fn open_partition(&self, year: i32) -> AuditResult<PartitionMetadata> {
        if let Some(meta) = self.registry.get(year).await? {
            if meta.is_sealed() {
                return Err(AuditError::Validation(format!(
                    "Archive partition {} is sealed",
                    year
                )));
            }
            return Ok(meta);
        }

        let table = archive_table_name(year);
        Queries::create_archive_table(self.db.pool(), &table).await?;

        let meta = PartitionMetadata {
            partition_key: year,
            first_id: None,
            last_id: None,
            row_count: 0,
            boundary_digest: None,
            storage_location: table,
            created_at: self.writer.clock().now(),
            sealed_at: None,
        };
        let mut tx = self.db.pool().begin().await?;
        let created = Queries::insert_partition(&mut tx, &meta).await?;
        if created {
            Queries::bump_partition_generation(&mut tx).await?;
        }
        tx.commit().await?;

        if !created {
            // another archiver registered the year first
            return self
                .registry
                .get(year)
                .await?
                .ok_or_else(|| AuditError::partition_not_found(year));
        }
        info!(partition = year, table = %meta.storage_location, "Created archive partition");
        Ok(meta)
    }

    async fn copy_slice(&self, meta: &PartitionMetadata, plan: &ArchivePlan) -> AuditResult<()> {
        let mut start = plan.first_id;
        while start <= plan.last_id {
            let end = (start + i64::from(self.batch_size) - 1).min(plan.last_id);

            let mut tx = self.db.pool().begin().await?;
            let copied = Queries::copy_live_range(&mut tx, &meta.storage_location, start, end).await?;
            if copied != (end - start + 1) as u64 {
                tx.rollback().await?;
                self.discard_pending(meta).await?;
                return Err(AuditError::Storage(format!(
                    "Copied {} rows for entries {}..{} into partition {}",
                    copied, start, end, meta.partition_key
                )));
            }
            tx.commit().await?;

            debug!(partition = meta.partition_key, start, end, "Copied archive batch");
            start = end + 1;
        }
        Ok(())
    }

    /// Re-read the copied rows from the partition table and check they chain
    /// from the true predecessor. Rejected copies are discarded before
    /// returning; storage failures propagate untouched.
    async fn verify_copied_slice(
        &self,
        meta: &PartitionMetadata,
        first_id: i64,
        last_id: i64,
    ) -> AuditResult<CopyCheck> {
        let seed = self.ledger.digest_before(first_id).await?.ok_or_else(|| {
            AuditError::Storage(format!("Predecessor of entry {} is missing", first_id))
        })?;

        let staging = TableSource::partition_staging(self.db.clone(), meta);
        let filter = EntryFilter::default();
        let mut check = ChainCheck::new(seed);
        let mut after = first_id - 1;
        let mut rejected = None;

        'pages: loop {
            let page = staging
                .scan(after, last_id, &filter, self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.id;

            for entry in &page {
                if !check.accept(entry) {
                    rejected = Some(format!(
                        "Archived copy of entry {} failed chain verification",
                        entry.id
                    ));
                    break 'pages;
                }
            }
        }

        let expected = (last_id - first_id + 1) as u64;
        if rejected.is_none() && check.checked() != expected {
            rejected = Some(format!(
                "Partition {} received {} of {} copied entries",
                meta.partition_key,
                check.checked(),
                expected
            ));
        }

        match rejected {
            Some(reason) => {
                self.discard_pending(meta).await?;
                Ok(CopyCheck::Rejected(reason))
            }
            None => Ok(CopyCheck::Verified(check.running_digest().to_string())),
        }
    }

    /// Delete the moved rows from the live table and extend the partition in
    /// one transaction.
    async fn commit_move(
        &self,
        meta: &PartitionMetadata,
        first_id: i64,
        last_id: i64,
        boundary_digest: String,
    ) -> AuditResult<PartitionMetadata> {
        let moved = (last_id - first_id + 1) as u64;
        let mut tx = self.db.pool().begin().await?;

        let deleted = Queries::delete_range(&mut tx, LIVE_TABLE, first_id, last_id).await?;
        if deleted != moved {
            tx.rollback().await?;
            return Err(AuditError::Storage(format!(
                "Expected to remove {} live entries, found {}",
                moved, deleted
            )));
        }

        let now = self.writer.clock().now();
        let oldest_remaining_year = match Queries::first_live_created_at(&mut tx, last_id).await? {
            Some(raw) => parse_timestamp(&raw)?.year(),
            None => now.year(),
        };

        let updated = PartitionMetadata {
            first_id: meta.first_id.or(Some(first_id)),
            last_id: Some(last_id),
            row_count: meta.row_count + moved,
            boundary_digest: Some(boundary_digest),
            sealed_at: (meta.partition_key < oldest_remaining_year).then_some(now),
            ..meta.clone()
        };

        if !Queries::extend_partition(&mut tx, meta, &updated).await? {
            tx.rollback().await?;
            return Err(AuditError::Storage(format!(
                "Partition {} changed while entries {}..{} were being archived",
                meta.partition_key, first_id, last_id
            )));
        }
        let sealed_earlier = Queries::seal_partitions_before(&mut tx, oldest_remaining_year, &now).await?;
        Queries::bump_partition_generation(&mut tx).await?;
        tx.commit().await?;

        info!(
            partition = updated.partition_key,
            moved,
            sealed = updated.is_sealed(),
            sealed_earlier,
            "{}",
            updated.summary()
        );
        Ok(updated)
    }

    /// Drop copies beyond the committed tail.
    async fn discard_pending(&self, meta: &PartitionMetadata) -> AuditResult<u64> {
        let committed = meta.last_id.unwrap_or(0);
        let dropped =
            Queries::delete_archive_rows_after(self.db.pool(), &meta.storage_location, committed).await?;
        debug!(partition = meta.partition_key, dropped, "Discarded uncommitted copies");
        Ok(dropped)
    }
}

impl std::fmt::Debug for ArchivePartitioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchivePartitioner")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

/// Canonical text bounds `[start of year, start of next year)`.
fn year_bounds(year: i32) -> AuditResult<(String, String)> {
    let start_of = |y: i32| {
        NaiveDate::from_ymd_opt(y, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| format_timestamp(&Utc.from_utc_datetime(&naive)))
            .ok_or_else(|| AuditError::Storage(format!("Year {} is out of range", y)))
    };
    Ok((start_of(year)?, start_of(year + 1)?))
}

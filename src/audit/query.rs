//! Archive Query Service
//!
//! Paginated, filtered reads over the whole ledger. Pages are assembled from
//! per-source counts and offsets, so no partition is ever read in full.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::entry::LogEntry;
use crate::audit::registry::PartitionSet;
use crate::audit::source::{EntryLocation, LedgerView};
use crate::database::models::PartitionMetadata;
use crate::error::{AuditError, AuditResult};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFilter {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub is_sensitive: Option<bool>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub keyword: Option<String>,
}

impl EntryFilter {
    pub fn validate(&self) -> AuditResult<()> {
        if let (Some(start), Some(end)) = (&self.start_date, &self.end_date) {
            if start > end {
                return Err(AuditError::Validation(format!(
                    "startDate {} is after endDate {}",
                    start, end
                )));
            }
        }
        Ok(())
    }

    /// Whether a year partition can hold entries inside the date window.
    pub fn may_match_year(&self, year: i32) -> bool {
        let year_start = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single();
        let next_year_start = Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single();

        if let (Some(end), Some(year_start)) = (&self.end_date, year_start) {
            if *end < year_start {
                return false;
            }
        }
        if let (Some(start), Some(next_year_start)) = (&self.start_date, next_year_start) {
            if *start >= next_year_start {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPage {
    pub data: Vec<LogEntry>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
}

/// Where an entry lives and, when archived, its partition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    pub id: i64,
    pub location: EntryLocation,
    pub chain_digest: String,
    pub created_at: DateTime<Utc>,
    pub partition: Option<PartitionMetadata>,
}

#[derive(Clone, Debug)]
pub struct ArchiveQueryService {
    ledger: LedgerView,
}

impl ArchiveQueryService {
    pub fn new(ledger: LedgerView) -> Self {
        Self { ledger }
    }

    /// Newest-first page across live and archived entries. `page` starts at 1;
    /// `page_size` is clamped to `1..=200`.
    pub async fn list(&self, page: u32, page_size: u32, filter: &EntryFilter) -> AuditResult<EntryPage> {
        filter.validate()?;
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

        let page = loop {
            let partitions = self.ledger.registry().snapshot().await?;
            let assembled = self.page_in(&partitions, page, page_size, filter).await?;
            if self.ledger.registry().is_current(&partitions).await? {
                break assembled;
            }
            debug!(page, "Partitions changed while listing, retrying");
        };

        debug!(
            page = page.page,
            page_size,
            total = page.total,
            returned = page.data.len(),
            "Listed audit entries"
        );
        Ok(page)
    }

    async fn page_in(
        &self,
        partitions: &PartitionSet,
        page: u32,
        page_size: u32,
        filter: &EntryFilter,
    ) -> AuditResult<EntryPage> {
        let mut skip = (page as u64 - 1) * page_size as u64;
        let mut remaining = page_size;
        let mut total = 0u64;
        let mut data = Vec::with_capacity(page_size as usize);

        for (source, meta) in self.ledger.sources_newest_first(partitions) {
            if let Some(meta) = meta {
                if !filter.may_match_year(meta.partition_key) {
                    continue;
                }
            }

            let count = source.count(filter).await?;
            total += count;

            if skip >= count {
                skip -= count;
                continue;
            }
            if remaining > 0 {
                let rows = source.page_newest_first(filter, skip, remaining).await?;
                remaining = remaining.saturating_sub(rows.len() as u32);
                data.extend(rows);
            }
            skip = 0;
        }

        Ok(EntryPage {
            data,
            page,
            page_size,
            total,
            total_pages: total.div_ceil(page_size as u64),
        })
    }

    pub async fn locate(&self, id: i64) -> AuditResult<EntryLocation> {
        if id < 1 {
            return Err(AuditError::invalid_id(id));
        }
        self.ledger
            .locate_entry(id)
            .await?
            .map(|(_, location)| location)
            .ok_or_else(|| AuditError::entry_not_found(id))
    }

    pub async fn metadata_for(&self, id: i64) -> AuditResult<EntryMetadata> {
        if id < 1 {
            return Err(AuditError::invalid_id(id));
        }
        let (entry, location) = self
            .ledger
            .locate_entry(id)
            .await?
            .ok_or_else(|| AuditError::entry_not_found(id))?;

        let partition = match location {
            EntryLocation::Archive { partition_key } => Some(
                self.ledger
                    .registry()
                    .get(partition_key)
                    .await?
                    .ok_or_else(|| AuditError::partition_not_found(partition_key))?,
            ),
            EntryLocation::Live => None,
        };

        Ok(EntryMetadata {
            id: entry.id,
            location,
            chain_digest: entry.chain_digest,
            created_at: entry.created_at,
            partition,
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_pruning() {
        let filter = EntryFilter {
            start_date: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
            end_date: Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        assert!(filter.may_match_year(2024));
        assert!(!filter.may_match_year(2023));
        assert!(!filter.may_match_year(2025));
        assert!(EntryFilter::default().may_match_year(1999));
    }

    #[test]
    fn test_inverted_dates_rejected() {
        let filter = EntryFilter {
            start_date: Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
            end_date: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        assert!(matches!(filter.validate(), Err(AuditError::Validation(_))));
    }
}

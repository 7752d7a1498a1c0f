//! Audit Log Verification
//!
//! Recomputes chain digests forward from a known-good predecessor and
//! reports the first entry whose stored digest disagrees. A broken chain is
//! a normal result; only storage failures and cancellation are errors.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::entry::LogEntry;
use crate::audit::query::EntryFilter;
use crate::audit::source::LedgerView;
use crate::audit::stats::ChainMonitor;
use crate::error::{AuditError, AuditResult};

/// Requested inclusive id bounds; `None` means "from the first" / "to the last".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRange {
    pub start_id: Option<i64>,
    pub end_id: Option<i64>,
}

impl VerificationRange {
    pub fn new(start_id: Option<i64>, end_id: Option<i64>) -> Self {
        Self { start_id, end_id }
    }

    pub fn single(id: i64) -> Self {
        Self::new(Some(id), Some(id))
    }

    pub fn validate(&self) -> AuditResult<()> {
        for id in [self.start_id, self.end_id].into_iter().flatten() {
            if id < 1 {
                return Err(AuditError::invalid_id(id));
            }
        }
        if let (Some(start), Some(end)) = (self.start_id, self.end_id) {
            if start > end {
                return Err(AuditError::invalid_range(start, end));
            }
        }
        Ok(())
    }

    pub fn is_unbounded(&self) -> bool {
        self.start_id.is_none() && self.end_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub range: VerificationRange,
    pub valid: bool,
    pub broken_at_id: Option<i64>,
    pub checked_count: u64,
    pub message: String,
}

impl VerificationResult {
    pub fn intact(range: VerificationRange, checked_count: u64) -> Self {
        let message = if checked_count == 0 {
            "No hash chain entries found.".to_string()
        } else {
            format!("Hash chain verified for {} entries.", checked_count)
        };
        Self {
            range,
            valid: true,
            broken_at_id: None,
            checked_count,
            message,
        }
    }

    pub fn broken(range: VerificationRange, broken_at_id: i64, checked_count: u64) -> Self {
        Self {
            range,
            valid: false,
            broken_at_id: Some(broken_at_id),
            checked_count,
            message: format!("Hash chain broken at entry {}.", broken_at_id),
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        if self.valid {
            format!("✅ Audit chain is valid ({} entries checked)", self.checked_count)
        } else {
            format!(
                "❌ Audit chain is broken at entry {} ({} entries checked)",
                self.broken_at_id.unwrap_or_default(),
                self.checked_count
            )
        }
    }

    /// Get detailed status
    pub fn detailed_status(&self) -> String {
        format!(
            "Range: {}..{}\nChecked: {}\nChain: {}\nMessage: {}",
            self.range.start_id.map(|id| id.to_string()).unwrap_or_else(|| "first".into()),
            self.range.end_id.map(|id| id.to_string()).unwrap_or_else(|| "last".into()),
            self.checked_count,
            if self.valid { "✅ Valid" } else { "❌ Broken" },
            self.message
        )
    }
}

/// Running state of a forward chain walk.
#[derive(Debug, Clone)]
pub struct ChainCheck {
    running_digest: String,
    checked: u64,
}

impl ChainCheck {
    pub fn new(seed_digest: impl Into<String>) -> Self {
        Self {
            running_digest: seed_digest.into(),
            checked: 0,
        }
    }

    /// Check one entry against the running digest. On a match the running
    /// digest advances to the entry's stored digest; on a mismatch it stays.
    pub fn accept(&mut self, entry: &LogEntry) -> bool {
        self.checked += 1;
        if !entry.verify_digest(&self.running_digest) {
            return false;
        }
        self.running_digest = entry.chain_digest.clone();
        true
    }

    pub fn checked(&self) -> u64 {
        self.checked
    }

    pub fn running_digest(&self) -> &str {
        &self.running_digest
    }
}

#[derive(Clone, Debug)]
pub struct ChainVerifier {
    ledger: LedgerView,
    monitor: ChainMonitor,
    page_size: u32,
}

impl ChainVerifier {
    pub fn new(ledger: LedgerView, monitor: ChainMonitor, page_size: u32) -> Self {
        Self {
            ledger,
            monitor,
            page_size: page_size.max(1),
        }
    }

    /// Verify a single entry against its true predecessor.
    pub async fn verify_one(&self, id: i64) -> AuditResult<VerificationResult> {
        let range = VerificationRange::single(id);
        range.validate()?;

        let entry = self
            .ledger
            .get(id)
            .await?
            .ok_or_else(|| AuditError::entry_not_found(id))?;

        let valid = match self.ledger.digest_before(id).await? {
            Some(previous) => entry.verify_digest(&previous),
            None => {
                warn!(audit_id = id, "Predecessor missing from every store");
                false
            }
        };

        Ok(if valid {
            VerificationResult::intact(range, 1)
        } else {
            VerificationResult::broken(range, id, 1)
        })
    }

    pub async fn verify_range(
        &self,
        start_id: Option<i64>,
        end_id: Option<i64>,
    ) -> AuditResult<VerificationResult> {
        self.verify_range_with_cancel(start_id, end_id, &CancellationToken::new())
            .await
    }

    pub async fn verify_all(&self) -> AuditResult<VerificationResult> {
        self.verify_range(None, None).await
    }

    /// Stream `[start_id, end_id]` in pages, stopping at the first mismatch.
    /// Cancellation is checked between pages.
    pub async fn verify_range_with_cancel(
        &self,
        start_id: Option<i64>,
        end_id: Option<i64>,
        cancel: &CancellationToken,
    ) -> AuditResult<VerificationResult> {
        let range = VerificationRange::new(start_id, end_id);
        range.validate()?;

        let until = end_id.unwrap_or(i64::MAX);
        let mut after = start_id.unwrap_or(1) - 1;
        let mut check: Option<ChainCheck> = None;
        let filter = EntryFilter::default();

        loop {
            if cancel.is_cancelled() {
                info!(after, "Chain verification cancelled");
                return Err(AuditError::Cancelled);
            }

            let page = self.ledger.scan(after, until, &filter, self.page_size).await?;
            let (Some(first), Some(last)) = (page.first(), page.last()) else {
                break;
            };
            let next_after = last.id;

            let mut running = match check.take() {
                Some(running) => running,
                None => match self.ledger.digest_before(first.id).await? {
                    Some(seed) => ChainCheck::new(seed),
                    None => {
                        warn!(audit_id = first.id, "Predecessor missing from every store");
                        let result = VerificationResult::broken(range, first.id, 1);
                        return Ok(self.finish(range, result).await);
                    }
                },
            };

            for entry in &page {
                if !running.accept(entry) {
                    warn!(audit_id = entry.id, checked = running.checked(), "Audit chain broken");
                    let result = VerificationResult::broken(range, entry.id, running.checked());
                    return Ok(self.finish(range, result).await);
                }
            }

            debug!(through = next_after, "Verified audit chain page");
            check = Some(running);
            after = next_after;
        }

        let checked = check.map(|c| c.checked()).unwrap_or(0);
        info!(checked, "Audit chain verification successful");
        Ok(self.finish(range, VerificationResult::intact(range, checked)).await)
    }

    async fn finish(&self, range: VerificationRange, result: VerificationResult) -> VerificationResult {
        if range.is_unbounded() {
            self.monitor.record_full_verification(&result).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{AuditEvent, GENESIS_DIGEST};
    use chrono::Utc;

    fn verify_entries<'a>(
        entries: impl IntoIterator<Item = &'a LogEntry>,
        seed_digest: &str,
        range: VerificationRange,
    ) -> VerificationResult {
        let mut check = ChainCheck::new(seed_digest);
        for entry in entries {
            if !check.accept(entry) {
                return VerificationResult::broken(range, entry.id, check.checked());
            }
        }
        VerificationResult::intact(range, check.checked())
    }

    fn chain(count: i64) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        let mut previous = GENESIS_DIGEST.to_string();
        for id in 1..=count {
            let event = AuditEvent::new("u-1", "Tester", format!("step_{}", id), "rfq");
            let entry = LogEntry::chained(id, event, Utc::now(), &previous);
            previous = entry.chain_digest.clone();
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn test_verify_entries_intact() {
        let entries = chain(5);
        let result = verify_entries(&entries, GENESIS_DIGEST, VerificationRange::default());
        assert!(result.valid);
        assert_eq!(result.checked_count, 5);
        assert!(result.summary().contains("✅"));
    }

    #[test]
    fn test_verify_entries_reports_first_break() {
        let mut entries = chain(5);
        entries[2].action = "tampered".to_string();
        let result = verify_entries(&entries, GENESIS_DIGEST, VerificationRange::default());
        assert!(!result.valid);
        assert_eq!(result.broken_at_id, Some(3));
        assert_eq!(result.checked_count, 3);
    }

    #[test]
    fn test_wrong_seed_breaks_first_entry() {
        let entries = chain(3);
        let result = verify_entries(&entries, "sha256:wrong", VerificationRange::default());
        assert_eq!(result.broken_at_id, Some(1));
        assert_eq!(result.checked_count, 1);
    }

    #[test]
    fn test_range_validation() {
        assert!(VerificationRange::new(Some(1), Some(5)).validate().is_ok());
        assert!(VerificationRange::new(None, None).validate().is_ok());
        assert!(matches!(
            VerificationRange::new(Some(5), Some(1)).validate(),
            Err(AuditError::Validation(_))
        ));
        assert!(matches!(
            VerificationRange::new(Some(0), None).validate(),
            Err(AuditError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_result_message() {
        let result = VerificationResult::intact(VerificationRange::new(Some(10), Some(20)), 0);
        assert!(result.valid);
        assert_eq!(result.message, "No hash chain entries found.");
        assert!(result.detailed_status().contains("Checked: 0"));
    }
}

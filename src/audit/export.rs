//! Audit export
//!
//! Produces a self-contained snapshot of a filtered slice of the ledger.
//! Every record carries the digest it chains from, so a snapshot can be
//! re-verified offline even when the filter made it non-contiguous.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::entry::{AuditEvent, LogEntry, PROTOCOL_VERSION};
use crate::audit::logger::LogWriter;
use crate::audit::query::EntryFilter;
use crate::audit::source::LedgerView;
use crate::audit::verify::{ChainCheck, VerificationRange, VerificationResult};
use crate::error::{AuditError, AuditResult};

/// Who requested an export. Recorded in the snapshot and in the meta-audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportActor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ip_address: Option<String>,
}

impl ExportActor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ip_address: None,
        }
    }

    pub fn system() -> Self {
        Self::new("system", "system")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    #[serde(flatten)]
    pub entry: LogEntry,
    /// Digest of entry `id - 1` (genesis for entry 1).
    pub previous_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSnapshot {
    pub export_id: Uuid,
    pub export_date: DateTime<Utc>,
    pub exported_by: ExportActor,
    pub filters: EntryFilter,
    pub total_records: u64,
    pub protocol: String,
    /// Digest preceding the first exported record.
    pub preceding_digest: Option<String>,
    pub records: Vec<ExportRecord>,
}

impl ExportSnapshot {
    pub fn file_name(&self) -> String {
        format!("audit-export-{}.json", self.export_date.format("%Y%m%dT%H%M%SZ"))
    }
}

#[derive(Clone, Debug)]
pub struct ExportService {
    ledger: LedgerView,
    writer: LogWriter,
    page_size: u32,
}

impl ExportService {
    pub fn new(ledger: LedgerView, writer: LogWriter, page_size: u32) -> Self {
        Self {
            ledger,
            writer,
            page_size: page_size.max(1),
        }
    }

    pub async fn export(&self, filter: &EntryFilter, actor: &ExportActor) -> AuditResult<ExportSnapshot> {
        self.export_with_cancel(filter, actor, &CancellationToken::new())
            .await
    }

    /// Collect matching entries in id order, then record the export itself.
    /// Cancellation is checked between pages; nothing is written when cancelled.
    pub async fn export_with_cancel(
        &self,
        filter: &EntryFilter,
        actor: &ExportActor,
        cancel: &CancellationToken,
    ) -> AuditResult<ExportSnapshot> {
        filter.validate()?;

        let mut records: Vec<ExportRecord> = Vec::new();
        let mut after = 0;
        loop {
            if cancel.is_cancelled() {
                info!(exported = records.len(), "Audit export cancelled");
                return Err(AuditError::Cancelled);
            }

            let page = self.ledger.scan(after, i64::MAX, filter, self.page_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.id;

            for entry in page {
                let previous_digest = match records.last() {
                    Some(prior) if prior.entry.id == entry.id - 1 => prior.entry.chain_digest.clone(),
                    _ => self.ledger.digest_before(entry.id).await?.ok_or_else(|| {
                        AuditError::Storage(format!("Predecessor of entry {} is missing", entry.id))
                    })?,
                };
                records.push(ExportRecord {
                    entry,
                    previous_digest,
                });
            }
        }

        let snapshot = ExportSnapshot {
            export_id: Uuid::new_v4(),
            export_date: self.writer.clock().now(),
            exported_by: actor.clone(),
            filters: filter.clone(),
            total_records: records.len() as u64,
            protocol: PROTOCOL_VERSION.to_string(),
            preceding_digest: records.first().map(|r| r.previous_digest.clone()),
            records,
        };

        let mut event = AuditEvent::new(&actor.id, &actor.name, "export_data", "audit_log")
            .with_summary(format!("Exported {} audit log records", snapshot.total_records))
            .with_changes(
                json!({
                    "count": snapshot.total_records,
                    "filters": &snapshot.filters,
                })
                .to_string(),
            );
        if let Some(ip) = &actor.ip_address {
            event = event.with_ip_address(ip);
        }
        self.writer.append(event).await?;

        info!(
            export_id = %snapshot.export_id,
            records = snapshot.total_records,
            actor = %actor.id,
            "Audit log exported"
        );
        Ok(snapshot)
    }

    pub fn verify_snapshot(&self, snapshot: &ExportSnapshot) -> AuditResult<VerificationResult> {
        verify_snapshot(snapshot)
    }
}

/// Re-verify a snapshot using nothing but its own contents.
pub fn verify_snapshot(snapshot: &ExportSnapshot) -> AuditResult<VerificationResult> {
    if snapshot.protocol != PROTOCOL_VERSION {
        return Err(AuditError::Validation(format!(
            "Unsupported export protocol {:?}",
            snapshot.protocol
        )));
    }

    let range = VerificationRange::new(
        snapshot.records.first().map(|r| r.entry.id),
        snapshot.records.last().map(|r| r.entry.id),
    );
    if snapshot.total_records != snapshot.records.len() as u64 {
        warn!(
            declared = snapshot.total_records,
            actual = snapshot.records.len(),
            "Export record count does not match its header"
        );
        let broken_at = range.start_id.unwrap_or(1);
        return Ok(VerificationResult::broken(range, broken_at, 0));
    }

    let mut checked = 0u64;
    let mut prior: Option<&LogEntry> = None;
    for record in &snapshot.records {
        let expected_previous = match prior {
            None => snapshot.preceding_digest.as_deref(),
            Some(p) if p.id == record.entry.id - 1 => Some(p.chain_digest.as_str()),
            Some(_) => None,
        };
        let linked = expected_previous.map_or(true, |d| d == record.previous_digest);

        let mut check = ChainCheck::new(record.previous_digest.as_str());
        checked += 1;
        if !linked || !check.accept(&record.entry) {
            return Ok(VerificationResult::broken(range, record.entry.id, checked));
        }
        prior = Some(&record.entry);
    }

    Ok(VerificationResult::intact(range, checked))
}

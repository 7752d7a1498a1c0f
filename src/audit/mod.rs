//! Audit Ledger
//!
//! Tamper-evident, append-only record of every audited action. Each entry's
//! digest covers its own content and its predecessor's digest, so editing,
//! inserting or deleting any past row breaks verification from that row on.
//! Old entries move into per-year archive partitions without being re-hashed.

pub mod archive;
pub mod entry;
pub mod export;
pub mod logger;
pub mod query;
pub mod registry;
pub mod sensitivity;
pub mod source;
pub mod stats;
pub mod verify;

pub use archive::{ArchiveCutoff, ArchivePartitioner};
pub use entry::{AuditEvent, LogEntry, GENESIS_DIGEST, PROTOCOL_VERSION};
pub use export::{verify_snapshot, ExportActor, ExportRecord, ExportService, ExportSnapshot};
pub use logger::{Clock, LogWriter, SystemClock};
pub use query::{ArchiveQueryService, EntryFilter, EntryMetadata, EntryPage};
pub use registry::{PartitionRegistry, PartitionSet};
pub use source::{EntryLocation, EntrySource, LedgerView};
pub use stats::{ChainMonitor, LedgerStats, StatsService};
pub use verify::{ChainVerifier, VerificationRange, VerificationResult};

use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::database::Database;
use crate::error::AuditResult;

/// Every ledger service wired onto one database and one partition registry.
#[derive(Clone, Debug)]
pub struct AuditLedger {
    pub writer: LogWriter,
    pub verifier: ChainVerifier,
    pub partitioner: ArchivePartitioner,
    pub query: ArchiveQueryService,
    pub export: ExportService,
    pub stats: StatsService,
    pub registry: PartitionRegistry,
    db: Database,
}

impl AuditLedger {
    pub async fn open(db: Database, config: &AppConfig) -> AuditResult<Self> {
        Self::with_clock(db, config, Arc::new(SystemClock)).await
    }

    /// Same as [`open`](Self::open) with an injected time source.
    pub async fn with_clock(db: Database, config: &AppConfig, clock: Arc<dyn Clock>) -> AuditResult<Self> {
        let registry = PartitionRegistry::load(&db).await?;
        let monitor = ChainMonitor::default();
        let ledger = LedgerView::new(db.clone(), registry.clone());

        let writer = LogWriter::new(db.clone(), clock, config.append_max_retries);
        let verifier = ChainVerifier::new(ledger.clone(), monitor.clone(), config.page_size);
        let partitioner =
            ArchivePartitioner::new(ledger.clone(), writer.clone(), config.archive.copy_batch_size);
        let query = ArchiveQueryService::new(ledger.clone());
        let export = ExportService::new(ledger, writer.clone(), config.page_size);
        let stats = StatsService::new(db.clone(), registry.clone(), monitor);

        info!("Audit ledger opened");
        Ok(Self {
            writer,
            verifier,
            partitioner,
            query,
            export,
            stats,
            registry,
            db,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

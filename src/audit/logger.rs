//! Audit Log Writer
//!
//! The only component that creates ledger rows. Each append reads the chain
//! head, chains the new entry onto it and advances the head inside one
//! transaction; an in-process lock plus a compare-and-swap on the head keep
//! the chain linear even when several writers race.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::audit::entry::{AuditEvent, LogEntry, GENESIS_DIGEST};
use crate::database::models::ChainHead;
use crate::database::queries::Queries;
use crate::database::Database;
use crate::error::{AuditError, AuditResult};

/// Source of `created_at` timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone)]
pub struct LogWriter {
    db: Database,
    tail_lock: Arc<Mutex<()>>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl LogWriter {
    pub fn new(db: Database, clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
        Self {
            db,
            tail_lock: Arc::new(Mutex::new(())),
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Append one audit event and return the committed, chained entry.
    pub async fn append(&self, event: AuditEvent) -> AuditResult<LogEntry> {
        event.validate()?;
        let event = event.classified();

        let _tail = self.tail_lock.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_append(&event).await {
                Ok(entry) => {
                    debug!(
                        audit_id = entry.id,
                        action = %entry.action,
                        entity = %entry.entity_type,
                        "Audit entry recorded"
                    );
                    return Ok(entry);
                }
                Err(AuditError::ConcurrencyConflict { expected_tail, .. }) => {
                    if attempt >= self.max_attempts {
                        return Err(AuditError::ConcurrencyConflict {
                            expected_tail,
                            attempts: attempt,
                        });
                    }
                    warn!(
                        attempt,
                        expected_tail = ?expected_tail,
                        "Chain head moved during append, retrying with a fresh predecessor"
                    );
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_append(&self, event: &AuditEvent) -> AuditResult<LogEntry> {
        let mut tx = self.db.pool().begin().await?;

        let head = Queries::chain_head(&mut tx).await?;
        let (previous_id, previous_digest) = match &head {
            Some(head) => (head.last_id, head.last_digest.as_str()),
            None => (0, GENESIS_DIGEST),
        };

        let entry = LogEntry::chained(previous_id + 1, event.clone(), self.clock.now(), previous_digest);

        Queries::insert_entry(&mut tx, &entry).await?;
        if !Queries::advance_head(&mut tx, head.as_ref(), entry.id, &entry.chain_digest).await? {
            tx.rollback().await?;
            return Err(AuditError::ConcurrencyConflict {
                expected_tail: Some(previous_id),
                attempts: 1,
            });
        }

        tx.commit().await?;
        Ok(entry)
    }

    pub async fn head(&self) -> AuditResult<Option<ChainHead>> {
        Queries::read_chain_head(self.db.pool()).await
    }

    /// Hold off appends while the archive partitioner fixes its boundary.
    pub(crate) async fn lock_tail(&self) -> MutexGuard<'_, ()> {
        self.tail_lock.lock().await
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn writer() -> LogWriter {
        let db = Database::new_in_memory().await.unwrap();
        LogWriter::new(db, Arc::new(SystemClock), 3)
    }

    fn event(i: usize) -> AuditEvent {
        AuditEvent::new(format!("u-{}", i), "Tester", "update_rfq", "rfq")
            .with_entity_id(format!("RFQ-{}", i))
            .with_changes(format!(r#"{{"line":{}}}"#, i))
    }

    #[tokio::test]
    async fn test_first_entry_chains_from_genesis() {
        let writer = writer().await;
        let entry = writer.append(event(1)).await.unwrap();
        assert_eq!(entry.id, 1);
        assert!(entry.verify_digest(GENESIS_DIGEST));

        let head = writer.head().await.unwrap().unwrap();
        assert_eq!(head.last_id, 1);
        assert_eq!(head.last_digest, entry.chain_digest);
    }

    #[tokio::test]
    async fn test_entries_link_to_predecessor() {
        let writer = writer().await;
        let mut previous = GENESIS_DIGEST.to_string();
        for i in 1..=5 {
            let entry = writer.append(event(i)).await.unwrap();
            assert_eq!(entry.id, i as i64);
            assert!(entry.verify_digest(&previous));
            previous = entry.chain_digest;
        }
    }

    #[tokio::test]
    async fn test_invalid_event_does_not_consume_an_id() {
        let writer = writer().await;
        let mut bad = event(1);
        bad.action.clear();
        assert!(matches!(writer.append(bad).await, Err(AuditError::Validation(_))));

        let entry = writer.append(event(2)).await.unwrap();
        assert_eq!(entry.id, 1);
    }

    #[tokio::test]
    async fn test_rows_are_immutable_in_storage() {
        let writer = writer().await;
        writer.append(event(1)).await.unwrap();
        let result = sqlx::query("UPDATE audit_log SET action = 'x' WHERE id = 1")
            .execute(writer.db.pool())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sensitive_actions_are_flagged() {
        let writer = writer().await;
        let entry = writer
            .append(AuditEvent::new("u-1", "Admin", "revoke_permission", "user"))
            .await
            .unwrap();
        assert!(entry.is_sensitive);
    }
}

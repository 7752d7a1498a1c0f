//! Hash chain integrity: appends, tampering, range semantics and concurrency.

mod common;

use audit_ledger::audit::{AuditEvent, AuditLedger, GENESIS_DIGEST};
use audit_ledger::config::AppConfig;
use audit_ledger::database::Database;
use audit_ledger::AuditError;
use common::{append_events, rfq_event, setup_test_ledger};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

const START: &str = "2024-03-01T12:00:00Z";

async fn tamper(ledger: &AuditLedger, sql: &str) {
    let pool = ledger.database().pool();
    sqlx::query("DROP TRIGGER audit_log_no_update")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(sql).execute(pool).await.unwrap();
}

#[tokio::test]
async fn test_corrupted_action_breaks_chain_at_that_entry() {
    let (ledger, clock) = setup_test_ledger(START).await;
    append_events(&ledger, &clock, 5).await;

    tamper(&ledger, "UPDATE audit_log SET action = 'approve_rfq' WHERE id = 3").await;

    let result = ledger.verifier.verify_range(Some(1), Some(5)).await.unwrap();
    assert!(!result.valid);
    assert_eq!(result.broken_at_id, Some(3));
    assert_eq!(result.checked_count, 3);

    // entries before the edit still verify on their own
    let prefix = ledger.verifier.verify_range(Some(1), Some(2)).await.unwrap();
    assert!(prefix.valid);
    assert_eq!(prefix.checked_count, 2);
}

#[tokio::test]
async fn test_tampering_any_field_is_detected() {
    let edits = [
        "UPDATE audit_log SET actor_id = 'intruder' WHERE id = 2",
        "UPDATE audit_log SET summary = NULL WHERE id = 2",
        "UPDATE audit_log SET changes = CAST('{}' AS BLOB) WHERE id = 2",
        "UPDATE audit_log SET is_sensitive = 1 WHERE id = 2",
        "UPDATE audit_log SET created_at = '2024-03-01T12:01:00.000001Z' WHERE id = 2",
        "UPDATE audit_log SET chain_digest = 'sha256:00' WHERE id = 2",
    ];

    for edit in edits {
        let (ledger, clock) = setup_test_ledger(START).await;
        append_events(&ledger, &clock, 4).await;
        tamper(&ledger, edit).await;

        let result = ledger.verifier.verify_all().await.unwrap();
        assert!(!result.valid, "edit not detected: {}", edit);
        assert_eq!(result.broken_at_id, Some(2), "wrong break for: {}", edit);
    }
}

#[tokio::test]
async fn test_deleted_entry_is_detected() {
    let (ledger, clock) = setup_test_ledger(START).await;
    append_events(&ledger, &clock, 5).await;

    sqlx::query("DELETE FROM audit_log WHERE id = 3")
        .execute(ledger.database().pool())
        .await
        .unwrap();

    let result = ledger.verifier.verify_all().await.unwrap();
    assert!(!result.valid);
    assert_eq!(result.broken_at_id, Some(4));

    // a range starting right after the hole has no predecessor to chain from
    let result = ledger.verifier.verify_range(Some(4), Some(5)).await.unwrap();
    assert_eq!(result.broken_at_id, Some(4));
}

#[tokio::test]
async fn test_verification_is_idempotent() {
    let (ledger, clock) = setup_test_ledger(START).await;
    append_events(&ledger, &clock, 7).await;

    let first = ledger.verifier.verify_range(Some(2), Some(6)).await.unwrap();
    let second = ledger.verifier.verify_range(Some(2), Some(6)).await.unwrap();
    assert_eq!(first, second);
    assert!(first.valid);
    assert_eq!(first.checked_count, 5);
}

#[tokio::test]
async fn test_single_entry_range_uses_true_predecessor() {
    let (ledger, clock) = setup_test_ledger(START).await;
    let entries = append_events(&ledger, &clock, 4).await;
    assert!(entries[0].verify_digest(GENESIS_DIGEST));

    let result = ledger.verifier.verify_range(Some(3), Some(3)).await.unwrap();
    assert!(result.valid);
    assert_eq!(result.checked_count, 1);

    let one = ledger.verifier.verify_one(3).await.unwrap();
    assert_eq!(one.checked_count, 1);
    assert!(one.valid);
}

#[tokio::test]
async fn test_empty_ranges() {
    let (ledger, clock) = setup_test_ledger(START).await;

    let result = ledger.verifier.verify_all().await.unwrap();
    assert!(result.valid);
    assert_eq!(result.checked_count, 0);
    assert_eq!(result.message, "No hash chain entries found.");

    append_events(&ledger, &clock, 3).await;
    let beyond = ledger.verifier.verify_range(Some(10), Some(20)).await.unwrap();
    assert!(beyond.valid);
    assert_eq!(beyond.checked_count, 0);
}

#[tokio::test]
async fn test_invalid_ranges_rejected() {
    let (ledger, _clock) = setup_test_ledger(START).await;

    assert!(matches!(
        ledger.verifier.verify_range(Some(5), Some(1)).await,
        Err(AuditError::Validation(_))
    ));
    assert!(matches!(
        ledger.verifier.verify_one(0).await,
        Err(AuditError::Validation(_))
    ));
    assert!(matches!(
        ledger.verifier.verify_one(42).await,
        Err(AuditError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_cancelled_verification() {
    let (ledger, clock) = setup_test_ledger(START).await;
    append_events(&ledger, &clock, 4).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = ledger
        .verifier
        .verify_range_with_cancel(None, None, &cancel)
        .await;
    assert!(matches!(result, Err(AuditError::Cancelled)));
}

#[tokio::test]
async fn test_concurrent_appends_form_one_chain() {
    let (ledger, _clock) = setup_test_ledger(START).await;

    let mut handles = Vec::new();
    for n in 0..20 {
        let writer = ledger.writer.clone();
        handles.push(tokio::spawn(async move { writer.append(rfq_event(n)).await }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let entry = handle.await.unwrap().unwrap();
        assert!(ids.insert(entry.id));
    }
    assert_eq!(ids, (1..=20).collect::<HashSet<i64>>());

    let result = ledger.verifier.verify_all().await.unwrap();
    assert!(result.valid);
    assert_eq!(result.checked_count, 20);
}

#[tokio::test]
async fn test_independent_writers_on_shared_database() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());

    let mut config = AppConfig::default();
    config.append_max_retries = 100;

    // two ledgers share the file but not the in-process tail lock
    let db = Database::new(&url).await.unwrap();
    db.run_migrations().await.unwrap();
    let a = AuditLedger::open(db, &config).await.unwrap();
    let b = AuditLedger::open(Database::new(&url).await.unwrap(), &config)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for (n, writer) in [a.writer.clone(), b.writer.clone()].into_iter().cycle().take(16).enumerate() {
        handles.push(tokio::spawn(async move { writer.append(rfq_event(n)).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let result = a.verifier.verify_all().await.unwrap();
    assert!(result.valid, "{}", result.message);
    assert_eq!(result.checked_count, 16);
    assert_eq!(b.writer.head().await.unwrap().unwrap().last_id, 16);
}

#[tokio::test]
async fn test_sensitive_classification_on_append() {
    let (ledger, _clock) = setup_test_ledger(START).await;

    let deleted = ledger
        .writer
        .append(AuditEvent::new("u-1", "Admin", "delete_supplier", "supplier"))
        .await
        .unwrap();
    assert!(deleted.is_sensitive);

    let routine = ledger.writer.append(rfq_event(1)).await.unwrap();
    assert!(!routine.is_sensitive);
}

#[tokio::test]
async fn test_stats_report_last_full_verification() {
    let (ledger, clock) = setup_test_ledger(START).await;
    append_events(&ledger, &clock, 3).await;

    let before = ledger.stats.get_stats().await.unwrap();
    assert_eq!(before.total_live, 3);
    assert_eq!(before.last_known_valid, None);

    // bounded ranges do not speak for the whole ledger
    ledger.verifier.verify_range(Some(1), Some(2)).await.unwrap();
    assert_eq!(ledger.stats.get_stats().await.unwrap().last_known_valid, None);

    ledger.verifier.verify_all().await.unwrap();
    let after = ledger.stats.get_stats().await.unwrap();
    assert_eq!(after.last_known_valid, Some(true));
    assert_eq!(after.head.unwrap().last_id, 3);

    ledger.writer.append(rfq_event(9)).await.unwrap();
    assert_eq!(ledger.stats.get_stats().await.unwrap().total_live, 4);
}

#![allow(dead_code)]

use audit_ledger::audit::{AuditEvent, AuditLedger, Clock, LogEntry};
use audit_ledger::config::AppConfig;
use audit_ledger::database::Database;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Test clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(ts: &str) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(parse(ts)),
        })
    }

    pub fn set(&self, ts: &str) {
        *self.now.lock().unwrap() = parse(ts);
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn parse(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts)
        .expect("valid RFC 3339 timestamp")
        .with_timezone(&Utc)
}

/// Small pages so multi-page paths are exercised with few entries.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.page_size = 3;
    config.archive.copy_batch_size = 2;
    config
}

/// Setup an in-memory ledger whose clock starts at `start`.
pub async fn setup_test_ledger(start: &str) -> (AuditLedger, Arc<ManualClock>) {
    let db = Database::new_in_memory()
        .await
        .expect("Failed to create test database");
    let clock = ManualClock::at(start);
    let ledger = AuditLedger::with_clock(db, &test_config(), clock.clone())
        .await
        .expect("Failed to open test ledger");
    (ledger, clock)
}

pub fn rfq_event(n: usize) -> AuditEvent {
    AuditEvent::new(format!("user-{}", n % 3), "Procurement Clerk", "update_rfq", "rfq")
        .with_entity_id(format!("RFQ-{:04}", n))
        .with_summary(format!("Updated RFQ line {}", n))
        .with_changes(format!(r#"{{"quantity":{{"from":{},"to":{}}}}}"#, n, n + 1))
        .with_ip_address("10.1.2.3")
}

/// Append `count` events, one minute apart.
pub async fn append_events(ledger: &AuditLedger, clock: &ManualClock, count: usize) -> Vec<LogEntry> {
    let mut entries = Vec::with_capacity(count);
    for n in 0..count {
        entries.push(ledger.writer.append(rfq_event(n)).await.expect("append"));
        clock.advance(Duration::minutes(1));
    }
    entries
}

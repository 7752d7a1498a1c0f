// Database schema definitions
// Live ledger, chain head and partition metadata come from the migration;
// archive partitions get one table per year, created on first write.

pub const AUDIT_LEDGER_SCHEMA: &str = include_str!("../../migrations/001_audit_ledger.sql");

pub const LIVE_TABLE: &str = "audit_log";

/// Table holding the archive partition for `year`.
pub fn archive_table_name(year: i32) -> String {
    format!("audit_archive_{}", year)
}

/// Same columns as the live table so rows can be copied verbatim.
pub fn archive_table_ddl(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY,
    actor_id TEXT NOT NULL,
    actor_name TEXT NOT NULL,
    action TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT,
    summary TEXT,
    changes BLOB NOT NULL,
    ip_address TEXT,
    is_sensitive INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    immutable INTEGER NOT NULL DEFAULT 1,
    chain_digest TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_{table}_created_at ON {table} (created_at);

CREATE TRIGGER IF NOT EXISTS {table}_no_update
BEFORE UPDATE ON {table}
BEGIN
    SELECT RAISE(ABORT, 'archived audit rows are immutable');
END;
"#,
        table = table
    )
}

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::audit::entry::{format_timestamp, LogEntry};
use crate::audit::query::EntryFilter;
use crate::database::models::*;
use crate::database::schema::{archive_table_ddl, LIVE_TABLE};
use crate::error::{AuditError, AuditResult};

const ENTRY_COLUMNS: &str = "id, actor_id, actor_name, action, entity_type, entity_id, summary, \
     changes, ip_address, is_sensitive, created_at, immutable, chain_digest";

const PARTITION_COLUMNS: &str = "partition_key, first_id, last_id, row_count, boundary_digest, \
     storage_location, created_at, sealed_at";

/// Id bounds and row count of a table (or of a slice of it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct IdSpan {
    pub min_id: Option<i64>,
    pub max_id: Option<i64>,
    pub row_count: i64,
}

pub struct Queries;

impl Queries {
    // ---- chain head -------------------------------------------------------

    pub async fn chain_head(conn: &mut SqliteConnection) -> AuditResult<Option<ChainHead>> {
        let head = sqlx::query_as::<_, ChainHead>(
            "SELECT last_id, last_digest FROM audit_chain_head WHERE singleton = 1",
        )
        .fetch_optional(conn)
        .await?;
        Ok(head)
    }

    pub async fn read_chain_head(pool: &SqlitePool) -> AuditResult<Option<ChainHead>> {
        let head = sqlx::query_as::<_, ChainHead>(
            "SELECT last_id, last_digest FROM audit_chain_head WHERE singleton = 1",
        )
        .fetch_optional(pool)
        .await?;
        Ok(head)
    }

    /// Compare-and-swap the chain head. Returns false when another writer
    /// moved the head since `expected` was read.
    pub async fn advance_head(
        conn: &mut SqliteConnection,
        expected: Option<&ChainHead>,
        new_id: i64,
        new_digest: &str,
    ) -> AuditResult<bool> {
        let result = match expected {
            Some(head) => {
                sqlx::query(
                    "UPDATE audit_chain_head SET last_id = ?, last_digest = ? \
                     WHERE singleton = 1 AND last_id = ? AND last_digest = ?",
                )
                .bind(new_id)
                .bind(new_digest)
                .bind(head.last_id)
                .bind(&head.last_digest)
                .execute(conn)
                .await?
            }
            None => {
                sqlx::query(
                    "INSERT INTO audit_chain_head (singleton, last_id, last_digest) VALUES (1, ?, ?) \
                     ON CONFLICT (singleton) DO NOTHING",
                )
                .bind(new_id)
                .bind(new_digest)
                .execute(conn)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    // ---- entries ----------------------------------------------------------

    /// Insert a freshly chained entry. A primary key collision means another
    /// writer already claimed this id.
    pub async fn insert_entry(conn: &mut SqliteConnection, entry: &LogEntry) -> AuditResult<()> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            LIVE_TABLE, ENTRY_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(entry.id)
            .bind(&entry.actor_id)
            .bind(&entry.actor_name)
            .bind(&entry.action)
            .bind(&entry.entity_type)
            .bind(&entry.entity_id)
            .bind(&entry.summary)
            .bind(entry.changes.as_bytes())
            .bind(&entry.ip_address)
            .bind(entry.is_sensitive)
            .bind(format_timestamp(&entry.created_at))
            .bind(entry.immutable)
            .bind(&entry.chain_digest)
            .execute(conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(AuditError::ConcurrencyConflict {
                    expected_tail: Some(entry.id - 1),
                    attempts: 1,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_entry(
        pool: &SqlitePool,
        table: &str,
        id: i64,
        upper: Option<i64>,
    ) -> AuditResult<Option<LogEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE id = ",
            ENTRY_COLUMNS, table
        ));
        qb.push_bind(id);
        if let Some(upper) = upper {
            qb.push(" AND id <= ").push_bind(upper);
        }

        let row = qb
            .build_query_as::<LogEntryRow>()
            .fetch_optional(pool)
            .await?;
        row.map(LogEntry::try_from).transpose()
    }

    /// Entries with `after < id <= until` matching `filter`, ascending, at most `limit`.
    pub async fn scan_ascending(
        pool: &SqlitePool,
        table: &str,
        after: i64,
        until: i64,
        filter: &EntryFilter,
        limit: u32,
    ) -> AuditResult<Vec<LogEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE id > ",
            ENTRY_COLUMNS, table
        ));
        qb.push_bind(after);
        qb.push(" AND id <= ").push_bind(until);
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id ASC LIMIT ").push_bind(limit as i64);

        let rows = qb.build_query_as::<LogEntryRow>().fetch_all(pool).await?;
        rows.into_iter().map(LogEntry::try_from).collect()
    }

    /// Newest-first page of entries with `id <= upper` matching `filter`.
    pub async fn page_descending(
        pool: &SqlitePool,
        table: &str,
        upper: i64,
        filter: &EntryFilter,
        offset: u64,
        limit: u32,
    ) -> AuditResult<Vec<LogEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE id <= ",
            ENTRY_COLUMNS, table
        ));
        qb.push_bind(upper);
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id DESC LIMIT ").push_bind(limit as i64);
        qb.push(" OFFSET ").push_bind(offset as i64);

        let rows = qb.build_query_as::<LogEntryRow>().fetch_all(pool).await?;
        rows.into_iter().map(LogEntry::try_from).collect()
    }

    pub async fn count_entries(
        pool: &SqlitePool,
        table: &str,
        upper: i64,
        filter: &EntryFilter,
    ) -> AuditResult<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT COUNT(*) FROM {} WHERE id <= ",
            table
        ));
        qb.push_bind(upper);
        push_filter(&mut qb, filter);

        let (count,): (i64,) = qb.build_query_as().fetch_one(pool).await?;
        Ok(count.max(0) as u64)
    }

    /// Bounds of the rows with `after < id <= until`.
    pub async fn id_span(
        pool: &SqlitePool,
        table: &str,
        after: i64,
        until: i64,
    ) -> AuditResult<IdSpan> {
        let sql = format!(
            "SELECT MIN(id) AS min_id, MAX(id) AS max_id, COUNT(*) AS row_count \
             FROM {} WHERE id > ? AND id <= ?",
            table
        );
        let span = sqlx::query_as::<_, IdSpan>(&sql)
            .bind(after)
            .bind(until)
            .fetch_one(pool)
            .await?;
        Ok(span)
    }

    /// Lowest live id after `after` whose timestamp is outside `[from, to)`.
    pub async fn first_live_id_outside(
        pool: &SqlitePool,
        after: i64,
        from: &str,
        to: &str,
    ) -> AuditResult<Option<i64>> {
        let sql = format!(
            "SELECT MIN(id) FROM {} WHERE id > ? AND (created_at < ? OR created_at >= ?)",
            LIVE_TABLE
        );
        let (id,): (Option<i64>,) = sqlx::query_as(&sql)
            .bind(after)
            .bind(from)
            .bind(to)
            .fetch_one(pool)
            .await?;
        Ok(id)
    }

    /// Lowest live id created strictly after `ts`.
    pub async fn first_live_id_created_after(pool: &SqlitePool, ts: &str) -> AuditResult<Option<i64>> {
        let sql = format!("SELECT MIN(id) FROM {} WHERE created_at > ?", LIVE_TABLE);
        let (id,): (Option<i64>,) = sqlx::query_as(&sql).bind(ts).fetch_one(pool).await?;
        Ok(id)
    }

    /// Timestamp of the oldest live entry with `id > after`.
    pub async fn first_live_created_at(
        conn: &mut SqliteConnection,
        after: i64,
    ) -> AuditResult<Option<String>> {
        let sql = format!(
            "SELECT created_at FROM {} WHERE id > ? ORDER BY id ASC LIMIT 1",
            LIVE_TABLE
        );
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .bind(after)
            .fetch_optional(conn)
            .await?;
        Ok(row.map(|(ts,)| ts))
    }

    // ---- archive movement -------------------------------------------------

    pub async fn create_archive_table(pool: &SqlitePool, table: &str) -> AuditResult<()> {
        sqlx::raw_sql(&archive_table_ddl(table)).execute(pool).await?;
        Ok(())
    }

    /// Copy `[first, last]` from the live table verbatim.
    pub async fn copy_live_range(
        conn: &mut SqliteConnection,
        archive_table: &str,
        first: i64,
        last: i64,
    ) -> AuditResult<u64> {
        let sql = format!(
            "INSERT INTO {archive} ({cols}) SELECT {cols} FROM {live} WHERE id >= ? AND id <= ? \
             ORDER BY id ASC",
            archive = archive_table,
            cols = ENTRY_COLUMNS,
            live = LIVE_TABLE
        );
        let result = sqlx::query(&sql).bind(first).bind(last).execute(conn).await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_range(
        conn: &mut SqliteConnection,
        table: &str,
        first: i64,
        last: i64,
    ) -> AuditResult<u64> {
        let sql = format!("DELETE FROM {} WHERE id >= ? AND id <= ?", table);
        let result = sqlx::query(&sql).bind(first).bind(last).execute(conn).await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_archive_rows_after(
        pool: &SqlitePool,
        table: &str,
        after: i64,
    ) -> AuditResult<u64> {
        let sql = format!("DELETE FROM {} WHERE id > ?", table);
        let result = sqlx::query(&sql).bind(after).execute(pool).await?;
        Ok(result.rows_affected())
    }

    // ---- partition metadata -----------------------------------------------

    pub async fn load_partitions(conn: &mut SqliteConnection) -> AuditResult<Vec<PartitionMetadata>> {
        let sql = format!(
            "SELECT {} FROM audit_partitions ORDER BY partition_key ASC",
            PARTITION_COLUMNS
        );
        let rows = sqlx::query_as::<_, PartitionRow>(&sql).fetch_all(conn).await?;
        rows.into_iter().map(PartitionMetadata::try_from).collect()
    }

    pub async fn partition_generation(conn: &mut SqliteConnection) -> AuditResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT generation FROM audit_partition_generation WHERE singleton = 1",
        )
        .fetch_optional(conn)
        .await?;
        Ok(row.map(|(generation,)| generation).unwrap_or(0))
    }

    /// Must run in the transaction that changes `audit_partitions`.
    pub async fn bump_partition_generation(conn: &mut SqliteConnection) -> AuditResult<()> {
        sqlx::query(
            "INSERT INTO audit_partition_generation (singleton, generation) VALUES (1, 1) \
             ON CONFLICT (singleton) DO UPDATE SET generation = generation + 1",
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn insert_partition(
        conn: &mut SqliteConnection,
        meta: &PartitionMetadata,
    ) -> AuditResult<bool> {
        let result = sqlx::query(
            "INSERT INTO audit_partitions (partition_key, first_id, last_id, row_count, \
             boundary_digest, storage_location, created_at, sealed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (partition_key) DO NOTHING",
        )
        .bind(meta.partition_key as i64)
        .bind(meta.first_id)
        .bind(meta.last_id)
        .bind(meta.row_count as i64)
        .bind(&meta.boundary_digest)
        .bind(&meta.storage_location)
        .bind(format_timestamp(&meta.created_at))
        .bind(meta.sealed_at.as_ref().map(format_timestamp))
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a committed move into an open partition. Fails (returns false)
    /// if the partition was sealed or its tail moved concurrently.
    pub async fn extend_partition(
        conn: &mut SqliteConnection,
        previous: &PartitionMetadata,
        updated: &PartitionMetadata,
    ) -> AuditResult<bool> {
        let result = sqlx::query(
            "UPDATE audit_partitions SET first_id = ?, last_id = ?, row_count = ?, \
             boundary_digest = ?, sealed_at = ? \
             WHERE partition_key = ? AND sealed_at IS NULL AND last_id IS ?",
        )
        .bind(updated.first_id)
        .bind(updated.last_id)
        .bind(updated.row_count as i64)
        .bind(&updated.boundary_digest)
        .bind(updated.sealed_at.as_ref().map(format_timestamp))
        .bind(updated.partition_key as i64)
        .bind(previous.last_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Seal every open partition older than `year`.
    pub async fn seal_partitions_before(
        conn: &mut SqliteConnection,
        year: i32,
        sealed_at: &DateTime<Utc>,
    ) -> AuditResult<u64> {
        let result = sqlx::query(
            "UPDATE audit_partitions SET sealed_at = ? WHERE partition_key < ? AND sealed_at IS NULL",
        )
        .bind(format_timestamp(sealed_at))
        .bind(year as i64)
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &EntryFilter) {
    if let Some(start) = &filter.start_date {
        qb.push(" AND created_at >= ").push_bind(format_timestamp(start));
    }
    if let Some(end) = &filter.end_date {
        qb.push(" AND created_at <= ").push_bind(format_timestamp(end));
    }
    if let Some(flag) = filter.is_sensitive {
        qb.push(" AND is_sensitive = ").push_bind(flag);
    }
    if let Some(entity_type) = &filter.entity_type {
        qb.push(" AND entity_type = ").push_bind(entity_type.clone());
    }
    if let Some(entity_id) = &filter.entity_id {
        qb.push(" AND entity_id = ").push_bind(entity_id.clone());
    }
    if let Some(actor_id) = &filter.actor_id {
        qb.push(" AND actor_id = ").push_bind(actor_id.clone());
    }
    if let Some(action) = &filter.action {
        qb.push(" AND action = ").push_bind(action.clone());
    }
    if let Some(keyword) = &filter.keyword {
        let pattern = format!("%{}%", keyword);
        qb.push(" AND (summary LIKE ")
            .push_bind(pattern.clone())
            .push(" OR action LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing;

use super::DatabaseError;

/// How long a writer waits on SQLite's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a SQLite connection to the given path and run migrations
pub fn open_database(path: &Path) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(path)?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_memory_database() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<(), DatabaseError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // journal_mode returns a row, so it cannot go through execute_batch
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_current_version(conn);

    let migrations: Vec<(i64, &str)> = vec![
        (1, include_str!("../../resources/migrations/001_initial.sql")),
    ];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!("Running migration v{version}");
            conn.execute_batch(sql).map_err(|e| DatabaseError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

/// Get the current schema version (0 if no schema exists yet)
fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get::<_, i64>(0),
    )
    .unwrap_or(0)
}

/// Begin a write transaction that takes SQLite's writer lock up front.
///
/// Everything read inside it is guaranteed current until commit, which is
/// what makes check-then-write sequences atomic across connections.
pub fn begin_immediate(conn: &mut Connection) -> Result<Transaction<'_>, DatabaseError> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// Count tables in the database (for verification)
pub fn count_tables(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}

// ─── Value encoding ───────────────────────────────────────────────────────────

/// Audit-style timestamp column format.
pub fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn decode_ts(field: &str, raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::InvalidValue {
            field: field.into(),
            value: raw.into(),
        })
}

pub fn decode_opt_ts(
    field: &str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    raw.map(|r| decode_ts(field, &r)).transpose()
}

/// Slot bounds are stored as epoch milliseconds so overlap tests are integer compares.
pub fn encode_instant(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn decode_instant(field: &str, millis: i64) -> Result<DateTime<Utc>, DatabaseError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| DatabaseError::InvalidValue {
            field: field.into(),
            value: millis.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_initializes_all_tables() {
        let conn = open_memory_database().unwrap();
        // schema_version + 4 directory + appointments + events + payments
        // + wallets + wallet_transactions + notifications + audit_log
        let count = count_tables(&conn).unwrap();
        assert!(count >= 12, "Expected at least 12 tables, got {count}");
    }

    #[test]
    fn schema_version_is_current() {
        let conn = open_memory_database().unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn migration_idempotent() {
        let conn = open_memory_database().unwrap();
        let result = run_migrations(&conn);
        assert!(result.is_ok());
    }

    #[test]
    fn foreign_keys_enabled() {
        let conn = open_memory_database().unwrap();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn file_database_reopens_without_rerunning_migrations() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("carebook.db");
        drop(open_database(&path).unwrap());
        let conn = open_database(&path).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn timestamps_round_trip_through_encoding() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 10, 10, 0, 0).unwrap();
        assert_eq!(decode_ts("t", &encode_ts(&ts)).unwrap(), ts);
        assert_eq!(decode_instant("t", encode_instant(&ts)).unwrap(), ts);
    }

    #[test]
    fn malformed_timestamp_is_reported() {
        let err = decode_ts("confirmed_at", "yesterday").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidValue { .. }));
    }
}

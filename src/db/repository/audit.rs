use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};

use crate::db::sqlite::encode_ts;
use crate::db::DatabaseError;

/// One buffered audit row: (timestamp, source, action, entity).
pub type AuditRow = (String, String, String, String);

/// Insert a batch of audit entries into the audit_log table.
pub fn insert_audit_entries(conn: &Connection, entries: &[AuditRow]) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "INSERT INTO audit_log (timestamp, source, action, entity) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (timestamp, source, action, entity) in entries {
        stmt.execute(params![timestamp, source, action, entity])?;
    }
    Ok(())
}

/// Prune audit entries older than `retention_days` before `now`.
///
/// The cutoff is computed here rather than with SQLite's `datetime('now')`
/// because stored timestamps are RFC 3339 and must compare as text.
pub fn prune_audit_log(
    conn: &Connection,
    now: &DateTime<Utc>,
    retention_days: i64,
) -> Result<usize, DatabaseError> {
    let cutoff = *now - Duration::days(retention_days);
    let deleted = conn.execute(
        "DELETE FROM audit_log WHERE timestamp < ?1",
        params![encode_ts(&cutoff)],
    )?;
    Ok(deleted)
}

/// Most recent audit entries touching `entity`, newest first.
pub fn query_audit_by_entity(
    conn: &Connection,
    entity: &str,
    limit: u32,
) -> Result<Vec<AuditRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT timestamp, source, action, entity FROM audit_log
         WHERE entity = ?1 ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![entity, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

use std::str::FromStr;

use rusqlite::{params, Connection};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::sqlite::{decode_ts, encode_ts};
use crate::db::DatabaseError;
use crate::models::enums::NotificationKind;
use crate::models::Notification;

pub fn insert_notification(conn: &Connection, n: &Notification) -> Result<(), DatabaseError> {
    let data = n
        .data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;
    conn.execute(
        "INSERT INTO notifications (id, user_id, kind, title, body, data, is_read, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            n.id.to_string(),
            n.user_id,
            n.kind.as_str(),
            n.title,
            n.body,
            data,
            n.is_read,
            encode_ts(&n.created_at),
        ],
    )?;
    Ok(())
}

/// Notifications for a user, newest first.
pub fn list_notifications(
    conn: &Connection,
    user_id: &str,
    unread_only: bool,
) -> Result<Vec<Notification>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, kind, title, body, data, is_read, created_at FROM notifications
         WHERE user_id = ?1 AND (?2 = 0 OR is_read = 0)
         ORDER BY created_at DESC",
    )?;
    let rows = stmt
        .query_map(params![user_id, unread_only], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, bool>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, user_id, kind, title, body, data, is_read, created_at)| {
            Ok(Notification {
                id: parse_uuid("notifications.id", &id)?,
                user_id,
                kind: NotificationKind::from_str(&kind)?,
                title,
                body,
                data: data.and_then(|d| serde_json::from_str(&d).ok()),
                is_read,
                created_at: decode_ts("notifications.created_at", &created_at)?,
            })
        })
        .collect()
}

pub fn mark_notification_read(conn: &Connection, id: &Uuid) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE id = ?1",
        params![id.to_string()],
    )?;
    if changed == 0 {
        return Err(DatabaseError::not_found("Notification", id));
    }
    Ok(())
}

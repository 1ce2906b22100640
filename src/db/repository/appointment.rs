use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_opt_uuid, parse_uuid};
use crate::db::sqlite::{decode_instant, decode_opt_ts, decode_ts, encode_instant, encode_ts};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const APPOINTMENT_COLUMNS: &str = "id, appointment_ref, patient_id, practitioner_id, hospital_id,
    department_id, previous_appointment_id, date, slot_start, slot_end, status, payment_status,
    payment_amount, wallet_credit_used, transaction_id, appointment_type, chief_complaint,
    estimated_duration_minutes, is_urgent, vitals, checkup_notes, diagnosis, prescriptions,
    confirmed_at, checked_in_at, completed_at, cancelled_at, cancelled_by, cancellation_reason,
    version, created_at, updated_at";

/// Raw column values; decoded into `Appointment` outside the rusqlite closure
/// so decode failures surface as `DatabaseError` instead of defaults.
struct AppointmentRow {
    id: String,
    appointment_ref: String,
    patient_id: String,
    practitioner_id: String,
    hospital_id: String,
    department_id: Option<String>,
    previous_appointment_id: Option<String>,
    date: String,
    slot_start: i64,
    slot_end: i64,
    status: String,
    payment_status: String,
    payment_amount: i64,
    wallet_credit_used: i64,
    transaction_id: Option<String>,
    appointment_type: Option<String>,
    chief_complaint: Option<String>,
    estimated_duration_minutes: Option<u32>,
    is_urgent: bool,
    vitals: Option<String>,
    checkup_notes: Option<String>,
    diagnosis: Option<String>,
    prescriptions: Option<String>,
    confirmed_at: Option<String>,
    checked_in_at: Option<String>,
    completed_at: Option<String>,
    cancelled_at: Option<String>,
    cancelled_by: Option<String>,
    cancellation_reason: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl AppointmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            appointment_ref: row.get(1)?,
            patient_id: row.get(2)?,
            practitioner_id: row.get(3)?,
            hospital_id: row.get(4)?,
            department_id: row.get(5)?,
            previous_appointment_id: row.get(6)?,
            date: row.get(7)?,
            slot_start: row.get(8)?,
            slot_end: row.get(9)?,
            status: row.get(10)?,
            payment_status: row.get(11)?,
            payment_amount: row.get(12)?,
            wallet_credit_used: row.get(13)?,
            transaction_id: row.get(14)?,
            appointment_type: row.get(15)?,
            chief_complaint: row.get(16)?,
            estimated_duration_minutes: row.get(17)?,
            is_urgent: row.get(18)?,
            vitals: row.get(19)?,
            checkup_notes: row.get(20)?,
            diagnosis: row.get(21)?,
            prescriptions: row.get(22)?,
            confirmed_at: row.get(23)?,
            checked_in_at: row.get(24)?,
            completed_at: row.get(25)?,
            cancelled_at: row.get(26)?,
            cancelled_by: row.get(27)?,
            cancellation_reason: row.get(28)?,
            version: row.get(29)?,
            created_at: row.get(30)?,
            updated_at: row.get(31)?,
        })
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(
    field: &str,
    raw: Option<String>,
) -> Result<Option<T>, DatabaseError> {
    raw.map(|r| {
        serde_json::from_str(&r).map_err(|_| DatabaseError::InvalidValue {
            field: field.into(),
            value: r,
        })
    })
    .transpose()
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

impl TryFrom<AppointmentRow> for Appointment {
    type Error = DatabaseError;

    fn try_from(r: AppointmentRow) -> Result<Self, Self::Error> {
        let start = decode_instant("appointments.slot_start", r.slot_start)?;
        let end = decode_instant("appointments.slot_end", r.slot_end)?;
        let time_slot = TimeSlot::new(start, end).ok_or_else(|| DatabaseError::InvalidValue {
            field: "appointments.slot".into(),
            value: format!("{}..{}", r.slot_start, r.slot_end),
        })?;

        Ok(Appointment {
            id: parse_uuid("appointments.id", &r.id)?,
            appointment_ref: r.appointment_ref,
            patient_id: parse_uuid("appointments.patient_id", &r.patient_id)?,
            practitioner_id: parse_uuid("appointments.practitioner_id", &r.practitioner_id)?,
            hospital_id: parse_uuid("appointments.hospital_id", &r.hospital_id)?,
            department_id: parse_opt_uuid("appointments.department_id", r.department_id)?,
            previous_appointment_id: parse_opt_uuid(
                "appointments.previous_appointment_id",
                r.previous_appointment_id,
            )?,
            date: NaiveDate::parse_from_str(&r.date, "%Y-%m-%d").map_err(|_| {
                DatabaseError::InvalidValue {
                    field: "appointments.date".into(),
                    value: r.date.clone(),
                }
            })?,
            time_slot,
            status: AppointmentStatus::from_str(&r.status)?,
            payment_status: AppointmentPaymentStatus::from_str(&r.payment_status)?,
            payment_amount: r.payment_amount,
            wallet_credit_used: r.wallet_credit_used,
            transaction_id: r.transaction_id,
            appointment_type: r
                .appointment_type
                .as_deref()
                .map(AppointmentType::from_str)
                .transpose()?,
            chief_complaint: r.chief_complaint,
            estimated_duration_minutes: r.estimated_duration_minutes,
            is_urgent: r.is_urgent,
            vitals: decode_json("appointments.vitals", r.vitals)?,
            checkup_notes: r.checkup_notes,
            diagnosis: r.diagnosis,
            prescriptions: decode_json("appointments.prescriptions", r.prescriptions)?
                .unwrap_or_default(),
            confirmed_at: decode_opt_ts("appointments.confirmed_at", r.confirmed_at)?,
            checked_in_at: decode_opt_ts("appointments.checked_in_at", r.checked_in_at)?,
            completed_at: decode_opt_ts("appointments.completed_at", r.completed_at)?,
            cancelled_at: decode_opt_ts("appointments.cancelled_at", r.cancelled_at)?,
            cancelled_by: r.cancelled_by,
            cancellation_reason: r.cancellation_reason,
            version: r.version,
            created_at: decode_ts("appointments.created_at", &r.created_at)?,
            updated_at: decode_ts("appointments.updated_at", &r.updated_at)?,
        })
    }
}

fn collect_appointments(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Appointment>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, AppointmentRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(Appointment::try_from).collect()
}

pub fn insert_appointment(conn: &Connection, appt: &Appointment) -> Result<(), DatabaseError> {
    let prescriptions = if appt.prescriptions.is_empty() {
        None
    } else {
        Some(encode_json(&appt.prescriptions)?)
    };
    let vitals = appt.vitals.as_ref().map(encode_json).transpose()?;

    conn.execute(
        &format!(
            "INSERT INTO appointments ({APPOINTMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30,
                     ?31, ?32)"
        ),
        params![
            appt.id.to_string(),
            appt.appointment_ref,
            appt.patient_id.to_string(),
            appt.practitioner_id.to_string(),
            appt.hospital_id.to_string(),
            appt.department_id.map(|d| d.to_string()),
            appt.previous_appointment_id.map(|d| d.to_string()),
            appt.date.format("%Y-%m-%d").to_string(),
            encode_instant(&appt.time_slot.start),
            encode_instant(&appt.time_slot.end),
            appt.status.as_str(),
            appt.payment_status.as_str(),
            appt.payment_amount,
            appt.wallet_credit_used,
            appt.transaction_id,
            appt.appointment_type.map(|t| t.as_str()),
            appt.chief_complaint,
            appt.estimated_duration_minutes,
            appt.is_urgent,
            vitals,
            appt.checkup_notes,
            appt.diagnosis,
            prescriptions,
            appt.confirmed_at.as_ref().map(encode_ts),
            appt.checked_in_at.as_ref().map(encode_ts),
            appt.completed_at.as_ref().map(encode_ts),
            appt.cancelled_at.as_ref().map(encode_ts),
            appt.cancelled_by,
            appt.cancellation_reason,
            appt.version,
            encode_ts(&appt.created_at),
            encode_ts(&appt.updated_at),
        ],
    )?;
    Ok(())
}

/// Write every mutable field, but only if nobody else wrote since `expected_version`.
///
/// Returns `false` when the revision check failed (row untouched). On success the
/// stored version becomes `expected_version + 1`.
pub fn update_appointment(
    conn: &Connection,
    appt: &Appointment,
    expected_version: i64,
) -> Result<bool, DatabaseError> {
    let prescriptions = if appt.prescriptions.is_empty() {
        None
    } else {
        Some(encode_json(&appt.prescriptions)?)
    };
    let vitals = appt.vitals.as_ref().map(encode_json).transpose()?;

    let changed = conn.execute(
        "UPDATE appointments SET
             date = ?1, slot_start = ?2, slot_end = ?3, status = ?4, payment_status = ?5,
             wallet_credit_used = ?6, transaction_id = ?7, vitals = ?8, checkup_notes = ?9,
             diagnosis = ?10, prescriptions = ?11, confirmed_at = ?12, checked_in_at = ?13,
             completed_at = ?14, cancelled_at = ?15, cancelled_by = ?16,
             cancellation_reason = ?17, updated_at = ?18, version = version + 1
         WHERE id = ?19 AND version = ?20",
        params![
            appt.date.format("%Y-%m-%d").to_string(),
            encode_instant(&appt.time_slot.start),
            encode_instant(&appt.time_slot.end),
            appt.status.as_str(),
            appt.payment_status.as_str(),
            appt.wallet_credit_used,
            appt.transaction_id,
            vitals,
            appt.checkup_notes,
            appt.diagnosis,
            prescriptions,
            appt.confirmed_at.as_ref().map(encode_ts),
            appt.checked_in_at.as_ref().map(encode_ts),
            appt.completed_at.as_ref().map(encode_ts),
            appt.cancelled_at.as_ref().map(encode_ts),
            appt.cancelled_by,
            appt.cancellation_reason,
            encode_ts(&appt.updated_at),
            appt.id.to_string(),
            expected_version,
        ],
    )?;
    Ok(changed == 1)
}

pub fn get_appointment(conn: &Connection, id: &Uuid) -> Result<Option<Appointment>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?1"),
            params![id.to_string()],
            AppointmentRow::from_row,
        )
        .optional()?;
    row.map(Appointment::try_from).transpose()
}

pub fn get_appointment_by_ref(
    conn: &Connection,
    appointment_ref: &str,
) -> Result<Option<Appointment>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE appointment_ref = ?1"),
            params![appointment_ref],
            AppointmentRow::from_row,
        )
        .optional()?;
    row.map(Appointment::try_from).transpose()
}

pub fn appointment_ref_exists(conn: &Connection, appointment_ref: &str) -> Result<bool, DatabaseError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM appointments WHERE appointment_ref = ?1)",
        params![appointment_ref],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// List appointments matching the filter, most recent date first.
pub fn list_appointments(
    conn: &Connection,
    filter: &AppointmentFilter,
) -> Result<Vec<Appointment>, DatabaseError> {
    let mut sql = format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE 1=1");
    let mut values: Vec<String> = Vec::new();

    if let Some(id) = filter.patient_id {
        values.push(id.to_string());
        sql.push_str(&format!(" AND patient_id = ?{}", values.len()));
    }
    if let Some(id) = filter.practitioner_id {
        values.push(id.to_string());
        sql.push_str(&format!(" AND practitioner_id = ?{}", values.len()));
    }
    if let Some(id) = filter.hospital_id {
        values.push(id.to_string());
        sql.push_str(&format!(" AND hospital_id = ?{}", values.len()));
    }
    if let Some(status) = filter.status {
        values.push(status.as_str().to_string());
        sql.push_str(&format!(" AND status = ?{}", values.len()));
    }
    if let Some(date) = filter.date {
        values.push(date.format("%Y-%m-%d").to_string());
        sql.push_str(&format!(" AND date = ?{}", values.len()));
    }
    sql.push_str(" ORDER BY date DESC, slot_start DESC");

    let params: Vec<&dyn rusqlite::ToSql> =
        values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    collect_appointments(conn, &sql, &params)
}

/// A practitioner's appointments on one calendar date, in slot order.
pub fn practitioner_schedule(
    conn: &Connection,
    practitioner_id: &Uuid,
    date: NaiveDate,
) -> Result<Vec<Appointment>, DatabaseError> {
    collect_appointments(
        conn,
        &format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments
             WHERE practitioner_id = ?1 AND date = ?2
             ORDER BY slot_start ASC"
        ),
        params![practitioner_id.to_string(), date.format("%Y-%m-%d").to_string()],
    )
}

/// Pending or confirmed appointments starting at or after `now`, soonest first.
pub fn upcoming_appointments(
    conn: &Connection,
    patient_id: Option<&Uuid>,
    practitioner_id: Option<&Uuid>,
    now: &DateTime<Utc>,
) -> Result<Vec<Appointment>, DatabaseError> {
    collect_appointments(
        conn,
        &format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments
             WHERE status IN ('pending', 'confirmed') AND slot_start >= ?1
               AND (?2 IS NULL OR patient_id = ?2)
               AND (?3 IS NULL OR practitioner_id = ?3)
             ORDER BY slot_start ASC"
        ),
        params![
            encode_instant(now),
            patient_id.map(|id| id.to_string()),
            practitioner_id.map(|id| id.to_string()),
        ],
    )
}

/// Minimal view of an appointment holding (or having held) part of a practitioner's time.
#[derive(Debug, Clone)]
pub struct SlotOccupant {
    pub id: Uuid,
    pub appointment_ref: String,
    pub status: AppointmentStatus,
    pub time_slot: TimeSlot,
}

/// Every appointment of the practitioner whose interval overlaps `slot`,
/// regardless of status. Callers decide which statuses hold the slot.
pub fn find_overlapping(
    conn: &Connection,
    practitioner_id: &Uuid,
    slot: &TimeSlot,
    exclude_id: Option<&Uuid>,
) -> Result<Vec<SlotOccupant>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, appointment_ref, status, slot_start, slot_end FROM appointments
         WHERE practitioner_id = ?1 AND slot_start < ?2 AND slot_end > ?3
           AND (?4 IS NULL OR id <> ?4)",
    )?;
    let rows = stmt
        .query_map(
            params![
                practitioner_id.to_string(),
                encode_instant(&slot.end),
                encode_instant(&slot.start),
                exclude_id.map(|id| id.to_string()),
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, appointment_ref, status, start, end)| {
            let start = decode_instant("appointments.slot_start", start)?;
            let end = decode_instant("appointments.slot_end", end)?;
            Ok(SlotOccupant {
                id: parse_uuid("appointments.id", &id)?,
                appointment_ref,
                status: AppointmentStatus::from_str(&status)?,
                time_slot: TimeSlot::new(start, end).ok_or_else(|| DatabaseError::InvalidValue {
                    field: "appointments.slot".into(),
                    value: id.clone(),
                })?,
            })
        })
        .collect()
}

pub fn insert_appointment_event(
    conn: &Connection,
    appointment_id: &Uuid,
    event: &AppointmentEvent,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO appointment_events (appointment_id, from_status, to_status, operation, actor, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            appointment_id.to_string(),
            event.from_status.map(|s| s.as_str()),
            event.to_status.as_str(),
            event.operation,
            event.actor,
            encode_ts(&event.at),
        ],
    )?;
    Ok(())
}

/// Status history, oldest first.
pub fn list_appointment_events(
    conn: &Connection,
    appointment_id: &Uuid,
) -> Result<Vec<AppointmentEvent>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT from_status, to_status, operation, actor, at FROM appointment_events
         WHERE appointment_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![appointment_id.to_string()], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(from, to, operation, actor, at)| {
            Ok(AppointmentEvent {
                from_status: from.as_deref().map(AppointmentStatus::from_str).transpose()?,
                to_status: AppointmentStatus::from_str(&to)?,
                operation,
                actor,
                at: decode_ts("appointment_events.at", &at)?,
            })
        })
        .collect()
}

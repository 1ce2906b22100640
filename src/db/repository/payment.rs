use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_uuid, page_clause};
use crate::db::sqlite::{decode_opt_ts, decode_ts, encode_ts};
use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

const PAYMENT_COLUMNS: &str = "id, appointment_id, patient_id, amount, method,
    wallet_amount_used, gateway_amount_paid, status, saga_state, transaction_id,
    provider_transaction_id, checkout_reference, failure_reason, completed_at,
    refund_amount, wallet_refund_amount, gateway_refund_amount, gateway_refund_status,
    gateway_refund_reference, gateway_refund_error, refund_reason, refunded_at, refunded_by,
    created_at, updated_at";

struct PaymentRow {
    id: String,
    appointment_id: String,
    patient_id: String,
    amount: i64,
    method: String,
    wallet_amount_used: i64,
    gateway_amount_paid: i64,
    status: String,
    saga_state: String,
    transaction_id: String,
    provider_transaction_id: Option<String>,
    checkout_reference: Option<String>,
    failure_reason: Option<String>,
    completed_at: Option<String>,
    refund_amount: Option<i64>,
    wallet_refund_amount: Option<i64>,
    gateway_refund_amount: Option<i64>,
    gateway_refund_status: Option<String>,
    gateway_refund_reference: Option<String>,
    gateway_refund_error: Option<String>,
    refund_reason: Option<String>,
    refunded_at: Option<String>,
    refunded_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl PaymentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            appointment_id: row.get(1)?,
            patient_id: row.get(2)?,
            amount: row.get(3)?,
            method: row.get(4)?,
            wallet_amount_used: row.get(5)?,
            gateway_amount_paid: row.get(6)?,
            status: row.get(7)?,
            saga_state: row.get(8)?,
            transaction_id: row.get(9)?,
            provider_transaction_id: row.get(10)?,
            checkout_reference: row.get(11)?,
            failure_reason: row.get(12)?,
            completed_at: row.get(13)?,
            refund_amount: row.get(14)?,
            wallet_refund_amount: row.get(15)?,
            gateway_refund_amount: row.get(16)?,
            gateway_refund_status: row.get(17)?,
            gateway_refund_reference: row.get(18)?,
            gateway_refund_error: row.get(19)?,
            refund_reason: row.get(20)?,
            refunded_at: row.get(21)?,
            refunded_by: row.get(22)?,
            created_at: row.get(23)?,
            updated_at: row.get(24)?,
        })
    }
}

impl TryFrom<PaymentRow> for Payment {
    type Error = DatabaseError;

    fn try_from(r: PaymentRow) -> Result<Self, Self::Error> {
        let refund = match r.refund_amount {
            None => None,
            Some(refund_amount) => Some(RefundRecord {
                refund_amount,
                wallet_refund_amount: r.wallet_refund_amount.unwrap_or(0),
                gateway_refund_amount: r.gateway_refund_amount.unwrap_or(0),
                gateway_refund_status: GatewayRefundStatus::from_str(
                    r.gateway_refund_status.as_deref().unwrap_or("pending"),
                )?,
                gateway_refund_reference: r.gateway_refund_reference,
                gateway_refund_error: r.gateway_refund_error,
                refund_reason: r.refund_reason.unwrap_or_default(),
                refunded_at: decode_ts(
                    "payments.refunded_at",
                    r.refunded_at.as_deref().unwrap_or_default(),
                )?,
                refunded_by: r.refunded_by.unwrap_or_default(),
            }),
        };

        Ok(Payment {
            id: parse_uuid("payments.id", &r.id)?,
            appointment_id: parse_uuid("payments.appointment_id", &r.appointment_id)?,
            patient_id: parse_uuid("payments.patient_id", &r.patient_id)?,
            amount: r.amount,
            method: PaymentMethod::from_str(&r.method)?,
            wallet_amount_used: r.wallet_amount_used,
            gateway_amount_paid: r.gateway_amount_paid,
            status: PaymentStatus::from_str(&r.status)?,
            saga_state: SagaState::from_str(&r.saga_state)?,
            transaction_id: r.transaction_id,
            provider_transaction_id: r.provider_transaction_id,
            checkout_reference: r.checkout_reference,
            failure_reason: r.failure_reason,
            completed_at: decode_opt_ts("payments.completed_at", r.completed_at)?,
            refund,
            created_at: decode_ts("payments.created_at", &r.created_at)?,
            updated_at: decode_ts("payments.updated_at", &r.updated_at)?,
        })
    }
}

fn collect_payments(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Payment>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, PaymentRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(Payment::try_from).collect()
}

fn query_one(
    conn: &Connection,
    where_clause: &str,
    value: &str,
) -> Result<Option<Payment>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE {where_clause}"),
            params![value],
            PaymentRow::from_row,
        )
        .optional()?;
    row.map(Payment::try_from).transpose()
}

/// Insert a fresh payment. Fails with a constraint violation when the
/// appointment already has an active (non-failed) payment.
pub fn insert_payment(conn: &Connection, payment: &Payment) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO payments (id, appointment_id, patient_id, amount, method, wallet_amount_used,
             gateway_amount_paid, status, saga_state, transaction_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            payment.id.to_string(),
            payment.appointment_id.to_string(),
            payment.patient_id.to_string(),
            payment.amount,
            payment.method.as_str(),
            payment.wallet_amount_used,
            payment.gateway_amount_paid,
            payment.status.as_str(),
            payment.saga_state.as_str(),
            payment.transaction_id,
            encode_ts(&payment.created_at),
            encode_ts(&payment.updated_at),
        ],
    )?;
    Ok(())
}

/// Persist every mutable field of the payment.
pub fn update_payment(conn: &Connection, payment: &Payment) -> Result<(), DatabaseError> {
    let refund = payment.refund.as_ref();
    let changed = conn.execute(
        "UPDATE payments SET
             status = ?1, saga_state = ?2, provider_transaction_id = ?3, checkout_reference = ?4,
             failure_reason = ?5, completed_at = ?6, refund_amount = ?7,
             wallet_refund_amount = ?8, gateway_refund_amount = ?9, gateway_refund_status = ?10,
             gateway_refund_reference = ?11, gateway_refund_error = ?12, refund_reason = ?13,
             refunded_at = ?14, refunded_by = ?15, updated_at = ?16
         WHERE id = ?17",
        params![
            payment.status.as_str(),
            payment.saga_state.as_str(),
            payment.provider_transaction_id,
            payment.checkout_reference,
            payment.failure_reason,
            payment.completed_at.as_ref().map(encode_ts),
            refund.map(|r| r.refund_amount),
            refund.map(|r| r.wallet_refund_amount),
            refund.map(|r| r.gateway_refund_amount),
            refund.map(|r| r.gateway_refund_status.as_str()),
            refund.and_then(|r| r.gateway_refund_reference.clone()),
            refund.and_then(|r| r.gateway_refund_error.clone()),
            refund.map(|r| r.refund_reason.clone()),
            refund.map(|r| encode_ts(&r.refunded_at)),
            refund.map(|r| r.refunded_by.clone()),
            encode_ts(&payment.updated_at),
            payment.id.to_string(),
        ],
    )?;
    if changed == 0 {
        return Err(DatabaseError::not_found("Payment", payment.id));
    }
    Ok(())
}

pub fn get_payment(conn: &Connection, id: &Uuid) -> Result<Option<Payment>, DatabaseError> {
    query_one(conn, "id = ?1", &id.to_string())
}

pub fn get_payment_by_transaction_id(
    conn: &Connection,
    transaction_id: &str,
) -> Result<Option<Payment>, DatabaseError> {
    query_one(conn, "transaction_id = ?1", transaction_id)
}

/// The appointment's active payment, if any. At most one exists.
pub fn get_active_payment_for_appointment(
    conn: &Connection,
    appointment_id: &Uuid,
) -> Result<Option<Payment>, DatabaseError> {
    query_one(
        conn,
        "appointment_id = ?1 AND status <> 'failed'",
        &appointment_id.to_string(),
    )
}

/// All payments ever attempted for an appointment, oldest first.
pub fn list_payments_for_appointment(
    conn: &Connection,
    appointment_id: &Uuid,
) -> Result<Vec<Payment>, DatabaseError> {
    collect_payments(
        conn,
        &format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE appointment_id = ?1
             ORDER BY created_at ASC"
        ),
        params![appointment_id.to_string()],
    )
}

/// A patient's payments, newest first, optionally filtered by status.
pub fn list_patient_payments(
    conn: &Connection,
    patient_id: &Uuid,
    filter: &PaymentFilter,
) -> Result<Vec<Payment>, DatabaseError> {
    let (limit, skip) = page_bounds(filter.limit, filter.skip);
    collect_payments(
        conn,
        &format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE patient_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC {}",
            page_clause(limit, skip)
        ),
        params![patient_id.to_string(), filter.status.map(|s| s.as_str())],
    )
}

/// Payments parked in a non-terminal saga step since before `cutoff`.
pub fn list_stale_payments(
    conn: &Connection,
    cutoff: &DateTime<Utc>,
) -> Result<Vec<Payment>, DatabaseError> {
    collect_payments(
        conn,
        &format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE saga_state IN ('pending', 'wallet_reserved', 'gateway_requested', 'compensating')
               AND updated_at < ?1
             ORDER BY updated_at ASC"
        ),
        params![encode_ts(cutoff)],
    )
}

//! Appointment lifecycle: booking, the status state machine, and the
//! payment-status bookkeeping that follows settlement results.
//!
//! ```text
//! pending ─confirm─▶ confirmed ─check_in─▶ checked_in ─record_vitals─▶ in_progress
//!    ▲                   │                     │                          │
//!    │                   └─mark_no_show─▶ no_show                         │
//!    │                                         └────────complete──────────┴─▶ completed
//!    └── reschedule (via rescheduled) ◀── any non-terminal ──cancel──▶ cancelled
//! ```
//!
//! Every write is guarded by the row's `version`; a stale read surfaces as
//! `ConcurrentModification` and leaves the stored record untouched.

use chrono::{NaiveDate, Utc};
use rand::Rng;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::repository;
use crate::db::sqlite::begin_immediate;
use crate::db::DatabaseError;
use crate::models::enums::{AppointmentPaymentStatus, AppointmentStatus};
use crate::models::*;
use crate::scheduling;

/// Attempts at drawing an unused external id before giving up.
const REF_ATTEMPTS: usize = 5;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum AppointmentError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Appointment not found: {0}")]
    NotFound(String),

    #[error("Time slot is already booked (conflicts with {conflicting_ref})")]
    SlotConflict { conflicting_ref: String },

    #[error("Cannot {operation} an appointment in status {current}")]
    InvalidTransition {
        current: AppointmentStatus,
        operation: Operation,
    },

    #[error("Cannot {operation} while payment status is {current}")]
    InvalidPaymentState {
        current: AppointmentPaymentStatus,
        operation: Operation,
    },

    #[error("Appointment {0} was modified concurrently; reload and retry")]
    ConcurrentModification(Uuid),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<rusqlite::Error> for AppointmentError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(e))
    }
}

// ─── State machine ────────────────────────────────────────────────────────────

/// Named lifecycle operations. Status changes happen only through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Book,
    Confirm,
    CheckIn,
    RecordVitals,
    Complete,
    Cancel,
    MarkNoShow,
    Reschedule,
    RecordPayment,
    RecordRefund,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::Confirm => "confirm",
            Self::CheckIn => "check_in",
            Self::RecordVitals => "record_vitals",
            Self::Complete => "complete",
            Self::Cancel => "cancel",
            Self::MarkNoShow => "mark_no_show",
            Self::Reschedule => "reschedule",
            Self::RecordPayment => "record_payment",
            Self::RecordRefund => "record_refund",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition table. `None` means the operation is not allowed from `current`.
pub fn next_status(current: AppointmentStatus, op: Operation) -> Option<AppointmentStatus> {
    use AppointmentStatus as S;
    match (op, current) {
        (Operation::Confirm, S::Pending) => Some(S::Confirmed),
        (Operation::CheckIn, S::Confirmed) => Some(S::CheckedIn),
        (Operation::RecordVitals, S::CheckedIn) => Some(S::InProgress),
        (Operation::Complete, S::CheckedIn | S::InProgress) => Some(S::Completed),
        (Operation::MarkNoShow, S::Confirmed) => Some(S::NoShow),
        (Operation::Cancel, s) if !s.is_terminal() => Some(S::Cancelled),
        // A missed visit can be booked again; a finished or cancelled one cannot.
        (Operation::Reschedule, s) if !matches!(s, S::Completed | S::Cancelled) => Some(S::Pending),
        _ => None,
    }
}

fn require_transition(
    appt: &Appointment,
    op: Operation,
) -> Result<AppointmentStatus, AppointmentError> {
    next_status(appt.status, op).ok_or(AppointmentError::InvalidTransition {
        current: appt.status,
        operation: op,
    })
}

// ─── Inputs ───────────────────────────────────────────────────────────────────

/// Clinical payload attached when a consultation is completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionNotes {
    pub diagnosis: Option<String>,
    #[serde(default)]
    pub prescriptions: Vec<Prescription>,
    pub checkup_notes: Option<String>,
}

// ─── Reads ────────────────────────────────────────────────────────────────────

pub fn get(conn: &Connection, id: &Uuid) -> Result<Appointment, AppointmentError> {
    repository::get_appointment(conn, id)?
        .ok_or_else(|| AppointmentError::NotFound(id.to_string()))
}

pub fn get_by_ref(conn: &Connection, appointment_ref: &str) -> Result<Appointment, AppointmentError> {
    repository::get_appointment_by_ref(conn, appointment_ref)?
        .ok_or_else(|| AppointmentError::NotFound(appointment_ref.to_string()))
}

pub fn list(conn: &Connection, filter: &AppointmentFilter) -> Result<Vec<Appointment>, AppointmentError> {
    Ok(repository::list_appointments(conn, filter)?)
}

pub fn schedule(
    conn: &Connection,
    practitioner_id: &Uuid,
    date: NaiveDate,
) -> Result<Vec<Appointment>, AppointmentError> {
    Ok(repository::practitioner_schedule(conn, practitioner_id, date)?)
}

pub fn upcoming(
    conn: &Connection,
    patient_id: Option<&Uuid>,
    practitioner_id: Option<&Uuid>,
) -> Result<Vec<Appointment>, AppointmentError> {
    Ok(repository::upcoming_appointments(
        conn,
        patient_id,
        practitioner_id,
        &Utc::now(),
    )?)
}

pub fn history(conn: &Connection, id: &Uuid) -> Result<Vec<AppointmentEvent>, AppointmentError> {
    get(conn, id)?;
    Ok(repository::list_appointment_events(conn, id)?)
}

// ─── Booking ──────────────────────────────────────────────────────────────────

/// External id: `APT` + epoch millis + 4 random digits.
pub fn generate_ref() -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("APT{}{suffix:04}", Utc::now().timestamp_millis())
}

/// Create a `pending` appointment after checking the practitioner's slot.
///
/// The conflict scan and the insert share one immediate transaction, so
/// concurrent bookings for the same slot serialize and only one succeeds.
pub fn book(
    conn: &mut Connection,
    new: &NewAppointment,
    actor: &str,
) -> Result<Appointment, AppointmentError> {
    if new.payment_amount <= 0 {
        return Err(AppointmentError::Validation(
            "payment amount must be positive".into(),
        ));
    }

    let tx = begin_immediate(conn)?;

    if let Some(previous_id) = new.previous_appointment_id {
        let previous = repository::get_appointment(&tx, &previous_id)?.ok_or_else(|| {
            AppointmentError::Validation(format!("previous appointment {previous_id} does not exist"))
        })?;
        if previous.patient_id != new.patient_id {
            return Err(AppointmentError::Validation(
                "previous appointment belongs to another patient".into(),
            ));
        }
    }

    if let Some(conflicting_ref) =
        scheduling::first_conflict(&tx, &new.practitioner_id, &new.time_slot, None)?
    {
        tracing::info!(
            practitioner_id = %new.practitioner_id,
            conflicting_ref = %conflicting_ref,
            "Booking rejected: slot taken"
        );
        return Err(AppointmentError::SlotConflict { conflicting_ref });
    }

    let mut appointment_ref = generate_ref();
    let mut attempts = 1;
    while repository::appointment_ref_exists(&tx, &appointment_ref)? {
        if attempts >= REF_ATTEMPTS {
            return Err(DatabaseError::ConstraintViolation(
                "could not allocate a unique appointment id".into(),
            )
            .into());
        }
        appointment_ref = generate_ref();
        attempts += 1;
    }

    let now = Utc::now();
    let appt = Appointment {
        id: Uuid::new_v4(),
        appointment_ref,
        patient_id: new.patient_id,
        practitioner_id: new.practitioner_id,
        hospital_id: new.hospital_id,
        department_id: new.department_id,
        previous_appointment_id: new.previous_appointment_id,
        date: new.date,
        time_slot: new.time_slot,
        status: AppointmentStatus::Pending,
        payment_status: AppointmentPaymentStatus::Pending,
        payment_amount: new.payment_amount,
        wallet_credit_used: 0,
        transaction_id: None,
        appointment_type: new.appointment_type,
        chief_complaint: new.chief_complaint.clone(),
        estimated_duration_minutes: new.estimated_duration_minutes,
        is_urgent: new.is_urgent,
        vitals: None,
        checkup_notes: None,
        diagnosis: None,
        prescriptions: Vec::new(),
        confirmed_at: None,
        checked_in_at: None,
        completed_at: None,
        cancelled_at: None,
        cancelled_by: None,
        cancellation_reason: None,
        version: 0,
        created_at: now,
        updated_at: now,
    };
    repository::insert_appointment(&tx, &appt)?;
    repository::insert_appointment_event(
        &tx,
        &appt.id,
        &AppointmentEvent {
            from_status: None,
            to_status: AppointmentStatus::Pending,
            operation: Operation::Book.as_str().into(),
            actor: Some(actor.to_string()),
            at: now,
        },
    )?;
    tx.commit()?;

    tracing::info!(
        appointment_id = %appt.id,
        appointment_ref = %appt.appointment_ref,
        practitioner_id = %appt.practitioner_id,
        "Appointment booked"
    );
    Ok(appt)
}

// ─── Transitions ──────────────────────────────────────────────────────────────

/// Read, validate and write one appointment under its version guard.
///
/// `apply` receives the loaded record with `status` already advanced and may
/// set the operation's side-effect fields or reject the operation.
fn transition<F>(
    conn: &mut Connection,
    id: &Uuid,
    op: Operation,
    actor: &str,
    apply: F,
) -> Result<Appointment, AppointmentError>
where
    F: FnOnce(&mut Appointment) -> Result<(), AppointmentError>,
{
    let current = get(conn, id)?;
    let next = require_transition(&current, op)?;

    let mut updated = current.clone();
    updated.status = next;
    updated.updated_at = Utc::now();
    apply(&mut updated)?;

    let tx = begin_immediate(conn)?;
    if !repository::update_appointment(&tx, &updated, current.version)? {
        return Err(AppointmentError::ConcurrentModification(*id));
    }
    repository::insert_appointment_event(
        &tx,
        id,
        &AppointmentEvent {
            from_status: Some(current.status),
            to_status: next,
            operation: op.as_str().into(),
            actor: Some(actor.to_string()),
            at: updated.updated_at,
        },
    )?;
    tx.commit()?;

    updated.version = current.version + 1;
    tracing::info!(
        appointment_id = %id,
        operation = op.as_str(),
        from = current.status.as_str(),
        to = next.as_str(),
        "Appointment transitioned"
    );
    Ok(updated)
}

fn stamp_vitals(mut vitals: Vitals, actor: &str) -> Vitals {
    vitals.recorded_by.get_or_insert_with(|| actor.to_string());
    vitals.recorded_at.get_or_insert_with(Utc::now);
    vitals
}

/// `pending → confirmed`; requires the appointment to be paid.
pub fn confirm(conn: &mut Connection, id: &Uuid, actor: &str) -> Result<Appointment, AppointmentError> {
    transition(conn, id, Operation::Confirm, actor, |appt| {
        if appt.payment_status != AppointmentPaymentStatus::Paid {
            return Err(AppointmentError::InvalidPaymentState {
                current: appt.payment_status,
                operation: Operation::Confirm,
            });
        }
        appt.confirmed_at = Some(appt.updated_at);
        Ok(())
    })
}

/// `confirmed → checked_in`, optionally capturing vitals at the desk.
pub fn check_in(
    conn: &mut Connection,
    id: &Uuid,
    vitals: Option<Vitals>,
    actor: &str,
) -> Result<Appointment, AppointmentError> {
    transition(conn, id, Operation::CheckIn, actor, |appt| {
        appt.checked_in_at = Some(appt.updated_at);
        if let Some(v) = vitals {
            appt.vitals = Some(stamp_vitals(v, actor));
        }
        Ok(())
    })
}

/// `checked_in → in_progress` with the nurse's vitals.
pub fn record_vitals(
    conn: &mut Connection,
    id: &Uuid,
    vitals: Vitals,
    actor: &str,
) -> Result<Appointment, AppointmentError> {
    transition(conn, id, Operation::RecordVitals, actor, |appt| {
        appt.vitals = Some(stamp_vitals(vitals, actor));
        Ok(())
    })
}

/// `checked_in | in_progress → completed`.
pub fn complete(
    conn: &mut Connection,
    id: &Uuid,
    notes: CompletionNotes,
    actor: &str,
) -> Result<Appointment, AppointmentError> {
    transition(conn, id, Operation::Complete, actor, |appt| {
        appt.completed_at = Some(appt.updated_at);
        appt.diagnosis = notes.diagnosis;
        appt.prescriptions = notes.prescriptions;
        if notes.checkup_notes.is_some() {
            appt.checkup_notes = notes.checkup_notes;
        }
        Ok(())
    })
}

/// Any non-terminal status `→ cancelled`. Refunds are the caller's concern.
pub fn cancel(
    conn: &mut Connection,
    id: &Uuid,
    reason: &str,
    actor: &str,
) -> Result<Appointment, AppointmentError> {
    transition(conn, id, Operation::Cancel, actor, |appt| {
        appt.cancelled_at = Some(appt.updated_at);
        appt.cancelled_by = Some(actor.to_string());
        appt.cancellation_reason = Some(reason.to_string());
        Ok(())
    })
}

/// `confirmed → no_show`.
pub fn mark_no_show(conn: &mut Connection, id: &Uuid, actor: &str) -> Result<Appointment, AppointmentError> {
    transition(conn, id, Operation::MarkNoShow, actor, |_| Ok(()))
}

/// Move a non-terminal appointment to a new slot and back to `pending`.
///
/// The slot check excludes the appointment itself and runs in the same
/// immediate transaction as the write. Two history rows are appended:
/// `X → rescheduled` and `rescheduled → pending`.
pub fn reschedule(
    conn: &mut Connection,
    id: &Uuid,
    date: NaiveDate,
    slot: TimeSlot,
    actor: &str,
) -> Result<Appointment, AppointmentError> {
    let tx = begin_immediate(conn)?;
    let current = repository::get_appointment(&tx, id)?
        .ok_or_else(|| AppointmentError::NotFound(id.to_string()))?;
    let next = require_transition(&current, Operation::Reschedule)?;

    if let Some(conflicting_ref) =
        scheduling::first_conflict(&tx, &current.practitioner_id, &slot, Some(id))?
    {
        return Err(AppointmentError::SlotConflict { conflicting_ref });
    }

    let now = Utc::now();
    let mut updated = current.clone();
    updated.date = date;
    updated.time_slot = slot;
    updated.status = next;
    updated.confirmed_at = None;
    updated.checked_in_at = None;
    updated.updated_at = now;

    if !repository::update_appointment(&tx, &updated, current.version)? {
        return Err(AppointmentError::ConcurrentModification(*id));
    }
    for (from, to) in [
        (current.status, AppointmentStatus::Rescheduled),
        (AppointmentStatus::Rescheduled, next),
    ] {
        repository::insert_appointment_event(
            &tx,
            id,
            &AppointmentEvent {
                from_status: Some(from),
                to_status: to,
                operation: Operation::Reschedule.as_str().into(),
                actor: Some(actor.to_string()),
                at: now,
            },
        )?;
    }
    tx.commit()?;

    updated.version = current.version + 1;
    tracing::info!(appointment_id = %id, from = current.status.as_str(), "Appointment rescheduled");
    Ok(updated)
}

// ─── Payment bookkeeping ──────────────────────────────────────────────────────

/// Mark the appointment paid after settlement completed. Idempotent for the
/// same transaction id.
pub fn record_payment(
    conn: &mut Connection,
    id: &Uuid,
    transaction_id: &str,
    wallet_credit_used: i64,
) -> Result<Appointment, AppointmentError> {
    let current = get(conn, id)?;
    if current.payment_status == AppointmentPaymentStatus::Paid
        && current.transaction_id.as_deref() == Some(transaction_id)
    {
        return Ok(current);
    }
    if current.payment_status != AppointmentPaymentStatus::Pending {
        return Err(AppointmentError::InvalidPaymentState {
            current: current.payment_status,
            operation: Operation::RecordPayment,
        });
    }

    let mut updated = current.clone();
    updated.payment_status = AppointmentPaymentStatus::Paid;
    updated.transaction_id = Some(transaction_id.to_string());
    updated.wallet_credit_used = wallet_credit_used;
    updated.updated_at = Utc::now();
    write_guarded(conn, &mut updated, current.version)?;

    tracing::info!(appointment_id = %id, transaction_id, "Appointment marked paid");
    Ok(updated)
}

/// Reflect a settled refund on the appointment's payment status.
pub fn record_refund(
    conn: &mut Connection,
    id: &Uuid,
    refund_amount: i64,
) -> Result<Appointment, AppointmentError> {
    let current = get(conn, id)?;
    if current.payment_status != AppointmentPaymentStatus::Paid {
        return Err(AppointmentError::InvalidPaymentState {
            current: current.payment_status,
            operation: Operation::RecordRefund,
        });
    }

    let mut updated = current.clone();
    updated.payment_status = if refund_amount >= current.payment_amount {
        AppointmentPaymentStatus::Refunded
    } else {
        AppointmentPaymentStatus::PartiallyRefunded
    };
    updated.updated_at = Utc::now();
    write_guarded(conn, &mut updated, current.version)?;

    tracing::info!(
        appointment_id = %id,
        refund_amount,
        payment_status = updated.payment_status.as_str(),
        "Appointment refund recorded"
    );
    Ok(updated)
}

fn write_guarded(
    conn: &mut Connection,
    updated: &mut Appointment,
    expected_version: i64,
) -> Result<(), AppointmentError> {
    let tx = begin_immediate(conn)?;
    if !repository::update_appointment(&tx, updated, expected_version)? {
        return Err(AppointmentError::ConcurrentModification(updated.id));
    }
    tx.commit()?;
    updated.version = expected_version + 1;
    Ok(())
}

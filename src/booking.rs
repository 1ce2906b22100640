//! Cross-component flows.
//!
//! Appointments, payments and wallets each own their records. This module
//! sequences them: it validates directory references before booking, reacts
//! to settlement results by updating the appointment's payment status, and
//! triggers refunds and notifications after cancellations.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::appointment::{self, AppointmentError};
use crate::db::{repository, DatabaseError};
use crate::gateway::GatewayClient;
use crate::models::enums::{
    AppointmentPaymentStatus, AppointmentStatus, AppointmentType, NotificationKind, PaymentStatus,
};
use crate::models::{Appointment, NewAppointment, Payment, TimeSlot};
use crate::notification::{dispatch, Notifier};
use crate::settlement::{
    self, GatewayCallback, PaymentRequest, ReconcileReport, RefundRequest, SettlementError,
};

/// Recorded as `refunded_by` for refunds no person asked for.
const SYSTEM_ACTOR: &str = "system";

#[derive(Error, Debug)]
pub enum BookingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Appointment(#[from] AppointmentError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Booking input as received from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRequest {
    pub patient_id: Uuid,
    pub practitioner_id: Uuid,
    pub hospital_id: Uuid,
    pub department_id: Option<Uuid>,
    pub previous_appointment_id: Option<Uuid>,
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Defaults to the practitioner's consultation fee.
    pub payment_amount: Option<i64>,
    pub appointment_type: Option<AppointmentType>,
    pub chief_complaint: Option<String>,
    pub estimated_duration_minutes: Option<u32>,
    #[serde(default)]
    pub is_urgent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentOutcome {
    pub appointment: Appointment,
    pub payment: Payment,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub appointment: Appointment,
    pub refund: Option<Payment>,
    /// Set when the cancellation committed but the automatic refund did not.
    pub refund_error: Option<String>,
}

fn patient_user(conn: &Connection, patient_id: &Uuid) -> Result<Option<String>, DatabaseError> {
    Ok(repository::get_patient(conn, patient_id)?.map(|p| p.user_id))
}

fn notify_patient(
    conn: &Connection,
    notifier: &dyn Notifier,
    patient_id: &Uuid,
    kind: NotificationKind,
    payload: serde_json::Value,
) {
    match patient_user(conn, patient_id) {
        Ok(Some(user_id)) => dispatch(notifier, &user_id, kind, payload),
        Ok(None) => tracing::warn!(patient_id = %patient_id, "Notification skipped: unknown patient"),
        Err(e) => tracing::warn!(patient_id = %patient_id, error = %e, "Notification skipped"),
    }
}

/// Validate directory references and book.
pub fn book(
    conn: &mut Connection,
    req: &BookingRequest,
    actor: &str,
) -> Result<Appointment, BookingError> {
    let time_slot = TimeSlot::new(req.start, req.end)
        .ok_or_else(|| BookingError::Validation("slot start must be before end".into()))?;

    repository::get_patient(conn, &req.patient_id)?
        .ok_or_else(|| BookingError::NotFound(format!("Patient {}", req.patient_id)))?;
    let hospital = repository::get_hospital(conn, &req.hospital_id)?
        .ok_or_else(|| BookingError::NotFound(format!("Hospital {}", req.hospital_id)))?;
    if !hospital.is_active {
        return Err(BookingError::Validation(format!("hospital {} is not accepting bookings", hospital.id)));
    }
    let practitioner = repository::get_practitioner(conn, &req.practitioner_id)?
        .ok_or_else(|| BookingError::NotFound(format!("Practitioner {}", req.practitioner_id)))?;
    if !practitioner.is_active {
        return Err(BookingError::Validation(format!(
            "practitioner {} is not accepting bookings",
            practitioner.id
        )));
    }
    if practitioner.hospital_id != hospital.id {
        return Err(BookingError::Validation(
            "practitioner does not work at this hospital".into(),
        ));
    }
    if let Some(department_id) = req.department_id {
        let department = repository::get_department(conn, &department_id)?
            .ok_or_else(|| BookingError::NotFound(format!("Department {department_id}")))?;
        if department.hospital_id != hospital.id {
            return Err(BookingError::Validation(
                "department does not belong to this hospital".into(),
            ));
        }
    }

    let new = NewAppointment {
        patient_id: req.patient_id,
        practitioner_id: req.practitioner_id,
        hospital_id: req.hospital_id,
        department_id: req.department_id,
        previous_appointment_id: req.previous_appointment_id,
        date: req.date,
        time_slot,
        payment_amount: req.payment_amount.unwrap_or(practitioner.consultation_fee),
        appointment_type: req.appointment_type,
        chief_complaint: req.chief_complaint.clone(),
        estimated_duration_minutes: req.estimated_duration_minutes,
        is_urgent: req.is_urgent,
    };
    Ok(appointment::book(conn, &new, actor)?)
}

fn mark_paid(
    conn: &mut Connection,
    notifier: &dyn Notifier,
    payment: &Payment,
) -> Result<Appointment, BookingError> {
    let appt = appointment::record_payment(
        conn,
        &payment.appointment_id,
        &payment.transaction_id,
        payment.wallet_amount_used,
    )?;
    notify_patient(
        conn,
        notifier,
        &payment.patient_id,
        NotificationKind::PaymentReceived,
        json!({
            "appointmentRef": appt.appointment_ref,
            "transactionId": payment.transaction_id,
            "amount": payment.amount,
        }),
    );
    Ok(appt)
}

/// Pay for an appointment, optionally using wallet credit. A payment that
/// completes immediately marks the appointment paid.
pub fn pay(
    conn: &mut Connection,
    gateway: &dyn GatewayClient,
    notifier: &dyn Notifier,
    appointment_id: &Uuid,
    wallet_amount_to_use: i64,
) -> Result<PaymentOutcome, BookingError> {
    let appt = appointment::get(conn, appointment_id)?;
    if appt.status.is_terminal() {
        return Err(BookingError::Validation(format!(
            "appointment is {} and cannot be paid",
            appt.status
        )));
    }
    if appt.payment_status != AppointmentPaymentStatus::Pending {
        return Err(BookingError::Validation(format!(
            "appointment payment is already {}",
            appt.payment_status
        )));
    }

    let payment = settlement::process_payment(
        conn,
        gateway,
        &PaymentRequest {
            appointment_id: appt.id,
            patient_id: appt.patient_id,
            total_amount: appt.payment_amount,
            wallet_amount_to_use,
        },
    )?;

    let appointment = if payment.status == PaymentStatus::Completed {
        mark_paid(conn, notifier, &payment)?
    } else {
        appt
    };
    Ok(PaymentOutcome { appointment, payment })
}

/// Apply a gateway verification and, once completed, mark the appointment paid.
pub fn settle(
    conn: &mut Connection,
    gateway: &dyn GatewayClient,
    notifier: &dyn Notifier,
    transaction_id: &str,
    callback: &GatewayCallback,
) -> Result<Payment, BookingError> {
    let payment = settlement::verify_payment(conn, gateway, transaction_id, callback)?;
    if payment.status != PaymentStatus::Completed {
        return Ok(payment);
    }
    match apply_completed(conn, gateway, notifier, &payment)? {
        Some(refunded) => Ok(refunded),
        None => Ok(payment),
    }
}

/// Reflect a completed payment on its appointment.
///
/// An appointment cancelled while its payment was still in flight is
/// recorded as paid and then refunded in full; the refunded payment is
/// returned in that case.
fn apply_completed(
    conn: &mut Connection,
    gateway: &dyn GatewayClient,
    notifier: &dyn Notifier,
    payment: &Payment,
) -> Result<Option<Payment>, BookingError> {
    let appt = appointment::get(conn, &payment.appointment_id)?;
    if appt.payment_status != AppointmentPaymentStatus::Pending {
        return Ok(None);
    }
    if appt.status != AppointmentStatus::Cancelled {
        mark_paid(conn, notifier, payment)?;
        return Ok(None);
    }

    tracing::warn!(
        appointment_id = %appt.id,
        transaction_id = %payment.transaction_id,
        "Payment settled after cancellation, refunding"
    );
    appointment::record_payment(
        conn,
        &appt.id,
        &payment.transaction_id,
        payment.wallet_amount_used,
    )?;
    let refunded = refund(
        conn,
        gateway,
        notifier,
        &payment.id,
        &RefundRequest {
            amount: None,
            reason: format!(
                "Appointment cancelled before payment settled: {}",
                appt.cancellation_reason.as_deref().unwrap_or("no reason given")
            ),
            refunded_by: SYSTEM_ACTOR.to_string(),
        },
    )?;
    Ok(Some(refunded))
}

/// Confirm a paid appointment and tell the patient.
pub fn confirm(
    conn: &mut Connection,
    notifier: &dyn Notifier,
    id: &Uuid,
    actor: &str,
) -> Result<Appointment, BookingError> {
    let appt = appointment::confirm(conn, id, actor)?;
    notify_patient(
        conn,
        notifier,
        &appt.patient_id,
        NotificationKind::AppointmentConfirmed,
        json!({
            "appointmentRef": appt.appointment_ref,
            "start": appt.time_slot.start,
        }),
    );
    Ok(appt)
}

/// Refund a payment and reflect it on the appointment.
pub fn refund(
    conn: &mut Connection,
    gateway: &dyn GatewayClient,
    notifier: &dyn Notifier,
    payment_id: &Uuid,
    req: &RefundRequest,
) -> Result<Payment, BookingError> {
    let payment = settlement::process_refund(conn, gateway, payment_id, req)?;
    let refunded = payment.refund.as_ref().map(|r| r.refund_amount).unwrap_or(0);

    match appointment::record_refund(conn, &payment.appointment_id, refunded) {
        Ok(_) => {}
        Err(AppointmentError::InvalidPaymentState { current, .. }) => {
            tracing::warn!(
                appointment_id = %payment.appointment_id,
                payment_status = current.as_str(),
                "Refund not reflected on appointment"
            );
        }
        Err(e) => return Err(e.into()),
    }

    if let Some(r) = payment.refund.as_ref() {
        notify_patient(
            conn,
            notifier,
            &payment.patient_id,
            NotificationKind::RefundProcessed,
            json!({
                "transactionId": payment.transaction_id,
                "refundAmount": r.refund_amount,
                "walletRefundAmount": r.wallet_refund_amount,
                "gatewayRefundAmount": r.gateway_refund_amount,
                "gatewayRefundStatus": r.gateway_refund_status,
            }),
        );
    }
    Ok(payment)
}

/// Run the stale-payment sweep and mark appointments paid for every
/// payment it completes (refunding those cancelled in the meantime).
pub fn reconcile(
    conn: &mut Connection,
    gateway: &dyn GatewayClient,
    notifier: &dyn Notifier,
    older_than: chrono::Duration,
) -> Result<ReconcileReport, BookingError> {
    let report = settlement::reconcile_stale(conn, gateway, older_than)?;
    for transaction_id in &report.completed {
        let payment = settlement::get_by_transaction_id(conn, transaction_id)?;
        apply_completed(conn, gateway, notifier, &payment)?;
    }
    Ok(report)
}

/// Cancel an appointment. A paid appointment is refunded in full.
pub fn cancel(
    conn: &mut Connection,
    gateway: &dyn GatewayClient,
    notifier: &dyn Notifier,
    id: &Uuid,
    reason: &str,
    actor: &str,
) -> Result<CancelOutcome, BookingError> {
    let appt = appointment::cancel(conn, id, reason, actor)?;
    notify_patient(
        conn,
        notifier,
        &appt.patient_id,
        NotificationKind::AppointmentCancelled,
        json!({
            "appointmentRef": appt.appointment_ref,
            "reason": reason,
        }),
    );

    let mut outcome = CancelOutcome {
        appointment: appt,
        refund: None,
        refund_error: None,
    };
    if outcome.appointment.payment_status != AppointmentPaymentStatus::Paid {
        return Ok(outcome);
    }

    // The cancellation is committed; refund problems are reported, not raised.
    match refund_cancelled(conn, gateway, notifier, id, reason, actor) {
        Ok(refunded) => outcome.refund = Some(refunded),
        Err(e) => {
            tracing::error!(appointment_id = %id, error = %e, "Refund after cancellation failed");
            outcome.refund_error = Some(e.to_string());
        }
    }
    if let Ok(current) = appointment::get(conn, id) {
        outcome.appointment = current;
    }
    Ok(outcome)
}

fn refund_cancelled(
    conn: &mut Connection,
    gateway: &dyn GatewayClient,
    notifier: &dyn Notifier,
    id: &Uuid,
    reason: &str,
    actor: &str,
) -> Result<Payment, BookingError> {
    let Some(payment) = repository::get_active_payment_for_appointment(conn, id)? else {
        tracing::error!(appointment_id = %id, "Paid appointment has no active payment to refund");
        return Err(BookingError::NotFound(format!("Active payment for appointment {id}")));
    };
    refund(
        conn,
        gateway,
        notifier,
        &payment.id,
        &RefundRequest {
            amount: None,
            reason: format!("Appointment cancelled: {reason}"),
            refunded_by: actor.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appointment::tests::{at, seed_directory, Fixture};
    use crate::db::sqlite::open_database;
    use crate::gateway::SandboxGateway;
    use crate::models::{Department, LedgerRefs, TransactionFilter};
    use crate::notification::StoredNotifier;
    use crate::wallet;

    struct Env {
        _dir: tempfile::TempDir,
        conn: Connection,
        f: Fixture,
        gateway: SandboxGateway,
        notifier: StoredNotifier,
    }

    fn env() -> Env {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("booking.db");
        let conn = open_database(&path).unwrap();
        let f = seed_directory(&conn);
        Env {
            _dir: dir,
            conn,
            f,
            gateway: SandboxGateway::new(),
            notifier: StoredNotifier::new(path),
        }
    }

    fn request(f: &Fixture, h1: u32, m1: u32, h2: u32, m2: u32) -> BookingRequest {
        BookingRequest {
            patient_id: f.patient,
            practitioner_id: f.practitioner,
            hospital_id: f.hospital,
            department_id: None,
            previous_appointment_id: None,
            date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            start: at(h1, m1),
            end: at(h2, m2),
            payment_amount: None,
            appointment_type: None,
            chief_complaint: None,
            estimated_duration_minutes: None,
            is_urgent: false,
        }
    }

    fn inbox(env: &Env) -> Vec<NotificationKind> {
        repository::list_notifications(&env.conn, "patient-user", false)
            .unwrap()
            .into_iter()
            .map(|n| n.kind)
            .collect()
    }

    #[test]
    fn booking_defaults_amount_to_consultation_fee() {
        let mut env = env();
        let appt = book(&mut env.conn, &request(&env.f, 10, 0, 10, 30), "recept").unwrap();
        assert_eq!(appt.payment_amount, 1000);
        assert_eq!(appt.status, AppointmentStatus::Pending);
    }

    #[test]
    fn booking_rejects_inverted_slot_and_unknown_references() {
        let mut env = env();
        let err = book(&mut env.conn, &request(&env.f, 10, 30, 10, 0), "r").unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)));

        let mut req = request(&env.f, 10, 0, 10, 30);
        req.practitioner_id = Uuid::new_v4();
        assert!(matches!(book(&mut env.conn, &req, "r").unwrap_err(), BookingError::NotFound(_)));
    }

    #[test]
    fn booking_rejects_department_of_other_hospital() {
        let mut env = env();
        let other_hospital = Uuid::new_v4();
        repository::insert_hospital(&env.conn, &crate::models::Hospital {
            id: other_hospital,
            name: "Elsewhere".into(),
            address: None,
            is_active: true,
        })
        .unwrap();
        let dept = Uuid::new_v4();
        repository::insert_department(&env.conn, &Department {
            id: dept,
            hospital_id: other_hospital,
            name: "Cardiology".into(),
        })
        .unwrap();
        let mut req = request(&env.f, 10, 0, 10, 30);
        req.department_id = Some(dept);
        assert!(matches!(book(&mut env.conn, &req, "r").unwrap_err(), BookingError::Validation(_)));
    }

    #[test]
    fn mixed_payment_then_confirm() {
        let mut env = env();
        wallet::credit(&mut env.conn, &env.f.patient, 500, "Top-up", LedgerRefs::default()).unwrap();
        let appt = book(&mut env.conn, &request(&env.f, 10, 0, 10, 30), "r").unwrap();

        let outcome = pay(&mut env.conn, &env.gateway, &env.notifier, &appt.id, 300).unwrap();
        assert_eq!(outcome.payment.status, PaymentStatus::Processing);
        assert_eq!(outcome.appointment.payment_status, AppointmentPaymentStatus::Pending);
        assert_eq!(wallet::get_balance(&env.conn, &env.f.patient).unwrap(), 200);

        let settled = settle(
            &mut env.conn,
            &env.gateway,
            &env.notifier,
            &outcome.payment.transaction_id,
            &GatewayCallback {
                success: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(settled.status, PaymentStatus::Completed);

        let confirmed = confirm(&mut env.conn, &env.notifier, &appt.id, "staff").unwrap();
        assert_eq!(confirmed.status, AppointmentStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());
        assert_eq!(confirmed.wallet_credit_used, 300);
        let kinds = inbox(&env);
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(&NotificationKind::PaymentReceived));
        assert!(kinds.contains(&NotificationKind::AppointmentConfirmed));
    }

    #[test]
    fn settle_replay_does_not_double_notify() {
        let mut env = env();
        let appt = book(&mut env.conn, &request(&env.f, 10, 0, 10, 30), "r").unwrap();
        let outcome = pay(&mut env.conn, &env.gateway, &env.notifier, &appt.id, 0).unwrap();
        let cb = GatewayCallback {
            success: Some(true),
            ..Default::default()
        };
        for _ in 0..2 {
            settle(&mut env.conn, &env.gateway, &env.notifier, &outcome.payment.transaction_id, &cb).unwrap();
        }
        assert_eq!(inbox(&env), vec![NotificationKind::PaymentReceived]);
    }

    #[test]
    fn cancelling_checked_in_paid_appointment_refunds() {
        let mut env = env();
        let appt = book(&mut env.conn, &request(&env.f, 10, 0, 10, 30), "r").unwrap();
        let outcome = pay(&mut env.conn, &env.gateway, &env.notifier, &appt.id, 0).unwrap();
        settle(&mut env.conn, &env.gateway, &env.notifier, &outcome.payment.transaction_id, &GatewayCallback {
            success: Some(true),
            ..Default::default()
        })
        .unwrap();
        confirm(&mut env.conn, &env.notifier, &appt.id, "staff").unwrap();
        appointment::check_in(&mut env.conn, &appt.id, None, "nurse").unwrap();

        let result = cancel(&mut env.conn, &env.gateway, &env.notifier, &appt.id, "emergency", "staff").unwrap();
        assert_eq!(result.appointment.status, AppointmentStatus::Cancelled);
        assert_eq!(result.appointment.payment_status, AppointmentPaymentStatus::Refunded);
        let refund = result.refund.unwrap();
        assert_eq!(refund.status, PaymentStatus::Refunded);
        let record = refund.refund.unwrap();
        assert_eq!((record.wallet_refund_amount, record.gateway_refund_amount), (100, 900));
        assert_eq!(wallet::get_balance(&env.conn, &env.f.patient).unwrap(), 100);

        let kinds = inbox(&env);
        assert!(kinds.contains(&NotificationKind::AppointmentCancelled));
        assert!(kinds.contains(&NotificationKind::RefundProcessed));
    }

    #[test]
    fn cancelling_unpaid_appointment_skips_refund() {
        let mut env = env();
        let appt = book(&mut env.conn, &request(&env.f, 10, 0, 10, 30), "r").unwrap();
        let result = cancel(&mut env.conn, &env.gateway, &env.notifier, &appt.id, "changed plans", "patient-user").unwrap();
        assert!(result.refund.is_none());
        assert_eq!(env.gateway.refund_calls(), 0);
        assert!(wallet::list_transactions(&env.conn, &env.f.patient, &TransactionFilter::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn payment_settling_after_cancellation_is_refunded() {
        let mut env = env();
        wallet::credit(&mut env.conn, &env.f.patient, 500, "Top-up", LedgerRefs::default()).unwrap();
        let appt = book(&mut env.conn, &request(&env.f, 10, 0, 10, 30), "r").unwrap();
        let outcome = pay(&mut env.conn, &env.gateway, &env.notifier, &appt.id, 300).unwrap();
        assert_eq!(outcome.payment.status, PaymentStatus::Processing);

        let cancelled = cancel(&mut env.conn, &env.gateway, &env.notifier, &appt.id, "changed plans", "patient-user").unwrap();
        assert!(cancelled.refund.is_none());
        assert_eq!(cancelled.appointment.payment_status, AppointmentPaymentStatus::Pending);

        let cb = GatewayCallback {
            success: Some(true),
            ..Default::default()
        };
        let settled = settle(&mut env.conn, &env.gateway, &env.notifier, &outcome.payment.transaction_id, &cb).unwrap();
        assert_eq!(settled.status, PaymentStatus::Refunded);
        let record = settled.refund.as_ref().unwrap();
        assert_eq!((record.wallet_refund_amount, record.gateway_refund_amount), (100, 900));
        assert_eq!(record.refunded_by, SYSTEM_ACTOR);

        let after = appointment::get(&env.conn, &appt.id).unwrap();
        assert_eq!(after.status, AppointmentStatus::Cancelled);
        assert_eq!(after.payment_status, AppointmentPaymentStatus::Refunded);
        assert_eq!(wallet::get_balance(&env.conn, &env.f.patient).unwrap(), 300);
        assert_eq!(env.gateway.refund_calls(), 1);
        assert!(!inbox(&env).contains(&NotificationKind::PaymentReceived));

        // a replayed webhook must not refund twice
        let replay = settle(&mut env.conn, &env.gateway, &env.notifier, &outcome.payment.transaction_id, &cb).unwrap();
        assert_eq!(replay.status, PaymentStatus::Refunded);
        assert_eq!(env.gateway.refund_calls(), 1);
    }

    #[test]
    fn payment_failing_after_cancellation_returns_wallet_money() {
        let mut env = env();
        wallet::credit(&mut env.conn, &env.f.patient, 500, "Top-up", LedgerRefs::default()).unwrap();
        let appt = book(&mut env.conn, &request(&env.f, 10, 0, 10, 30), "r").unwrap();
        let outcome = pay(&mut env.conn, &env.gateway, &env.notifier, &appt.id, 300).unwrap();
        cancel(&mut env.conn, &env.gateway, &env.notifier, &appt.id, "changed plans", "r").unwrap();

        let failed = settle(&mut env.conn, &env.gateway, &env.notifier, &outcome.payment.transaction_id, &GatewayCallback {
            success: Some(false),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert_eq!(wallet::get_balance(&env.conn, &env.f.patient).unwrap(), 500);
        assert_eq!(
            appointment::get(&env.conn, &appt.id).unwrap().payment_status,
            AppointmentPaymentStatus::Pending
        );
    }

    #[test]
    fn cancel_stands_when_automatic_refund_fails() {
        let mut env = env();
        let appt = book(&mut env.conn, &request(&env.f, 10, 0, 10, 30), "r").unwrap();
        // paid on the appointment, but no payment record to refund
        appointment::record_payment(&mut env.conn, &appt.id, "TXN-missing", 0).unwrap();

        let result = cancel(&mut env.conn, &env.gateway, &env.notifier, &appt.id, "ill", "r").unwrap();
        assert_eq!(result.appointment.status, AppointmentStatus::Cancelled);
        assert!(result.refund.is_none());
        assert!(result.refund_error.is_some());
        assert_eq!(
            appointment::get(&env.conn, &appt.id).unwrap().status,
            AppointmentStatus::Cancelled
        );
    }

    #[test]
    fn paying_a_cancelled_appointment_is_rejected() {
        let mut env = env();
        let appt = book(&mut env.conn, &request(&env.f, 10, 0, 10, 30), "r").unwrap();
        appointment::cancel(&mut env.conn, &appt.id, "x", "r").unwrap();
        assert!(matches!(
            pay(&mut env.conn, &env.gateway, &env.notifier, &appt.id, 0).unwrap_err(),
            BookingError::Validation(_)
        ));
    }

    #[test]
    fn reconcile_marks_recovered_payment_paid() {
        let mut env = env();
        let appt = book(&mut env.conn, &request(&env.f, 10, 0, 10, 30), "r").unwrap();
        let outcome = pay(&mut env.conn, &env.gateway, &env.notifier, &appt.id, 0).unwrap();
        assert_eq!(outcome.payment.status, PaymentStatus::Processing);

        let mut stuck = outcome.payment.clone();
        stuck.updated_at = chrono::Utc::now() - chrono::Duration::hours(2);
        repository::update_payment(&env.conn, &stuck).unwrap();

        let report = reconcile(
            &mut env.conn,
            &env.gateway,
            &env.notifier,
            chrono::Duration::minutes(30),
        )
        .unwrap();
        assert_eq!(report.completed, vec![outcome.payment.transaction_id.clone()]);
        assert_eq!(
            appointment::get(&env.conn, &appt.id).unwrap().payment_status,
            AppointmentPaymentStatus::Paid
        );
    }

    #[test]
    fn failed_gateway_leaves_appointment_unpaid() {
        let mut env = env();
        wallet::credit(&mut env.conn, &env.f.patient, 500, "Top-up", LedgerRefs::default()).unwrap();
        let appt = book(&mut env.conn, &request(&env.f, 10, 0, 10, 30), "r").unwrap();
        env.gateway.fail_initiate(true);
        let err = pay(&mut env.conn, &env.gateway, &env.notifier, &appt.id, 300).unwrap_err();
        assert!(matches!(err, BookingError::Settlement(SettlementError::Gateway(_))));
        assert_eq!(wallet::get_balance(&env.conn, &env.f.patient).unwrap(), 500);
        assert_eq!(
            appointment::get(&env.conn, &appt.id).unwrap().payment_status,
            AppointmentPaymentStatus::Pending
        );
    }
}

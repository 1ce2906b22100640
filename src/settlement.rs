//! Payment settlement: the wallet + gateway payment saga, verification and
//! the fixed 10/90 refund split.
//!
//! Saga steps are persisted as they happen:
//!
//! ```text
//! pending ─▶ wallet_reserved ─▶ gateway_requested ─▶ completed
//!                  │                    │
//!                  └──────────▶ compensating ─▶ failed
//! ```
//!
//! Network calls never run inside a database transaction. A crash between
//! steps leaves the payment in a non-terminal step that `reconcile_stale`
//! can resume.

use chrono::{Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::repository;
use crate::db::sqlite::begin_immediate;
use crate::db::DatabaseError;
use crate::gateway::{GatewayClient, GatewayError};
use crate::models::enums::{GatewayRefundStatus, PaymentMethod, PaymentStatus, SagaState};
use crate::models::{LedgerRefs, Payment, PaymentFilter, RefundRecord};
use crate::wallet::{self, WalletError};

/// Refund reason recorded when there is no provider charge to reverse.
const NO_GATEWAY_CHARGE: &str = "no gateway transaction; manual payout required";

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Payment not found: {0}")]
    NotFound(String),

    #[error("Insufficient wallet balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },

    #[error("Cannot {operation} a payment in status {current}")]
    InvalidState {
        current: PaymentStatus,
        operation: &'static str,
    },

    #[error("Appointment {0} already has an active payment")]
    DuplicatePayment(Uuid),

    #[error("Payment gateway failure: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<rusqlite::Error> for SettlementError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(e))
    }
}

impl From<WalletError> for SettlementError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::InsufficientBalance { available, requested } => {
                Self::InsufficientBalance { available, requested }
            }
            WalletError::InvalidAmount(amount) => {
                Self::Validation(format!("invalid wallet amount {amount}"))
            }
            WalletError::Database(db) => Self::Database(db),
        }
    }
}

// ─── Inputs & outputs ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub total_amount: i64,
    #[serde(default)]
    pub wallet_amount_to_use: i64,
}

/// Result reported by the gateway, either pushed by its webhook or pulled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayCallback {
    pub success: Option<bool>,
    pub status: Option<String>,
    pub provider_transaction_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    /// Defaults to the full payment amount.
    pub amount: Option<i64>,
    pub reason: String,
    pub refunded_by: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub unresolved: Vec<String>,
}

/// `(wallet_share, gateway_share)` of a refund: 10% to the wallet rounded
/// half up, the remainder through the gateway.
pub fn split_refund(amount: i64) -> (i64, i64) {
    let wallet_share = (amount + 5) / 10;
    (wallet_share, amount - wallet_share)
}

pub fn generate_transaction_id() -> String {
    format!("TXN{}", Uuid::new_v4().simple())
}

// ─── Reads ────────────────────────────────────────────────────────────────────

pub fn get_payment(conn: &Connection, id: &Uuid) -> Result<Payment, SettlementError> {
    repository::get_payment(conn, id)?.ok_or_else(|| SettlementError::NotFound(id.to_string()))
}

pub fn get_by_transaction_id(conn: &Connection, transaction_id: &str) -> Result<Payment, SettlementError> {
    repository::get_payment_by_transaction_id(conn, transaction_id)?
        .ok_or_else(|| SettlementError::NotFound(transaction_id.to_string()))
}

pub fn payments_for_appointment(
    conn: &Connection,
    appointment_id: &Uuid,
) -> Result<Vec<Payment>, SettlementError> {
    Ok(repository::list_payments_for_appointment(conn, appointment_id)?)
}

pub fn patient_history(
    conn: &Connection,
    patient_id: &Uuid,
    filter: &PaymentFilter,
) -> Result<Vec<Payment>, SettlementError> {
    Ok(repository::list_patient_payments(conn, patient_id, filter)?)
}

// ─── Saga bookkeeping ─────────────────────────────────────────────────────────

fn set_step(payment: &mut Payment, step: SagaState) {
    payment.saga_state = step;
    payment.status = step.payment_status();
    payment.updated_at = Utc::now();
    if step == SagaState::Completed {
        payment.completed_at = Some(payment.updated_at);
    }
}

fn ledger_refs(payment: &Payment) -> LedgerRefs {
    LedgerRefs {
        appointment_id: Some(payment.appointment_id),
        payment_id: Some(payment.id),
    }
}

/// Persist a single saga step in its own transaction, re-reading the row so a
/// concurrent finisher is not overwritten. Returns the stored payment, which
/// is unchanged if it had already left `from`.
fn advance(
    conn: &mut Connection,
    payment_id: &Uuid,
    from: &[SagaState],
    to: SagaState,
    edit: impl FnOnce(&mut Payment),
) -> Result<Payment, SettlementError> {
    let tx = begin_immediate(conn)?;
    let mut payment = repository::get_payment(&tx, payment_id)?
        .ok_or_else(|| SettlementError::NotFound(payment_id.to_string()))?;
    if !from.contains(&payment.saga_state) {
        return Ok(payment);
    }
    set_step(&mut payment, to);
    edit(&mut payment);
    repository::update_payment(&tx, &payment)?;
    tx.commit()?;

    tracing::info!(
        payment_id = %payment_id,
        transaction_id = %payment.transaction_id,
        saga_state = to.as_str(),
        "Payment saga advanced"
    );
    Ok(payment)
}

/// Roll a payment back: persist `compensating`, then return any reserved
/// wallet money and mark it `failed` in one transaction.
fn compensate(
    conn: &mut Connection,
    payment_id: &Uuid,
    reason: &str,
) -> Result<Payment, SettlementError> {
    advance(
        conn,
        payment_id,
        &[SagaState::Pending, SagaState::WalletReserved, SagaState::GatewayRequested],
        SagaState::Compensating,
        |p| p.failure_reason = Some(reason.to_string()),
    )?;

    let tx = begin_immediate(conn)?;
    let mut payment = repository::get_payment(&tx, payment_id)?
        .ok_or_else(|| SettlementError::NotFound(payment_id.to_string()))?;
    if payment.saga_state != SagaState::Compensating {
        return Ok(payment);
    }
    if payment.wallet_amount_used > 0 {
        wallet::credit_in(
            &tx,
            &payment.patient_id,
            payment.wallet_amount_used,
            &format!("Reversal of failed payment {}", payment.transaction_id),
            ledger_refs(&payment),
        )?;
    }
    set_step(&mut payment, SagaState::Failed);
    repository::update_payment(&tx, &payment)?;
    tx.commit()?;

    tracing::warn!(
        payment_id = %payment_id,
        transaction_id = %payment.transaction_id,
        wallet_returned = payment.wallet_amount_used,
        reason,
        "Payment failed and compensated"
    );
    Ok(payment)
}

// ─── Payment ──────────────────────────────────────────────────────────────────

/// Start paying for an appointment.
///
/// Any wallet share is debited immediately in the same transaction that
/// records `wallet_reserved`. A zero gateway share completes at once.
/// Otherwise the charge is opened with the gateway and the payment stays
/// `processing` until verified; if opening it fails the wallet debit is
/// reversed, the payment is marked `failed` and the gateway error returned.
pub fn process_payment(
    conn: &mut Connection,
    gateway: &dyn GatewayClient,
    req: &PaymentRequest,
) -> Result<Payment, SettlementError> {
    if req.total_amount <= 0 {
        return Err(SettlementError::Validation("total amount must be positive".into()));
    }
    if req.wallet_amount_to_use < 0 || req.wallet_amount_to_use > req.total_amount {
        return Err(SettlementError::Validation(format!(
            "wallet amount must be between 0 and {}",
            req.total_amount
        )));
    }

    let wallet_amount = req.wallet_amount_to_use;
    let gateway_amount = req.total_amount - wallet_amount;
    let now = Utc::now();
    let mut payment = Payment {
        id: Uuid::new_v4(),
        appointment_id: req.appointment_id,
        patient_id: req.patient_id,
        amount: req.total_amount,
        method: PaymentMethod::classify(req.total_amount, wallet_amount),
        wallet_amount_used: wallet_amount,
        gateway_amount_paid: gateway_amount,
        status: PaymentStatus::Pending,
        saga_state: SagaState::Pending,
        transaction_id: generate_transaction_id(),
        provider_transaction_id: None,
        checkout_reference: None,
        failure_reason: None,
        completed_at: None,
        refund: None,
        created_at: now,
        updated_at: now,
    };

    let tx = begin_immediate(conn)?;
    if wallet_amount > 0 {
        let available = wallet::get_or_create(&tx, &req.patient_id)?.balance;
        if available < wallet_amount {
            return Err(SettlementError::InsufficientBalance {
                available,
                requested: wallet_amount,
            });
        }
    }
    if let Err(e) = repository::insert_payment(&tx, &payment) {
        if e.is_constraint_violation() {
            return Err(SettlementError::DuplicatePayment(req.appointment_id));
        }
        return Err(e.into());
    }
    if wallet_amount > 0 {
        wallet::debit_in(
            &tx,
            &req.patient_id,
            wallet_amount,
            &format!("Payment {}", payment.transaction_id),
            ledger_refs(&payment),
        )?;
        set_step(&mut payment, SagaState::WalletReserved);
    }
    if gateway_amount == 0 {
        set_step(&mut payment, SagaState::Completed);
    }
    repository::update_payment(&tx, &payment)?;
    tx.commit()?;

    tracing::info!(
        payment_id = %payment.id,
        transaction_id = %payment.transaction_id,
        method = payment.method.as_str(),
        wallet_amount,
        gateway_amount,
        "Payment initiated"
    );

    if gateway_amount == 0 {
        return Ok(payment);
    }

    let payment = advance(
        conn,
        &payment.id,
        &[SagaState::Pending, SagaState::WalletReserved],
        SagaState::GatewayRequested,
        |_| {},
    )?;

    let description = format!("Appointment payment {}", payment.appointment_id);
    match gateway.initiate(gateway_amount, &payment.transaction_id, &description) {
        Ok(charge) => {
            let tx = begin_immediate(conn)?;
            let mut stored = repository::get_payment(&tx, &payment.id)?
                .ok_or_else(|| SettlementError::NotFound(payment.id.to_string()))?;
            stored.provider_transaction_id = Some(charge.provider_transaction_id);
            stored.checkout_reference = Some(charge.checkout_reference);
            stored.updated_at = Utc::now();
            repository::update_payment(&tx, &stored)?;
            tx.commit()?;
            Ok(stored)
        }
        Err(e) => {
            tracing::warn!(
                transaction_id = %payment.transaction_id,
                error = %e,
                "Gateway charge failed, compensating"
            );
            compensate(conn, &payment.id, &e.to_string())?;
            Err(SettlementError::Gateway(e))
        }
    }
}

/// Apply the gateway's verdict on a charge. Idempotent: completed or failed
/// payments are returned unchanged.
///
/// When the callback carries no explicit outcome the gateway is asked
/// directly; an error from that call counts as a failed charge.
pub fn verify_payment(
    conn: &mut Connection,
    gateway: &dyn GatewayClient,
    transaction_id: &str,
    callback: &GatewayCallback,
) -> Result<Payment, SettlementError> {
    let payment = get_by_transaction_id(conn, transaction_id)?;
    if payment.saga_state == SagaState::Completed || payment.saga_state == SagaState::Failed {
        tracing::debug!(transaction_id, "Verification replay ignored");
        return Ok(payment);
    }

    let provider_id = callback
        .provider_transaction_id
        .clone()
        .or_else(|| payment.provider_transaction_id.clone());

    let outcome = match callback.success {
        Some(success) => Ok(success),
        None => match provider_id.as_deref() {
            Some(id) => gateway.verify(id).map(|status| status.success),
            None => Err(GatewayError::Declined("no provider transaction to verify".into())),
        },
    };

    match outcome {
        Ok(true) => advance(
            conn,
            &payment.id,
            &[SagaState::GatewayRequested, SagaState::WalletReserved, SagaState::Pending],
            SagaState::Completed,
            |p| {
                if p.provider_transaction_id.is_none() {
                    p.provider_transaction_id = provider_id;
                }
            },
        ),
        Ok(false) => {
            let reason = callback
                .status
                .clone()
                .unwrap_or_else(|| "declined by gateway".into());
            compensate(conn, &payment.id, &reason)
        }
        Err(e) => {
            compensate(conn, &payment.id, &e.to_string())?;
            Err(SettlementError::Gateway(e))
        }
    }
}

// ─── Refund ───────────────────────────────────────────────────────────────────

/// Refund a completed payment: 10% (half up) back to the wallet at once,
/// the rest through the gateway.
///
/// The wallet credit and refund bookkeeping commit before the gateway is
/// called. A gateway refund failure is recorded on the payment for manual
/// follow-up and does not fail the operation.
pub fn process_refund(
    conn: &mut Connection,
    gateway: &dyn GatewayClient,
    payment_id: &Uuid,
    req: &RefundRequest,
) -> Result<Payment, SettlementError> {
    let tx = begin_immediate(conn)?;
    let mut payment = repository::get_payment(&tx, payment_id)?
        .ok_or_else(|| SettlementError::NotFound(payment_id.to_string()))?;
    if payment.status != PaymentStatus::Completed {
        return Err(SettlementError::InvalidState {
            current: payment.status,
            operation: "refund",
        });
    }
    let amount = req.amount.unwrap_or(payment.amount);
    if amount <= 0 || amount > payment.amount {
        return Err(SettlementError::Validation(format!(
            "refund amount must be between 1 and {}",
            payment.amount
        )));
    }

    let (wallet_share, gateway_share) = split_refund(amount);
    if wallet_share > 0 {
        wallet::credit_in(
            &tx,
            &payment.patient_id,
            wallet_share,
            &format!("Refund credit for {}", payment.transaction_id),
            ledger_refs(&payment),
        )?;
    }

    let now = Utc::now();
    payment.status = if amount == payment.amount {
        PaymentStatus::Refunded
    } else {
        PaymentStatus::PartiallyRefunded
    };
    payment.refund = Some(RefundRecord {
        refund_amount: amount,
        wallet_refund_amount: wallet_share,
        gateway_refund_amount: gateway_share,
        gateway_refund_status: GatewayRefundStatus::Pending,
        gateway_refund_reference: None,
        gateway_refund_error: None,
        refund_reason: req.reason.clone(),
        refunded_at: now,
        refunded_by: req.refunded_by.clone(),
    });
    payment.updated_at = now;
    repository::update_payment(&tx, &payment)?;
    tx.commit()?;

    tracing::info!(
        payment_id = %payment_id,
        amount,
        wallet_share,
        gateway_share,
        "Refund recorded, wallet share credited"
    );

    let outcome = match payment.provider_transaction_id.as_deref() {
        None => Err(NO_GATEWAY_CHARGE.to_string()),
        Some(provider_id) => match gateway.refund(provider_id, gateway_share, &req.reason) {
            Ok(receipt) if receipt.success => Ok(receipt.refund_reference),
            Ok(_) => Err("refund declined by gateway".to_string()),
            Err(e) => Err(e.to_string()),
        },
    };

    let tx = begin_immediate(conn)?;
    let mut stored = repository::get_payment(&tx, payment_id)?
        .ok_or_else(|| SettlementError::NotFound(payment_id.to_string()))?;
    if let Some(refund) = stored.refund.as_mut() {
        match outcome {
            Ok(reference) => {
                refund.gateway_refund_status = GatewayRefundStatus::Succeeded;
                refund.gateway_refund_reference = reference;
            }
            Err(error) => {
                tracing::warn!(
                    payment_id = %payment_id,
                    gateway_share,
                    error = %error,
                    "Gateway refund failed; manual follow-up required"
                );
                refund.gateway_refund_status = GatewayRefundStatus::Failed;
                refund.gateway_refund_error = Some(error);
            }
        }
    }
    stored.updated_at = Utc::now();
    repository::update_payment(&tx, &stored)?;
    tx.commit()?;
    Ok(stored)
}

// ─── Recovery ─────────────────────────────────────────────────────────────────

/// Resume payments stuck in a non-terminal saga step for longer than
/// `older_than`. Operator-triggered; never scheduled automatically.
pub fn reconcile_stale(
    conn: &mut Connection,
    gateway: &dyn GatewayClient,
    older_than: Duration,
) -> Result<ReconcileReport, SettlementError> {
    let cutoff = Utc::now().checked_sub_signed(older_than).ok_or_else(|| {
        SettlementError::Validation(format!("reconcile age {older_than} is out of range"))
    })?;
    let stale = repository::list_stale_payments(conn, &cutoff)?;
    let mut report = ReconcileReport {
        examined: stale.len(),
        ..Default::default()
    };

    for payment in stale {
        let resolved = match (payment.saga_state, payment.provider_transaction_id.as_deref()) {
            (SagaState::GatewayRequested, Some(provider_id)) => match gateway.verify(provider_id) {
                Ok(status) if status.success => advance(
                    conn,
                    &payment.id,
                    &[SagaState::GatewayRequested],
                    SagaState::Completed,
                    |_| {},
                )?,
                Ok(status) => compensate(conn, &payment.id, &status.status)?,
                Err(e) => {
                    tracing::warn!(
                        transaction_id = %payment.transaction_id,
                        error = %e,
                        "Reconciliation could not reach gateway"
                    );
                    report.unresolved.push(payment.transaction_id);
                    continue;
                }
            },
            (SagaState::GatewayRequested, None) => {
                compensate(conn, &payment.id, "gateway charge never opened")?
            }
            _ => compensate(conn, &payment.id, "abandoned before gateway charge")?,
        };

        match resolved.saga_state {
            SagaState::Completed => report.completed.push(resolved.transaction_id),
            SagaState::Failed => report.failed.push(resolved.transaction_id),
            _ => report.unresolved.push(resolved.transaction_id),
        }
    }

    tracing::info!(
        examined = report.examined,
        completed = report.completed.len(),
        failed = report.failed.len(),
        unresolved = report.unresolved.len(),
        "Payment reconciliation finished"
    );
    Ok(report)
}

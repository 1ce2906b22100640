//! Payment endpoints.
//!
//! `verify` is the provider's webhook and sits behind the signature
//! middleware instead of the actor middleware.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::appointment;
use crate::authorization::{authorize, ensure_own_record, Action, Actor};
use crate::booking::{self, PaymentOutcome};
use crate::models::{Payment, PaymentFilter};
use crate::settlement::{self, GatewayCallback, ReconcileReport, RefundRequest};

/// Stale payments older than this are swept when the caller gives no age.
const DEFAULT_RECONCILE_AGE_MINUTES: i64 = 15;

#[derive(Debug, Deserialize)]
pub struct ProcessBody {
    pub appointment_id: Uuid,
    #[serde(default)]
    pub wallet_amount_to_use: i64,
}

/// `POST /api/payments/process`
pub async fn process(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<ProcessBody>,
) -> Result<Json<PaymentOutcome>, ApiError> {
    authorize(&actor, Action::ProcessPayment, None)?;
    let outcome = ctx
        .blocking(move |core, conn| {
            let appt = appointment::get(conn, &body.appointment_id)?;
            ensure_own_record(&actor, Some(&appt.patient_id))?;
            Ok(booking::pay(
                conn,
                core.gateway(),
                core.notifier(),
                &appt.id,
                body.wallet_amount_to_use,
            )?)
        })
        .await?;
    Ok(Json(outcome))
}

/// Webhook payload as sent by the provider.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBody {
    pub transaction_id: String,
    #[serde(flatten)]
    pub callback: GatewayCallback,
}

/// `POST /api/payments/verify` (gateway webhook, signature-checked)
pub async fn verify(
    State(ctx): State<ApiContext>,
    Json(body): Json<VerifyBody>,
) -> Result<Json<Payment>, ApiError> {
    let payment = ctx
        .blocking(move |core, conn| {
            Ok(booking::settle(
                conn,
                core.gateway(),
                core.notifier(),
                &body.transaction_id,
                &body.callback,
            )?)
        })
        .await?;
    Ok(Json(payment))
}

#[derive(Debug, Deserialize)]
pub struct RefundBody {
    pub amount: Option<i64>,
    pub reason: String,
}

/// `POST /api/payments/:id/refund`
pub async fn refund(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(body): Json<RefundBody>,
) -> Result<Json<Payment>, ApiError> {
    authorize(&actor, Action::RefundPayment, None)?;
    if body.reason.trim().is_empty() {
        return Err(ApiError::Validation("refund reason is required".into()));
    }
    let req = RefundRequest {
        amount: body.amount,
        reason: body.reason.trim().to_string(),
        refunded_by: actor.id.clone(),
    };
    let payment = ctx
        .blocking(move |core, conn| {
            Ok(booking::refund(conn, core.gateway(), core.notifier(), &id, &req)?)
        })
        .await?;
    Ok(Json(payment))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileBody {
    pub older_than_minutes: Option<i64>,
}

/// `POST /api/payments/reconcile`: operator-triggered recovery sweep.
pub async fn reconcile(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    body: Option<Json<ReconcileBody>>,
) -> Result<Json<ReconcileReport>, ApiError> {
    authorize(&actor, Action::ReconcilePayments, None)?;
    let minutes = body
        .and_then(|Json(b)| b.older_than_minutes)
        .unwrap_or(DEFAULT_RECONCILE_AGE_MINUTES);
    if minutes < 0 {
        return Err(ApiError::Validation("older_than_minutes must not be negative".into()));
    }
    let older_than = chrono::Duration::try_minutes(minutes)
        .ok_or_else(|| ApiError::Validation("older_than_minutes is out of range".into()))?;
    let report = ctx
        .blocking(move |core, conn| {
            Ok(booking::reconcile(
                conn,
                core.gateway(),
                core.notifier(),
                older_than,
            )?)
        })
        .await?;
    Ok(Json(report))
}

/// `GET /api/payments/:id`
pub async fn get(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, ApiError> {
    authorize(&actor, Action::ViewPayments, None)?;
    let payment = ctx
        .blocking(move |_, conn| {
            let payment = settlement::get_payment(conn, &id)?;
            ensure_own_record(&actor, Some(&payment.patient_id))?;
            Ok(payment)
        })
        .await?;
    Ok(Json(payment))
}

/// `GET /api/payments/transaction/:transaction_id`
pub async fn by_transaction(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(transaction_id): Path<String>,
) -> Result<Json<Payment>, ApiError> {
    authorize(&actor, Action::ViewPayments, None)?;
    let payment = ctx
        .blocking(move |_, conn| {
            let payment = settlement::get_by_transaction_id(conn, &transaction_id)?;
            ensure_own_record(&actor, Some(&payment.patient_id))?;
            Ok(payment)
        })
        .await?;
    Ok(Json(payment))
}

/// `GET /api/patients/:patient_id/payments?status=&limit=&skip=`
pub async fn patient_history(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(patient_id): Path<Uuid>,
    Query(filter): Query<PaymentFilter>,
) -> Result<Json<Vec<Payment>>, ApiError> {
    authorize(&actor, Action::ViewPayments, Some(&patient_id))?;
    let payments = ctx
        .blocking(move |_, conn| Ok(settlement::patient_history(conn, &patient_id, &filter)?))
        .await?;
    Ok(Json(payments))
}

/// `GET /api/appointments/:id/payments`
pub async fn for_appointment(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Vec<Payment>>, ApiError> {
    authorize(&actor, Action::ViewPayments, None)?;
    let payments = ctx
        .blocking(move |_, conn| {
            let appt = appointment::get(conn, &appointment_id)?;
            ensure_own_record(&actor, Some(&appt.patient_id))?;
            Ok(settlement::payments_for_appointment(conn, &appointment_id)?)
        })
        .await?;
    Ok(Json(payments))
}

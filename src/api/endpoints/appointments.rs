//! Appointment endpoints.
//!
//! Booking, reads, and every lifecycle transition. Transitions that touch
//! payments or notifications go through `booking`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::appointment::{self, CompletionNotes};
use crate::authorization::{authorize, ensure_own_record, Action, Actor};
use crate::booking::{self, BookingRequest, CancelOutcome};
use crate::models::enums::Role;
use crate::models::{Appointment, AppointmentEvent, AppointmentFilter, TimeSlot, Vitals};

/// Role check first, then load and check ownership.
fn load_for(
    conn: &Connection,
    actor: &Actor,
    action: Action,
    id: &Uuid,
) -> Result<Appointment, ApiError> {
    authorize(actor, action, None)?;
    let appt = appointment::get(conn, id)?;
    ensure_own_record(actor, Some(&appt.patient_id))?;
    Ok(appt)
}

// ── Reads ───────────────────────────────────────────────────

/// `POST /api/appointments`
pub async fn create(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<BookingRequest>,
) -> Result<(StatusCode, Json<Appointment>), ApiError> {
    authorize(&actor, Action::BookAppointment, Some(&req.patient_id))?;
    let appt = ctx
        .blocking(move |_, conn| Ok(booking::book(conn, &req, &actor.id)?))
        .await?;
    Ok((StatusCode::CREATED, Json(appt)))
}

/// `GET /api/appointments`: patients only ever see their own.
pub async fn list(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Query(mut filter): Query<AppointmentFilter>,
) -> Result<Json<Vec<Appointment>>, ApiError> {
    authorize(&actor, Action::ViewAppointments, filter.patient_id.as_ref())?;
    if actor.role == Role::Patient && filter.patient_id.is_none() {
        filter.patient_id = actor.patient_id;
    }
    let appointments = ctx
        .blocking(move |_, conn| Ok(appointment::list(conn, &filter)?))
        .await?;
    Ok(Json(appointments))
}

/// `GET /api/appointments/:id`
pub async fn get(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<Appointment>, ApiError> {
    let appt = ctx
        .blocking(move |_, conn| load_for(conn, &actor, Action::ViewAppointments, &id))
        .await?;
    Ok(Json(appt))
}

/// `GET /api/appointments/ref/:appointment_ref`
pub async fn get_by_ref(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(appointment_ref): Path<String>,
) -> Result<Json<Appointment>, ApiError> {
    let appt = ctx
        .blocking(move |_, conn| {
            authorize(&actor, Action::ViewAppointments, None)?;
            let appt = appointment::get_by_ref(conn, &appointment_ref)?;
            ensure_own_record(&actor, Some(&appt.patient_id))?;
            Ok(appt)
        })
        .await?;
    Ok(Json(appt))
}

/// `GET /api/appointments/:id/history`
pub async fn history(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AppointmentEvent>>, ApiError> {
    let events = ctx
        .blocking(move |_, conn| {
            load_for(conn, &actor, Action::ViewAppointments, &id)?;
            Ok(appointment::history(conn, &id)?)
        })
        .await?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
pub struct ScheduleQuery {
    pub date: NaiveDate,
}

/// `GET /api/practitioners/:id/schedule?date=YYYY-MM-DD`
pub async fn schedule(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(practitioner_id): Path<Uuid>,
    Query(query): Query<ScheduleQuery>,
) -> Result<Json<Vec<Appointment>>, ApiError> {
    authorize(&actor, Action::ViewSchedule, None)?;
    let day = ctx
        .blocking(move |_, conn| Ok(appointment::schedule(conn, &practitioner_id, query.date)?))
        .await?;
    Ok(Json(day))
}

/// `GET /api/patients/:patient_id/appointments/upcoming`
pub async fn upcoming(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<Vec<Appointment>>, ApiError> {
    authorize(&actor, Action::ViewAppointments, Some(&patient_id))?;
    let appointments = ctx
        .blocking(move |_, conn| Ok(appointment::upcoming(conn, Some(&patient_id), None)?))
        .await?;
    Ok(Json(appointments))
}

// ── Transitions ─────────────────────────────────────────────

/// `PATCH /api/appointments/:id/confirm`
pub async fn confirm(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<Appointment>, ApiError> {
    let appt = ctx
        .blocking(move |core, conn| {
            load_for(conn, &actor, Action::ConfirmAppointment, &id)?;
            Ok(booking::confirm(conn, core.notifier(), &id, &actor.id)?)
        })
        .await?;
    Ok(Json(appt))
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckInBody {
    pub vitals: Option<Vitals>,
}

/// `PATCH /api/appointments/:id/checkin`: body optional.
pub async fn check_in(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    body: Option<Json<CheckInBody>>,
) -> Result<Json<Appointment>, ApiError> {
    let vitals = body.and_then(|Json(b)| b.vitals);
    let appt = ctx
        .blocking(move |_, conn| {
            load_for(conn, &actor, Action::CheckIn, &id)?;
            Ok(appointment::check_in(conn, &id, vitals, &actor.id)?)
        })
        .await?;
    Ok(Json(appt))
}

/// `PATCH /api/appointments/:id/vitals`
pub async fn record_vitals(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(vitals): Json<Vitals>,
) -> Result<Json<Appointment>, ApiError> {
    let appt = ctx
        .blocking(move |_, conn| {
            load_for(conn, &actor, Action::RecordVitals, &id)?;
            Ok(appointment::record_vitals(conn, &id, vitals, &actor.id)?)
        })
        .await?;
    Ok(Json(appt))
}

/// `PATCH /api/appointments/:id/complete`
pub async fn complete(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(notes): Json<CompletionNotes>,
) -> Result<Json<Appointment>, ApiError> {
    let appt = ctx
        .blocking(move |_, conn| {
            load_for(conn, &actor, Action::CompleteAppointment, &id)?;
            Ok(appointment::complete(conn, &id, notes, &actor.id)?)
        })
        .await?;
    Ok(Json(appt))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub reason: String,
}

/// `PATCH /api/appointments/:id/cancel`: refunds automatically when paid.
pub async fn cancel(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelBody>,
) -> Result<Json<CancelOutcome>, ApiError> {
    if body.reason.trim().is_empty() {
        return Err(ApiError::Validation("cancellation reason is required".into()));
    }
    let outcome = ctx
        .blocking(move |core, conn| {
            load_for(conn, &actor, Action::CancelAppointment, &id)?;
            Ok(booking::cancel(
                conn,
                core.gateway(),
                core.notifier(),
                &id,
                body.reason.trim(),
                &actor.id,
            )?)
        })
        .await?;
    Ok(Json(outcome))
}

/// `PATCH /api/appointments/:id/no-show`
pub async fn no_show(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<Appointment>, ApiError> {
    let appt = ctx
        .blocking(move |_, conn| {
            load_for(conn, &actor, Action::MarkNoShow, &id)?;
            Ok(appointment::mark_no_show(conn, &id, &actor.id)?)
        })
        .await?;
    Ok(Json(appt))
}

#[derive(Debug, Deserialize)]
pub struct RescheduleBody {
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// `POST /api/appointments/:id/reschedule`
pub async fn reschedule(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(body): Json<RescheduleBody>,
) -> Result<Json<Appointment>, ApiError> {
    let slot = TimeSlot::new(body.start, body.end)
        .ok_or_else(|| ApiError::Validation("slot start must be before end".into()))?;
    let appt = ctx
        .blocking(move |_, conn| {
            load_for(conn, &actor, Action::RescheduleAppointment, &id)?;
            Ok(appointment::reschedule(conn, &id, body.date, slot, &actor.id)?)
        })
        .await?;
    Ok(Json(appt))
}

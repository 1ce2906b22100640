//! Wallet endpoints.
//!
//! Reads are open to the owning patient and front-desk staff. Manual
//! credit/debit is an administrative correction and always leaves a ledger row.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use rusqlite::Connection;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::authorization::{authorize, Action, Actor};
use crate::db::repository;
use crate::models::{LedgerRefs, TransactionFilter, Wallet, WalletTransaction};
use crate::wallet::{self, LedgerCheck};

fn require_patient(conn: &Connection, patient_id: &Uuid) -> Result<(), ApiError> {
    repository::get_patient(conn, patient_id)?
        .map(|_| ())
        .ok_or_else(|| ApiError::NotFound(format!("Patient {patient_id} not found")))
}

/// `GET /api/wallets/:patient_id`: creates an empty wallet on first access.
pub async fn get(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<Wallet>, ApiError> {
    authorize(&actor, Action::ViewWallet, Some(&patient_id))?;
    let wallet = ctx
        .blocking(move |_, conn| {
            require_patient(conn, &patient_id)?;
            Ok(wallet::get_or_create(conn, &patient_id)?)
        })
        .await?;
    Ok(Json(wallet))
}

/// `GET /api/wallets/:patient_id/transactions?type=&date_from=&date_to=&limit=&skip=`
pub async fn transactions(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(patient_id): Path<Uuid>,
    Query(filter): Query<TransactionFilter>,
) -> Result<Json<Vec<WalletTransaction>>, ApiError> {
    authorize(&actor, Action::ViewWallet, Some(&patient_id))?;
    let entries = ctx
        .blocking(move |_, conn| {
            require_patient(conn, &patient_id)?;
            Ok(wallet::list_transactions(conn, &patient_id, &filter)?)
        })
        .await?;
    Ok(Json(entries))
}

/// `GET /api/wallets/:patient_id/ledger-check`
pub async fn ledger_check(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<LedgerCheck>, ApiError> {
    authorize(&actor, Action::ViewWallet, Some(&patient_id))?;
    let check = ctx
        .blocking(move |_, conn| {
            require_patient(conn, &patient_id)?;
            Ok(wallet::verify_ledger(conn, &patient_id)?)
        })
        .await?;
    Ok(Json(check))
}

#[derive(Debug, Deserialize)]
pub struct AdjustBody {
    pub amount: i64,
    pub description: String,
}

impl AdjustBody {
    fn validated_description(&self) -> Result<String, ApiError> {
        let description = self.description.trim();
        if description.is_empty() {
            return Err(ApiError::Validation("description is required".into()));
        }
        Ok(description.to_string())
    }
}

/// `POST /api/wallets/:patient_id/credit`
pub async fn credit(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(patient_id): Path<Uuid>,
    Json(body): Json<AdjustBody>,
) -> Result<Json<Wallet>, ApiError> {
    authorize(&actor, Action::AdjustWallet, Some(&patient_id))?;
    let description = body.validated_description()?;
    let wallet = ctx
        .blocking(move |_, conn| {
            require_patient(conn, &patient_id)?;
            let wallet = wallet::credit(conn, &patient_id, body.amount, &description, LedgerRefs::default())?;
            tracing::info!(patient_id = %patient_id, amount = body.amount, actor = %actor.id, "Manual wallet credit");
            Ok(wallet)
        })
        .await?;
    Ok(Json(wallet))
}

/// `POST /api/wallets/:patient_id/debit`
pub async fn debit(
    State(ctx): State<ApiContext>,
    Extension(actor): Extension<Actor>,
    Path(patient_id): Path<Uuid>,
    Json(body): Json<AdjustBody>,
) -> Result<Json<Wallet>, ApiError> {
    authorize(&actor, Action::AdjustWallet, Some(&patient_id))?;
    let description = body.validated_description()?;
    let wallet = ctx
        .blocking(move |_, conn| {
            require_patient(conn, &patient_id)?;
            let wallet = wallet::debit(conn, &patient_id, body.amount, &description, LedgerRefs::default())?;
            tracing::info!(patient_id = %patient_id, amount = body.amount, actor = %actor.id, "Manual wallet debit");
            Ok(wallet)
        })
        .await?;
    Ok(Json(wallet))
}

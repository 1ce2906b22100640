//! API error type and the single mapping from component errors to HTTP.
//!
//! Body shape: `{ "statusCode": 409, "message": "...", "errorKind": "Conflict" }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::appointment::AppointmentError;
use crate::authorization::AuthorizationError;
use crate::booking::BookingError;
use crate::core_state::CoreError;
use crate::db::DatabaseError;
use crate::gateway::GatewayError;
use crate::settlement::SettlementError;
use crate::wallet::WalletError;

/// Structured error response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status_code: u16,
    pub message: String,
    pub error_kind: &'static str,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },
    #[error("Gateway failure: {0}")]
    GatewayFailure(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::GatewayFailure(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Forbidden(_) => "Forbidden",
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::InvalidTransition(_) => "InvalidTransition",
            Self::InsufficientBalance { .. } => "InsufficientBalance",
            Self::GatewayFailure(_) => "GatewayFailure",
            Self::Internal(_) => "Internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                "An internal error occurred".to_string()
            }
            ApiError::Validation(m)
            | ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::InvalidTransition(m)
            | ApiError::GatewayFailure(m) => m.clone(),
            ApiError::InsufficientBalance { .. } => self.to_string(),
        };

        let body = ErrorBody {
            status_code: status.as_u16(),
            message,
            error_kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Database(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        DatabaseError::Sqlite(err).into()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { entity_type, id } => {
                ApiError::NotFound(format!("{entity_type} {id} not found"))
            }
            e if e.is_constraint_violation() => ApiError::Conflict(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<AuthorizationError> for ApiError {
    fn from(err: AuthorizationError) -> Self {
        ApiError::Forbidden(err.to_string())
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::GatewayFailure(err.to_string())
    }
}

impl From<WalletError> for ApiError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InvalidAmount(_) => ApiError::Validation(err.to_string()),
            WalletError::InsufficientBalance { available, requested } => {
                ApiError::InsufficientBalance { available, requested }
            }
            WalletError::Database(e) => e.into(),
        }
    }
}

impl From<AppointmentError> for ApiError {
    fn from(err: AppointmentError) -> Self {
        match err {
            AppointmentError::Validation(m) => ApiError::Validation(m),
            AppointmentError::NotFound(_) => ApiError::NotFound(err.to_string()),
            AppointmentError::SlotConflict { .. } | AppointmentError::ConcurrentModification(_) => {
                ApiError::Conflict(err.to_string())
            }
            AppointmentError::InvalidTransition { .. }
            | AppointmentError::InvalidPaymentState { .. } => {
                ApiError::InvalidTransition(err.to_string())
            }
            AppointmentError::Database(e) => e.into(),
        }
    }
}

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::Validation(m) => ApiError::Validation(m),
            SettlementError::NotFound(_) => ApiError::NotFound(err.to_string()),
            SettlementError::InsufficientBalance { available, requested } => {
                ApiError::InsufficientBalance { available, requested }
            }
            SettlementError::InvalidState { .. } => ApiError::InvalidTransition(err.to_string()),
            SettlementError::DuplicatePayment(_) => ApiError::Conflict(err.to_string()),
            SettlementError::Gateway(e) => e.into(),
            SettlementError::Database(e) => e.into(),
        }
    }
}

impl From<BookingError> for ApiError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::Validation(m) => ApiError::Validation(m),
            BookingError::NotFound(m) => ApiError::NotFound(format!("{m} not found")),
            BookingError::Appointment(e) => e.into(),
            BookingError::Settlement(e) => e.into(),
            BookingError::Database(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use uuid::Uuid;

    use crate::models::enums::AppointmentStatus;

    async fn body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 4096).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn body_has_status_message_and_kind() {
        let response = ApiError::NotFound("Appointment X".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body(response).await;
        assert_eq!(json["statusCode"], 404);
        assert_eq!(json["message"], "Appointment X");
        assert_eq!(json["errorKind"], "NotFound");
    }

    #[tokio::test]
    async fn internal_hides_detail() {
        let response = ApiError::Internal("disk on fire".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body(response).await;
        assert_eq!(json["message"], "An internal error occurred");
    }

    #[tokio::test]
    async fn insufficient_balance_is_422() {
        let err: ApiError = WalletError::InsufficientBalance {
            available: 100,
            requested: 300,
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body(response).await;
        assert_eq!(json["errorKind"], "InsufficientBalance");
        assert!(json["message"].as_str().unwrap().contains("300"));
    }

    #[test]
    fn appointment_errors_map_by_kind() {
        let conflict: ApiError = AppointmentError::SlotConflict {
            conflicting_ref: "APT1".into(),
        }
        .into();
        assert_eq!(conflict.kind(), "Conflict");

        let transition: ApiError = AppointmentError::InvalidTransition {
            current: AppointmentStatus::Completed,
            operation: crate::appointment::Operation::Cancel,
        }
        .into();
        assert_eq!(transition.kind(), "InvalidTransition");
        assert_eq!(transition.status(), StatusCode::CONFLICT);
        assert!(transition.to_string().contains("completed"));

        let stale: ApiError = AppointmentError::ConcurrentModification(Uuid::new_v4()).into();
        assert_eq!(stale.kind(), "Conflict");
    }

    #[test]
    fn settlement_gateway_failure_is_502() {
        let err: ApiError = SettlementError::Gateway(GatewayError::Timeout(15)).into();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.kind(), "GatewayFailure");
    }

    #[test]
    fn database_not_found_maps_to_404() {
        let err: ApiError = DatabaseError::not_found("Wallet", "p-1").into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}

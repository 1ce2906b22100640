//! Fire-and-forget notifications sent after successful transitions.
//!
//! A failed notification never undoes the state change that triggered it:
//! [`dispatch`] logs the error and returns.

use std::path::PathBuf;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::db::{self, repository, DatabaseError};
use crate::models::enums::NotificationKind;
use crate::models::Notification;

pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: &str, kind: NotificationKind, payload: Value) -> Result<(), DatabaseError>;
}

/// Persists notifications to the `notifications` table for the user's inbox.
pub struct StoredNotifier {
    db_path: PathBuf,
}

impl StoredNotifier {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }
}

fn title_for(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::AppointmentConfirmed => "Appointment confirmed",
        NotificationKind::AppointmentCancelled => "Appointment cancelled",
        NotificationKind::PaymentReceived => "Payment received",
        NotificationKind::RefundProcessed => "Refund processed",
    }
}

fn body_for(kind: NotificationKind, payload: &Value) -> String {
    let field = |name: &str| {
        payload
            .get(name)
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .unwrap_or_default()
    };
    match kind {
        NotificationKind::AppointmentConfirmed => {
            format!("Your appointment {} has been confirmed.", field("appointmentRef"))
        }
        NotificationKind::AppointmentCancelled => {
            format!("Your appointment {} has been cancelled.", field("appointmentRef"))
        }
        NotificationKind::PaymentReceived => {
            format!("We received your payment of {}.", field("amount"))
        }
        NotificationKind::RefundProcessed => format!(
            "A refund of {} was issued: {} to your wallet, {} to your original payment method.",
            field("refundAmount"),
            field("walletRefundAmount"),
            field("gatewayRefundAmount")
        ),
    }
}

impl Notifier for StoredNotifier {
    fn notify(&self, user_id: &str, kind: NotificationKind, payload: Value) -> Result<(), DatabaseError> {
        let conn = db::open_database(&self.db_path)?;
        repository::insert_notification(
            &conn,
            &Notification {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                kind,
                title: title_for(kind).to_string(),
                body: body_for(kind, &payload),
                data: Some(payload),
                is_read: false,
                created_at: Utc::now(),
            },
        )
    }
}

/// Only traces. Useful when no inbox is wanted.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, user_id: &str, kind: NotificationKind, payload: Value) -> Result<(), DatabaseError> {
        tracing::info!(user_id, kind = kind.as_str(), %payload, "Notification");
        Ok(())
    }
}

/// Send and forget. Errors are logged, never returned.
pub fn dispatch(notifier: &dyn Notifier, user_id: &str, kind: NotificationKind, payload: Value) {
    if let Err(e) = notifier.notify(user_id, kind, payload) {
        tracing::warn!(user_id, kind = kind.as_str(), error = %e, "Notification dispatch failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Failing;

    impl Notifier for Failing {
        fn notify(&self, _: &str, _: NotificationKind, _: Value) -> Result<(), DatabaseError> {
            Err(DatabaseError::ConstraintViolation("inbox down".into()))
        }
    }

    #[test]
    fn stored_notifier_writes_inbox_row() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("n.db");
        let notifier = StoredNotifier::new(path.clone());
        dispatch(
            &notifier,
            "user-1",
            NotificationKind::AppointmentConfirmed,
            json!({ "appointmentRef": "APT123" }),
        );

        let conn = db::open_database(&path).unwrap();
        let inbox = repository::list_notifications(&conn, "user-1", true).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].title, "Appointment confirmed");
        assert!(inbox[0].body.contains("APT123"));
    }

    #[test]
    fn refund_body_lists_both_shares() {
        let body = body_for(
            NotificationKind::RefundProcessed,
            &json!({ "refundAmount": 1000, "walletRefundAmount": 100, "gatewayRefundAmount": 900 }),
        );
        assert!(body.contains("1000"));
        assert!(body.contains("100 to your wallet"));
        assert!(body.contains("900"));
    }

    #[test]
    fn dispatch_swallows_failures() {
        dispatch(&Failing, "user-1", NotificationKind::PaymentReceived, json!({}));
        dispatch(&LogNotifier, "user-1", NotificationKind::PaymentReceived, json!({}));
    }
}

//! HTTP router.
//!
//! Returns a composable `Router` with every route under `/api/`.
//!
//! Middleware stack (outermost → innermost):
//! - protected routes: Actor resolver → Audit logger
//! - gateway webhook: Signature verifier → Audit logger
//! - health: Audit logger only

use std::sync::Arc;

use axum::http::{header, HeaderValue};
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::api::endpoints::{appointments, health, payments, wallets};
use crate::api::middleware;
use crate::api::types::ApiContext;
use crate::core_state::CoreState;

/// Build the API router.
///
/// Middleware uses `Extension<ApiContext>` (injected as the outermost layer).
/// Endpoint handlers use `State<ApiContext>` (provided via `with_state`).
pub fn api_router(core: Arc<CoreState>) -> Router {
    build_router(ApiContext::new(core))
}

fn build_router(ctx: ApiContext) -> Router {
    // Layers apply bottom-up: Extension ends up outermost so every
    // middleware can read ApiContext.
    let protected = Router::new()
        .route(
            "/appointments",
            post(appointments::create).get(appointments::list),
        )
        .route(
            "/appointments/ref/:appointment_ref",
            get(appointments::get_by_ref),
        )
        .route("/appointments/:id", get(appointments::get))
        .route("/appointments/:id/history", get(appointments::history))
        .route("/appointments/:id/payments", get(payments::for_appointment))
        .route("/appointments/:id/confirm", patch(appointments::confirm))
        .route("/appointments/:id/checkin", patch(appointments::check_in))
        .route("/appointments/:id/vitals", patch(appointments::record_vitals))
        .route("/appointments/:id/complete", patch(appointments::complete))
        .route("/appointments/:id/cancel", patch(appointments::cancel))
        .route("/appointments/:id/no-show", patch(appointments::no_show))
        .route(
            "/appointments/:id/reschedule",
            post(appointments::reschedule),
        )
        .route("/practitioners/:id/schedule", get(appointments::schedule))
        .route(
            "/patients/:patient_id/appointments/upcoming",
            get(appointments::upcoming),
        )
        .route(
            "/patients/:patient_id/payments",
            get(payments::patient_history),
        )
        .route("/payments/process", post(payments::process))
        .route("/payments/reconcile", post(payments::reconcile))
        .route(
            "/payments/transaction/:transaction_id",
            get(payments::by_transaction),
        )
        .route("/payments/:id", get(payments::get))
        .route("/payments/:id/refund", post(payments::refund))
        .route("/wallets/:patient_id", get(wallets::get))
        .route(
            "/wallets/:patient_id/transactions",
            get(wallets::transactions),
        )
        .route(
            "/wallets/:patient_id/ledger-check",
            get(wallets::ledger_check),
        )
        .route("/wallets/:patient_id/credit", post(wallets::credit))
        .route("/wallets/:patient_id/debit", post(wallets::debit))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::audit::log_access))
        .layer(axum::middleware::from_fn(middleware::actor::require_actor))
        .layer(axum::Extension(ctx.clone()));

    let webhook = Router::new()
        .route("/payments/verify", post(payments::verify))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::audit::log_access))
        .layer(axum::middleware::from_fn(
            middleware::signature::verify_signature,
        ))
        .layer(axum::Extension(ctx.clone()));

    let public = Router::new()
        .route("/health", get(health::check))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::audit::log_access))
        .layer(axum::Extension(ctx));

    Router::new()
        .nest("/api", protected.merge(webhook).merge(public))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::api::middleware::signature::sign;
    use crate::api::types::{
        ACTOR_ID_HEADER, ACTOR_ROLE_HEADER, PATIENT_ID_HEADER, SIGNATURE_HEADER,
    };
    use crate::appointment::tests::{seed_directory, Fixture};
    use crate::config::AppConfig;
    use crate::core_state::AccessSource;
    use crate::db::sqlite::open_database;
    use crate::gateway::SandboxGateway;
    use crate::notification::StoredNotifier;

    const SECRET: &str = "whsec-test";

    struct TestApp {
        _dir: tempfile::TempDir,
        core: Arc<CoreState>,
        f: Fixture,
    }

    fn test_app(webhook_secret: Option<&str>) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.db");
        let conn = open_database(&path).unwrap();
        let f = seed_directory(&conn);
        drop(conn);

        let mut config = AppConfig::for_db(path.clone());
        config.webhook_secret = webhook_secret.map(str::to_string);
        let core = Arc::new(CoreState::with_collaborators(
            config,
            Arc::new(SandboxGateway::new()),
            Arc::new(StoredNotifier::new(path)),
        ));
        TestApp { _dir: dir, core, f }
    }

    enum Caller {
        Nobody,
        Staff(&'static str),
        Patient(Uuid),
    }

    fn request(method: &str, uri: &str, caller: Caller, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        match caller {
            Caller::Nobody => {}
            Caller::Staff(role) => {
                builder = builder
                    .header(ACTOR_ID_HEADER, format!("{role}-1"))
                    .header(ACTOR_ROLE_HEADER, role);
            }
            Caller::Patient(id) => {
                builder = builder
                    .header(ACTOR_ID_HEADER, "patient-user")
                    .header(ACTOR_ROLE_HEADER, "patient")
                    .header(PATIENT_ID_HEADER, id.to_string());
            }
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, Value) {
        let response = api_router(app.core.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn booking_body(f: &Fixture, start: &str, end: &str) -> Value {
        json!({
            "patient_id": f.patient,
            "practitioner_id": f.practitioner,
            "hospital_id": f.hospital,
            "date": "2030-03-04",
            "start": start,
            "end": end,
        })
    }

    async fn book(app: &TestApp) -> Value {
        let (status, body) = send(
            app,
            request(
                "POST",
                "/api/appointments",
                Caller::Patient(app.f.patient),
                Some(booking_body(&app.f, "2030-03-04T10:00:00Z", "2030-03-04T10:30:00Z")),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body
    }

    fn webhook(body: &Value, signature: Option<String>) -> Request<Body> {
        let raw = body.to_string();
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/payments/verify")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        builder.body(Body::from(raw)).unwrap()
    }

    /// Book, pay fully through the gateway, settle via signed webhook.
    async fn book_and_settle(app: &TestApp) -> (String, Value) {
        let appt = book(app).await;
        let id = appt["id"].as_str().unwrap().to_string();

        let (status, outcome) = send(
            app,
            request(
                "POST",
                "/api/payments/process",
                Caller::Patient(app.f.patient),
                Some(json!({ "appointment_id": id })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{outcome}");
        assert_eq!(outcome["payment"]["status"], "processing");
        let txn = outcome["payment"]["transaction_id"].as_str().unwrap().to_string();

        let callback = json!({ "transactionId": txn, "success": true });
        let sig = sign(SECRET, callback.to_string().as_bytes());
        let (status, payment) = send(app, webhook(&callback, sig)).await;
        assert_eq!(status, StatusCode::OK, "{payment}");
        assert_eq!(payment["status"], "completed");
        (id, payment)
    }

    #[tokio::test]
    async fn health_needs_no_actor() {
        let app = test_app(None);
        let response = api_router(app.core.clone())
            .oneshot(request("GET", "/api/health", Caller::Nobody, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );

        let entries = app.core.audit_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, AccessSource::Anonymous);
        assert_eq!(entries[0].action, "GET /api/health");
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let app = test_app(None);
        let (status, body) = send(&app, request("GET", "/api/appointments", Caller::Nobody, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["statusCode"], 401);
        assert_eq!(body["errorKind"], "Unauthorized");
        assert!(body["message"].as_str().unwrap().contains(ACTOR_ID_HEADER));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app = test_app(None);
        let (status, _) = send(&app, request("GET", "/nowhere", Caller::Nobody, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn book_pay_settle_confirm() {
        let app = test_app(Some(SECRET));
        let (id, _) = book_and_settle(&app).await;

        let (status, appt) = send(
            &app,
            request(
                "PATCH",
                &format!("/api/appointments/{id}/confirm"),
                Caller::Staff("receptionist"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{appt}");
        assert_eq!(appt["status"], "confirmed");
        assert_eq!(appt["payment_status"], "paid");

        let (status, history) = send(
            &app,
            request(
                "GET",
                &format!("/api/appointments/{id}/history"),
                Caller::Patient(app.f.patient),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(history.as_array().unwrap().len() >= 2);

        let webhook_audited = app
            .core
            .audit_entries()
            .iter()
            .any(|e| e.source == AccessSource::Webhook && e.action == "POST /api/payments/verify");
        assert!(webhook_audited);
    }

    #[tokio::test]
    async fn overlapping_booking_conflicts() {
        let app = test_app(None);
        book(&app).await;

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/appointments",
                Caller::Staff("receptionist"),
                Some(booking_body(&app.f, "2030-03-04T10:15:00Z", "2030-03-04T10:45:00Z")),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errorKind"], "Conflict");
    }

    #[tokio::test]
    async fn confirm_before_payment_is_invalid_transition() {
        let app = test_app(None);
        let appt = book(&app).await;
        let (status, body) = send(
            &app,
            request(
                "PATCH",
                &format!("/api/appointments/{}/confirm", appt["id"].as_str().unwrap()),
                Caller::Staff("owner"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errorKind"], "InvalidTransition");
    }

    #[tokio::test]
    async fn role_policy_is_enforced() {
        let app = test_app(None);
        let appt = book(&app).await;

        let (status, body) = send(
            &app,
            request(
                "PATCH",
                &format!("/api/appointments/{}/confirm", appt["id"].as_str().unwrap()),
                Caller::Staff("nurse"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["errorKind"], "Forbidden");
    }

    #[tokio::test]
    async fn patients_cannot_read_other_wallets() {
        let app = test_app(None);
        let uri = format!("/api/wallets/{}", app.f.patient);

        let (status, _) = send(&app, request("GET", &uri, Caller::Patient(Uuid::new_v4()), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, wallet) = send(&app, request("GET", &uri, Caller::Patient(app.f.patient), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(wallet["balance"], 0);
    }

    #[tokio::test]
    async fn wallet_adjustments_and_overdraft() {
        let app = test_app(None);
        let base = format!("/api/wallets/{}", app.f.patient);

        let (status, wallet) = send(
            &app,
            request(
                "POST",
                &format!("{base}/credit"),
                Caller::Staff("owner"),
                Some(json!({ "amount": 500, "description": "goodwill" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{wallet}");
        assert_eq!(wallet["balance"], 500);

        let (status, body) = send(
            &app,
            request(
                "POST",
                &format!("{base}/debit"),
                Caller::Staff("owner"),
                Some(json!({ "amount": 800, "description": "correction" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["errorKind"], "InsufficientBalance");

        let (status, _) = send(
            &app,
            request(
                "POST",
                &format!("{base}/credit"),
                Caller::Staff("receptionist"),
                Some(json!({ "amount": 10, "description": "nope" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, check) = send(
            &app,
            request("GET", &format!("{base}/ledger-check"), Caller::Staff("owner"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(check["consistent"], true);
    }

    #[tokio::test]
    async fn webhook_requires_valid_signature() {
        let app = test_app(Some(SECRET));
        let callback = json!({ "transactionId": "TXN-unknown", "success": true });

        let (status, _) = send(&app, webhook(&callback, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = sign("other-secret", callback.to_string().as_bytes());
        let (status, _) = send(&app, webhook(&callback, wrong)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Correctly signed, but no such transaction.
        let good = sign(SECRET, callback.to_string().as_bytes());
        let (status, body) = send(&app, webhook(&callback, good)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
    }

    #[tokio::test]
    async fn webhook_rejected_without_configured_secret() {
        let app = test_app(None);
        let callback = json!({ "transactionId": "TXN1", "success": true });
        let sig = sign(SECRET, callback.to_string().as_bytes());
        let (status, _) = send(&app, webhook(&callback, sig)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cancelling_paid_appointment_splits_refund() {
        let app = test_app(Some(SECRET));
        let (id, _) = book_and_settle(&app).await;

        let (status, outcome) = send(
            &app,
            request(
                "PATCH",
                &format!("/api/appointments/{id}/cancel"),
                Caller::Patient(app.f.patient),
                Some(json!({ "reason": "travel" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{outcome}");
        assert_eq!(outcome["appointment"]["status"], "cancelled");
        let refund = &outcome["refund"]["refund"];
        assert_eq!(refund["refund_amount"], 1000);
        assert_eq!(refund["wallet_refund_amount"], 100);
        assert_eq!(refund["gateway_refund_amount"], 900);

        let (status, wallet) = send(
            &app,
            request(
                "GET",
                &format!("/api/wallets/{}", app.f.patient),
                Caller::Patient(app.f.patient),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(wallet["balance"], 100);

        let (status, payments) = send(
            &app,
            request(
                "GET",
                &format!("/api/appointments/{id}/payments"),
                Caller::Staff("receptionist"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payments.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_rejects_out_of_range_age() {
        let app = test_app(None);
        // Too large for a duration, then too far back for the calendar.
        for minutes in [i64::MAX, 200_000_000_000] {
            let (status, body) = send(
                &app,
                request(
                    "POST",
                    "/api/payments/reconcile",
                    Caller::Staff("owner"),
                    Some(json!({ "older_than_minutes": minutes })),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{minutes}");
            assert_eq!(body["errorKind"], "ValidationError");
        }

        let (status, _) = send(
            &app,
            request("POST", "/api/payments/reconcile", Caller::Staff("owner"), Some(json!({}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_appointment_is_not_found() {
        let app = test_app(None);
        let (status, body) = send(
            &app,
            request(
                "GET",
                &format!("/api/appointments/{}", Uuid::new_v4()),
                Caller::Staff("doctor"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errorKind"], "NotFound");
    }
}

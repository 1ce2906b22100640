//! Audit logging middleware.
//!
//! Logs every API request with actor, method, path, and response status.
//! Runs innermost, after the actor or webhook signature has been resolved.

use axum::extract::OriginalUri;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::api::middleware::signature::WebhookCall;
use crate::api::types::ApiContext;
use crate::authorization::Actor;
use crate::core_state::AccessSource;

/// Log API access for audit trail.
/// Accesses `ApiContext` from request extensions.
pub async fn log_access(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let ctx = req.extensions().get::<ApiContext>().cloned();

    let source = if let Some(actor) = req.extensions().get::<Actor>() {
        AccessSource::Api {
            actor_id: actor.id.clone(),
            role: actor.role,
        }
    } else if req.extensions().get::<WebhookCall>().is_some() {
        AccessSource::Webhook
    } else {
        AccessSource::Anonymous
    };

    let response = next.run(req).await;

    if let Some(ctx) = ctx {
        let status = response.status().as_u16();
        ctx.core
            .log_access(source, &format!("{method} {path}"), &format!("status:{status}"));
    }

    response
}

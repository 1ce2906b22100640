//! Actor resolution middleware.
//!
//! Reads `X-Actor-Id`, `X-Actor-Role` and `X-Patient-Id` set by the upstream
//! identity proxy and injects an [`Actor`] into request extensions for
//! downstream handlers. Requests without a resolvable actor get 401.

use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::types::actor_from_headers;
use crate::authorization::Actor;

/// Require actor headers on every request.
pub async fn require_actor(mut req: Request<axum::body::Body>, next: Next) -> Response {
    let actor: Actor = match actor_from_headers(req.headers()) {
        Ok(actor) => actor,
        Err(err) => {
            tracing::debug!(error = %err, "Request rejected: no actor");
            return err.into_response();
        }
    };
    req.extensions_mut().insert(actor);
    next.run(req).await
}

//! Gateway webhook signature middleware.
//!
//! The webhook is unauthenticated: the provider proves itself by sending
//! `X-Gateway-Signature`, the hex HMAC-SHA256 of the raw request body keyed
//! with the shared webhook secret. Without a configured secret every webhook
//! is rejected.

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, SIGNATURE_HEADER};

type HmacSha256 = Hmac<Sha256>;

/// Webhook bodies are small JSON documents.
const MAX_WEBHOOK_BODY_BYTES: usize = 64 * 1024;

/// Marker injected once a webhook signature has been verified.
#[derive(Debug, Clone, Copy)]
pub struct WebhookCall;

/// Lowercase hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect(),
    )
}

/// Constant-time check of a hex signature (case-insensitive).
pub fn verify(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Some(expected) = sign(secret, body) else {
        return false;
    };
    let provided = signature_hex.trim().to_ascii_lowercase();
    expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1
}

pub async fn verify_signature(req: Request<Body>, next: Next) -> Response {
    match verify_signature_inner(req, next).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn verify_signature_inner(req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let ctx: ApiContext = req
        .extensions()
        .get::<ApiContext>()
        .cloned()
        .ok_or(ApiError::Internal("missing API context".into()))?;

    let Some(secret) = ctx.core.config().webhook_secret.clone() else {
        tracing::warn!("Webhook rejected: no webhook secret configured");
        return Err(ApiError::Unauthorized("webhook not configured".into()));
    };

    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {SIGNATURE_HEADER} header")))?;

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_WEBHOOK_BODY_BYTES)
        .await
        .map_err(|_| ApiError::Validation("webhook body too large".into()))?;

    if !verify(&secret, &bytes, &signature) {
        tracing::warn!("Webhook rejected: signature mismatch");
        return Err(ApiError::Unauthorized("invalid webhook signature".into()));
    }

    let mut req = Request::from_parts(parts, Body::from(bytes));
    req.extensions_mut().insert(WebhookCall);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let body = br#"{"transaction_id":"TXN1","success":true}"#;
        let sig = sign("s3cret", body).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(verify("s3cret", body, &sig));
        assert!(verify("s3cret", body, &sig.to_uppercase()));
    }

    #[test]
    fn tampered_body_or_wrong_secret_fails() {
        let body = br#"{"success":true}"#;
        let sig = sign("s3cret", body).unwrap();
        assert!(!verify("s3cret", br#"{"success":false}"#, &sig));
        assert!(!verify("other", body, &sig));
        assert!(!verify("s3cret", body, "not-hex"));
    }
}

//! Shared types for the API layer.

use std::sync::Arc;

use axum::http::HeaderMap;
use rusqlite::Connection;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::authorization::Actor;
use crate::core_state::CoreState;
use crate::models::enums::Role;

pub const ACTOR_ID_HEADER: &str = "X-Actor-Id";
pub const ACTOR_ROLE_HEADER: &str = "X-Actor-Role";
pub const PATIENT_ID_HEADER: &str = "X-Patient-Id";
pub const SIGNATURE_HEADER: &str = "X-Gateway-Signature";

// ═══════════════════════════════════════════════════════════
// API context: shared state for the router
// ═══════════════════════════════════════════════════════════

/// Shared context for all API routes and middleware.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Self {
        Self { core }
    }

    /// Run blocking domain work on the blocking pool with a fresh connection.
    ///
    /// The domain layer is synchronous (SQLite, blocking gateway client),
    /// so handlers never touch it from an async task directly.
    pub async fn blocking<T, F>(&self, work: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&CoreState, &mut Connection) -> Result<T, ApiError> + Send + 'static,
    {
        let core = self.core.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = core.open_db()?;
            work(&core, &mut conn)
        })
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
    }
}

// ═══════════════════════════════════════════════════════════
// Actor context: injected by the actor middleware
// ═══════════════════════════════════════════════════════════

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the calling actor from identity headers set by the upstream proxy.
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let id = header(headers, ACTOR_ID_HEADER)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {ACTOR_ID_HEADER} header")))?;
    let role_raw = header(headers, ACTOR_ROLE_HEADER)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {ACTOR_ROLE_HEADER} header")))?;
    let role: Role = role_raw
        .parse()
        .map_err(|_| ApiError::Unauthorized(format!("unknown role '{role_raw}'")))?;

    let patient_id = match header(headers, PATIENT_ID_HEADER) {
        None => None,
        Some(raw) => Some(
            Uuid::parse_str(raw)
                .map_err(|_| ApiError::Unauthorized(format!("malformed {PATIENT_ID_HEADER} header")))?,
        ),
    };
    if role == Role::Patient && patient_id.is_none() {
        return Err(ApiError::Unauthorized(format!(
            "patient actors must send {PATIENT_ID_HEADER}"
        )));
    }

    Ok(Actor {
        id: id.to_string(),
        role,
        patient_id,
    })
}

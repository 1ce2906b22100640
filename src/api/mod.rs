//! HTTP API.
//!
//! Exposes booking, payment, and wallet operations as JSON endpoints under
//! `/api/`. Callers identify themselves through proxy-asserted identity
//! headers; the payment provider's webhook is authenticated by HMAC
//! signature instead.
//!
//! The router is composable: `api_router()` returns a `Router` that can be
//! mounted on any axum server instance.

pub mod endpoints;
pub mod error;
pub mod middleware;
pub mod router;
pub mod server;
pub mod types;

pub use router::api_router;
pub use server::{start_api_server, ApiServer, ApiSession};
pub use types::ApiContext;

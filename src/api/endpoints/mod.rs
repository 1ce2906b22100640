//! API endpoint handlers, one module per resource.
//!
//! Handlers authorize at the boundary, then run domain work on the
//! blocking pool through `ApiContext::blocking`.

pub mod appointments;
pub mod health;
pub mod payments;
pub mod wallets;

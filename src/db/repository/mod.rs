//! Repository layer: entity-scoped database operations.
//!
//! Free functions over a borrowed `Connection`, so callers choose whether they
//! run inside a transaction (pass `&Transaction`, which derefs) or not.

mod appointment;
mod audit;
mod directory;
mod notification;
mod payment;
mod wallet;

use uuid::Uuid;

use super::DatabaseError;

pub use appointment::*;
pub use audit::*;
pub use directory::*;
pub use notification::*;
pub use payment::*;
pub use wallet::*;

pub(crate) fn parse_uuid(field: &str, raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|_| DatabaseError::InvalidValue {
        field: field.into(),
        value: raw.into(),
    })
}

pub(crate) fn parse_opt_uuid(field: &str, raw: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    raw.map(|r| parse_uuid(field, &r)).transpose()
}

fn page_clause(limit: u32, skip: u32) -> String {
    format!("LIMIT {limit} OFFSET {skip}")
}

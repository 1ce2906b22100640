use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

use super::enums::{AppointmentStatus, PaymentStatus, TransactionType};

#[derive(Debug, Default, Clone, Deserialize)]
pub struct AppointmentFilter {
    pub patient_id: Option<Uuid>,
    pub practitioner_id: Option<Uuid>,
    pub hospital_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PaymentFilter {
    pub status: Option<PaymentStatus>,
    pub limit: Option<u32>,
    pub skip: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct TransactionFilter {
    #[serde(rename = "type")]
    pub tx_type: Option<TransactionType>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub limit: Option<u32>,
    pub skip: Option<u32>,
}

/// Default and ceiling for list page sizes.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

pub fn page_bounds(limit: Option<u32>, skip: Option<u32>) -> (u32, u32) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (limit, skip.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_bounds_defaults_and_clamps() {
        assert_eq!(page_bounds(None, None), (50, 0));
        assert_eq!(page_bounds(Some(0), Some(5)), (1, 5));
        assert_eq!(page_bounds(Some(10_000), None), (200, 0));
    }
}

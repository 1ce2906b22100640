use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::TransactionType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub patient_id: Uuid,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: i64,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub amount: i64,
    pub description: String,
    pub related_appointment_id: Option<Uuid>,
    pub related_payment_id: Option<Uuid>,
    pub balance_before: i64,
    pub balance_after: i64,
    pub date: DateTime<Utc>,
}

/// Optional references carried on a ledger entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerRefs {
    pub appointment_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
}

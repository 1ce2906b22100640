use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{GatewayRefundStatus, PaymentMethod, PaymentStatus, SagaState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub amount: i64,
    pub method: PaymentMethod,
    pub wallet_amount_used: i64,
    pub gateway_amount_paid: i64,
    pub status: PaymentStatus,
    pub saga_state: SagaState,
    /// Idempotency key shared with the gateway. Never changes.
    pub transaction_id: String,
    pub provider_transaction_id: Option<String>,
    pub checkout_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub refund: Option<RefundRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn is_active(&self) -> bool {
        self.status != PaymentStatus::Failed
    }
}

/// Refund bookkeeping written once by the refund operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub refund_amount: i64,
    pub wallet_refund_amount: i64,
    pub gateway_refund_amount: i64,
    pub gateway_refund_status: GatewayRefundStatus,
    pub gateway_refund_reference: Option<String>,
    pub gateway_refund_error: Option<String>,
    pub refund_reason: String,
    pub refunded_at: DateTime<Utc>,
    pub refunded_by: String,
}

use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(AppointmentStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    CheckedIn => "checked_in",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
    NoShow => "no_show",
    Rescheduled => "rescheduled",
});

impl AppointmentStatus {
    /// Terminal for the normal flow. Only reschedule leaves `no_show`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    /// Whether an appointment in this state holds its practitioner's slot.
    /// Completed visits keep their slot: they happened.
    pub fn occupies_slot(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::NoShow | Self::Rescheduled)
    }
}

str_enum!(AppointmentPaymentStatus {
    Pending => "pending",
    Paid => "paid",
    Refunded => "refunded",
    PartiallyRefunded => "partially_refunded",
});

str_enum!(AppointmentType {
    Consultation => "consultation",
    FollowUp => "follow_up",
    Emergency => "emergency",
    Checkup => "checkup",
});

str_enum!(PaymentStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Refunded => "refunded",
    PartiallyRefunded => "partially_refunded",
});

str_enum!(PaymentMethod {
    Gateway => "gateway",
    Wallet => "wallet",
    Mixed => "mixed",
});

impl PaymentMethod {
    /// Classify a payment by how much of it the wallet covers.
    pub fn classify(total: i64, wallet_amount: i64) -> Self {
        if wallet_amount == 0 {
            Self::Gateway
        } else if wallet_amount == total {
            Self::Wallet
        } else {
            Self::Mixed
        }
    }
}

str_enum!(SagaState {
    Pending => "pending",
    WalletReserved => "wallet_reserved",
    GatewayRequested => "gateway_requested",
    Completed => "completed",
    Compensating => "compensating",
    Failed => "failed",
});

impl SagaState {
    /// Public payment status for a saga step (before any refund).
    pub fn payment_status(&self) -> PaymentStatus {
        match self {
            Self::Pending | Self::WalletReserved => PaymentStatus::Pending,
            Self::GatewayRequested | Self::Compensating => PaymentStatus::Processing,
            Self::Completed => PaymentStatus::Completed,
            Self::Failed => PaymentStatus::Failed,
        }
    }
}

str_enum!(GatewayRefundStatus {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
});

str_enum!(TransactionType {
    Credit => "credit",
    Debit => "debit",
});

str_enum!(NotificationKind {
    AppointmentConfirmed => "appointment_confirmed",
    AppointmentCancelled => "appointment_cancelled",
    PaymentReceived => "payment_received",
    RefundProcessed => "refund_processed",
});

str_enum!(Role {
    SuperAdmin => "super_admin",
    Owner => "owner",
    Receptionist => "receptionist",
    Doctor => "doctor",
    Nurse => "nurse",
    Staff => "staff",
    Patient => "patient",
});

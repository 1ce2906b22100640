//! Role-based access policy.
//!
//! A single table maps `(Role, Action)` to allow/deny, evaluated once at the
//! API boundary. Default-deny. Patients are further restricted to their own
//! records: the target patient must match the actor's `patient_id`.

use serde::Serialize;
use uuid::Uuid;

use crate::models::enums::Role;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Who is calling. Identity is asserted by the upstream proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
    /// Set for patient actors: the patient record they own.
    pub patient_id: Option<Uuid>,
}

/// Every guarded operation exposed by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    BookAppointment,
    ViewAppointments,
    ViewSchedule,
    ConfirmAppointment,
    CheckIn,
    RecordVitals,
    CompleteAppointment,
    CancelAppointment,
    RescheduleAppointment,
    MarkNoShow,
    ProcessPayment,
    RefundPayment,
    ViewPayments,
    ReconcilePayments,
    ViewWallet,
    AdjustWallet,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BookAppointment => "book_appointment",
            Self::ViewAppointments => "view_appointments",
            Self::ViewSchedule => "view_schedule",
            Self::ConfirmAppointment => "confirm_appointment",
            Self::CheckIn => "check_in",
            Self::RecordVitals => "record_vitals",
            Self::CompleteAppointment => "complete_appointment",
            Self::CancelAppointment => "cancel_appointment",
            Self::RescheduleAppointment => "reschedule_appointment",
            Self::MarkNoShow => "mark_no_show",
            Self::ProcessPayment => "process_payment",
            Self::RefundPayment => "refund_payment",
            Self::ViewPayments => "view_payments",
            Self::ReconcilePayments => "reconcile_payments",
            Self::ViewWallet => "view_wallet",
            Self::AdjustWallet => "adjust_wallet",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("Role {role} may not {action}")]
    RoleDenied { role: Role, action: &'static str },

    #[error("Patients may only access their own records")]
    NotOwnRecord,
}

// ═══════════════════════════════════════════════════════════
// Policy
// ═══════════════════════════════════════════════════════════

/// The policy table.
pub fn is_allowed(role: Role, action: Action) -> bool {
    use Action::*;
    use Role::*;

    match action {
        BookAppointment | CancelAppointment | RescheduleAppointment => {
            matches!(role, Patient | Receptionist | Owner | SuperAdmin)
        }
        ViewAppointments => true,
        ViewSchedule => matches!(role, Patient | Doctor | Receptionist | Owner | SuperAdmin),
        ConfirmAppointment | MarkNoShow => matches!(role, Receptionist | Owner | SuperAdmin),
        CheckIn => matches!(role, Receptionist | Nurse | Owner | SuperAdmin),
        RecordVitals => matches!(role, Nurse | Doctor | Owner | SuperAdmin),
        CompleteAppointment => matches!(role, Doctor | Owner | SuperAdmin),
        ProcessPayment => matches!(role, Patient | Receptionist),
        RefundPayment => matches!(role, Receptionist | Owner | SuperAdmin),
        ViewPayments | ViewWallet => matches!(role, Patient | Receptionist | Owner | SuperAdmin),
        ReconcilePayments | AdjustWallet => matches!(role, Owner | SuperAdmin),
    }
}

/// Check the policy table and, for patient actors, record ownership.
///
/// `target_patient` is the patient whose data the action touches, when known.
pub fn authorize(
    actor: &Actor,
    action: Action,
    target_patient: Option<&Uuid>,
) -> Result<(), AuthorizationError> {
    if !is_allowed(actor.role, action) {
        tracing::warn!(
            actor = %actor.id,
            role = actor.role.as_str(),
            action = action.as_str(),
            "Access denied by role policy"
        );
        return Err(AuthorizationError::RoleDenied {
            role: actor.role,
            action: action.as_str(),
        });
    }
    ensure_own_record(actor, target_patient)
}

/// Patients may only touch their own records. Staff are unrestricted here.
pub fn ensure_own_record(actor: &Actor, target_patient: Option<&Uuid>) -> Result<(), AuthorizationError> {
    if actor.role != Role::Patient {
        return Ok(());
    }
    match (actor.patient_id.as_ref(), target_patient) {
        (_, None) => Ok(()),
        (Some(own), Some(target)) if own == target => Ok(()),
        _ => {
            tracing::warn!(actor = %actor.id, "Patient attempted access to another patient's record");
            Err(AuthorizationError::NotOwnRecord)
        }
    }
}

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{AppointmentPaymentStatus, AppointmentStatus, AppointmentType};

/// Half-open `[start, end)` interval a practitioner is committed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSlot {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Standard half-open overlap: touching slots do not conflict.
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloodPressure {
    pub systolic: u16,
    pub diastolic: u16,
}

/// Vitals captured at check-in or by the nurse before the consultation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Vitals {
    pub blood_pressure: Option<BloodPressure>,
    pub temperature: Option<f64>,
    pub heart_rate: Option<u16>,
    pub weight: Option<f64>,
    pub height: Option<f64>,
    pub oxygen_saturation: Option<f64>,
    pub notes: Option<String>,
    pub recorded_by: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prescription {
    pub medicine_name: String,
    pub dosage: String,
    pub frequency: String,
    pub duration: String,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    /// Human-referenceable id (`APT…`).
    pub appointment_ref: String,
    pub patient_id: Uuid,
    pub practitioner_id: Uuid,
    pub hospital_id: Uuid,
    pub department_id: Option<Uuid>,
    pub previous_appointment_id: Option<Uuid>,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub status: AppointmentStatus,
    pub payment_status: AppointmentPaymentStatus,
    pub payment_amount: i64,
    pub wallet_credit_used: i64,
    pub transaction_id: Option<String>,
    pub appointment_type: Option<AppointmentType>,
    pub chief_complaint: Option<String>,
    pub estimated_duration_minutes: Option<u32>,
    pub is_urgent: bool,
    pub vitals: Option<Vitals>,
    pub checkup_notes: Option<String>,
    pub diagnosis: Option<String>,
    pub prescriptions: Vec<Prescription>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub cancellation_reason: Option<String>,
    /// Optimistic concurrency revision, bumped on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated booking input, ready to be placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAppointment {
    pub patient_id: Uuid,
    pub practitioner_id: Uuid,
    pub hospital_id: Uuid,
    pub department_id: Option<Uuid>,
    pub previous_appointment_id: Option<Uuid>,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub payment_amount: i64,
    pub appointment_type: Option<AppointmentType>,
    pub chief_complaint: Option<String>,
    pub estimated_duration_minutes: Option<u32>,
    pub is_urgent: bool,
}

/// One row of an appointment's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentEvent {
    pub from_status: Option<AppointmentStatus>,
    pub to_status: AppointmentStatus,
    pub operation: String,
    pub actor: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, h, m, 0).unwrap()
    }

    #[test]
    fn slot_requires_start_before_end() {
        assert!(TimeSlot::new(at(10, 0), at(10, 30)).is_some());
        assert!(TimeSlot::new(at(10, 30), at(10, 30)).is_none());
        assert!(TimeSlot::new(at(11, 0), at(10, 30)).is_none());
    }

    #[test]
    fn overlap_is_half_open() {
        let a = TimeSlot::new(at(10, 0), at(10, 30)).unwrap();
        let b = TimeSlot::new(at(10, 15), at(10, 45)).unwrap();
        let c = TimeSlot::new(at(10, 30), at(11, 0)).unwrap();
        let inner = TimeSlot::new(at(10, 5), at(10, 10)).unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c), "back-to-back slots must not conflict");
        assert!(a.overlaps(&inner));
        assert!(inner.overlaps(&a));
    }
}

//! Slot conflict checking for a practitioner's time.
//!
//! Appointments hold `[start, end)`. Two slots conflict when
//! `existing.start < new.end && existing.end > new.start`. Cancelled and
//! no-show appointments release their slot; every other status, including
//! `completed`, keeps it.

use rusqlite::Connection;
use uuid::Uuid;

use crate::db::repository::{self, SlotOccupant};
use crate::db::DatabaseError;
use crate::models::TimeSlot;

/// Appointments of the practitioner that still hold part of `slot`.
pub fn conflicting_appointments(
    conn: &Connection,
    practitioner_id: &Uuid,
    slot: &TimeSlot,
    exclude_appointment_id: Option<&Uuid>,
) -> Result<Vec<SlotOccupant>, DatabaseError> {
    let overlapping = repository::find_overlapping(conn, practitioner_id, slot, exclude_appointment_id)?;
    Ok(overlapping
        .into_iter()
        .filter(|o| o.status.occupies_slot() && o.time_slot.overlaps(slot))
        .collect())
}

pub fn is_available(
    conn: &Connection,
    practitioner_id: &Uuid,
    slot: &TimeSlot,
    exclude_appointment_id: Option<&Uuid>,
) -> Result<bool, DatabaseError> {
    Ok(conflicting_appointments(conn, practitioner_id, slot, exclude_appointment_id)?.is_empty())
}

/// Like [`is_available`], but returns the first conflicting appointment's
/// external id so callers can report it.
///
/// Must run inside the same immediate transaction as the write that claims
/// the slot, otherwise two bookings can both pass.
pub fn first_conflict(
    conn: &Connection,
    practitioner_id: &Uuid,
    slot: &TimeSlot,
    exclude_appointment_id: Option<&Uuid>,
) -> Result<Option<String>, DatabaseError> {
    Ok(conflicting_appointments(conn, practitioner_id, slot, exclude_appointment_id)?
        .into_iter()
        .next()
        .map(|o| o.appointment_ref))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::models::enums::*;
    use crate::models::*;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, h, m, 0).unwrap()
    }

    fn slot(h1: u32, m1: u32, h2: u32, m2: u32) -> TimeSlot {
        TimeSlot::new(at(h1, m1), at(h2, m2)).unwrap()
    }

    /// Seeds one practitioner with a single 10:00-10:30 appointment in `status`.
    fn setup(status: AppointmentStatus) -> (Connection, Uuid, Uuid) {
        let conn = open_memory_database().unwrap();
        let hospital = Uuid::new_v4();
        repository::insert_hospital(&conn, &Hospital {
            id: hospital,
            name: "General".into(),
            address: None,
            is_active: true,
        })
        .unwrap();
        let practitioner = Uuid::new_v4();
        repository::insert_practitioner(&conn, &Practitioner {
            id: practitioner,
            hospital_id: hospital,
            department_id: None,
            name: "Dr. D".into(),
            specialty: None,
            consultation_fee: 1000,
            is_active: true,
        })
        .unwrap();
        let patient = Uuid::new_v4();
        repository::insert_patient(&conn, &Patient {
            id: patient,
            user_id: "u".into(),
            name: "P".into(),
            phone: None,
        })
        .unwrap();

        let now = at(8, 0);
        let id = Uuid::new_v4();
        repository::insert_appointment(&conn, &Appointment {
            id,
            appointment_ref: "APT-EXISTING".into(),
            patient_id: patient,
            practitioner_id: practitioner,
            hospital_id: hospital,
            department_id: None,
            previous_appointment_id: None,
            date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            time_slot: slot(10, 0, 10, 30),
            status,
            payment_status: AppointmentPaymentStatus::Pending,
            payment_amount: 1000,
            wallet_credit_used: 0,
            transaction_id: None,
            appointment_type: None,
            chief_complaint: None,
            estimated_duration_minutes: None,
            is_urgent: false,
            vitals: None,
            checkup_notes: None,
            diagnosis: None,
            prescriptions: Vec::new(),
            confirmed_at: None,
            checked_in_at: None,
            completed_at: None,
            cancelled_at: None,
            cancelled_by: None,
            cancellation_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
        .unwrap();
        (conn, practitioner, id)
    }

    #[test]
    fn partial_overlap_conflicts() {
        let (conn, prac, _) = setup(AppointmentStatus::Pending);
        assert!(!is_available(&conn, &prac, &slot(10, 15, 10, 45), None).unwrap());
        assert!(!is_available(&conn, &prac, &slot(9, 45, 10, 15), None).unwrap());
        assert_eq!(
            first_conflict(&conn, &prac, &slot(10, 15, 10, 45), None).unwrap().as_deref(),
            Some("APT-EXISTING")
        );
    }

    #[test]
    fn containment_conflicts_both_ways() {
        let (conn, prac, _) = setup(AppointmentStatus::Confirmed);
        assert!(!is_available(&conn, &prac, &slot(10, 5, 10, 10), None).unwrap());
        assert!(!is_available(&conn, &prac, &slot(9, 0, 11, 0), None).unwrap());
    }

    #[test]
    fn adjacent_slots_are_free() {
        let (conn, prac, _) = setup(AppointmentStatus::Confirmed);
        assert!(is_available(&conn, &prac, &slot(10, 30, 11, 0), None).unwrap());
        assert!(is_available(&conn, &prac, &slot(9, 30, 10, 0), None).unwrap());
    }

    #[test]
    fn released_statuses_do_not_block() {
        for status in [AppointmentStatus::Cancelled, AppointmentStatus::NoShow] {
            let (conn, prac, _) = setup(status);
            assert!(is_available(&conn, &prac, &slot(10, 0, 10, 30), None).unwrap());
        }
    }

    #[test]
    fn completed_appointment_keeps_its_slot() {
        let (conn, prac, _) = setup(AppointmentStatus::Completed);
        assert!(!is_available(&conn, &prac, &slot(10, 0, 10, 30), None).unwrap());
    }

    #[test]
    fn own_record_is_excluded_on_reschedule() {
        let (conn, prac, id) = setup(AppointmentStatus::Confirmed);
        assert!(is_available(&conn, &prac, &slot(10, 15, 10, 45), Some(&id)).unwrap());
    }

    #[test]
    fn other_practitioners_are_independent() {
        let (conn, _, _) = setup(AppointmentStatus::Confirmed);
        assert!(is_available(&conn, &Uuid::new_v4(), &slot(10, 0, 10, 30), None).unwrap());
    }
}

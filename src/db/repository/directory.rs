use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_opt_uuid, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

pub fn insert_hospital(conn: &Connection, hospital: &Hospital) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO hospitals (id, name, address, is_active) VALUES (?1, ?2, ?3, ?4)",
        params![
            hospital.id.to_string(),
            hospital.name,
            hospital.address,
            hospital.is_active,
        ],
    )?;
    Ok(())
}

pub fn get_hospital(conn: &Connection, id: &Uuid) -> Result<Option<Hospital>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, name, address, is_active FROM hospitals WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(id, name, address, is_active)| {
        Ok(Hospital {
            id: parse_uuid("hospitals.id", &id)?,
            name,
            address,
            is_active,
        })
    })
    .transpose()
}

pub fn insert_department(conn: &Connection, dept: &Department) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO departments (id, hospital_id, name) VALUES (?1, ?2, ?3)",
        params![dept.id.to_string(), dept.hospital_id.to_string(), dept.name],
    )?;
    Ok(())
}

pub fn get_department(conn: &Connection, id: &Uuid) -> Result<Option<Department>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, hospital_id, name FROM departments WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    row.map(|(id, hospital_id, name)| {
        Ok(Department {
            id: parse_uuid("departments.id", &id)?,
            hospital_id: parse_uuid("departments.hospital_id", &hospital_id)?,
            name,
        })
    })
    .transpose()
}

pub fn insert_practitioner(conn: &Connection, prac: &Practitioner) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO practitioners
             (id, hospital_id, department_id, name, specialty, consultation_fee, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            prac.id.to_string(),
            prac.hospital_id.to_string(),
            prac.department_id.map(|d| d.to_string()),
            prac.name,
            prac.specialty,
            prac.consultation_fee,
            prac.is_active,
        ],
    )?;
    Ok(())
}

pub fn get_practitioner(
    conn: &Connection,
    id: &Uuid,
) -> Result<Option<Practitioner>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, hospital_id, department_id, name, specialty, consultation_fee, is_active
             FROM practitioners WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            },
        )
        .optional()?;

    row.map(
        |(id, hospital_id, department_id, name, specialty, consultation_fee, is_active)| {
            Ok(Practitioner {
                id: parse_uuid("practitioners.id", &id)?,
                hospital_id: parse_uuid("practitioners.hospital_id", &hospital_id)?,
                department_id: parse_opt_uuid("practitioners.department_id", department_id)?,
                name,
                specialty,
                consultation_fee,
                is_active,
            })
        },
    )
    .transpose()
}

pub fn insert_patient(conn: &Connection, patient: &Patient) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO patients (id, user_id, name, phone) VALUES (?1, ?2, ?3, ?4)",
        params![
            patient.id.to_string(),
            patient.user_id,
            patient.name,
            patient.phone,
        ],
    )?;
    Ok(())
}

pub fn get_patient(conn: &Connection, id: &Uuid) -> Result<Option<Patient>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, user_id, name, phone FROM patients WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(id, user_id, name, phone)| {
        Ok(Patient {
            id: parse_uuid("patients.id", &id)?,
            user_id,
            name,
            phone,
        })
    })
    .transpose()
}

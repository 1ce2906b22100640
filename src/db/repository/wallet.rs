use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{page_clause, parse_opt_uuid, parse_uuid};
use crate::db::sqlite::{decode_ts, encode_ts};
use crate::db::DatabaseError;
use crate::models::enums::TransactionType;
use crate::models::*;

pub fn get_wallet(conn: &Connection, patient_id: &Uuid) -> Result<Option<Wallet>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT patient_id, balance, created_at, updated_at FROM wallets WHERE patient_id = ?1",
            params![patient_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(patient_id, balance, created_at, updated_at)| {
        Ok(Wallet {
            patient_id: parse_uuid("wallets.patient_id", &patient_id)?,
            balance,
            created_at: decode_ts("wallets.created_at", &created_at)?,
            updated_at: decode_ts("wallets.updated_at", &updated_at)?,
        })
    })
    .transpose()
}

/// Create an empty wallet unless one already exists. Safe to race.
pub fn insert_wallet_if_absent(
    conn: &Connection,
    patient_id: &Uuid,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO wallets (patient_id, balance, created_at, updated_at)
         VALUES (?1, 0, ?2, ?2)",
        params![patient_id.to_string(), encode_ts(now)],
    )?;
    Ok(())
}

/// Overwrite the stored balance. Only the wallet module calls this, always
/// inside the transaction that appends the matching ledger row.
pub(crate) fn set_wallet_balance(
    conn: &Connection,
    patient_id: &Uuid,
    balance: i64,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE wallets SET balance = ?1, updated_at = ?2 WHERE patient_id = ?3",
        params![balance, encode_ts(now), patient_id.to_string()],
    )?;
    if changed == 0 {
        return Err(DatabaseError::not_found("Wallet", patient_id));
    }
    Ok(())
}

/// Append one ledger row and return its id.
pub(crate) fn insert_wallet_transaction(
    conn: &Connection,
    patient_id: &Uuid,
    tx: &WalletTransaction,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO wallet_transactions (patient_id, type, amount, description,
             related_appointment_id, related_payment_id, balance_before, balance_after, date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            patient_id.to_string(),
            tx.tx_type.as_str(),
            tx.amount,
            tx.description,
            tx.related_appointment_id.map(|id| id.to_string()),
            tx.related_payment_id.map(|id| id.to_string()),
            tx.balance_before,
            tx.balance_after,
            encode_ts(&tx.date),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Ledger rows for a patient, newest first.
pub fn list_wallet_transactions(
    conn: &Connection,
    patient_id: &Uuid,
    filter: &TransactionFilter,
) -> Result<Vec<WalletTransaction>, DatabaseError> {
    let (limit, skip) = page_bounds(filter.limit, filter.skip);
    // date bounds compare as RFC 3339 text; the upper bound is the day after `date_to`
    let from = filter.date_from.map(day_start);
    let to = filter
        .date_to
        .and_then(|d| d.succ_opt())
        .map(day_start);

    let mut stmt = conn.prepare(&format!(
        "SELECT id, type, amount, description, related_appointment_id, related_payment_id,
                balance_before, balance_after, date
         FROM wallet_transactions
         WHERE patient_id = ?1
           AND (?2 IS NULL OR type = ?2)
           AND (?3 IS NULL OR date >= ?3)
           AND (?4 IS NULL OR date < ?4)
         ORDER BY id DESC {}",
        page_clause(limit, skip)
    ))?;
    let rows = stmt
        .query_map(
            params![
                patient_id.to_string(),
                filter.tx_type.map(|t| t.as_str()),
                from,
                to,
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(id, tx_type, amount, description, appt, payment, before, after, date)| {
                Ok(WalletTransaction {
                    id,
                    tx_type: TransactionType::from_str(&tx_type)?,
                    amount,
                    description,
                    related_appointment_id: parse_opt_uuid(
                        "wallet_transactions.related_appointment_id",
                        appt,
                    )?,
                    related_payment_id: parse_opt_uuid(
                        "wallet_transactions.related_payment_id",
                        payment,
                    )?,
                    balance_before: before,
                    balance_after: after,
                    date: decode_ts("wallet_transactions.date", &date)?,
                })
            },
        )
        .collect()
}

fn day_start(date: NaiveDate) -> String {
    encode_ts(&date.and_time(chrono::NaiveTime::MIN).and_utc())
}

/// Aggregate view of a patient's ledger used for integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSummary {
    pub total_credits: i64,
    pub total_debits: i64,
    pub entries: i64,
    /// `balance_after` of the newest row, if any.
    pub last_balance_after: Option<i64>,
    /// Rows whose `balance_after` disagrees with `balance_before ± amount`.
    pub inconsistent_rows: i64,
    /// Rows whose `balance_before` differs from the previous row's `balance_after`.
    pub broken_links: i64,
}

pub fn summarize_ledger(conn: &Connection, patient_id: &Uuid) -> Result<LedgerSummary, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT type, amount, balance_before, balance_after FROM wallet_transactions
         WHERE patient_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![patient_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut summary = LedgerSummary::default();
    let mut previous_after: Option<i64> = None;
    for (tx_type, amount, before, after) in rows {
        let expected = match TransactionType::from_str(&tx_type)? {
            TransactionType::Credit => {
                summary.total_credits += amount;
                before + amount
            }
            TransactionType::Debit => {
                summary.total_debits += amount;
                before - amount
            }
        };
        if expected != after {
            summary.inconsistent_rows += 1;
        }
        if previous_after.is_some_and(|prev| prev != before) {
            summary.broken_links += 1;
        }
        previous_after = Some(after);
        summary.entries += 1;
    }
    summary.last_balance_after = previous_after;
    Ok(summary)
}

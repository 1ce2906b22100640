//! Wallet ledger: per-patient balance backed by an append-only transaction log.
//!
//! The only writer of `wallets.balance`. Every credit or debit reads the
//! balance, appends a ledger row carrying before/after values and stores the
//! new balance inside one immediate transaction.

use chrono::Utc;
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::db::repository;
use crate::db::sqlite::begin_immediate;
use crate::db::DatabaseError;
use crate::models::enums::TransactionType;
use crate::models::{LedgerRefs, TransactionFilter, Wallet, WalletTransaction};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("Insufficient wallet balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<rusqlite::Error> for WalletError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(e))
    }
}

// ─── Reads ────────────────────────────────────────────────────────────────────

/// Fetch the patient's wallet, creating an empty one on first access.
pub fn get_or_create(conn: &Connection, patient_id: &Uuid) -> Result<Wallet, WalletError> {
    if let Some(wallet) = repository::get_wallet(conn, patient_id)? {
        return Ok(wallet);
    }
    repository::insert_wallet_if_absent(conn, patient_id, &Utc::now())?;
    repository::get_wallet(conn, patient_id)?
        .ok_or_else(|| DatabaseError::not_found("Wallet", patient_id).into())
}

pub fn get_balance(conn: &Connection, patient_id: &Uuid) -> Result<i64, WalletError> {
    Ok(get_or_create(conn, patient_id)?.balance)
}

pub fn has_sufficient_balance(
    conn: &Connection,
    patient_id: &Uuid,
    amount: i64,
) -> Result<bool, WalletError> {
    Ok(get_balance(conn, patient_id)? >= amount)
}

pub fn list_transactions(
    conn: &Connection,
    patient_id: &Uuid,
    filter: &TransactionFilter,
) -> Result<Vec<WalletTransaction>, WalletError> {
    get_or_create(conn, patient_id)?;
    Ok(repository::list_wallet_transactions(conn, patient_id, filter)?)
}

/// Outcome of recomputing a wallet's balance from its ledger.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerCheck {
    pub patient_id: Uuid,
    pub balance: i64,
    pub ledger_balance: i64,
    pub entries: i64,
    pub consistent: bool,
}

/// Recompute `sum(credits) - sum(debits)` and compare it with the stored balance.
/// Row-level before/after mismatches also mark the wallet inconsistent.
pub fn verify_ledger(conn: &Connection, patient_id: &Uuid) -> Result<LedgerCheck, WalletError> {
    let wallet = get_or_create(conn, patient_id)?;
    let summary = repository::summarize_ledger(conn, patient_id)?;
    let ledger_balance = summary.total_credits - summary.total_debits;
    let consistent = ledger_balance == wallet.balance
        && summary.inconsistent_rows == 0
        && summary.broken_links == 0
        && summary.last_balance_after.unwrap_or(0) == wallet.balance;

    if !consistent {
        tracing::error!(
            patient_id = %patient_id,
            balance = wallet.balance,
            ledger_balance,
            inconsistent_rows = summary.inconsistent_rows,
            broken_links = summary.broken_links,
            "Wallet ledger drift detected"
        );
    }

    Ok(LedgerCheck {
        patient_id: *patient_id,
        balance: wallet.balance,
        ledger_balance,
        entries: summary.entries,
        consistent,
    })
}

// ─── Writes ───────────────────────────────────────────────────────────────────

/// Add `amount` to the wallet in its own transaction.
pub fn credit(
    conn: &mut Connection,
    patient_id: &Uuid,
    amount: i64,
    description: &str,
    refs: LedgerRefs,
) -> Result<Wallet, WalletError> {
    let tx = begin_immediate(conn)?;
    let wallet = credit_in(&tx, patient_id, amount, description, refs)?;
    tx.commit()?;
    Ok(wallet)
}

/// Remove `amount` from the wallet in its own transaction.
pub fn debit(
    conn: &mut Connection,
    patient_id: &Uuid,
    amount: i64,
    description: &str,
    refs: LedgerRefs,
) -> Result<Wallet, WalletError> {
    let tx = begin_immediate(conn)?;
    let wallet = debit_in(&tx, patient_id, amount, description, refs)?;
    tx.commit()?;
    Ok(wallet)
}

/// Credit inside a caller-owned transaction, so the caller can commit the
/// ledger move together with its own writes.
pub fn credit_in(
    tx: &Transaction<'_>,
    patient_id: &Uuid,
    amount: i64,
    description: &str,
    refs: LedgerRefs,
) -> Result<Wallet, WalletError> {
    apply(tx, patient_id, TransactionType::Credit, amount, description, refs)
}

/// Debit inside a caller-owned transaction. Fails without side effects when
/// the balance does not cover `amount`.
pub fn debit_in(
    tx: &Transaction<'_>,
    patient_id: &Uuid,
    amount: i64,
    description: &str,
    refs: LedgerRefs,
) -> Result<Wallet, WalletError> {
    apply(tx, patient_id, TransactionType::Debit, amount, description, refs)
}

fn apply(
    tx: &Transaction<'_>,
    patient_id: &Uuid,
    tx_type: TransactionType,
    amount: i64,
    description: &str,
    refs: LedgerRefs,
) -> Result<Wallet, WalletError> {
    if amount <= 0 {
        return Err(WalletError::InvalidAmount(amount));
    }

    let wallet = get_or_create(tx, patient_id)?;
    let balance_before = wallet.balance;
    let balance_after = match tx_type {
        TransactionType::Credit => balance_before
            .checked_add(amount)
            .ok_or(WalletError::InvalidAmount(amount))?,
        TransactionType::Debit => {
            if balance_before < amount {
                return Err(WalletError::InsufficientBalance {
                    available: balance_before,
                    requested: amount,
                });
            }
            balance_before - amount
        }
    };

    let now = Utc::now();
    repository::insert_wallet_transaction(
        tx,
        patient_id,
        &WalletTransaction {
            id: 0,
            tx_type,
            amount,
            description: description.to_string(),
            related_appointment_id: refs.appointment_id,
            related_payment_id: refs.payment_id,
            balance_before,
            balance_after,
            date: now,
        },
    )?;
    repository::set_wallet_balance(tx, patient_id, balance_after, &now)?;

    tracing::info!(
        patient_id = %patient_id,
        kind = tx_type.as_str(),
        amount,
        balance_before,
        balance_after,
        "Wallet ledger entry appended"
    );

    Ok(Wallet {
        balance: balance_after,
        updated_at: now,
        ..wallet
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::sqlite::open_database;
    use crate::models::Patient;
    use std::path::Path;

    pub(crate) fn seed_patient(conn: &Connection) -> Uuid {
        let id = Uuid::new_v4();
        repository::insert_patient(conn, &Patient {
            id,
            user_id: format!("user-{id}"),
            name: "Ada".into(),
            phone: None,
        })
        .unwrap();
        id
    }

    fn test_db(dir: &Path) -> Connection {
        open_database(&dir.join("wallet.db")).unwrap()
    }

    #[test]
    fn wallet_is_created_on_first_access() {
        let tmp = tempfile::tempdir().unwrap();
        let conn = test_db(tmp.path());
        let patient = seed_patient(&conn);
        assert_eq!(get_balance(&conn, &patient).unwrap(), 0);
        assert!(repository::get_wallet(&conn, &patient).unwrap().is_some());
    }

    #[test]
    fn credit_then_debit_records_before_and_after() {
        let tmp = tempfile::tempdir().unwrap();
        let mut conn = test_db(tmp.path());
        let patient = seed_patient(&conn);

        credit(&mut conn, &patient, 500, "Top-up", LedgerRefs::default()).unwrap();
        let wallet = debit(&mut conn, &patient, 300, "Appointment payment", LedgerRefs::default()).unwrap();
        assert_eq!(wallet.balance, 200);

        let txs = list_transactions(&conn, &patient, &TransactionFilter::default()).unwrap();
        assert_eq!(txs.len(), 2);
        // newest first
        assert_eq!(txs[0].tx_type, TransactionType::Debit);
        assert_eq!((txs[0].balance_before, txs[0].balance_after), (500, 200));
        assert_eq!((txs[1].balance_before, txs[1].balance_after), (0, 500));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut conn = test_db(tmp.path());
        let patient = seed_patient(&conn);
        for amount in [0, -5] {
            let err = credit(&mut conn, &patient, amount, "x", LedgerRefs::default()).unwrap_err();
            assert!(matches!(err, WalletError::InvalidAmount(_)));
        }
        assert!(list_transactions(&conn, &patient, &TransactionFilter::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn overdraw_reports_available_and_requested() {
        let tmp = tempfile::tempdir().unwrap();
        let mut conn = test_db(tmp.path());
        let patient = seed_patient(&conn);
        credit(&mut conn, &patient, 100, "Top-up", LedgerRefs::default()).unwrap();

        let err = debit(&mut conn, &patient, 150, "x", LedgerRefs::default()).unwrap_err();
        match err {
            WalletError::InsufficientBalance { available, requested } => {
                assert_eq!((available, requested), (100, 150));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(get_balance(&conn, &patient).unwrap(), 100);
        assert!(!has_sufficient_balance(&conn, &patient, 150).unwrap());
        assert!(has_sufficient_balance(&conn, &patient, 100).unwrap());
    }

    #[test]
    fn ledger_references_are_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let mut conn = test_db(tmp.path());
        let patient = seed_patient(&conn);
        let payment_id = Uuid::new_v4();
        credit(&mut conn, &patient, 100, "Refund", LedgerRefs {
            appointment_id: None,
            payment_id: Some(payment_id),
        })
        .unwrap();
        let txs = list_transactions(&conn, &patient, &TransactionFilter::default()).unwrap();
        assert_eq!(txs[0].related_payment_id, Some(payment_id));
    }

    #[test]
    fn balance_matches_ledger_after_mixed_activity() {
        let tmp = tempfile::tempdir().unwrap();
        let mut conn = test_db(tmp.path());
        let patient = seed_patient(&conn);
        for (credit_amount, debit_amount) in [(700, 200), (50, 500), (1000, 1)] {
            credit(&mut conn, &patient, credit_amount, "in", LedgerRefs::default()).unwrap();
            debit(&mut conn, &patient, debit_amount, "out", LedgerRefs::default()).unwrap();
        }
        let check = verify_ledger(&conn, &patient).unwrap();
        assert!(check.consistent);
        assert_eq!(check.balance, 1049);
        assert_eq!(check.ledger_balance, 1049);
        assert_eq!(check.entries, 6);
    }

    #[test]
    fn verify_ledger_flags_balance_written_around_the_ledger() {
        let tmp = tempfile::tempdir().unwrap();
        let mut conn = test_db(tmp.path());
        let patient = seed_patient(&conn);
        credit(&mut conn, &patient, 100, "in", LedgerRefs::default()).unwrap();
        repository::set_wallet_balance(&conn, &patient, 900, &Utc::now()).unwrap();
        assert!(!verify_ledger(&conn, &patient).unwrap().consistent);
    }

    #[test]
    fn concurrent_debits_never_overdraw() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("wallet.db");
        let patient = {
            let mut conn = open_database(&path).unwrap();
            let patient = seed_patient(&conn);
            credit(&mut conn, &patient, 500, "Top-up", LedgerRefs::default()).unwrap();
            patient
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut conn = open_database(&path).unwrap();
                    debit(&mut conn, &patient, 100, "race", LedgerRefs::default()).is_ok()
                })
            })
            .collect();
        let succeeded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        let conn = open_database(&path).unwrap();
        assert_eq!(succeeded, 5);
        assert_eq!(get_balance(&conn, &patient).unwrap(), 0);
        assert!(verify_ledger(&conn, &patient).unwrap().consistent);
    }
}

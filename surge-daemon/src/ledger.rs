use std::fmt;

use diesel::result::Error as DieselError;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl, SqliteConnection};

use surge_core::db::Database;
use surge_core::unix_time;
use surge_daemon_db::models::{LedgerTxRecord, TxType};
use surge_daemon_db::schema::{ledger_tx, session, user};

use crate::db::HOUSE_USER_ID;

/// All balance mutations go through this module. Every mutation inserts
/// exactly one transaction row and adjusts `balance_sats` in the same
/// database transaction, so the per-user row sum always equals the
/// materialized balance. Transaction ids are caller-chosen; replaying an
/// id is a no-op, which is what makes settlement and refunds idempotent
/// across restarts.
#[derive(Debug)]
pub enum LedgerError {
    InsufficientFunds,
    InvalidAmount,
    SessionAlreadyPaid,
    Database(DieselError),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::InsufficientFunds => write!(f, "insufficient funds"),
            LedgerError::InvalidAmount => write!(f, "amount must be positive"),
            LedgerError::SessionAlreadyPaid => write!(f, "session already paid"),
            LedgerError::Database(e) => write!(f, "database error: {e}"),
        }
    }
}

impl From<DieselError> for LedgerError {
    fn from(e: DieselError) -> Self {
        LedgerError::Database(e)
    }
}

pub(crate) fn tx_record(
    id: &str,
    user_id: &str,
    tx_type: TxType,
    amount_sats: i64,
    fee_sats: i64,
    description: &str,
    related_session_id: Option<&str>,
) -> LedgerTxRecord {
    LedgerTxRecord {
        id: id.to_string(),
        user_id: user_id.to_string(),
        tx_type: tx_type.as_str().to_string(),
        amount_sats,
        fee_sats,
        description: description.to_string(),
        related_session_id: related_session_id.map(str::to_string),
        created_at: unix_time(),
    }
}

/// Inserts the row unless its id already exists and applies the balance
/// delta only on first insert. Returns whether the row was inserted.
pub(crate) fn apply_once(
    conn: &mut SqliteConnection,
    record: &LedgerTxRecord,
) -> Result<bool, LedgerError> {
    let inserted = diesel::insert_into(ledger_tx::table)
        .values(record)
        .on_conflict(ledger_tx::id)
        .do_nothing()
        .execute(conn)?;

    if inserted == 0 {
        return Ok(false);
    }

    if record.amount_sats < 0 {
        let debited = diesel::update(
            user::table
                .find(&record.user_id)
                .filter(user::balance_sats.ge(-record.amount_sats)),
        )
        .set(user::balance_sats.eq(user::balance_sats + record.amount_sats))
        .execute(conn)?;

        if debited == 0 {
            return Err(LedgerError::InsufficientFunds);
        }
    } else {
        diesel::update(user::table.find(&record.user_id))
            .set(user::balance_sats.eq(user::balance_sats + record.amount_sats))
            .execute(conn)?;
    }

    Ok(true)
}

fn current_balance(conn: &mut SqliteConnection, user_id: &str) -> Result<i64, LedgerError> {
    user::table
        .find(user_id)
        .select(user::balance_sats)
        .first::<i64>(conn)
        .map_err(LedgerError::from)
}

pub async fn credit(
    db: &Database,
    id: &str,
    user_id: &str,
    amount_sats: i64,
    tx_type: TxType,
    description: &str,
    related_session_id: Option<&str>,
) -> Result<i64, LedgerError> {
    if amount_sats <= 0 {
        return Err(LedgerError::InvalidAmount);
    }

    let record = tx_record(
        id,
        user_id,
        tx_type,
        amount_sats,
        0,
        description,
        related_session_id,
    );

    let mut conn = db.get_connection().await;

    conn.immediate_transaction(|conn| {
        apply_once(conn, &record)?;

        current_balance(conn, user_id)
    })
}

pub async fn debit(
    db: &Database,
    id: &str,
    user_id: &str,
    amount_sats: i64,
    fee_sats: i64,
    tx_type: TxType,
    description: &str,
    related_session_id: Option<&str>,
) -> Result<i64, LedgerError> {
    if amount_sats <= 0 || fee_sats < 0 {
        return Err(LedgerError::InvalidAmount);
    }

    let record = tx_record(
        id,
        user_id,
        tx_type,
        -(amount_sats + fee_sats),
        fee_sats,
        description,
        related_session_id,
    );

    let mut conn = db.get_connection().await;

    conn.immediate_transaction(|conn| {
        apply_once(conn, &record)?;

        current_balance(conn, user_id)
    })
}

/// Wallet payment for a session: debits the buyer and stamps the
/// session paid in one transaction. The `paid_at IS NULL` guard makes a
/// racing second payment attempt fail instead of double-debiting.
pub async fn debit_for_session(
    db: &Database,
    session_id: &str,
    user_id: &str,
    amount_sats: i64,
    description: &str,
) -> Result<i64, LedgerError> {
    if amount_sats <= 0 {
        return Err(LedgerError::InvalidAmount);
    }

    let record = tx_record(
        &format!("{session_id}-payment"),
        user_id,
        TxType::SessionPayment,
        -amount_sats,
        0,
        description,
        Some(session_id),
    );

    let mut conn = db.get_connection().await;

    conn.immediate_transaction(|conn| {
        let stamped = diesel::update(
            session::table
                .find(session_id)
                .filter(session::paid_at.is_null()),
        )
        .set(session::paid_at.eq(unix_time()))
        .execute(conn)?;

        if stamped == 0 {
            return Err(LedgerError::SessionAlreadyPaid);
        }

        apply_once(conn, &record)?;

        current_balance(conn, user_id)
    })
}

/// Pays out a finished session: node owner earning and house commission
/// in one all-or-nothing transaction. Idempotent per session.
pub async fn settle(
    db: &Database,
    session_id: &str,
    owner_id: &str,
    earning_sats: i64,
    commission_sats: i64,
    description: &str,
) -> Result<(), LedgerError> {
    if earning_sats < 0 || commission_sats < 0 {
        return Err(LedgerError::InvalidAmount);
    }

    let earning = tx_record(
        &format!("{session_id}-earning"),
        owner_id,
        TxType::NodeEarning,
        earning_sats,
        0,
        description,
        Some(session_id),
    );

    let commission = tx_record(
        &format!("{session_id}-commission"),
        HOUSE_USER_ID,
        TxType::Commission,
        commission_sats,
        0,
        description,
        Some(session_id),
    );

    let mut conn = db.get_connection().await;

    conn.immediate_transaction(|conn| {
        if earning.amount_sats > 0 {
            apply_once(conn, &earning)?;
        }

        if commission.amount_sats > 0 {
            apply_once(conn, &commission)?;
        }

        Ok(())
    })
}

pub async fn balance(db: &Database, user_id: &str) -> i64 {
    let mut conn = db.get_connection().await;

    user::table
        .find(user_id)
        .select(user::balance_sats)
        .first::<i64>(&mut *conn)
        .optional()
        .expect("Failed to query balance")
        .unwrap_or(0)
}

pub async fn get_transaction(db: &Database, id: &str) -> Option<LedgerTxRecord> {
    let mut conn = db.get_connection().await;

    ledger_tx::table
        .find(id)
        .first::<LedgerTxRecord>(&mut *conn)
        .optional()
        .expect("Failed to query transaction")
}

pub async fn list_transactions(
    db: &Database,
    user_id: &str,
    page: u32,
    page_size: u32,
) -> Vec<LedgerTxRecord> {
    let mut conn = db.get_connection().await;

    ledger_tx::table
        .filter(ledger_tx::user_id.eq(user_id))
        .order(ledger_tx::created_at.desc())
        .offset(page as i64 * page_size as i64)
        .limit(page_size as i64)
        .load::<LedgerTxRecord>(&mut *conn)
        .expect("Failed to load transactions")
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tests::{seed_user, test_database};

    #[tokio::test]
    async fn balance_always_matches_row_sum() {
        let db = test_database().await;

        let user = seed_user(&db, "alice", 0).await;

        credit(&db, "tx1", &user.id, 1_000, TxType::Deposit, "deposit", None)
            .await
            .unwrap();

        debit(&db, "tx2", &user.id, 300, 0, TxType::SessionPayment, "pay", None)
            .await
            .unwrap();

        assert_eq!(balance(&db, &user.id).await, 700);

        let row_sum: i64 = list_transactions(&db, &user.id, 0, 100)
            .await
            .iter()
            .map(|tx| tx.amount_sats)
            .sum();

        assert_eq!(row_sum, 700);
    }

    #[tokio::test]
    async fn debit_never_overdraws() {
        let db = test_database().await;

        let user = seed_user(&db, "alice", 100).await;

        let result = debit(&db, "tx1", &user.id, 101, 0, TxType::Withdrawal, "w", None).await;

        assert!(matches!(result, Err(LedgerError::InsufficientFunds)));

        assert_eq!(balance(&db, &user.id).await, 100);

        // The rolled back attempt left no transaction row behind.
        assert_eq!(list_transactions(&db, &user.id, 0, 100).await.len(), 1);
    }

    #[tokio::test]
    async fn replayed_transaction_id_applies_once() {
        let db = test_database().await;

        let user = seed_user(&db, "alice", 0).await;

        for _ in 0..3 {
            credit(&db, "tx1", &user.id, 500, TxType::Deposit, "deposit", None)
                .await
                .unwrap();
        }

        assert_eq!(balance(&db, &user.id).await, 500);
    }

    #[tokio::test]
    async fn session_can_only_be_paid_once() {
        let db = test_database().await;

        let user = seed_user(&db, "alice", 2_000).await;

        let session = crate::tests::seed_pending_session(&db, &user.id, 500).await;

        debit_for_session(&db, &session, &user.id, 500, "pay")
            .await
            .unwrap();

        let second = debit_for_session(&db, &session, &user.id, 500, "pay").await;

        assert!(matches!(second, Err(LedgerError::SessionAlreadyPaid)));

        assert_eq!(balance(&db, &user.id).await, 1_500);
    }

    #[tokio::test]
    async fn settlement_is_atomic_and_idempotent() {
        let db = test_database().await;

        let owner = seed_user(&db, "owner", 0).await;

        settle(&db, "sess", &owner.id, 450, 50, "settlement")
            .await
            .unwrap();

        settle(&db, "sess", &owner.id, 450, 50, "settlement")
            .await
            .unwrap();

        assert_eq!(balance(&db, &owner.id).await, 450);
        assert_eq!(balance(&db, crate::db::HOUSE_USER_ID).await, 50);
    }
}

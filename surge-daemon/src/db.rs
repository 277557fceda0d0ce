use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl};

use surge_core::db::Database;
use surge_core::unix_time;
use surge_daemon_db::models::{InvoiceRecord, InvoiceStatus, SessionRecord, SessionState, UserRecord};
use surge_daemon_db::schema::{invoice, session, user};

pub const HOUSE_USER_ID: &str = "house";

pub async fn ensure_house_account(db: &Database) {
    let mut conn = db.get_connection().await;

    let house = UserRecord {
        id: HOUSE_USER_ID.to_string(),
        name: HOUSE_USER_ID.to_string(),
        password_hash: String::new(),
        token: None,
        is_admin: true,
        balance_sats: 0,
        created_at: unix_time(),
    };

    diesel::insert_into(user::table)
        .values(&house)
        .on_conflict(user::id)
        .do_nothing()
        .execute(&mut *conn)
        .expect("Failed to create house account");
}

pub async fn create_user(db: &Database, record: UserRecord) -> bool {
    let mut conn = db.get_connection().await;

    diesel::insert_into(user::table)
        .values(&record)
        .on_conflict_do_nothing()
        .execute(&mut *conn)
        .expect("Failed to create user")
        == 1
}

pub async fn get_user(db: &Database, id: &str) -> Option<UserRecord> {
    let mut conn = db.get_connection().await;

    user::table
        .find(id)
        .first::<UserRecord>(&mut *conn)
        .optional()
        .expect("Failed to query user")
}

pub async fn get_user_by_name(db: &Database, name: &str) -> Option<UserRecord> {
    let mut conn = db.get_connection().await;

    user::table
        .filter(user::name.eq(name))
        .first::<UserRecord>(&mut *conn)
        .optional()
        .expect("Failed to query user by name")
}

pub async fn get_user_by_token(db: &Database, token: &str) -> Option<UserRecord> {
    let mut conn = db.get_connection().await;

    user::table
        .filter(user::token.eq(token))
        .first::<UserRecord>(&mut *conn)
        .optional()
        .expect("Failed to query user by token")
}

pub async fn rotate_token(db: &Database, user_id: &str, token: &str) {
    let mut conn = db.get_connection().await;

    diesel::update(user::table.find(user_id))
        .set(user::token.eq(token))
        .execute(&mut *conn)
        .expect("Failed to rotate token");
}

pub async fn list_users(db: &Database) -> Vec<UserRecord> {
    let mut conn = db.get_connection().await;

    user::table
        .order(user::created_at.asc())
        .load::<UserRecord>(&mut *conn)
        .expect("Failed to load users")
}

pub async fn create_session(db: &Database, record: SessionRecord) {
    let mut conn = db.get_connection().await;

    diesel::insert_into(session::table)
        .values(&record)
        .execute(&mut *conn)
        .expect("Failed to create session");
}

pub async fn get_session(db: &Database, id: &str) -> Option<SessionRecord> {
    let mut conn = db.get_connection().await;

    session::table
        .find(id)
        .first::<SessionRecord>(&mut *conn)
        .optional()
        .expect("Failed to query session")
}

/// Compare-and-set state transition, the guard that makes duplicated
/// session events no-ops.
pub async fn transition_session(
    db: &Database,
    id: &str,
    from: SessionState,
    to: SessionState,
) -> bool {
    let mut conn = db.get_connection().await;

    diesel::update(
        session::table
            .find(id)
            .filter(session::state.eq(from.as_str())),
    )
    .set(session::state.eq(to.as_str()))
    .execute(&mut *conn)
    .expect("Failed to transition session")
        == 1
}

pub async fn begin_starting(db: &Database, id: &str) -> bool {
    let mut conn = db.get_connection().await;

    diesel::update(
        session::table
            .find(id)
            .filter(session::state.eq(SessionState::PendingPayment.as_str())),
    )
    .set((
        session::state.eq(SessionState::Starting.as_str()),
        session::paid_at.eq(unix_time()),
    ))
    .execute(&mut *conn)
    .expect("Failed to mark session starting")
        == 1
}

pub async fn activate_session(db: &Database, id: &str, started_at: i64, expires_at: i64) -> bool {
    let mut conn = db.get_connection().await;

    diesel::update(
        session::table
            .find(id)
            .filter(session::state.eq(SessionState::Starting.as_str())),
    )
    .set((
        session::state.eq(SessionState::Active.as_str()),
        session::started_at.eq(started_at),
        session::expires_at.eq(expires_at),
    ))
    .execute(&mut *conn)
    .expect("Failed to activate session")
        == 1
}

/// Stamps the settlement boundary: everything owed is computed from the
/// `ended_at` written here, which makes a replayed settlement arrive at
/// the same amounts.
pub async fn begin_settling(db: &Database, id: &str) -> bool {
    let mut conn = db.get_connection().await;

    diesel::update(
        session::table
            .find(id)
            .filter(session::state.eq(SessionState::Active.as_str())),
    )
    .set((
        session::state.eq(SessionState::Settling.as_str()),
        session::ended_at.eq(unix_time()),
    ))
    .execute(&mut *conn)
    .expect("Failed to mark session settling")
        == 1
}

pub async fn end_session(db: &Database, id: &str, from: SessionState) -> bool {
    let mut conn = db.get_connection().await;

    conn.immediate_transaction(|conn| {
        let ended = diesel::update(
            session::table
                .find(id)
                .filter(session::state.eq(from.as_str())),
        )
        .set(session::state.eq(SessionState::Ended.as_str()))
        .execute(conn)?;

        if ended == 1 {
            diesel::update(
                session::table
                    .find(id)
                    .filter(session::ended_at.is_null()),
            )
            .set(session::ended_at.eq(unix_time()))
            .execute(conn)?;
        }

        Ok::<_, diesel::result::Error>(ended)
    })
    .expect("Failed to end session")
        == 1
}

pub async fn sessions_in_state(db: &Database, state: SessionState) -> Vec<SessionRecord> {
    let mut conn = db.get_connection().await;

    session::table
        .filter(session::state.eq(state.as_str()))
        .load::<SessionRecord>(&mut *conn)
        .expect("Failed to load sessions by state")
}

pub async fn non_terminal_sessions(db: &Database) -> Vec<SessionRecord> {
    let mut conn = db.get_connection().await;

    session::table
        .filter(session::state.ne(SessionState::Ended.as_str()))
        .load::<SessionRecord>(&mut *conn)
        .expect("Failed to load non-terminal sessions")
}

pub async fn list_sessions(db: &Database) -> Vec<SessionRecord> {
    let mut conn = db.get_connection().await;

    session::table
        .order(session::created_at.desc())
        .load::<SessionRecord>(&mut *conn)
        .expect("Failed to load sessions")
}

pub async fn active_session_for_node(db: &Database, node_id: &str) -> Option<SessionRecord> {
    let mut conn = db.get_connection().await;

    session::table
        .filter(session::node_id.eq(node_id))
        .filter(session::state.eq(SessionState::Active.as_str()))
        .first::<SessionRecord>(&mut *conn)
        .optional()
        .expect("Failed to query active session for node")
}

pub async fn create_invoice(db: &Database, record: InvoiceRecord) {
    let mut conn = db.get_connection().await;

    diesel::insert_into(invoice::table)
        .values(&record)
        .execute(&mut *conn)
        .expect("Failed to create invoice");
}

pub async fn get_invoice(db: &Database, payment_hash: &str) -> Option<InvoiceRecord> {
    let mut conn = db.get_connection().await;

    invoice::table
        .find(payment_hash)
        .first::<InvoiceRecord>(&mut *conn)
        .optional()
        .expect("Failed to query invoice")
}

/// Flips a pending invoice to paid. Returns false when some other path
/// already settled or expired it, callers rely on this for exactly-once
/// crediting.
pub async fn mark_invoice_paid(db: &Database, payment_hash: &str) -> bool {
    let mut conn = db.get_connection().await;

    diesel::update(
        invoice::table
            .find(payment_hash)
            .filter(invoice::status.eq(InvoiceStatus::Pending.as_str())),
    )
    .set(invoice::status.eq(InvoiceStatus::Paid.as_str()))
    .execute(&mut *conn)
    .expect("Failed to mark invoice paid")
        == 1
}

pub async fn mark_invoice_expired(db: &Database, payment_hash: &str) -> bool {
    let mut conn = db.get_connection().await;

    diesel::update(
        invoice::table
            .find(payment_hash)
            .filter(invoice::status.eq(InvoiceStatus::Pending.as_str())),
    )
    .set(invoice::status.eq(InvoiceStatus::Expired.as_str()))
    .execute(&mut *conn)
    .expect("Failed to mark invoice expired")
        == 1
}

pub async fn pending_invoices(db: &Database) -> Vec<InvoiceRecord> {
    let mut conn = db.get_connection().await;

    invoice::table
        .filter(invoice::status.eq(InvoiceStatus::Pending.as_str()))
        .load::<InvoiceRecord>(&mut *conn)
        .expect("Failed to load pending invoices")
}

/// Garbage-collects expired invoice rows past their retention window.
pub async fn delete_expired_invoices(db: &Database, expired_before: i64) {
    let mut conn = db.get_connection().await;

    diesel::delete(
        invoice::table
            .filter(invoice::status.eq(InvoiceStatus::Expired.as_str()))
            .filter(invoice::expires_at.lt(expired_before)),
    )
    .execute(&mut *conn)
    .expect("Failed to delete expired invoices");
}

use std::fmt;

use bitcoin::hashes::{Hash, sha256};
use bitcoin::hex::DisplayHex;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl};
use rand::Rng;
use tracing::info;

use surge_api_core::{HardwareInfo, HeartbeatRequest, RegisterNodeRequest};
use surge_core::db::Database;
use surge_core::unix_time;
use surge_daemon_db::models::{NodeRecord, NodeStatus, TxType};
use surge_daemon_db::schema::node;

use crate::ledger::{self, LedgerError};

/// The registry is the single authority over the node row: reservation,
/// release and liveness transitions all go through here, and the busy
/// transition is a single compare-and-set statement, so two sessions can
/// never hold the same node.
#[derive(Debug)]
pub enum RegistryError {
    DuplicateNode,
    Ledger(LedgerError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateNode => write!(f, "node already registered"),
            RegistryError::Ledger(e) => write!(f, "{e}"),
        }
    }
}

impl From<LedgerError> for RegistryError {
    fn from(e: LedgerError) -> Self {
        RegistryError::Ledger(e)
    }
}

impl From<diesel::result::Error> for RegistryError {
    fn from(e: diesel::result::Error) -> Self {
        RegistryError::Ledger(LedgerError::Database(e))
    }
}

pub fn hardware_fingerprint(hardware: &HardwareInfo) -> String {
    let encoded = serde_json::to_vec(hardware).expect("Failed to serialize hardware");

    sha256::Hash::hash(&encoded).to_byte_array().as_hex().to_string()
}

/// Registers a node, debiting the one-time fee from its owner in the
/// same database transaction as the insert.
pub async fn register_node(
    db: &Database,
    owner_id: &str,
    request: &RegisterNodeRequest,
    fee_sats: i64,
) -> Result<NodeRecord, RegistryError> {
    let fingerprint = hardware_fingerprint(&request.hardware);

    let record = NodeRecord {
        id: rand::rng().random::<[u8; 16]>().as_hex().to_string(),
        name: request.name.clone(),
        owner_id: owner_id.to_string(),
        endpoint_url: request.endpoint_url.trim_end_matches('/').to_string(),
        fingerprint: fingerprint.clone(),
        cpu: request.hardware.cpu.clone(),
        ram_mb: request.hardware.ram_mb,
        disk_gb: request.hardware.disk_gb,
        gpus_json: serde_json::to_string(&request.hardware.gpus).expect("Failed to serialize gpus"),
        models_json: serde_json::to_string(&request.models).expect("Failed to serialize models"),
        price_per_minute_sats: request.price_per_minute_sats,
        load_factor: 0.0,
        status: NodeStatus::Online.as_str().to_string(),
        current_session_id: None,
        last_heartbeat_at: unix_time(),
        created_at: unix_time(),
    };

    let fee = ledger::tx_record(
        &format!("{}-registration", record.id),
        owner_id,
        TxType::Withdrawal,
        -fee_sats,
        0,
        "Node registration fee",
        None,
    );

    let fee_income = ledger::tx_record(
        &format!("{}-registration-fee", record.id),
        crate::db::HOUSE_USER_ID,
        TxType::Commission,
        fee_sats,
        0,
        "Node registration fee",
        None,
    );

    let mut conn = db.get_connection().await;

    let record = conn.immediate_transaction(|conn| {
        let duplicate = diesel::select(diesel::dsl::exists(
            node::table
                .filter(node::owner_id.eq(owner_id))
                .filter(node::fingerprint.eq(&fingerprint)),
        ))
        .get_result::<bool>(conn)
        .map_err(LedgerError::from)?;

        if duplicate {
            return Err(RegistryError::DuplicateNode);
        }

        if fee_sats > 0 {
            ledger::apply_once(conn, &fee)?;
            ledger::apply_once(conn, &fee_income)?;
        }

        diesel::insert_into(node::table)
            .values(&record)
            .execute(conn)
            .map_err(LedgerError::from)?;

        Ok(record)
    })?;

    info!(node_id = %record.id, %owner_id, "node registered");

    Ok(record)
}

/// Refreshes liveness and capabilities. A silent node that reports in
/// again is re-admitted as online, or busy if it still holds a session.
pub async fn heartbeat(db: &Database, request: &HeartbeatRequest) -> Option<NodeRecord> {
    let mut conn = db.get_connection().await;

    conn.immediate_transaction(|conn| {
        let record = node::table
            .find(&request.node_id)
            .first::<NodeRecord>(conn)
            .optional()?;

        let record = match record {
            Some(record) => record,
            None => return Ok(None),
        };

        let status = match record.node_status() {
            NodeStatus::Offline if record.current_session_id.is_some() => NodeStatus::Busy,
            NodeStatus::Offline => NodeStatus::Online,
            status => status,
        };

        diesel::update(node::table.find(&request.node_id))
            .set((
                node::cpu.eq(&request.hardware.cpu),
                node::ram_mb.eq(request.hardware.ram_mb),
                node::disk_gb.eq(request.hardware.disk_gb),
                node::gpus_json.eq(
                    serde_json::to_string(&request.hardware.gpus)
                        .expect("Failed to serialize gpus"),
                ),
                node::models_json.eq(
                    serde_json::to_string(&request.models)
                        .expect("Failed to serialize models"),
                ),
                node::load_factor.eq(request.load),
                node::status.eq(status.as_str()),
                node::last_heartbeat_at.eq(unix_time()),
            ))
            .execute(conn)?;

        node::table
            .find(&request.node_id)
            .first::<NodeRecord>(conn)
            .optional()
    })
    .expect("Failed to process heartbeat")
}

/// Atomic online-to-busy compare-and-set, the only path into busy.
pub async fn try_reserve(db: &Database, node_id: &str, session_id: &str) -> bool {
    let mut conn = db.get_connection().await;

    diesel::update(
        node::table
            .find(node_id)
            .filter(node::status.eq(NodeStatus::Online.as_str()))
            .filter(node::current_session_id.is_null()),
    )
    .set((
        node::status.eq(NodeStatus::Busy.as_str()),
        node::current_session_id.eq(session_id),
    ))
    .execute(&mut *conn)
    .expect("Failed to reserve node")
        == 1
}

/// Reverses a reservation held by `session_id`, a no-op for any other
/// holder. A node the scheduler already took offline stays offline.
pub async fn release(db: &Database, node_id: &str, session_id: &str) -> bool {
    let mut conn = db.get_connection().await;

    conn.immediate_transaction(|conn| {
        diesel::update(
            node::table
                .find(node_id)
                .filter(node::current_session_id.eq(session_id))
                .filter(node::status.eq(NodeStatus::Busy.as_str())),
        )
        .set(node::status.eq(NodeStatus::Online.as_str()))
        .execute(conn)?;

        diesel::update(
            node::table
                .find(node_id)
                .filter(node::current_session_id.eq(session_id)),
        )
        .set(node::current_session_id.eq(None::<String>))
        .execute(conn)
    })
    .expect("Failed to release node")
        == 1
}

pub async fn get_node(db: &Database, node_id: &str) -> Option<NodeRecord> {
    let mut conn = db.get_connection().await;

    node::table
        .find(node_id)
        .first::<NodeRecord>(&mut *conn)
        .optional()
        .expect("Failed to query node")
}

pub async fn list_nodes(db: &Database) -> Vec<NodeRecord> {
    let mut conn = db.get_connection().await;

    node::table
        .order(node::created_at.asc())
        .load::<NodeRecord>(&mut *conn)
        .expect("Failed to load nodes")
}

pub async fn nodes_with_status(db: &Database, status: NodeStatus) -> Vec<NodeRecord> {
    let mut conn = db.get_connection().await;

    node::table
        .filter(node::status.eq(status.as_str()))
        .load::<NodeRecord>(&mut *conn)
        .expect("Failed to load nodes by status")
}

/// Marks every node silent for longer than the heartbeat timeout as
/// offline and returns the transitioned rows, reservations intact, so
/// the scheduler can fail over their sessions.
pub async fn mark_stale_offline(db: &Database, stale_before: i64) -> Vec<NodeRecord> {
    let mut conn = db.get_connection().await;

    conn.immediate_transaction(|conn| {
        let stale = node::table
            .filter(node::status.ne(NodeStatus::Offline.as_str()))
            .filter(node::last_heartbeat_at.lt(stale_before))
            .load::<NodeRecord>(conn)?;

        for record in &stale {
            diesel::update(node::table.find(&record.id))
                .set(node::status.eq(NodeStatus::Offline.as_str()))
                .execute(conn)?;
        }

        Ok::<_, diesel::result::Error>(stale)
    })
    .expect("Failed to sweep stale nodes")
}

#[cfg(test)]
mod tests {
    use surge_api_core::HeartbeatRequest;

    use super::*;
    use crate::tests::{node_request, seed_user, test_database};

    #[tokio::test]
    async fn registration_debits_fee_and_rejects_duplicates() {
        let db = test_database().await;

        let owner = seed_user(&db, "owner", 1_000).await;

        let request = node_request(100);

        register_node(&db, &owner.id, &request, 600).await.unwrap();

        assert_eq!(ledger::balance(&db, &owner.id).await, 400);
        assert_eq!(ledger::balance(&db, crate::db::HOUSE_USER_ID).await, 600);

        // Same hardware again: rejected, and the fee is not taken twice.
        let duplicate = register_node(&db, &owner.id, &request, 600).await;

        assert!(matches!(duplicate, Err(RegistryError::DuplicateNode)));
        assert_eq!(ledger::balance(&db, &owner.id).await, 400);

        let broke = register_node(&db, &owner.id, &node_request(200), 600).await;

        assert!(matches!(
            broke,
            Err(RegistryError::Ledger(LedgerError::InsufficientFunds))
        ));
    }

    #[tokio::test]
    async fn reservation_is_exclusive() {
        let db = test_database().await;

        let owner = seed_user(&db, "owner", 0).await;

        let node = register_node(&db, &owner.id, &node_request(100), 0)
            .await
            .unwrap();

        let session_ids: Vec<String> = (0..8).map(|i| format!("session-{i}")).collect();
        let results = futures::future::join_all(
            session_ids
                .iter()
                .map(|session_id| try_reserve(&db, &node.id, session_id)),
        )
        .await;

        assert_eq!(results.into_iter().filter(|ok| *ok).count(), 1);

        let node = get_node(&db, &node.id).await.unwrap();

        assert_eq!(node.node_status(), NodeStatus::Busy);
    }

    #[tokio::test]
    async fn release_requires_the_holder() {
        let db = test_database().await;

        let owner = seed_user(&db, "owner", 0).await;

        let node = register_node(&db, &owner.id, &node_request(100), 0)
            .await
            .unwrap();

        assert!(try_reserve(&db, &node.id, "session-a").await);

        assert!(!release(&db, &node.id, "session-b").await);

        let held = get_node(&db, &node.id).await.unwrap();

        assert_eq!(held.node_status(), NodeStatus::Busy);

        assert!(release(&db, &node.id, "session-a").await);

        let freed = get_node(&db, &node.id).await.unwrap();

        assert_eq!(freed.node_status(), NodeStatus::Online);
        assert_eq!(freed.current_session_id, None);
    }

    #[tokio::test]
    async fn release_does_not_resurrect_offline_nodes() {
        let db = test_database().await;

        let owner = seed_user(&db, "owner", 0).await;

        let node = register_node(&db, &owner.id, &node_request(100), 0)
            .await
            .unwrap();

        assert!(try_reserve(&db, &node.id, "session-a").await);

        let swept = mark_stale_offline(&db, surge_core::unix_time() + 1).await;

        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].current_session_id.as_deref(), Some("session-a"));

        assert!(release(&db, &node.id, "session-a").await);

        let released = get_node(&db, &node.id).await.unwrap();

        assert_eq!(released.node_status(), NodeStatus::Offline);
        assert_eq!(released.current_session_id, None);
    }

    #[tokio::test]
    async fn heartbeat_readmits_offline_nodes() {
        let db = test_database().await;

        let owner = seed_user(&db, "owner", 0).await;

        let request = node_request(100);

        let node = register_node(&db, &owner.id, &request, 0).await.unwrap();

        mark_stale_offline(&db, surge_core::unix_time() + 1).await;

        let heartbeat_request = HeartbeatRequest {
            node_id: node.id.clone(),
            load: 0.25,
            hardware: request.hardware.clone(),
            models: request.models.clone(),
        };

        let record = heartbeat(&db, &heartbeat_request).await.unwrap();

        assert_eq!(record.node_status(), NodeStatus::Online);
        assert_eq!(record.load_factor, 0.25);
    }
}

use surge_api_core::{MeResponse, NodeListing, TransactionInfo};
use surge_cli_core::{NodeInfo, SessionInfo, UserInfo};
use surge_daemon_db::models::{LedgerTxRecord, NodeRecord, SessionRecord, UserRecord};

pub fn into_me_response(record: UserRecord) -> MeResponse {
    MeResponse {
        user_id: record.id,
        name: record.name,
        is_admin: record.is_admin,
        balance_sats: record.balance_sats,
        created_at: record.created_at,
    }
}

pub fn into_node_listing(record: NodeRecord, busy_until: Option<i64>) -> NodeListing {
    NodeListing {
        hardware: record.hardware(),
        models: record.models(),
        node_id: record.id,
        name: record.name,
        price_per_minute_sats: record.price_per_minute_sats,
        status: record.status,
        busy_until,
    }
}

pub fn into_transaction_info(record: LedgerTxRecord) -> TransactionInfo {
    TransactionInfo {
        id: record.id,
        tx_type: record.tx_type,
        amount_sats: record.amount_sats,
        fee_sats: record.fee_sats,
        description: record.description,
        related_session_id: record.related_session_id,
        created_at: record.created_at,
    }
}

pub fn into_user_info(record: UserRecord) -> UserInfo {
    UserInfo {
        id: record.id,
        name: record.name,
        is_admin: record.is_admin,
        balance_sats: record.balance_sats,
        created_at: record.created_at,
    }
}

pub fn into_node_info(record: NodeRecord) -> NodeInfo {
    NodeInfo {
        id: record.id,
        name: record.name,
        owner_id: record.owner_id,
        status: record.status,
        price_per_minute_sats: record.price_per_minute_sats,
        last_heartbeat_at: record.last_heartbeat_at,
        current_session_id: record.current_session_id,
    }
}

pub fn into_session_info(record: SessionRecord) -> SessionInfo {
    SessionInfo {
        id: record.id,
        user_id: record.user_id,
        node_id: record.node_id,
        model_id: record.model_id,
        state: record.state,
        minutes_purchased: record.minutes_purchased,
        amount_sats: record.amount_sats,
        payment_method: record.payment_method,
        created_at: record.created_at,
        expires_at: record.expires_at,
    }
}

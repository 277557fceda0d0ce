use std::fmt;
use std::str::FromStr;

use diesel::{Insertable, Queryable, Selectable};

use surge_api_core::{GpuInfo, HardwareInfo, ModelInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    PendingPayment,
    Starting,
    Active,
    Settling,
    Refunding,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::PendingPayment => "pending_payment",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Settling => "settling",
            SessionState::Refunding => "refunding",
            SessionState::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended)
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_payment" => Ok(SessionState::PendingPayment),
            "starting" => Ok(SessionState::Starting),
            "active" => Ok(SessionState::Active),
            "settling" => Ok(SessionState::Settling),
            "refunding" => Ok(SessionState::Refunding),
            "ended" => Ok(SessionState::Ended),
            other => Err(format!("Unknown session state: {other}")),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Online,
    Busy,
    Offline,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Busy => "busy",
            NodeStatus::Offline => "offline",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(NodeStatus::Online),
            "busy" => Ok(NodeStatus::Busy),
            "offline" => Ok(NodeStatus::Offline),
            other => Err(format!("Unknown node status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Expired,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoicePurpose {
    Deposit,
    Session,
}

impl InvoicePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoicePurpose::Deposit => "deposit",
            InvoicePurpose::Session => "session",
        }
    }
}

impl FromStr for InvoicePurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(InvoicePurpose::Deposit),
            "session" => Ok(InvoicePurpose::Session),
            other => Err(format!("Unknown invoice purpose: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    Deposit,
    SessionPayment,
    NodeEarning,
    Commission,
    Withdrawal,
    Refund,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Deposit => "deposit",
            TxType::SessionPayment => "session_payment",
            TxType::NodeEarning => "node_earning",
            TxType::Commission => "commission",
            TxType::Withdrawal => "withdrawal",
            TxType::Refund => "refund",
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::user)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub password_hash: String,
    pub token: Option<String>,
    pub is_admin: bool,
    pub balance_sats: i64,
    pub created_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::node)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub endpoint_url: String,
    pub fingerprint: String,
    pub cpu: String,
    pub ram_mb: i64,
    pub disk_gb: i64,
    pub gpus_json: String,
    pub models_json: String,
    pub price_per_minute_sats: i64,
    pub load_factor: f64,
    pub status: String,
    pub current_session_id: Option<String>,
    pub last_heartbeat_at: i64,
    pub created_at: i64,
}

impl NodeRecord {
    pub fn node_status(&self) -> NodeStatus {
        self.status.parse().expect("invalid node status")
    }

    pub fn hardware(&self) -> HardwareInfo {
        HardwareInfo {
            cpu: self.cpu.clone(),
            ram_mb: self.ram_mb,
            disk_gb: self.disk_gb,
            gpus: serde_json::from_str::<Vec<GpuInfo>>(&self.gpus_json)
                .expect("invalid gpus json"),
        }
    }

    pub fn models(&self) -> Vec<ModelInfo> {
        serde_json::from_str(&self.models_json).expect("invalid models json")
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::session)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub node_id: String,
    pub model_id: String,
    pub is_hf_download: bool,
    pub context_length: i64,
    pub minutes_purchased: i64,
    pub amount_sats: i64,
    pub state: String,
    pub payment_method: String,
    pub payment_reference: Option<String>,
    pub created_at: i64,
    pub paid_at: Option<i64>,
    pub started_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl SessionRecord {
    pub fn session_state(&self) -> SessionState {
        self.state.parse().expect("invalid session state")
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::invoice)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct InvoiceRecord {
    pub payment_hash: String,
    pub bolt11: String,
    pub amount_sats: i64,
    pub purpose: String,
    pub related_id: String,
    pub status: String,
    pub expires_at: i64,
    pub created_at: i64,
}

impl InvoiceRecord {
    pub fn invoice_purpose(&self) -> InvoicePurpose {
        self.purpose.parse().expect("invalid invoice purpose")
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::ledger_tx)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct LedgerTxRecord {
    pub id: String,
    pub user_id: String,
    pub tx_type: String,
    pub amount_sats: i64,
    pub fee_sats: i64,
    pub description: String,
    pub related_session_id: Option<String>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_states_round_trip() {
        for state in [
            SessionState::PendingPayment,
            SessionState::Starting,
            SessionState::Active,
            SessionState::Settling,
            SessionState::Refunding,
            SessionState::Ended,
        ] {
            assert_eq!(state.as_str().parse::<SessionState>(), Ok(state));
        }

        assert!("paused".parse::<SessionState>().is_err());
        assert!(SessionState::Ended.is_terminal());
        assert!(!SessionState::Settling.is_terminal());
    }

    #[test]
    fn node_statuses_round_trip() {
        for status in [NodeStatus::Online, NodeStatus::Busy, NodeStatus::Offline] {
            assert_eq!(status.as_str().parse::<NodeStatus>(), Ok(status));
        }
    }
}

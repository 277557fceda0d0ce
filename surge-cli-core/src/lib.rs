use bitcoin::address::NetworkUnchecked;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Address;
use clap::Args;
use serde::{Deserialize, Serialize};

pub const CLI_BIND_ADDR: &str = "127.0.0.1:9090";

pub const ROUTE_LDK_NODE_ID: &str = "/ldk/node-id";
pub const ROUTE_LDK_BALANCES: &str = "/ldk/balances";
pub const ROUTE_LDK_ONCHAIN_RECEIVE: &str = "/ldk/onchain/receive";
pub const ROUTE_LDK_ONCHAIN_SEND: &str = "/ldk/onchain/send";
pub const ROUTE_LDK_CHANNEL_OPEN: &str = "/ldk/channel/open";
pub const ROUTE_LDK_CHANNEL_CLOSE: &str = "/ldk/channel/close";
pub const ROUTE_LDK_CHANNEL_LIST: &str = "/ldk/channel/list";
pub const ROUTE_LDK_PEER_CONNECT: &str = "/ldk/peer/connect";
pub const ROUTE_LDK_PEER_LIST: &str = "/ldk/peer/list";
pub const ROUTE_USER_LIST: &str = "/user/list";
pub const ROUTE_NODE_LIST: &str = "/node/list";
pub const ROUTE_SESSION_LIST: &str = "/session/list";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdResponse {
    /// The Lightning node's public key
    pub node_id: PublicKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancesResponse {
    /// The total balance in the on-chain wallet
    pub total_onchain_balance_sats: u64,
    /// The total inbound capacity across all usable channels
    pub total_inbound_capacity_msat: u64,
    /// The total outbound capacity across all usable channels
    pub total_outbound_capacity_msat: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnchainReceiveResponse {
    /// The generated Bitcoin address
    pub address: Address<NetworkUnchecked>,
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct OnchainSendRequest {
    /// Bitcoin address to send to
    pub address: Address<NetworkUnchecked>,
    /// Amount in satoshis
    pub amount_sats: u64,
    /// The fee rate to use in satoshis per vbyte (optional)
    #[arg(long)]
    pub sats_per_vbyte: Option<u64>,
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    /// The public key of the node to open a channel with
    pub node_id: PublicKey,
    /// The network address of the node (IP:PORT, HOSTNAME:PORT or Onion address)
    pub socket_address: String,
    /// The amount to fund the channel with, in satoshis
    pub channel_amount_sats: u64,
    /// Amount to push to the counterparty when opening the channel
    #[arg(long)]
    pub push_to_counterparty_msat: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenChannelResponse {
    pub channel_id: String,
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct CloseChannelRequest {
    /// The user channel id as hex
    pub user_channel_id: String,
    /// The public key of the counterparty
    pub counterparty_node_id: PublicKey,
    /// Force close the channel
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub user_channel_id: String,
    pub counterparty_node_id: PublicKey,
    pub channel_value_sats: u64,
    pub outbound_capacity_msat: u64,
    pub inbound_capacity_msat: u64,
    pub is_channel_ready: bool,
    pub is_usable: bool,
    pub is_outbound: bool,
    pub confirmations: Option<u32>,
    pub confirmations_required: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListChannelsResponse {
    pub channels: Vec<ChannelInfo>,
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct ConnectPeerRequest {
    /// The public key of the peer
    pub node_id: PublicKey,
    /// The network address of the peer
    pub address: String,
    /// Whether to reconnect on restart
    #[arg(long)]
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: PublicKey,
    pub address: String,
    pub is_persisted: bool,
    pub is_connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPeersResponse {
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub is_admin: bool,
    pub balance_sats: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListUsersResponse {
    pub users: Vec<UserInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub status: String,
    pub price_per_minute_sats: i64,
    pub last_heartbeat_at: i64,
    pub current_session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub user_id: String,
    pub node_id: String,
    pub model_id: String,
    pub state: String,
    pub minutes_purchased: i64,
    pub amount_sats: i64,
    pub payment_method: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

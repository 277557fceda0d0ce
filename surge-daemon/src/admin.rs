use axum::extract::{Json, State};
use axum::routing::post;
use axum::Router;
use bitcoin::hex::{DisplayHex, FromHex};
use bitcoin::FeeRate;
use ldk_node::UserChannelId;
use ldk_node::lightning::ln::msgs::SocketAddress;
use tracing::info;

use surge_cli_core::{
    BalancesResponse, ChannelInfo, CloseChannelRequest, ConnectPeerRequest, ListChannelsResponse,
    ListNodesResponse, ListPeersResponse, ListSessionsResponse, ListUsersResponse, NodeIdResponse,
    OnchainReceiveResponse, OnchainSendRequest, OpenChannelRequest, OpenChannelResponse, PeerInfo,
    ROUTE_LDK_BALANCES, ROUTE_LDK_CHANNEL_CLOSE, ROUTE_LDK_CHANNEL_LIST, ROUTE_LDK_CHANNEL_OPEN,
    ROUTE_LDK_NODE_ID, ROUTE_LDK_ONCHAIN_RECEIVE, ROUTE_LDK_ONCHAIN_SEND, ROUTE_LDK_PEER_CONNECT,
    ROUTE_LDK_PEER_LIST, ROUTE_NODE_LIST, ROUTE_SESSION_LIST, ROUTE_USER_LIST,
};

use crate::convert;
use crate::error::ApiError;
use crate::registry;
use crate::{AppState, db};

/// Loopback-only operator surface: Lightning liquidity management for
/// the embedded node plus read-only marketplace listings.
pub fn router() -> Router<AppState> {
    Router::new()
        .route(ROUTE_LDK_NODE_ID, post(ldk_node_id))
        .route(ROUTE_LDK_BALANCES, post(ldk_balances))
        .route(ROUTE_LDK_ONCHAIN_RECEIVE, post(ldk_onchain_receive))
        .route(ROUTE_LDK_ONCHAIN_SEND, post(ldk_onchain_send))
        .route(ROUTE_LDK_CHANNEL_OPEN, post(ldk_channel_open))
        .route(ROUTE_LDK_CHANNEL_CLOSE, post(ldk_channel_close))
        .route(ROUTE_LDK_CHANNEL_LIST, post(ldk_channel_list))
        .route(ROUTE_LDK_PEER_CONNECT, post(ldk_peer_connect))
        .route(ROUTE_LDK_PEER_LIST, post(ldk_peer_list))
        .route(ROUTE_USER_LIST, post(user_list))
        .route(ROUTE_NODE_LIST, post(node_list))
        .route(ROUTE_SESSION_LIST, post(session_list))
}

#[axum::debug_handler]
pub async fn ldk_node_id(State(state): State<AppState>) -> Json<NodeIdResponse> {
    Json(NodeIdResponse {
        node_id: state.node.node_id(),
    })
}

#[axum::debug_handler]
pub async fn ldk_balances(
    State(state): State<AppState>,
) -> Result<Json<BalancesResponse>, ApiError> {
    let total_onchain_balance_sats = state.node.list_balances().total_onchain_balance_sats;

    let usable = state
        .node
        .list_channels()
        .into_iter()
        .filter(|channel| channel.is_usable)
        .collect::<Vec<_>>();

    Ok(Json(BalancesResponse {
        total_onchain_balance_sats,
        total_inbound_capacity_msat: usable.iter().map(|c| c.inbound_capacity_msat).sum(),
        total_outbound_capacity_msat: usable.iter().map(|c| c.outbound_capacity_msat).sum(),
    }))
}

#[axum::debug_handler]
pub async fn ldk_onchain_receive(
    State(state): State<AppState>,
) -> Result<Json<OnchainReceiveResponse>, ApiError> {
    let address = state
        .node
        .onchain_payment()
        .new_address()
        .map_err(ApiError::internal)?;

    info!(?address, "generated new onchain address");

    Ok(Json(OnchainReceiveResponse {
        address: address.into_unchecked(),
    }))
}

#[axum::debug_handler]
pub async fn ldk_onchain_send(
    State(state): State<AppState>,
    Json(request): Json<OnchainSendRequest>,
) -> Result<Json<String>, ApiError> {
    state
        .node
        .onchain_payment()
        .send_to_address(
            &request.address.clone().assume_checked(),
            request.amount_sats,
            request
                .sats_per_vbyte
                .map(FeeRate::from_sat_per_vb_unchecked),
        )
        .map(|txid| Json(txid.to_string()))
        .map_err(ApiError::internal)
}

#[axum::debug_handler]
pub async fn ldk_channel_open(
    State(state): State<AppState>,
    Json(request): Json<OpenChannelRequest>,
) -> Result<Json<OpenChannelResponse>, ApiError> {
    let address: SocketAddress = request
        .socket_address
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid socket address"))?;

    let channel_id = state
        .node
        .open_announced_channel(
            request.node_id,
            address,
            request.channel_amount_sats,
            request.push_to_counterparty_msat,
            None,
        )
        .map_err(ApiError::internal)?;

    info!(?request, ?channel_id, "opened channel");

    Ok(Json(OpenChannelResponse {
        channel_id: channel_id.0.to_be_bytes().as_hex().to_string(),
    }))
}

#[axum::debug_handler]
pub async fn ldk_channel_close(
    State(state): State<AppState>,
    Json(request): Json<CloseChannelRequest>,
) -> Result<Json<()>, ApiError> {
    let channel_id = <[u8; 16]>::from_hex(&request.user_channel_id)
        .map(u128::from_be_bytes)
        .map(UserChannelId)
        .map_err(ApiError::bad_request)?;

    match request.force {
        true => {
            state
                .node
                .force_close_channel(&channel_id, request.counterparty_node_id, None)
                .map_err(ApiError::internal)?;
        }
        false => {
            state
                .node
                .close_channel(&channel_id, request.counterparty_node_id)
                .map_err(ApiError::internal)?;
        }
    }

    info!(?request, "closed channel");

    Ok(Json(()))
}

#[axum::debug_handler]
pub async fn ldk_channel_list(
    State(state): State<AppState>,
) -> Result<Json<ListChannelsResponse>, ApiError> {
    let channels = state
        .node
        .list_channels()
        .into_iter()
        .map(|channel| ChannelInfo {
            user_channel_id: channel.user_channel_id.0.to_be_bytes().as_hex().to_string(),
            counterparty_node_id: channel.counterparty_node_id,
            channel_value_sats: channel.channel_value_sats,
            outbound_capacity_msat: channel.outbound_capacity_msat,
            inbound_capacity_msat: channel.inbound_capacity_msat,
            is_channel_ready: channel.is_channel_ready,
            is_usable: channel.is_usable,
            is_outbound: channel.is_outbound,
            confirmations: channel.confirmations,
            confirmations_required: channel.confirmations_required,
        })
        .collect();

    Ok(Json(ListChannelsResponse { channels }))
}

#[axum::debug_handler]
pub async fn ldk_peer_connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectPeerRequest>,
) -> Result<Json<()>, ApiError> {
    let address: SocketAddress = request
        .address
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid socket address"))?;

    state
        .node
        .connect(request.node_id, address, request.persist)
        .map_err(ApiError::internal)?;

    info!(?request, "connected to peer");

    Ok(Json(()))
}

#[axum::debug_handler]
pub async fn ldk_peer_list(
    State(state): State<AppState>,
) -> Result<Json<ListPeersResponse>, ApiError> {
    let peers = state
        .node
        .list_peers()
        .into_iter()
        .map(|peer| PeerInfo {
            node_id: peer.node_id,
            address: peer.address.to_string(),
            is_persisted: peer.is_persisted,
            is_connected: peer.is_connected,
        })
        .collect();

    Ok(Json(ListPeersResponse { peers }))
}

pub async fn user_list(State(state): State<AppState>) -> Result<Json<ListUsersResponse>, ApiError> {
    let users = db::list_users(&state.db)
        .await
        .into_iter()
        .map(convert::into_user_info)
        .collect();

    Ok(Json(ListUsersResponse { users }))
}

pub async fn node_list(State(state): State<AppState>) -> Result<Json<ListNodesResponse>, ApiError> {
    let nodes = registry::list_nodes(&state.db)
        .await
        .into_iter()
        .map(convert::into_node_info)
        .collect();

    Ok(Json(ListNodesResponse { nodes }))
}

pub async fn session_list(
    State(state): State<AppState>,
) -> Result<Json<ListSessionsResponse>, ApiError> {
    let sessions = db::list_sessions(&state.db)
        .await
        .into_iter()
        .map(convert::into_session_info)
        .collect();

    Ok(Json(ListSessionsResponse { sessions }))
}

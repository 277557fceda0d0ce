use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use bitcoin::hashes::{Hash, sha256};
use bitcoin::hex::DisplayHex;
use rand::Rng;

use surge_daemon_db::models::UserRecord;

use crate::error::ApiError;
use crate::{AppState, db};

/// Resolves the bearer token to a user row. Frames and requests never
/// get to claim a user id themselves.
pub struct AuthUser(pub UserRecord);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

        db::get_user_by_token(&state.db, token)
            .await
            .map(AuthUser)
            .ok_or_else(|| ApiError::unauthorized("Invalid token"))
    }
}

pub fn hash_password(password: &str) -> String {
    sha256::Hash::hash(password.as_bytes())
        .to_byte_array()
        .as_hex()
        .to_string()
}

pub fn new_token() -> String {
    rand::rng().random::<[u8; 32]>().as_hex().to_string()
}

use std::fmt::Display;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use bitcoin::hex::DisplayHex;
use rand::Rng;
use tracing::error;

use crate::ledger::LedgerError;
use crate::lightning::GatewayError;
use crate::orchestrator::NewSessionError;
use crate::registry::RegistryError;

pub struct ApiError {
    pub code: StatusCode,
    pub error: String,
}

impl ApiError {
    pub fn bad_request(error: impl Display) -> Self {
        Self {
            code: StatusCode::BAD_REQUEST,
            error: error.to_string(),
        }
    }

    pub fn unauthorized(error: impl Display) -> Self {
        Self {
            code: StatusCode::UNAUTHORIZED,
            error: error.to_string(),
        }
    }

    pub fn forbidden(error: impl Display) -> Self {
        Self {
            code: StatusCode::FORBIDDEN,
            error: error.to_string(),
        }
    }

    pub fn not_found(error: impl Display) -> Self {
        Self {
            code: StatusCode::NOT_FOUND,
            error: error.to_string(),
        }
    }

    pub fn payment_required(error: impl Display) -> Self {
        Self {
            code: StatusCode::PAYMENT_REQUIRED,
            error: error.to_string(),
        }
    }

    pub fn conflict(error: impl Display) -> Self {
        Self {
            code: StatusCode::CONFLICT,
            error: error.to_string(),
        }
    }

    pub fn rate_limited(error: impl Display) -> Self {
        Self {
            code: StatusCode::TOO_MANY_REQUESTS,
            error: error.to_string(),
        }
    }

    pub fn upstream(error: impl Display) -> Self {
        Self {
            code: StatusCode::BAD_GATEWAY,
            error: error.to_string(),
        }
    }

    /// Logs the underlying error under a correlation id and returns an
    /// opaque 500, raw internals never reach the client.
    pub fn internal(error: impl Display) -> Self {
        let correlation_id = rand::rng().random::<[u8; 8]>().as_hex().to_string();

        error!(%correlation_id, %error, "internal error");

        Self {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            error: format!("Internal error ({correlation_id})"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.code, self.error).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientFunds => ApiError::payment_required("Insufficient balance"),
            LedgerError::InvalidAmount => ApiError::bad_request("Amount must be positive"),
            LedgerError::SessionAlreadyPaid => ApiError::bad_request("Session already paid"),
            LedgerError::Database(e) => ApiError::internal(e),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateNode => {
                ApiError::bad_request("A node with this hardware is already registered")
            }
            RegistryError::Ledger(e) => e.into(),
        }
    }
}

impl From<NewSessionError> for ApiError {
    fn from(e: NewSessionError) -> Self {
        match e {
            NewSessionError::Validation(e) => ApiError::bad_request(e),
            NewSessionError::NodeBusy => ApiError::conflict("Node is busy"),
            NewSessionError::InsufficientFunds => {
                ApiError::payment_required("Insufficient balance")
            }
            NewSessionError::Lightning(e) => e.into(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Unavailable(e) => {
                error!(%e, "lightning backend unavailable");

                ApiError::upstream("Lightning backend unavailable")
            }
            GatewayError::InvalidInvoice(e) => ApiError::bad_request(e),
        }
    }
}


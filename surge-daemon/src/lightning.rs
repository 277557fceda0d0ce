use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::hex::{DisplayHex, FromHex};
use ldk_node::payment::{PaymentDirection, PaymentKind, PaymentStatus, SendingParameters};
use ldk_node::{Event, Node};
use lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescription, Description};
use tracing::{error, info, warn};

use surge_core::db::Database;
use surge_core::unix_time;
use surge_daemon_db::models::{InvoicePurpose, TxType};

use crate::db;
use crate::ledger;
use crate::orchestrator::{SessionContext, SessionEvent, deliver};

#[derive(Debug)]
pub enum GatewayError {
    /// The Lightning backend could not be reached or refused the
    /// operation, retryable.
    Unavailable(String),
    /// The payment request itself is malformed, terminal.
    InvalidInvoice(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Unavailable(e) => write!(f, "lightning unavailable: {e}"),
            GatewayError::InvalidInvoice(e) => write!(f, "invalid invoice: {e}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    pub bolt11: String,
    /// Hex encoded payment hash
    pub payment_hash: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceState {
    Pending,
    Paid { settled_at: i64 },
    Expired,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// Hex encoded payment id of the in-flight payment
    pub payment_id: String,
}

/// Driver over the Lightning daemon. Settlement is never reported from
/// coordinator state, only from the daemon's own payment store.
#[async_trait]
pub trait LightningGateway: Send + Sync {
    async fn create_invoice(
        &self,
        amount_sats: i64,
        memo: &str,
        expiry_secs: u32,
    ) -> Result<CreatedInvoice, GatewayError>;

    /// Pure and idempotent, tolerates daemon restarts.
    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceState, GatewayError>;

    /// Outbound payment, only used for withdrawals.
    async fn pay_invoice(
        &self,
        bolt11: &str,
        max_fee_sats: i64,
    ) -> Result<SendOutcome, GatewayError>;
}

pub struct LdkGateway {
    node: Arc<Node>,
}

impl LdkGateway {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl LightningGateway for LdkGateway {
    async fn create_invoice(
        &self,
        amount_sats: i64,
        memo: &str,
        expiry_secs: u32,
    ) -> Result<CreatedInvoice, GatewayError> {
        let description = Description::new(memo.to_string())
            .map(Bolt11InvoiceDescription::Direct)
            .map_err(|e| GatewayError::InvalidInvoice(e.to_string()))?;

        let invoice = self
            .node
            .bolt11_payment()
            .receive(amount_sats as u64 * 1000, &description, expiry_secs)
            .inspect_err(|error| error!(?error, "ldk node bolt11 receive error"))
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(CreatedInvoice {
            bolt11: invoice.to_string(),
            payment_hash: invoice.payment_hash().to_byte_array().as_hex().to_string(),
            expires_at: unix_time() + expiry_secs as i64 * 1000,
        })
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceState, GatewayError> {
        let hash = <[u8; 32]>::from_hex(payment_hash)
            .map_err(|e| GatewayError::InvalidInvoice(e.to_string()))?;

        let payment = self.node.list_payments().into_iter().find(|details| {
            details.direction == PaymentDirection::Inbound
                && matches!(&details.kind, PaymentKind::Bolt11 { hash: h, .. } if h.0 == hash)
        });

        let state = match payment {
            Some(details) => match details.status {
                PaymentStatus::Succeeded => InvoiceState::Paid {
                    settled_at: details.latest_update_timestamp as i64 * 1000,
                },
                PaymentStatus::Failed => InvoiceState::Expired,
                PaymentStatus::Pending => InvoiceState::Pending,
            },
            None => InvoiceState::Pending,
        };

        Ok(state)
    }

    async fn pay_invoice(
        &self,
        bolt11: &str,
        max_fee_sats: i64,
    ) -> Result<SendOutcome, GatewayError> {
        let invoice: Bolt11Invoice = bolt11
            .parse()
            .map_err(|_| GatewayError::InvalidInvoice("Failed to parse invoice".to_string()))?;

        if invoice.amount_milli_satoshis().is_none() {
            return Err(GatewayError::InvalidInvoice(
                "Amountless invoices are not supported".to_string(),
            ));
        }

        let payment_id = self
            .node
            .bolt11_payment()
            .send(&invoice, Some(sending_parameters(max_fee_sats)))
            .inspect_err(|error| error!(?error, "ldk node bolt11 send error"))
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(SendOutcome {
            payment_id: payment_id.0.as_hex().to_string(),
        })
    }
}

fn sending_parameters(max_fee_sats: i64) -> SendingParameters {
    SendingParameters {
        max_total_routing_fee_msat: Some(Some(max_fee_sats as u64 * 1000)),
        max_total_cltv_expiry_delta: None,
        max_path_count: None,
        max_channel_saturation_power_of_half: None,
    }
}

/// Drains the embedded node's event queue: inbound settlements flip
/// invoice rows and wake the paying session, failed withdrawals are
/// reversed on the ledger.
pub async fn process_ldk_events(node: Arc<Node>, ctx: SessionContext) {
    let db = ctx.db.clone();

    loop {
        match node.next_event_async().await {
            Event::PaymentReceived {
                payment_id,
                amount_msat,
                ..
            } => {
                let kind = payment_id
                    .and_then(|id| node.payment(&id))
                    .map(|details| details.kind);

                if let Some(PaymentKind::Bolt11 { hash, .. }) = kind {
                    let payment_hash = hash.0.as_hex().to_string();

                    info!(?payment_hash, ?amount_msat, "payment received");

                    observe_settled_invoice(&ctx, &payment_hash).await;
                }
            }
            Event::PaymentSuccessful { payment_id, .. } => {
                if let Some(payment_id) = payment_id {
                    info!(payment_id = %payment_id.0.as_hex(), "outbound payment successful");
                }
            }
            Event::PaymentFailed { payment_id, .. } => {
                if let Some(payment_id) = payment_id {
                    let payment_id = payment_id.0.as_hex().to_string();

                    warn!(%payment_id, "outbound payment failed");

                    refund_failed_withdrawal(&db, &payment_id).await;
                }
            }
            _ => {}
        }

        node.event_handled().expect("Failed to handle event");
    }
}

/// Marks the invoice row paid exactly once and applies its purpose:
/// deposits credit the wallet, session invoices wake the session actor.
/// A settlement that lands after its session already closed is credited
/// to the buyer's wallet instead of vanishing.
pub async fn observe_settled_invoice(ctx: &SessionContext, payment_hash: &str) {
    let db = &ctx.db;

    if !db::mark_invoice_paid(db, payment_hash).await {
        return;
    }

    let invoice = match db::get_invoice(db, payment_hash).await {
        Some(invoice) => invoice,
        None => return,
    };

    match invoice.invoice_purpose() {
        InvoicePurpose::Deposit => {
            credit_settled(db, &invoice.related_id, payment_hash, invoice.amount_sats).await;
        }
        InvoicePurpose::Session => {
            let session = db::get_session(db, &invoice.related_id).await;

            match session {
                Some(session) if !session.session_state().is_terminal() => {
                    deliver(ctx, &session.id, SessionEvent::PaymentObserved).await;
                }
                Some(session) => {
                    warn!(session_id = %session.id, "payment for closed session, crediting wallet");

                    credit_settled(db, &session.user_id, payment_hash, invoice.amount_sats).await;
                }
                None => {}
            }
        }
    }
}

async fn credit_settled(db: &Database, user_id: &str, payment_hash: &str, amount_sats: i64) {
    let credited = ledger::credit(
        db,
        &format!("{payment_hash}-deposit"),
        user_id,
        amount_sats,
        TxType::Deposit,
        "Lightning deposit",
        None,
    )
    .await;

    match credited {
        Ok(balance_sats) => info!(%user_id, ?balance_sats, "deposit credited"),
        Err(e) => error!(%e, "failed to credit deposit"),
    }
}

/// Puts the debited amount back when an outbound withdrawal payment
/// terminally fails. Keyed on the withdrawal row, idempotent.
async fn refund_failed_withdrawal(db: &Database, payment_id: &str) {
    let withdrawal = match ledger::get_transaction(db, payment_id).await {
        Some(tx) if tx.tx_type == TxType::Withdrawal.as_str() => tx,
        _ => return,
    };

    let refunded = ledger::credit(
        db,
        &format!("{payment_id}-refund"),
        &withdrawal.user_id,
        -withdrawal.amount_sats,
        TxType::Refund,
        "Withdrawal failed",
        None,
    )
    .await;

    if let Err(e) = refunded {
        error!(%e, "failed to refund withdrawal");
    }
}

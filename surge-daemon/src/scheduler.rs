use std::time::Duration;

use tokio::time::interval;
use tracing::{info, warn};

use surge_core::unix_time;
use surge_daemon_db::models::{InvoicePurpose, SessionState};

use crate::db;
use crate::lightning::{self, GatewayError, InvoiceState, LightningGateway};
use crate::orchestrator::{SessionContext, SessionEvent, deliver};
use crate::registry;

const EXPIRED_INVOICE_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

/// Fires expiry ticks for overdue active sessions and deadline events
/// for stuck starting and pending ones. Runs off the session table, so
/// a restart re-arms every timer automatically; the receiving actors
/// make duplicate firings harmless.
pub async fn run_expiry_loop(ctx: SessionContext) {
    let mut tick = interval(Duration::from_secs(1));

    loop {
        tick.tick().await;

        let now = unix_time();

        for session in db::sessions_in_state(&ctx.db, SessionState::Active).await {
            if session.expires_at.unwrap_or(i64::MAX) <= now {
                deliver(&ctx, &session.id, SessionEvent::ExpiryTick).await;
            }
        }

        for session in db::sessions_in_state(&ctx.db, SessionState::Starting).await {
            let timeout_secs = if session.is_hf_download {
                ctx.config.download_timeout_secs
            } else {
                ctx.config.starting_timeout_secs
            };

            let deadline = session.paid_at.unwrap_or(session.created_at)
                + timeout_secs as i64 * 1000;

            if deadline <= now {
                warn!(session_id = %session.id, "starting deadline elapsed");

                deliver(&ctx, &session.id, SessionEvent::StartingTimeout).await;
            }
        }

        for session in db::sessions_in_state(&ctx.db, SessionState::PendingPayment).await {
            let deadline = session.created_at + ctx.config.invoice_expiry_secs as i64 * 1000;

            if deadline <= now {
                deliver(&ctx, &session.id, SessionEvent::InvoiceExpired).await;
            }
        }
    }
}

/// Sweeps nodes past the heartbeat timeout offline. A swept node that
/// still held a session takes that session down with it.
pub async fn run_heartbeat_loop(ctx: SessionContext, poll_secs: u64, timeout_secs: u64) {
    let mut tick = interval(Duration::from_secs(poll_secs));

    loop {
        tick.tick().await;

        let stale_before = unix_time() - timeout_secs as i64 * 1000;

        for node in registry::mark_stale_offline(&ctx.db, stale_before).await {
            info!(node_id = %node.id, "node went offline");

            if let Some(session_id) = &node.current_session_id {
                deliver(&ctx, session_id, SessionEvent::NodeFailed).await;
            }
        }
    }
}

/// Polls the Lightning daemon for every pending invoice: settlements
/// wake their purpose, lapsed invoices are expired, and long-expired
/// rows are garbage-collected.
pub async fn run_invoice_poll_loop(ctx: SessionContext, poll_secs: u64) {
    let mut tick = interval(Duration::from_secs(poll_secs));

    loop {
        tick.tick().await;

        let now = unix_time();

        for invoice in db::pending_invoices(&ctx.db).await {
            if invoice.expires_at <= now {
                expire_invoice(&ctx, &invoice.payment_hash, &invoice.related_id, invoice.invoice_purpose()).await;

                continue;
            }

            match ctx.gateway.lookup_invoice(&invoice.payment_hash).await {
                Ok(InvoiceState::Paid { .. }) => {
                    lightning::observe_settled_invoice(&ctx, &invoice.payment_hash).await;
                }
                Ok(InvoiceState::Expired) => {
                    expire_invoice(&ctx, &invoice.payment_hash, &invoice.related_id, invoice.invoice_purpose()).await;
                }
                Ok(InvoiceState::Pending) => {}
                Err(GatewayError::InvalidInvoice(e)) => {
                    warn!(payment_hash = %invoice.payment_hash, %e, "dropping invalid invoice");

                    expire_invoice(&ctx, &invoice.payment_hash, &invoice.related_id, invoice.invoice_purpose()).await;
                }
                Err(GatewayError::Unavailable(e)) => {
                    // Retried on the next tick, bounded by the invoice TTL.
                    warn!(%e, "invoice lookup unavailable");
                }
            }
        }

        db::delete_expired_invoices(&ctx.db, now - EXPIRED_INVOICE_RETENTION_MS).await;
    }
}

async fn expire_invoice(
    ctx: &SessionContext,
    payment_hash: &str,
    related_id: &str,
    purpose: InvoicePurpose,
) {
    if !db::mark_invoice_expired(&ctx.db, payment_hash).await {
        return;
    }

    if purpose == InvoicePurpose::Session {
        deliver(ctx, related_id, SessionEvent::InvoiceExpired).await;
    }
}

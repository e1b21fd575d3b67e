//! Billing audit trail
//!
//! Every reconciliation decision is appended to `billing_events`, including
//! duplicates and ignored events, so replays and disputes can be traced
//! after the fact. Logging is non-fatal by design.

use sitebill_shared::TenantId;
use sqlx::PgPool;

use crate::engine::Outcome;
use crate::event::BillingEvent;

/// Appends reconciliation decisions to the audit table
#[derive(Clone)]
pub struct BillingEventLog {
    pool: PgPool,
}

impl BillingEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record the verdict for a processed event. Failures are logged and
    /// swallowed: the state change already committed.
    pub async fn record(
        &self,
        event: &BillingEvent,
        tenant_id: Option<TenantId>,
        outcome: &Outcome,
    ) {
        #[allow(clippy::disallowed_methods)]
        let data = serde_json::json!({
            "dedup_key": event.dedup_key(),
            "provider_event_id": event.provider_event_id,
            "level": event.level,
            "term_months": event.term_months,
            "currency": event.currency,
        });

        let result = sqlx::query(
            "INSERT INTO billing_events
                 (tenant_id, gateway, event_type, outcome, subscription_id, txn_id,
                  amount_cents, data)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(tenant_id)
        .bind(&event.gateway)
        .bind(event.kind.as_str())
        .bind(outcome.as_str())
        .bind(&event.subscription_id)
        .bind(&event.txn_id)
        .bind(event.amount_cents)
        .bind(&data)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                gateway = %event.gateway,
                event_type = %event.kind,
                error = %e,
                "Failed to write billing audit event"
            );
        }
    }
}

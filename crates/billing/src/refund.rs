//! Operator-initiated refunds
//!
//! Refunds are executed at the provider; the resulting notification flows
//! back through the reconciliation engine, which is the single place that
//! records refund state. Executing here AND recording here would double
//! count when the notification arrives.

use sitebill_shared::TenantId;
use time::OffsetDateTime;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayRegistry;
use crate::store::SubscriptionStore;

/// How much of the last charge to hand back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundMode {
    Full,
    /// Remaining unused fraction of the paid term
    Prorated,
    /// Fixed amount in cents
    Amount(i64),
}

/// Unused fraction of a paid term, as cents of the last payment.
///
/// Terms are valued at a flat average month length rather than the exact
/// calendar span, so a 3-month term refunds the same per day no matter
/// which months it covered. Returns 0 for a lapsed tenant.
pub fn prorated_refund_cents(
    last_payment_cents: i64,
    term_months: i32,
    expires_at: OffsetDateTime,
    now: OffsetDateTime,
    days_per_month: f64,
) -> i64 {
    if expires_at <= now || last_payment_cents <= 0 || term_months < 1 {
        return 0;
    }
    let days_left = (expires_at - now).whole_seconds() as f64 / 86_400.0;
    let term_days = f64::from(term_months) * days_per_month;
    let fraction = (days_left / term_days).min(1.0);
    ((last_payment_cents as f64) * fraction).round() as i64
}

/// Executes refunds against the provider
#[derive(Clone)]
pub struct RefundService {
    store: SubscriptionStore,
    registry: GatewayRegistry,
    config: BillingConfig,
}

impl RefundService {
    pub fn new(store: SubscriptionStore, registry: GatewayRegistry, config: BillingConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Refund (part of) the tenant's most recent charge at the provider.
    /// Returns the amount requested from the provider, in cents.
    pub async fn refund_tenant(
        &self,
        tenant_id: TenantId,
        mode: RefundMode,
    ) -> BillingResult<i64> {
        let tenant = self
            .store
            .find_tenant(tenant_id)
            .await?
            .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))?;
        let txn = self
            .store
            .find_latest_transaction(tenant_id)
            .await?
            .ok_or_else(|| {
                BillingError::InvalidAmount("tenant has no refundable charge".to_string())
            })?;
        let gateway = self
            .registry
            .get(&txn.gateway)
            .ok_or_else(|| BillingError::UnknownGateway(txn.gateway.clone()))?;

        let refundable = txn.amount_cents - txn.refunded_cents;
        if refundable <= 0 {
            return Err(BillingError::InvalidAmount(
                "charge is already fully refunded".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let amount = match mode {
            RefundMode::Full => refundable,
            RefundMode::Prorated => prorated_refund_cents(
                txn.amount_cents,
                tenant.term_months,
                tenant.expires_at,
                now,
                self.config.days_per_month,
            )
            .min(refundable),
            RefundMode::Amount(cents) => {
                if cents <= 0 || cents > refundable {
                    return Err(BillingError::InvalidAmount(format!(
                        "refund amount must be between 1 and {refundable}"
                    )));
                }
                cents
            }
        };
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(
                "nothing left of the paid term to refund".to_string(),
            ));
        }

        // Full refunds of the full charge go as provider-side full refunds
        let partial = (amount < txn.amount_cents).then_some(amount);
        gateway.refund_charge(&txn.txn_id, partial).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            gateway = %txn.gateway,
            txn_id = %txn.txn_id,
            amount_cents = amount,
            "Refund requested at provider"
        );
        Ok(amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2025-06-01 00:00 UTC);
    const DPM: f64 = 30.4166;

    #[test]
    fn test_half_term_left_refunds_half() {
        // 3-month term, ~45.6 days left of ~91.25
        let expires = NOW + time::Duration::days(45) + time::Duration::seconds(53_998);
        let refund = prorated_refund_cents(9000, 3, expires, NOW, DPM);
        assert!((4490..=4510).contains(&refund), "got {refund}");
    }

    #[test]
    fn test_lapsed_tenant_refunds_nothing() {
        let expires = datetime!(2025-05-01 00:00 UTC);
        assert_eq!(prorated_refund_cents(9000, 3, expires, NOW, DPM), 0);
    }

    #[test]
    fn test_refund_never_exceeds_payment() {
        // Expiry further out than the term (stacked renewals): clamp to 100%
        let expires = datetime!(2026-06-01 00:00 UTC);
        assert_eq!(prorated_refund_cents(3000, 1, expires, NOW, DPM), 3000);
    }

    #[test]
    fn test_full_unused_term_refunds_everything_nearly() {
        let expires = NOW + time::Duration::days(91);
        let refund = prorated_refund_cents(9000, 3, expires, NOW, DPM);
        assert!(refund > 8900 && refund <= 9000, "got {refund}");
    }

    #[test]
    fn test_zero_payment_refunds_nothing() {
        let expires = NOW + time::Duration::days(30);
        assert_eq!(prorated_refund_cents(0, 1, expires, NOW, DPM), 0);
    }
}

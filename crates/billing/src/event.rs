//! Canonical billing events
//!
//! Gateway notifications (PayPal IPN, Stripe webhooks) are normalized into
//! [`BillingEvent`] before touching the reconciliation engine. The engine
//! never sees gateway wire formats.

use serde::{Deserialize, Serialize};
use sitebill_shared::TenantId;
use time::OffsetDateTime;

/// Canonical event kinds the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    PaymentSucceeded,
    PaymentFailed,
    PaymentPending,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCancelled,
    Refunded,
    PartiallyRefunded,
    /// Chargeback / payment reversal: funds were pulled back by the
    /// provider, access is withdrawn immediately
    ChargebackReversed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PaymentSucceeded => "payment_succeeded",
            EventKind::PaymentFailed => "payment_failed",
            EventKind::PaymentPending => "payment_pending",
            EventKind::SubscriptionCreated => "subscription_created",
            EventKind::SubscriptionUpdated => "subscription_updated",
            EventKind::SubscriptionCancelled => "subscription_cancelled",
            EventKind::Refunded => "refunded",
            EventKind::PartiallyRefunded => "partially_refunded",
            EventKind::ChargebackReversed => "chargeback_reversed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a notification identifies the tenant it belongs to.
/// Resolution precedence in the store: id, then activation key, then the
/// provider-side identifiers on the active link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantRef {
    Id(TenantId),
    /// Signup handshake key carried through checkout metadata; a match on a
    /// not-yet-provisioned signup provisions the tenant
    ActivationKey(String),
    /// Provider customer id (Stripe `cus_..`, PayPal payer id)
    ProviderCustomer(String),
}

/// A normalized billing event, provider-agnostic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub gateway: String,
    pub kind: EventKind,
    pub tenant_ref: Option<TenantRef>,
    /// Provider subscription / recurring-profile id
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    /// Provider transaction/charge id for money movements
    pub txn_id: Option<String>,
    pub level: Option<i32>,
    pub term_months: Option<i32>,
    pub amount_cents: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    /// Provider-assigned notification id (Stripe `evt_..`); PayPal IPN has
    /// none
    pub provider_event_id: Option<String>,
}

impl BillingEvent {
    /// Idempotency key for the processed-event ledger.
    ///
    /// Precedence: provider event id, then (txn, kind) so a refund is not
    /// shadowed by the payment on the same transaction, then
    /// (subscription, kind, timestamp) for status changes that carry no
    /// transaction. Replays preserve all of these fields, so a replay maps
    /// to the same key.
    pub fn dedup_key(&self) -> String {
        if let Some(id) = &self.provider_event_id {
            return format!("{}:evt:{}", self.gateway, id);
        }
        if let Some(txn) = &self.txn_id {
            return format!("{}:txn:{}:{}", self.gateway, txn, self.kind);
        }
        if let Some(sub) = &self.subscription_id {
            return format!(
                "{}:sub:{}:{}:{}",
                self.gateway,
                sub,
                self.kind,
                self.occurred_at.unix_timestamp()
            );
        }
        format!(
            "{}:{}:{}",
            self.gateway,
            self.kind,
            self.occurred_at.unix_timestamp()
        )
    }

    /// Digest of the expiry extension a successful payment would apply.
    /// Two payments with the same digest inside the dedup window are the
    /// same notification fired twice.
    pub fn extension_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.subscription_id.as_deref().unwrap_or(""),
            self.level.unwrap_or(0),
            self.term_months.unwrap_or(0),
            self.amount_cents
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn event(kind: EventKind) -> BillingEvent {
        BillingEvent {
            gateway: "paypal".to_string(),
            kind,
            tenant_ref: None,
            subscription_id: Some("I-ABC123".to_string()),
            customer_id: None,
            txn_id: Some("TXN-1".to_string()),
            level: Some(2),
            term_months: Some(3),
            amount_cents: 7500,
            currency: "USD".to_string(),
            occurred_at: datetime!(2025-06-01 10:00 UTC),
            provider_event_id: None,
        }
    }

    #[test]
    fn test_dedup_key_prefers_provider_event_id() {
        let mut e = event(EventKind::PaymentSucceeded);
        e.gateway = "stripe".to_string();
        e.provider_event_id = Some("evt_42".to_string());
        assert_eq!(e.dedup_key(), "stripe:evt:evt_42");
    }

    #[test]
    fn test_dedup_key_replay_is_stable() {
        let a = event(EventKind::PaymentSucceeded);
        let b = event(EventKind::PaymentSucceeded);
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_refund_and_payment_on_same_txn_do_not_collide() {
        let payment = event(EventKind::PaymentSucceeded);
        let refund = event(EventKind::Refunded);
        assert_ne!(payment.dedup_key(), refund.dedup_key());
    }

    #[test]
    fn test_status_events_without_txn_key_on_subscription() {
        let mut e = event(EventKind::SubscriptionCancelled);
        e.txn_id = None;
        assert!(e.dedup_key().starts_with("paypal:sub:I-ABC123:"));
    }

    #[test]
    fn test_extension_key_reflects_plan_and_amount() {
        let a = event(EventKind::PaymentSucceeded);
        let mut b = event(EventKind::PaymentSucceeded);
        assert_eq!(a.extension_key(), b.extension_key());
        b.amount_cents = 9900;
        assert_ne!(a.extension_key(), b.extension_key());
    }
}

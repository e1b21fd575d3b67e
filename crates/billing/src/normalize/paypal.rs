//! PayPal IPN normalizer
//!
//! Maps verified IPN form payloads to canonical events. Money movements are
//! classified by `payment_status`; subscription lifecycle messages by
//! `txn_type`. IPN timestamps arrive in PayPal's legacy US-locale format, so
//! events are stamped with the intake time instead.

use std::collections::HashMap;

use sitebill_shared::money::cents_from_decimal;
use sitebill_shared::TenantId;
use time::OffsetDateTime;
use url::form_urlencoded;

use crate::event::{BillingEvent, EventKind, TenantRef};

/// Parse a raw IPN body into a field map
pub fn parse_ipn_body(raw: &str) -> HashMap<String, String> {
    form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// The `custom` passthrough we attach at checkout:
/// `pre:tenant_id:activation_key:level:term:amount:currency:timestamp`
#[derive(Debug, Clone, PartialEq)]
pub struct CustomField {
    pub tenant_id: i64,
    pub activation_key: String,
    pub level: i32,
    pub term_months: i32,
    pub amount_cents: i64,
    pub currency: String,
}

pub fn parse_custom(custom: &str) -> Option<CustomField> {
    let parts: Vec<&str> = custom.split(':').collect();
    if parts.len() < 8 || parts[0] != "pre" {
        return None;
    }
    Some(CustomField {
        tenant_id: parts[1].parse().ok()?,
        activation_key: parts[2].to_string(),
        level: parts[3].parse().ok()?,
        term_months: parts[4].parse().ok()?,
        amount_cents: cents_from_decimal(parts[5])?,
        currency: parts[6].to_string(),
    })
}

fn kind_from_payment_status(status: &str) -> Option<EventKind> {
    match status {
        "Completed" | "Processed" => Some(EventKind::PaymentSucceeded),
        "Failed" | "Denied" => Some(EventKind::PaymentFailed),
        "Pending" => Some(EventKind::PaymentPending),
        "Refunded" => Some(EventKind::Refunded),
        "Partially_Refunded" => Some(EventKind::PartiallyRefunded),
        "Reversed" => Some(EventKind::ChargebackReversed),
        _ => None,
    }
}

fn kind_from_txn_type(txn_type: &str) -> Option<EventKind> {
    match txn_type {
        "subscr_signup" | "recurring_payment_profile_created" => {
            Some(EventKind::SubscriptionCreated)
        }
        "subscr_modify" => Some(EventKind::SubscriptionUpdated),
        "subscr_cancel" | "recurring_payment_profile_cancel"
        | "recurring_payment_suspended" => Some(EventKind::SubscriptionCancelled),
        "subscr_failed" | "recurring_payment_failed"
        | "recurring_payment_suspended_due_to_max_failed_payment" => {
            Some(EventKind::PaymentFailed)
        }
        // End-of-term carries no state change; the paid-through expiry
        // simply lapses
        _ => None,
    }
}

fn tenant_ref(fields: &HashMap<String, String>, custom: Option<&CustomField>) -> Option<TenantRef> {
    if let Some(c) = custom {
        if c.tenant_id > 0 {
            return Some(TenantRef::Id(TenantId(c.tenant_id)));
        }
        if !c.activation_key.is_empty() {
            return Some(TenantRef::ActivationKey(c.activation_key.clone()));
        }
    }
    // Express recurring profiles echo our PROFILEREFERENCE here
    if let Some(key) = fields.get("rp_invoice_id") {
        if !key.is_empty() {
            return Some(TenantRef::ActivationKey(key.clone()));
        }
    }
    fields
        .get("payer_id")
        .filter(|p| !p.is_empty())
        .map(|p| TenantRef::ProviderCustomer(p.clone()))
}

/// Normalize a verified IPN into a canonical event.
///
/// Returns None for message types the engine has no interest in (echeck
/// notices, EOT markers, unknown statuses); the raw payload is still kept
/// in the notification log.
pub fn normalize(
    fields: &HashMap<String, String>,
    received_at: OffsetDateTime,
) -> Option<BillingEvent> {
    let custom = fields.get("custom").and_then(|c| parse_custom(c));

    let kind = fields
        .get("payment_status")
        .and_then(|s| kind_from_payment_status(s))
        .or_else(|| fields.get("txn_type").and_then(|t| kind_from_txn_type(t)))?;

    // Refunds and reversals arrive with a negative gross
    let amount_cents = fields
        .get("mc_gross")
        .and_then(|g| cents_from_decimal(g.trim_start_matches('-')))
        .or(custom.as_ref().map(|c| c.amount_cents))
        .unwrap_or(0);

    let subscription_id = fields
        .get("subscr_id")
        .or_else(|| fields.get("recurring_payment_id"))
        .filter(|s| !s.is_empty())
        .cloned();

    let txn_id = fields.get("txn_id").filter(|t| !t.is_empty()).cloned();

    // A settled payment without a transaction id cannot be recorded
    // idempotently; drop it rather than guess.
    if kind == EventKind::PaymentSucceeded && txn_id.is_none() {
        tracing::warn!("IPN payment without txn_id, ignoring");
        return None;
    }

    // Refund/reversal IPNs reference the original charge in parent_txn_id;
    // their own txn_id identifies the refund transaction.
    let txn_id = match kind {
        EventKind::Refunded | EventKind::PartiallyRefunded | EventKind::ChargebackReversed => {
            fields
                .get("parent_txn_id")
                .filter(|t| !t.is_empty())
                .cloned()
                .or(txn_id)
        }
        _ => txn_id,
    };

    Some(BillingEvent {
        gateway: "paypal".to_string(),
        kind,
        tenant_ref: tenant_ref(fields, custom.as_ref()),
        subscription_id,
        customer_id: fields.get("payer_id").filter(|p| !p.is_empty()).cloned(),
        txn_id,
        level: custom.as_ref().map(|c| c.level),
        term_months: custom.as_ref().map(|c| c.term_months),
        amount_cents,
        currency: fields
            .get("mc_currency")
            .cloned()
            .or(custom.as_ref().map(|c| c.currency.clone()))
            .unwrap_or_else(|| "USD".to_string()),
        occurred_at: received_at,
        provider_event_id: None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const AT: OffsetDateTime = datetime!(2025-06-01 10:00 UTC);

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_custom_round_trip() {
        let c = parse_custom("pre:42:abc123:2:3:75.00:USD:1748772000").unwrap();
        assert_eq!(c.tenant_id, 42);
        assert_eq!(c.activation_key, "abc123");
        assert_eq!(c.level, 2);
        assert_eq!(c.term_months, 3);
        assert_eq!(c.amount_cents, 7500);
        assert_eq!(c.currency, "USD");
    }

    #[test]
    fn test_parse_custom_rejects_foreign_payloads() {
        assert!(parse_custom("something-else").is_none());
        assert!(parse_custom("pre:1:key").is_none());
    }

    #[test]
    fn test_completed_payment_normalizes() {
        let f = fields(&[
            ("payment_status", "Completed"),
            ("txn_id", "TXN-77"),
            ("mc_gross", "75.00"),
            ("mc_currency", "USD"),
            ("subscr_id", "I-XYZ"),
            ("custom", "pre:42:abc:2:3:75.00:USD:1748772000"),
        ]);
        let e = normalize(&f, AT).unwrap();
        assert_eq!(e.kind, EventKind::PaymentSucceeded);
        assert_eq!(e.txn_id.as_deref(), Some("TXN-77"));
        assert_eq!(e.amount_cents, 7500);
        assert_eq!(e.subscription_id.as_deref(), Some("I-XYZ"));
        assert_eq!(e.tenant_ref, Some(TenantRef::Id(TenantId(42))));
        assert_eq!(e.level, Some(2));
        assert_eq!(e.term_months, Some(3));
    }

    #[test]
    fn test_payment_without_txn_id_is_dropped() {
        let f = fields(&[("payment_status", "Completed"), ("mc_gross", "10.00")]);
        assert!(normalize(&f, AT).is_none());
    }

    #[test]
    fn test_refund_references_parent_txn() {
        let f = fields(&[
            ("payment_status", "Refunded"),
            ("txn_id", "REF-1"),
            ("parent_txn_id", "TXN-77"),
            ("mc_gross", "-25.00"),
            ("mc_currency", "USD"),
        ]);
        let e = normalize(&f, AT).unwrap();
        assert_eq!(e.kind, EventKind::Refunded);
        assert_eq!(e.txn_id.as_deref(), Some("TXN-77"));
        assert_eq!(e.amount_cents, 2500);
    }

    #[test]
    fn test_reversal_maps_to_chargeback() {
        let f = fields(&[
            ("payment_status", "Reversed"),
            ("txn_id", "REV-1"),
            ("parent_txn_id", "TXN-77"),
            ("mc_gross", "-75.00"),
        ]);
        let e = normalize(&f, AT).unwrap();
        assert_eq!(e.kind, EventKind::ChargebackReversed);
        assert_eq!(e.txn_id.as_deref(), Some("TXN-77"));
    }

    #[test]
    fn test_subscription_lifecycle_by_txn_type() {
        let cancel = fields(&[("txn_type", "subscr_cancel"), ("subscr_id", "I-XYZ")]);
        assert_eq!(
            normalize(&cancel, AT).unwrap().kind,
            EventKind::SubscriptionCancelled
        );

        let signup = fields(&[
            ("txn_type", "subscr_signup"),
            ("subscr_id", "I-XYZ"),
            ("custom", "pre:0:abc:1:1:10.00:USD:1748772000"),
        ]);
        let e = normalize(&signup, AT).unwrap();
        assert_eq!(e.kind, EventKind::SubscriptionCreated);
        assert_eq!(
            e.tenant_ref,
            Some(TenantRef::ActivationKey("abc".to_string()))
        );
    }

    #[test]
    fn test_eot_is_ignored() {
        let f = fields(&[("txn_type", "subscr_eot"), ("subscr_id", "I-XYZ")]);
        assert!(normalize(&f, AT).is_none());
    }

    #[test]
    fn test_express_profile_reference_resolves_tenant() {
        let f = fields(&[
            ("txn_type", "recurring_payment_profile_created"),
            ("recurring_payment_id", "I-PROF"),
            ("rp_invoice_id", "act-key-9"),
        ]);
        let e = normalize(&f, AT).unwrap();
        assert_eq!(e.subscription_id.as_deref(), Some("I-PROF"));
        assert_eq!(
            e.tenant_ref,
            Some(TenantRef::ActivationKey("act-key-9".to_string()))
        );
    }
}

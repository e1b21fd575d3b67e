//! Stripe webhook normalizer
//!
//! Works on the raw event JSON rather than async-stripe's typed `Event`, so
//! intake is not coupled to the library's pinned API version (payloads from
//! newer dashboard API versions still normalize).

use serde_json::Value;
use sitebill_shared::TenantId;
use time::OffsetDateTime;

use crate::event::{BillingEvent, EventKind, TenantRef};

fn str_field<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn i64_field(obj: &Value, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

/// The subscription line inside an invoice, when present.
///
/// Invoices bundle one-off items and the subscription renewal in the same
/// `lines` array; the renewal line is the one typed "subscription" and its
/// metadata (not the invoice's) carries our plan fields. Falls back to the
/// invoice's own subscription reference for single-line invoices.
fn subscription_line(invoice: &Value) -> Option<&Value> {
    invoice
        .get("lines")?
        .get("data")?
        .as_array()?
        .iter()
        .find(|line| str_field(line, "type") == Some("subscription"))
}

fn invoice_subscription_id(invoice: &Value) -> Option<String> {
    if let Some(line) = subscription_line(invoice) {
        if let Some(id) = str_field(line, "subscription") {
            return Some(id.to_string());
        }
        if let Some(id) = str_field(line, "id") {
            return Some(id.to_string());
        }
    }
    str_field(invoice, "subscription").map(str::to_string)
}

fn metadata_of(obj: &Value) -> Option<&Value> {
    obj.get("metadata").filter(|m| m.is_object())
}

/// Plan fields we stash in metadata at checkout
#[derive(Debug, Default, Clone, Copy)]
struct PlanMeta {
    level: Option<i32>,
    term_months: Option<i32>,
}

fn plan_meta(metadata: Option<&Value>) -> PlanMeta {
    let Some(m) = metadata else {
        return PlanMeta::default();
    };
    PlanMeta {
        level: str_field(m, "level").and_then(|v| v.parse().ok()),
        term_months: str_field(m, "term_months").and_then(|v| v.parse().ok()),
    }
}

fn tenant_ref_from(metadata: Option<&Value>, customer: Option<&str>) -> Option<TenantRef> {
    if let Some(m) = metadata {
        if let Some(id) = str_field(m, "tenant_id").and_then(|v| v.parse::<i64>().ok()) {
            return Some(TenantRef::Id(TenantId(id)));
        }
        if let Some(key) = str_field(m, "activation_key").filter(|k| !k.is_empty()) {
            return Some(TenantRef::ActivationKey(key.to_string()));
        }
    }
    customer.map(|c| TenantRef::ProviderCustomer(c.to_string()))
}

/// Term length from a subscription object: explicit metadata wins, then the
/// price's month interval
fn subscription_term(sub: &Value) -> Option<i32> {
    if let Some(t) = plan_meta(metadata_of(sub)).term_months {
        return Some(t);
    }
    let plan = sub.get("plan").or_else(|| {
        sub.get("items")?
            .get("data")?
            .as_array()?
            .first()?
            .get("price")
    })?;
    let interval = str_field(plan, "interval").or_else(|| {
        plan.get("recurring")
            .and_then(|r| str_field(r, "interval"))
    })?;
    if interval != "month" {
        return None;
    }
    i64_field(plan, "interval_count")
        .or_else(|| {
            plan.get("recurring")
                .and_then(|r| i64_field(r, "interval_count"))
        })
        .map(|c| c as i32)
}

/// The delta refunded by the refund that triggered a `charge.refunded`
/// event. `amount_refunded` on the charge is cumulative; the most recent
/// refund object carries the increment.
fn latest_refund_cents(charge: &Value) -> Option<i64> {
    charge
        .get("refunds")?
        .get("data")?
        .as_array()?
        .first()
        .and_then(|r| i64_field(r, "amount"))
}

/// Normalize a verified Stripe webhook event.
///
/// Returns None for event types the engine does not act on; the raw payload
/// is still kept in the notification log.
pub fn normalize(event: &Value) -> Option<BillingEvent> {
    let event_type = str_field(event, "type")?;
    let object = event.get("data")?.get("object")?;
    let occurred_at = i64_field(event, "created")
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);
    let provider_event_id = str_field(event, "id").map(str::to_string);
    let customer = str_field(object, "customer");

    let base = |kind: EventKind| BillingEvent {
        gateway: "stripe".to_string(),
        kind,
        tenant_ref: tenant_ref_from(metadata_of(object), customer),
        subscription_id: None,
        customer_id: customer.map(str::to_string),
        txn_id: None,
        level: None,
        term_months: None,
        amount_cents: 0,
        currency: str_field(object, "currency")
            .map(str::to_uppercase)
            .unwrap_or_else(|| "USD".to_string()),
        occurred_at,
        provider_event_id: provider_event_id.clone(),
    };

    match event_type {
        "checkout.session.completed" => {
            let meta = plan_meta(metadata_of(object));
            let mut e = base(EventKind::SubscriptionCreated);
            e.subscription_id = str_field(object, "subscription").map(str::to_string);
            e.level = meta.level;
            e.term_months = meta.term_months;
            e.amount_cents = i64_field(object, "amount_total").unwrap_or(0);
            Some(e)
        }
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.deleted" => {
            let kind = match event_type {
                "customer.subscription.created" => EventKind::SubscriptionCreated,
                "customer.subscription.updated" => EventKind::SubscriptionUpdated,
                _ => EventKind::SubscriptionCancelled,
            };
            let meta = plan_meta(metadata_of(object));
            let mut e = base(kind);
            e.subscription_id = str_field(object, "id").map(str::to_string);
            e.level = meta.level;
            e.term_months = subscription_term(object);
            Some(e)
        }
        "invoice.payment_succeeded" | "invoice.payment_failed" => {
            let kind = if event_type == "invoice.payment_succeeded" {
                EventKind::PaymentSucceeded
            } else {
                EventKind::PaymentFailed
            };
            let line_meta = subscription_line(object).and_then(metadata_of);
            let meta = plan_meta(line_meta.or_else(|| metadata_of(object)));
            let mut e = base(kind);
            // Plan identity can live on the subscription line rather than
            // the invoice itself
            if e.tenant_ref.is_none() || line_meta.is_some() {
                if let Some(r) = tenant_ref_from(line_meta, customer) {
                    e.tenant_ref = Some(r);
                }
            }
            e.subscription_id = invoice_subscription_id(object);
            e.txn_id = str_field(object, "charge")
                .or_else(|| str_field(object, "payment_intent"))
                .or_else(|| str_field(object, "id"))
                .map(str::to_string);
            e.level = meta.level;
            e.term_months = meta.term_months;
            e.amount_cents = i64_field(object, "amount_paid")
                .or_else(|| i64_field(object, "amount_due"))
                .unwrap_or(0);
            Some(e)
        }
        "charge.refunded" => {
            let amount = i64_field(object, "amount").unwrap_or(0);
            let refunded = i64_field(object, "amount_refunded").unwrap_or(0);
            let kind = if refunded >= amount {
                EventKind::Refunded
            } else {
                EventKind::PartiallyRefunded
            };
            let mut e = base(kind);
            e.txn_id = str_field(object, "id").map(str::to_string);
            e.amount_cents = latest_refund_cents(object).unwrap_or(refunded);
            Some(e)
        }
        "charge.dispute.created" => {
            let mut e = base(EventKind::ChargebackReversed);
            e.txn_id = str_field(object, "charge").map(str::to_string);
            e.amount_cents = i64_field(object, "amount").unwrap_or(0);
            Some(e)
        }
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invoice_prefers_nested_subscription_line() {
        let event = json!({
            "id": "evt_1",
            "type": "invoice.payment_succeeded",
            "created": 1748772000,
            "data": { "object": {
                "id": "in_1",
                "customer": "cus_9",
                "charge": "ch_55",
                "amount_paid": 7500,
                "currency": "usd",
                "subscription": "sub_outer",
                "lines": { "data": [
                    { "type": "invoiceitem", "id": "ii_1" },
                    { "type": "subscription", "id": "sli_1",
                      "subscription": "sub_nested",
                      "metadata": { "activation_key": "abc", "level": "2", "term_months": "3" } }
                ]}
            }}
        });
        let e = normalize(&event).unwrap();
        assert_eq!(e.kind, EventKind::PaymentSucceeded);
        assert_eq!(e.subscription_id.as_deref(), Some("sub_nested"));
        assert_eq!(e.txn_id.as_deref(), Some("ch_55"));
        assert_eq!(e.amount_cents, 7500);
        assert_eq!(e.level, Some(2));
        assert_eq!(e.term_months, Some(3));
        assert_eq!(
            e.tenant_ref,
            Some(TenantRef::ActivationKey("abc".to_string()))
        );
        assert_eq!(e.provider_event_id.as_deref(), Some("evt_1"));
    }

    #[test]
    fn test_invoice_without_typed_line_uses_outer_subscription() {
        let event = json!({
            "id": "evt_2",
            "type": "invoice.payment_succeeded",
            "created": 1748772000,
            "data": { "object": {
                "id": "in_2",
                "customer": "cus_9",
                "amount_paid": 1000,
                "subscription": "sub_outer",
                "lines": { "data": [ { "type": "invoiceitem", "id": "ii_1" } ] }
            }}
        });
        let e = normalize(&event).unwrap();
        assert_eq!(e.subscription_id.as_deref(), Some("sub_outer"));
        // No charge on the payload: falls back to the invoice id
        assert_eq!(e.txn_id.as_deref(), Some("in_2"));
        assert_eq!(
            e.tenant_ref,
            Some(TenantRef::ProviderCustomer("cus_9".to_string()))
        );
    }

    #[test]
    fn test_subscription_deleted_maps_to_cancelled() {
        let event = json!({
            "id": "evt_3",
            "type": "customer.subscription.deleted",
            "created": 1748772000,
            "data": { "object": {
                "id": "sub_1",
                "customer": "cus_9",
                "metadata": { "tenant_id": "42" },
                "plan": { "interval": "month", "interval_count": 3 }
            }}
        });
        let e = normalize(&event).unwrap();
        assert_eq!(e.kind, EventKind::SubscriptionCancelled);
        assert_eq!(e.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(e.term_months, Some(3));
        assert_eq!(e.tenant_ref, Some(TenantRef::Id(TenantId(42))));
    }

    #[test]
    fn test_partial_refund_uses_latest_refund_delta() {
        let event = json!({
            "id": "evt_4",
            "type": "charge.refunded",
            "created": 1748772000,
            "data": { "object": {
                "id": "ch_55",
                "customer": "cus_9",
                "amount": 7500,
                "amount_refunded": 4000,
                "refunds": { "data": [ { "id": "re_2", "amount": 1500 } ] }
            }}
        });
        let e = normalize(&event).unwrap();
        assert_eq!(e.kind, EventKind::PartiallyRefunded);
        assert_eq!(e.txn_id.as_deref(), Some("ch_55"));
        assert_eq!(e.amount_cents, 1500);
    }

    #[test]
    fn test_full_refund_classified() {
        let event = json!({
            "id": "evt_5",
            "type": "charge.refunded",
            "created": 1748772000,
            "data": { "object": {
                "id": "ch_55",
                "amount": 7500,
                "amount_refunded": 7500,
                "refunds": { "data": [ { "id": "re_1", "amount": 7500 } ] }
            }}
        });
        assert_eq!(normalize(&event).unwrap().kind, EventKind::Refunded);
    }

    #[test]
    fn test_dispute_maps_to_chargeback() {
        let event = json!({
            "id": "evt_6",
            "type": "charge.dispute.created",
            "created": 1748772000,
            "data": { "object": { "id": "dp_1", "charge": "ch_55", "amount": 7500 } }
        });
        let e = normalize(&event).unwrap();
        assert_eq!(e.kind, EventKind::ChargebackReversed);
        assert_eq!(e.txn_id.as_deref(), Some("ch_55"));
    }

    #[test]
    fn test_unhandled_types_return_none() {
        let event = json!({
            "id": "evt_7",
            "type": "customer.created",
            "created": 1748772000,
            "data": { "object": { "id": "cus_9" } }
        });
        assert!(normalize(&event).is_none());
    }
}

//! Integration tests for event reconciliation against a real database
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/sitebill_test"
//! cargo test --test reconciliation -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use sitebill_billing::audit::BillingEventLog;
use sitebill_billing::config::{BillingConfig, PlanTable};
use sitebill_billing::email::BillingEmailService;
use sitebill_billing::engine::{Outcome, ReconcileEngine};
use sitebill_billing::event::{BillingEvent, EventKind, TenantRef};
use sitebill_billing::gateway::GatewayRegistry;
use sitebill_billing::store::SubscriptionStore;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

async fn setup() -> (ReconcileEngine, SubscriptionStore, PgPool) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let config = BillingConfig {
        plans: PlanTable::parse("1:Starter:1000,2:Pro:2500,3:Business:5000").unwrap(),
        currency: "USD".to_string(),
        app_base_url: "http://localhost:3000".to_string(),
        days_per_month: 30.4166,
        extension_dedup_window_secs: 300,
        recurring_billing: true,
        trial_days: 0,
        setup_fee_cents: 0,
        alerts_email: "billing@example.com".to_string(),
    };
    let store = SubscriptionStore::new(pool.clone());
    let engine = ReconcileEngine::new(
        store.clone(),
        GatewayRegistry::new(),
        BillingEmailService::from_env(),
        BillingEventLog::new(pool.clone()),
        config,
    );
    (engine, store, pool)
}

fn payment_event(key: &str, sub: &str, txn: &str, cents: i64) -> BillingEvent {
    BillingEvent {
        gateway: "paypal".to_string(),
        kind: EventKind::PaymentSucceeded,
        tenant_ref: Some(TenantRef::ActivationKey(key.to_string())),
        subscription_id: Some(sub.to_string()),
        customer_id: Some("PAYER-TEST".to_string()),
        txn_id: Some(txn.to_string()),
        level: Some(2),
        term_months: Some(3),
        amount_cents: cents,
        currency: "USD".to_string(),
        occurred_at: OffsetDateTime::now_utc(),
        provider_event_id: None,
    }
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Needs DATABASE_URL
async fn payment_for_unknown_activation_key_provisions_tenant() {
    let (engine, store, _pool) = setup().await;
    let key = unique("key");
    let event = payment_event(&key, &unique("I"), &unique("TXN"), 7500);

    let outcome = engine.process(&event).await.unwrap();
    assert_eq!(outcome, Outcome::Applied);

    let tenant = store
        .find_tenant_by_activation_key(&key)
        .await
        .unwrap()
        .expect("tenant was provisioned");
    assert_eq!(tenant.level, 2);
    assert_eq!(tenant.term_months, 3);
    assert!(tenant.expires_at > OffsetDateTime::now_utc());

    let link = store
        .find_active_link(tenant.id, "paypal")
        .await
        .unwrap()
        .expect("provider link was adopted");
    assert_eq!(link.subscription_id, event.subscription_id.unwrap());
}

#[tokio::test]
#[ignore]
async fn replayed_notification_is_a_duplicate() {
    let (engine, store, _pool) = setup().await;
    let key = unique("key");
    let event = payment_event(&key, &unique("I"), &unique("TXN"), 7500);

    assert_eq!(engine.process(&event).await.unwrap(), Outcome::Applied);
    let tenant = store
        .find_tenant_by_activation_key(&key)
        .await
        .unwrap()
        .unwrap();
    let first_expiry = tenant.expires_at;

    // Same IPN delivered again
    assert_eq!(engine.process(&event).await.unwrap(), Outcome::Duplicate);
    let tenant = store.find_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(tenant.expires_at, first_expiry, "replay must not extend");
}

#[tokio::test]
#[ignore]
async fn final_payment_after_cancellation_extends_but_stays_cancelled() {
    let (engine, store, _pool) = setup().await;
    let key = unique("key");
    let sub = unique("I");

    let first = payment_event(&key, &sub, &unique("TXN"), 7500);
    engine.process(&first).await.unwrap();
    let tenant = store
        .find_tenant_by_activation_key(&key)
        .await
        .unwrap()
        .unwrap();
    let paid_through = tenant.expires_at;

    let mut cancel = payment_event(&key, &sub, "unused", 0);
    cancel.kind = EventKind::SubscriptionCancelled;
    cancel.txn_id = None;
    assert_eq!(engine.process(&cancel).await.unwrap(), Outcome::Applied);

    // The provider settles one last charge after the cancellation
    let last = payment_event(&key, &sub, &unique("TXN"), 7500);
    assert_eq!(engine.process(&last).await.unwrap(), Outcome::Applied);

    let tenant = store.find_tenant(tenant.id).await.unwrap().unwrap();
    assert!(tenant.is_cancelled, "payment must not un-cancel");
    assert!(tenant.expires_at > paid_through, "final charge still extends");
}

#[tokio::test]
#[ignore]
async fn refunds_are_clamped_to_the_charge() {
    let (engine, store, _pool) = setup().await;
    let key = unique("key");
    let sub = unique("I");
    let txn = unique("TXN");

    engine
        .process(&payment_event(&key, &sub, &txn, 7500))
        .await
        .unwrap();

    let mut refund = payment_event(&key, &sub, &txn, 5000);
    refund.kind = EventKind::PartiallyRefunded;
    refund.tenant_ref = None;
    assert_eq!(engine.process(&refund).await.unwrap(), Outcome::Applied);

    // A second over-large refund only takes what is left
    let mut second = payment_event(&key, &sub, &txn, 5000);
    second.kind = EventKind::Refunded;
    second.tenant_ref = None;
    assert_eq!(engine.process(&second).await.unwrap(), Outcome::Applied);

    let record = store
        .find_transaction("paypal", &txn)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.refunded_cents, 7500);

    // Nothing left: a third refund event is a duplicate
    let mut third = payment_event(&key, &sub, &txn, 100);
    third.kind = EventKind::Refunded;
    third.tenant_ref = None;
    assert_eq!(engine.process(&third).await.unwrap(), Outcome::Duplicate);
}

#[tokio::test]
#[ignore]
async fn chargeback_revokes_access_immediately() {
    let (engine, store, _pool) = setup().await;
    let key = unique("key");
    let txn = unique("TXN");

    engine
        .process(&payment_event(&key, &unique("I"), &txn, 7500))
        .await
        .unwrap();

    let mut chargeback = payment_event(&key, "unused", &txn, 7500);
    chargeback.kind = EventKind::ChargebackReversed;
    chargeback.subscription_id = None;
    assert_eq!(engine.process(&chargeback).await.unwrap(), Outcome::Applied);

    let tenant = store
        .find_tenant_by_activation_key(&key)
        .await
        .unwrap()
        .unwrap();
    assert!(tenant.is_cancelled);
    assert!(tenant.expires_at <= OffsetDateTime::now_utc());
}

#[tokio::test]
#[ignore]
async fn notification_payload_is_recorded_before_processing() {
    let (_engine, store, pool) = setup().await;
    let payload = serde_json::json!({ "txn_type": "subscr_signup" });

    // Intake logs the verified payload as "received" up front; the outcome
    // lands later, so a crash in between never loses the notification.
    let id = store
        .log_notification("paypal", &payload, "received")
        .await
        .unwrap();
    let (outcome,): (Option<String>,) =
        sqlx::query_as("SELECT outcome FROM gateway_notifications WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(outcome.as_deref(), Some("received"));

    store.set_notification_outcome(id, "applied").await.unwrap();
    let (outcome,): (Option<String>,) =
        sqlx::query_as("SELECT outcome FROM gateway_notifications WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(outcome.as_deref(), Some("applied"));
}

#[tokio::test]
#[ignore]
async fn new_subscription_supersedes_the_old_link() {
    let (engine, store, _pool) = setup().await;
    let key = unique("key");
    let old_sub = unique("I-OLD");
    let new_sub = unique("I-NEW");

    engine
        .process(&payment_event(&key, &old_sub, &unique("TXN"), 7500))
        .await
        .unwrap();

    let mut created = payment_event(&key, &new_sub, "unused", 0);
    created.kind = EventKind::SubscriptionCreated;
    created.txn_id = None;
    assert_eq!(engine.process(&created).await.unwrap(), Outcome::Applied);

    let tenant = store
        .find_tenant_by_activation_key(&key)
        .await
        .unwrap()
        .unwrap();
    let link = store
        .find_active_link(tenant.id, "paypal")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.subscription_id, new_sub);

    // A straggler payment for the retired profile is ignored
    let stale = payment_event(&key, &old_sub, &unique("TXN"), 7500);
    assert!(matches!(
        engine.process(&stale).await.unwrap(),
        Outcome::Ignored(_)
    ));
}

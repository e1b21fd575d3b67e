//! Subscription store
//!
//! All billing state lives here: tenants, provider links, transactions, the
//! processed-event ledger, checkout intents, and the raw notification log.
//! Functions that take `&mut PgConnection` are building blocks the engine
//! composes inside one transaction per event; pool methods are standalone
//! reads/writes.

use serde::Serialize;
use sitebill_shared::TenantId;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::event::{BillingEvent, TenantRef};

/// A billable site/account
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: TenantId,
    pub activation_key: Option<String>,
    pub email: String,
    pub display_name: String,
    pub level: i32,
    pub term_months: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub is_trial: bool,
    pub is_cancelled: bool,
    pub pending_reconciliation: bool,
    pub gateway: Option<String>,
    pub last_extension_key: Option<String>,
    pub last_extended_at: Option<OffsetDateTime>,
}

/// A tenant's identity at a payment provider
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProviderLink {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub gateway: String,
    pub customer_id: Option<String>,
    pub subscription_id: String,
    pub is_active: bool,
}

/// A settled charge
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub gateway: String,
    pub txn_id: String,
    pub amount_cents: i64,
    pub refunded_cents: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

/// Tenant state as seen by the engine while deciding an event, loaded under
/// the tenant row lock
#[derive(Debug, Clone)]
pub struct TenantSnapshot {
    pub tenant: Tenant,
    /// The active link for the event's gateway, if any
    pub active_link: Option<ProviderLink>,
}

/// A server-side checkout in progress
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CheckoutIntent {
    pub id: Uuid,
    pub tenant_id: Option<TenantId>,
    pub activation_key: Option<String>,
    pub gateway: String,
    pub level: i32,
    pub term_months: i32,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub gateway_token: Option<String>,
    pub charge_txn_id: Option<String>,
    pub profile_id: Option<String>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

const TENANT_COLUMNS: &str = "id, activation_key, email, display_name, level, term_months, \
     expires_at, is_trial, is_cancelled, pending_reconciliation, gateway, \
     last_extension_key, last_extended_at";

const INTENT_COLUMNS: &str = "id, tenant_id, activation_key, gateway, level, term_months, \
     amount_cents, currency, status, gateway_token, charge_txn_id, profile_id, \
     attempts, last_error";

/// Store facade over the billing schema
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // -------------------------------------------------------------------
    // Tenant resolution (reads, outside the event transaction)
    // -------------------------------------------------------------------

    pub async fn find_tenant(&self, id: TenantId) -> BillingResult<Option<Tenant>> {
        let row = sqlx::query_as(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_tenant_by_activation_key(
        &self,
        key: &str,
    ) -> BillingResult<Option<Tenant>> {
        let row = sqlx::query_as(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE activation_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Tenant owning the active link for a provider subscription id
    pub async fn find_tenant_by_subscription(
        &self,
        gateway: &str,
        subscription_id: &str,
    ) -> BillingResult<Option<TenantId>> {
        let row: Option<(TenantId,)> = sqlx::query_as(
            "SELECT tenant_id FROM provider_links
             WHERE gateway = $1 AND subscription_id = $2 AND is_active",
        )
        .bind(gateway)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Tenant owning any link (active or superseded) for a provider customer
    pub async fn find_tenant_by_customer(
        &self,
        gateway: &str,
        customer_id: &str,
    ) -> BillingResult<Option<TenantId>> {
        let row: Option<(TenantId,)> = sqlx::query_as(
            "SELECT tenant_id FROM provider_links
             WHERE gateway = $1 AND customer_id = $2
             ORDER BY is_active DESC, created_at DESC LIMIT 1",
        )
        .bind(gateway)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Active provider link for a tenant at a gateway (pool read)
    pub async fn find_active_link(
        &self,
        tenant_id: TenantId,
        gateway: &str,
    ) -> BillingResult<Option<ProviderLink>> {
        let row = sqlx::query_as(
            "SELECT id, tenant_id, gateway, customer_id, subscription_id, is_active
             FROM provider_links
             WHERE tenant_id = $1 AND gateway = $2 AND is_active",
        )
        .bind(tenant_id)
        .bind(gateway)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_transaction(
        &self,
        gateway: &str,
        txn_id: &str,
    ) -> BillingResult<Option<TransactionRecord>> {
        let row = sqlx::query_as(
            "SELECT id, tenant_id, gateway, txn_id, amount_cents, refunded_cents,
                    currency, occurred_at
             FROM transactions WHERE gateway = $1 AND txn_id = $2",
        )
        .bind(gateway)
        .bind(txn_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Most recent settled charge for a tenant, the one a prorated refund
    /// is computed against
    pub async fn find_latest_transaction(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<TransactionRecord>> {
        let row = sqlx::query_as(
            "SELECT id, tenant_id, gateway, txn_id, amount_cents, refunded_cents,
                    currency, occurred_at
             FROM transactions WHERE tenant_id = $1
             ORDER BY occurred_at DESC LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Resolve the tenant a normalized event belongs to.
    /// Precedence: explicit tenant id, activation key, active subscription
    /// link, the referenced transaction, then provider customer id.
    pub async fn resolve_tenant(&self, event: &BillingEvent) -> BillingResult<Option<TenantId>> {
        match &event.tenant_ref {
            Some(TenantRef::Id(id)) => {
                if self.find_tenant(*id).await?.is_some() {
                    return Ok(Some(*id));
                }
            }
            Some(TenantRef::ActivationKey(key)) => {
                if let Some(t) = self.find_tenant_by_activation_key(key).await? {
                    return Ok(Some(t.id));
                }
            }
            _ => {}
        }
        if let Some(sub) = &event.subscription_id {
            if let Some(id) = self.find_tenant_by_subscription(&event.gateway, sub).await? {
                return Ok(Some(id));
            }
        }
        if let Some(txn) = &event.txn_id {
            if let Some(t) = self.find_transaction(&event.gateway, txn).await? {
                return Ok(Some(t.tenant_id));
            }
        }
        if let Some(TenantRef::ProviderCustomer(cust)) = &event.tenant_ref {
            return self.find_tenant_by_customer(&event.gateway, cust).await;
        }
        if let Some(cust) = &event.customer_id {
            return self.find_tenant_by_customer(&event.gateway, cust).await;
        }
        Ok(None)
    }

    // -------------------------------------------------------------------
    // Notification log / checkout intents (pool writes)
    // -------------------------------------------------------------------

    /// Durably record a verified notification before it is processed, so a
    /// payload is never lost to a processing failure. Returns the row id for
    /// the outcome update.
    pub async fn log_notification(
        &self,
        gateway: &str,
        payload: &serde_json::Value,
        outcome: &str,
    ) -> BillingResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO gateway_notifications (gateway, payload, outcome)
             VALUES ($1, $2, $3)
             RETURNING id",
        )
        .bind(gateway)
        .bind(payload)
        .bind(outcome)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn set_notification_outcome(&self, id: Uuid, outcome: &str) -> BillingResult<()> {
        sqlx::query("UPDATE gateway_notifications SET outcome = $2 WHERE id = $1")
            .bind(id)
            .bind(outcome)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_intent(
        &self,
        tenant_id: Option<TenantId>,
        activation_key: &str,
        gateway: &str,
        level: i32,
        term_months: i32,
        amount_cents: i64,
        currency: &str,
    ) -> BillingResult<CheckoutIntent> {
        let row = sqlx::query_as(&format!(
            "INSERT INTO checkout_intents
                 (tenant_id, activation_key, gateway, level, term_months, amount_cents, currency)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {INTENT_COLUMNS}"
        ))
        .bind(tenant_id)
        .bind(activation_key)
        .bind(gateway)
        .bind(level)
        .bind(term_months)
        .bind(amount_cents)
        .bind(currency)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_intent(&self, id: Uuid) -> BillingResult<Option<CheckoutIntent>> {
        let row = sqlx::query_as(&format!(
            "SELECT {INTENT_COLUMNS} FROM checkout_intents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn set_intent_token(&self, id: Uuid, token: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE checkout_intents SET gateway_token = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_intent_charged(&self, id: Uuid, txn_id: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE checkout_intents
             SET status = 'charged', charge_txn_id = $2, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(txn_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_intent_completed(&self, id: Uuid, profile_id: Option<&str>) -> BillingResult<()> {
        sqlx::query(
            "UPDATE checkout_intents
             SET status = 'completed', profile_id = COALESCE($2, profile_id), updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(profile_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_intent_pending_profile(&self, id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE checkout_intents
             SET status = 'pending_profile', last_error = $2,
                 attempts = attempts + 1, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_intent_failed(&self, id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE checkout_intents
             SET status = 'failed', last_error = $2, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claim one pending_profile intent for retry, or None when the queue
    /// is drained. SKIP LOCKED keeps concurrent sweeps off the same row;
    /// the caller holds the transaction while it works the intent.
    pub async fn claim_one_pending_profile_intent(
        conn: &mut PgConnection,
        max_attempts: i32,
    ) -> BillingResult<Option<CheckoutIntent>> {
        let row = sqlx::query_as(&format!(
            "SELECT {INTENT_COLUMNS} FROM checkout_intents
             WHERE status = 'pending_profile' AND attempts < $1
             ORDER BY created_at
             LIMIT 1
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(max_attempts)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    /// Close an intent whose recurring profile finally got created
    pub async fn complete_intent(
        conn: &mut PgConnection,
        id: Uuid,
        profile_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE checkout_intents
             SET status = 'completed', profile_id = $2, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(profile_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Record another failed profile-creation attempt. Returns the new
    /// attempt count.
    pub async fn record_profile_attempt(
        conn: &mut PgConnection,
        id: Uuid,
        error: &str,
    ) -> BillingResult<i32> {
        let (attempts,): (i32,) = sqlx::query_as(
            "UPDATE checkout_intents
             SET attempts = attempts + 1, last_error = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING attempts",
        )
        .bind(id)
        .bind(error)
        .fetch_one(conn)
        .await?;
        Ok(attempts)
    }

    /// Drop notification-log rows older than the retention window
    pub async fn cleanup_old_notifications(&self, keep_days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            "DELETE FROM gateway_notifications
             WHERE received_at < NOW() - make_interval(days => $1)",
        )
        .bind(keep_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // -------------------------------------------------------------------
    // Event-transaction building blocks (&mut PgConnection)
    // -------------------------------------------------------------------

    /// Atomically claim an idempotency key. Returns false when another
    /// delivery already claimed it; the caller treats that as a duplicate.
    pub async fn claim_event_key(
        conn: &mut PgConnection,
        dedup_key: &str,
        tenant_id: Option<TenantId>,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "INSERT INTO processed_event_keys (dedup_key, tenant_id)
             VALUES ($1, $2)
             ON CONFLICT (dedup_key) DO NOTHING",
        )
        .bind(dedup_key)
        .bind(tenant_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lock the tenant row for the duration of the event transaction.
    /// This is the per-tenant serialization point: concurrent events for
    /// the same tenant queue here.
    pub async fn lock_tenant(
        conn: &mut PgConnection,
        id: TenantId,
    ) -> BillingResult<Option<Tenant>> {
        let row = sqlx::query_as(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    /// Create (or adopt) the tenant for an activation key, locking the row.
    /// Notifications can arrive before the signup flow finished, so the
    /// insert provisions a placeholder the signup later fills in.
    pub async fn provision_tenant(
        conn: &mut PgConnection,
        activation_key: &str,
        level: i32,
        term_months: i32,
        gateway: &str,
    ) -> BillingResult<Tenant> {
        let row = sqlx::query_as(&format!(
            "INSERT INTO tenants (activation_key, level, term_months, gateway, expires_at)
             VALUES ($1, $2, $3, $4, NOW())
             ON CONFLICT (activation_key)
             DO UPDATE SET updated_at = NOW()
             RETURNING {TENANT_COLUMNS}"
        ))
        .bind(activation_key)
        .bind(level)
        .bind(term_months)
        .bind(gateway)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    pub async fn active_link(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        gateway: &str,
    ) -> BillingResult<Option<ProviderLink>> {
        let row = sqlx::query_as(
            "SELECT id, tenant_id, gateway, customer_id, subscription_id, is_active
             FROM provider_links
             WHERE tenant_id = $1 AND gateway = $2 AND is_active",
        )
        .bind(tenant_id)
        .bind(gateway)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    /// Retire the tenant's current link for this gateway and install a new
    /// active one. Idempotent: replacing a link with itself is a no-op.
    pub async fn supersede_link(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        gateway: &str,
        customer_id: Option<&str>,
        subscription_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE provider_links
             SET is_active = FALSE, superseded_at = NOW()
             WHERE tenant_id = $1 AND gateway = $2 AND is_active
               AND subscription_id <> $3",
        )
        .bind(tenant_id)
        .bind(gateway)
        .bind(subscription_id)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO provider_links (tenant_id, gateway, customer_id, subscription_id)
             SELECT $1, $2, $3, $4
             WHERE NOT EXISTS (
                 SELECT 1 FROM provider_links
                 WHERE gateway = $2 AND subscription_id = $4 AND is_active
             )",
        )
        .bind(tenant_id)
        .bind(gateway)
        .bind(customer_id)
        .bind(subscription_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Record a settled charge. Returns false when the (gateway, txn) pair
    /// was already recorded.
    pub async fn record_transaction(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        gateway: &str,
        txn_id: &str,
        amount_cents: i64,
        currency: &str,
        occurred_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "INSERT INTO transactions
                 (tenant_id, gateway, txn_id, amount_cents, currency, occurred_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (gateway, txn_id) DO NOTHING",
        )
        .bind(tenant_id)
        .bind(gateway)
        .bind(txn_id)
        .bind(amount_cents)
        .bind(currency)
        .bind(occurred_at)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transaction row as seen inside the event transaction
    pub async fn transaction_record(
        conn: &mut PgConnection,
        gateway: &str,
        txn_id: &str,
    ) -> BillingResult<Option<TransactionRecord>> {
        let row = sqlx::query_as(
            "SELECT id, tenant_id, gateway, txn_id, amount_cents, refunded_cents,
                    currency, occurred_at
             FROM transactions WHERE gateway = $1 AND txn_id = $2",
        )
        .bind(gateway)
        .bind(txn_id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    /// Add to a transaction's refunded total, clamped so the total never
    /// exceeds the charge. Returns the new refunded total.
    pub async fn apply_refund(
        conn: &mut PgConnection,
        gateway: &str,
        txn_id: &str,
        delta_cents: i64,
    ) -> BillingResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE transactions
             SET refunded_cents = LEAST(amount_cents, refunded_cents + $3)
             WHERE gateway = $1 AND txn_id = $2
             RETURNING refunded_cents",
        )
        .bind(gateway)
        .bind(txn_id)
        .bind(delta_cents.max(0))
        .fetch_optional(conn)
        .await?;
        Ok(row.map(|(refunded,)| refunded).unwrap_or(0))
    }

    /// Move the paid-through date forward, never backward. Out-of-order
    /// payment events therefore cannot shrink the paid period, and the
    /// never-expires sentinel is naturally preserved.
    pub async fn extend_expiry(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        new_expires_at: OffsetDateTime,
        extension_key: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE tenants
             SET expires_at = GREATEST(expires_at, $2),
                 last_extension_key = $3,
                 last_extended_at = NOW(),
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(tenant_id)
        .bind(new_expires_at)
        .bind(extension_key)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Chargeback path: cut access immediately, bypassing the monotonic
    /// extension guard.
    pub async fn revoke_access(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE tenants SET expires_at = $2, is_cancelled = TRUE, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(tenant_id)
        .bind(at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn set_plan(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        level: i32,
        term_months: i32,
        gateway: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE tenants
             SET level = $2, term_months = $3, gateway = $4, is_trial = FALSE,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(tenant_id)
        .bind(level)
        .bind(term_months)
        .bind(gateway)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Mark the subscription cancelled without touching the paid-through
    /// date: access runs until expiry.
    pub async fn mark_cancelled(conn: &mut PgConnection, tenant_id: TenantId) -> BillingResult<()> {
        sqlx::query("UPDATE tenants SET is_cancelled = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(tenant_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn set_pending_reconciliation(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        pending: bool,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE tenants SET pending_reconciliation = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(tenant_id)
        .bind(pending)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn record_stat(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        action: &str,
        gateway: &str,
    ) -> BillingResult<()> {
        sqlx::query("INSERT INTO tenant_stats (tenant_id, action, gateway) VALUES ($1, $2, $3)")
            .bind(tenant_id)
            .bind(action)
            .bind(gateway)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Snapshot a locked tenant plus its active link for this gateway
    pub async fn load_snapshot(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        gateway: &str,
    ) -> BillingResult<Option<TenantSnapshot>> {
        let Some(tenant) = Self::lock_tenant(conn, tenant_id).await? else {
            return Ok(None);
        };
        let active_link = Self::active_link(conn, tenant_id, gateway).await?;
        Ok(Some(TenantSnapshot {
            tenant,
            active_link,
        }))
    }
}

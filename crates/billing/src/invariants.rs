//! Billing consistency checks
//!
//! Runnable read-only checks over the billing schema. The worker runs the
//! full set on a schedule; individual checks can be run ad hoc while
//! debugging a replay or a dispute.

use serde::{Deserialize, Serialize};
use sitebill_shared::TenantId;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// A single failed consistency check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Tenants affected
    pub tenant_ids: Vec<TenantId>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// System may be granting or charging incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of a full invariant run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleLinksRow {
    tenant_id: TenantId,
    gateway: String,
    link_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OverRefundedRow {
    tenant_id: TenantId,
    txn_id: String,
    amount_cents: i64,
    refunded_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanPendingRow {
    tenant_id: TenantId,
    activation_key: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePendingIntentRow {
    intent_id: uuid::Uuid,
    tenant_id: Option<TenantId>,
    attempts: i32,
    last_error: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct UnknownLevelRow {
    tenant_id: TenantId,
    level: i32,
}

/// Runs the consistency checks
pub struct InvariantChecker {
    pool: PgPool,
    known_levels: Vec<i32>,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, known_levels: Vec<i32>) -> Self {
        Self { pool, known_levels }
    }

    /// Run every check and summarize
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_link().await?);
        violations.extend(self.check_refunds_within_charge().await?);
        violations.extend(self.check_pending_reconciliation_has_intent().await?);
        violations.extend(self.check_exhausted_pending_intents().await?);
        violations.extend(self.check_levels_exist().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: at most one active provider link per (tenant, gateway).
    ///
    /// Two active links mean two recurring profiles billing the same
    /// tenant. The partial unique index should make this impossible; the
    /// check exists to catch it anyway.
    async fn check_single_active_link(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleLinksRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, gateway, COUNT(*) as link_count
            FROM provider_links
            WHERE is_active
            GROUP BY tenant_id, gateway
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_link".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant has {} active {} links (expected at most 1)",
                    row.link_count, row.gateway
                ),
                context: serde_json::json!({
                    "gateway": row.gateway,
                    "link_count": row.link_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: refunded totals never exceed the charge
    async fn check_refunds_within_charge(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverRefundedRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, txn_id, amount_cents, refunded_cents
            FROM transactions
            WHERE refunded_cents > amount_cents
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refunds_within_charge".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Transaction {} refunded {} cents of a {} cent charge",
                    row.txn_id, row.refunded_cents, row.amount_cents
                ),
                context: serde_json::json!({
                    "txn_id": row.txn_id,
                    "amount_cents": row.amount_cents,
                    "refunded_cents": row.refunded_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: a tenant flagged pending_reconciliation has a
    /// pending_profile intent for the sweep to work on. A flag with no
    /// intent would never clear.
    async fn check_pending_reconciliation_has_intent(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanPendingRow> = sqlx::query_as(
            r#"
            SELECT t.id as tenant_id, t.activation_key
            FROM tenants t
            WHERE t.pending_reconciliation
              AND NOT EXISTS (
                  SELECT 1 FROM checkout_intents i
                  WHERE i.tenant_id = t.id AND i.status = 'pending_profile'
              )
              AND NOT EXISTS (
                  SELECT 1 FROM checkout_intents i
                  WHERE i.activation_key = t.activation_key
                    AND i.status = 'pending_profile'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_reconciliation_has_intent".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: "Tenant is flagged pending_reconciliation with no pending_profile intent"
                    .to_string(),
                context: serde_json::json!({
                    "activation_key": row.activation_key,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: pending_profile intents that exhausted their retry
    /// budget need a human. These tenants paid but have no recurring
    /// profile billing future terms.
    async fn check_exhausted_pending_intents(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StalePendingIntentRow> = sqlx::query_as(
            r#"
            SELECT id as intent_id, tenant_id, attempts, last_error
            FROM checkout_intents
            WHERE status = 'pending_profile' AND attempts >= 5
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "exhausted_pending_intents".to_string(),
                tenant_ids: row.tenant_id.into_iter().collect(),
                description: format!(
                    "Intent {} failed profile creation {} times",
                    row.intent_id, row.attempts
                ),
                context: serde_json::json!({
                    "intent_id": row.intent_id,
                    "attempts": row.attempts,
                    "last_error": row.last_error,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: every tenant's level exists in the plan table
    async fn check_levels_exist(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnknownLevelRow> = sqlx::query_as(
            r#"
            SELECT id as tenant_id, level
            FROM tenants
            WHERE NOT (level = ANY($1))
            "#,
        )
        .bind(&self.known_levels)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "levels_exist".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!("Tenant is on level {} which no plan defines", row.level),
                context: serde_json::json!({
                    "level": row.level,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run one check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_link" => self.check_single_active_link().await,
            "refunds_within_charge" => self.check_refunds_within_charge().await,
            "pending_reconciliation_has_intent" => {
                self.check_pending_reconciliation_has_intent().await
            }
            "exhausted_pending_intents" => self.check_exhausted_pending_intents().await,
            "levels_exist" => self.check_levels_exist().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_link",
            "refunds_within_charge",
            "pending_reconciliation_has_intent",
            "exhausted_pending_intents",
            "levels_exist",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_active_link"));
        assert!(checks.contains(&"refunds_within_charge"));
    }
}

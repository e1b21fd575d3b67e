//! Billing configuration: plan table and reconciliation policy

use crate::error::{BillingError, BillingResult};

/// A purchasable plan level. Levels are ordered: a move to a higher number
/// is an upgrade, a lower number a downgrade.
#[derive(Debug, Clone)]
pub struct PlanLevel {
    pub level: i32,
    pub name: String,
    pub monthly_cents: i64,
}

/// Ordered table of plan levels, parsed from `PLAN_LEVELS`
/// ("1:Starter:1000,2:Pro:2500,3:Business:5000").
#[derive(Debug, Clone)]
pub struct PlanTable {
    levels: Vec<PlanLevel>,
}

impl PlanTable {
    pub fn parse(spec: &str) -> BillingResult<Self> {
        let mut levels = Vec::new();
        for entry in spec.split(',').filter(|e| !e.trim().is_empty()) {
            let mut parts = entry.trim().splitn(3, ':');
            let (level, name, cents) = match (parts.next(), parts.next(), parts.next()) {
                (Some(l), Some(n), Some(c)) => (l, n, c),
                _ => {
                    return Err(BillingError::Config(format!(
                        "PLAN_LEVELS entry '{entry}' is not level:name:monthly_cents"
                    )))
                }
            };
            levels.push(PlanLevel {
                level: level.parse().map_err(|_| {
                    BillingError::Config(format!("PLAN_LEVELS entry '{entry}': bad level"))
                })?,
                name: name.to_string(),
                monthly_cents: cents.parse().map_err(|_| {
                    BillingError::Config(format!("PLAN_LEVELS entry '{entry}': bad price"))
                })?,
            });
        }
        if levels.is_empty() {
            return Err(BillingError::Config(
                "PLAN_LEVELS defined no plan levels".to_string(),
            ));
        }
        levels.sort_by_key(|p| p.level);
        Ok(Self { levels })
    }

    pub fn get(&self, level: i32) -> Option<&PlanLevel> {
        self.levels.iter().find(|p| p.level == level)
    }

    /// Price for a plan at a term length. Terms are billed as flat
    /// multiples of the monthly price.
    pub fn price_cents(&self, level: i32, term_months: i32) -> Option<i64> {
        let plan = self.get(level)?;
        plan.monthly_cents.checked_mul(i64::from(term_months.max(1)))
    }

    pub fn name(&self, level: i32) -> &str {
        self.get(level).map(|p| p.name.as_str()).unwrap_or("Unknown")
    }

    pub fn level_numbers(&self) -> Vec<i32> {
        self.levels.iter().map(|p| p.level).collect()
    }
}

/// Configuration for the billing core
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub plans: PlanTable,
    /// ISO currency code used for new checkouts
    pub currency: String,
    /// Base URL for checkout return/cancel redirects
    pub app_base_url: String,
    /// Average month length used by the prorated-refund policy.
    /// Kept as policy rather than exact calendar math so a refund for a
    /// 3-month term is independent of which months it spanned.
    pub days_per_month: f64,
    /// Window in which an identical expiry extension is treated as a
    /// double-fired notification rather than a new payment
    pub extension_dedup_window_secs: i64,
    /// When false, checkouts collect a one-time payment for the term and no
    /// recurring profile is created
    pub recurring_billing: bool,
    /// Free trial length for new recurring profiles; 0 disables
    pub trial_days: i32,
    /// One-time setup fee collected with new recurring profiles; 0 disables
    pub setup_fee_cents: i64,
    /// Address that receives reconciliation-failure alerts
    pub alerts_email: String,
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let plans_spec = std::env::var("PLAN_LEVELS")
            .map_err(|_| BillingError::Config("PLAN_LEVELS not set".to_string()))?;
        Ok(Self {
            plans: PlanTable::parse(&plans_spec)?,
            currency: std::env::var("BILLING_CURRENCY").unwrap_or_else(|_| "USD".to_string()),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            days_per_month: 30.4166,
            extension_dedup_window_secs: 300,
            recurring_billing: std::env::var("RECURRING_BILLING")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            trial_days: std::env::var("TRIAL_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            setup_fee_cents: std::env::var("SETUP_FEE_CENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            alerts_email: std::env::var("BILLING_ALERTS_EMAIL")
                .unwrap_or_else(|_| "billing@sitebill.dev".to_string()),
        })
    }
}

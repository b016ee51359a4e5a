//! Environment-driven configuration for usage limits and ledger behavior

use std::time::Duration;

use tollgate_shared::PlanTier;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Monthly metered-minutes allowances per plan tier.
///
/// Paid tiers are per-seat allowances; the free/trial allowance is a flat
/// per-tenant number. All values are overridable via environment variables.
#[derive(Debug, Clone)]
pub struct UsageLimitsConfig {
    /// Flat monthly allowance for organizations without a paid subscription
    /// (and for trialing subscriptions).
    pub free_trial_monthly_minutes: f64,
    pub free_trial_seat_count: i32,
    /// Fallback when the plan tier cannot be resolved at all.
    pub default_monthly_minutes: f64,
    pub default_seat_count: i32,
    pub personal_minutes_per_seat: f64,
    pub business_minutes_per_seat: f64,
    pub company_minutes_per_seat: f64,
    pub custom_minutes_per_seat: f64,
}

impl Default for UsageLimitsConfig {
    fn default() -> Self {
        Self {
            free_trial_monthly_minutes: 300.0,
            free_trial_seat_count: 1,
            default_monthly_minutes: 300.0,
            default_seat_count: 1,
            personal_minutes_per_seat: 1_500.0,
            business_minutes_per_seat: 3_000.0,
            company_minutes_per_seat: 6_000.0,
            custom_minutes_per_seat: 10_000.0,
        }
    }
}

impl UsageLimitsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            free_trial_monthly_minutes: env_parse(
                "FREE_TRIAL_MONTHLY_MINUTES",
                defaults.free_trial_monthly_minutes,
            ),
            free_trial_seat_count: env_parse(
                "FREE_TRIAL_SEAT_COUNT",
                defaults.free_trial_seat_count,
            ),
            default_monthly_minutes: env_parse(
                "DEFAULT_MONTHLY_MINUTES",
                defaults.default_monthly_minutes,
            ),
            default_seat_count: env_parse("DEFAULT_SEAT_COUNT", defaults.default_seat_count),
            personal_minutes_per_seat: env_parse(
                "PERSONAL_MINUTES_PER_SEAT",
                defaults.personal_minutes_per_seat,
            ),
            business_minutes_per_seat: env_parse(
                "BUSINESS_MINUTES_PER_SEAT",
                defaults.business_minutes_per_seat,
            ),
            company_minutes_per_seat: env_parse(
                "COMPANY_MINUTES_PER_SEAT",
                defaults.company_minutes_per_seat,
            ),
            custom_minutes_per_seat: env_parse(
                "CUSTOM_MINUTES_PER_SEAT",
                defaults.custom_minutes_per_seat,
            ),
        }
    }

    /// Per-seat monthly minutes for a paid tier. `Free` returns the flat
    /// free-trial allowance.
    pub fn minutes_per_seat(&self, tier: PlanTier) -> f64 {
        match tier {
            PlanTier::Personal => self.personal_minutes_per_seat,
            PlanTier::Business => self.business_minutes_per_seat,
            PlanTier::Company => self.company_minutes_per_seat,
            PlanTier::Custom => self.custom_minutes_per_seat,
            PlanTier::Free => self.free_trial_monthly_minutes,
        }
    }
}

/// Tuning knobs for the ledger's duplicate-delivery heuristic.
///
/// Only the concurrent window suppresses writes; the recent window is
/// observational and exists to surface suspicious re-delivery in logs.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Appends for the same (org, external subscription) key within this
    /// window of an existing record are treated as duplicate deliveries of
    /// the same logical event.
    pub concurrent_window: Duration,
    /// Wider window used only to log suspicious rapid re-delivery.
    pub recent_window: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            concurrent_window: Duration::from_secs(1),
            recent_window: Duration::from_secs(5 * 60),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrent_window: Duration::from_millis(env_parse(
                "LEDGER_CONCURRENT_WINDOW_MS",
                defaults.concurrent_window.as_millis() as u64,
            )),
            recent_window: Duration::from_secs(env_parse(
                "LEDGER_RECENT_WINDOW_SECS",
                defaults.recent_window.as_secs(),
            )),
        }
    }

    /// Disable duplicate suppression entirely (both windows zero).
    pub fn without_dedup() -> Self {
        Self {
            concurrent_window: Duration::ZERO,
            recent_window: Duration::ZERO,
        }
    }
}

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::sync::Arc;

use crate::cache::QueryCache;

/// Monthly spending cap for outbound summary calls, persisted in the cache
/// database so it survives restarts.
pub struct CostBudget {
    limit_usd: f64,
    cache: Arc<QueryCache>,
}

impl CostBudget {
    pub fn new(limit_usd: f64, cache: Arc<QueryCache>) -> Self {
        Self { limit_usd, cache }
    }

    /// Budget period key, e.g. `2026-10`.
    pub fn month_key(now: DateTime<Utc>) -> String {
        now.format("%Y-%m").to_string()
    }

    pub fn current_month() -> String {
        Self::month_key(Utc::now())
    }

    /// Spend so far this month; `None` when it cannot be tracked.
    pub fn spent(&self) -> Option<f64> {
        self.cache.monthly_spend(&Self::current_month())
    }

    /// Untracked spend counts as exhausted.
    pub fn remaining(&self) -> f64 {
        match self.spent() {
            Some(spent) => (self.limit_usd - spent).max(0.0),
            None => 0.0,
        }
    }

    pub fn allows_call(&self) -> bool {
        let remaining = self.remaining();
        if remaining <= 0.0 {
            debug!("AI budget of ${:.2} exhausted for {}", self.limit_usd, Self::current_month());
            return false;
        }
        true
    }

    pub fn record(&self, cost_usd: f64) {
        if cost_usd <= 0.0 {
            return;
        }
        let month = Self::current_month();
        self.cache.add_spend(&month, cost_usd);
        if self.remaining() <= 0.0 {
            info!("AI budget of ${:.2} reached for {month}; summaries paused", self.limit_usd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn month_key_is_year_and_month() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(CostBudget::month_key(at), "2026-03");
    }

    #[test]
    fn spend_accumulates_until_the_limit() {
        let cache = Arc::new(QueryCache::in_memory(
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        let budget = CostBudget::new(0.05, cache);
        assert!(budget.allows_call());
        budget.record(0.03);
        assert!(budget.allows_call());
        budget.record(0.03);
        assert!(!budget.allows_call());
        assert_eq!(budget.remaining(), 0.0);
    }

    #[test]
    fn untracked_spend_blocks_calls() {
        let budget = CostBudget::new(10.0, Arc::new(QueryCache::disabled()));
        assert!(!budget.allows_call());
    }
}

use chrono::{Datelike, Months, NaiveDate};
use ibkr_bridge_core::{CacheConfig, ToolRequest};
use std::time::Duration;

/// Freshness window per tool kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub historical: Duration,
    pub current: Duration,
    pub contract: Duration,
    pub account: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for TtlPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            historical: Duration::from_secs(config.historical_ttl_secs),
            current: Duration::from_secs(config.current_ttl_secs),
            contract: Duration::from_secs(config.contract_ttl_secs),
            account: Duration::from_secs(config.account_ttl_secs),
        }
    }
}

impl TtlPolicy {
    /// TTL for a request evaluated on `today`. Zero means never cache.
    pub fn ttl_for(&self, request: &ToolRequest, today: NaiveDate) -> Duration {
        match request {
            ToolRequest::MarketData(p) => {
                if overlaps_current_month(p.start_date, p.end_date, today) {
                    self.current
                } else {
                    self.historical
                }
            }
            ToolRequest::ContractLookup(_) => self.contract,
            ToolRequest::Positions(_) | ToolRequest::AccountSummary(_) => self.account,
            ToolRequest::OptionPrices(_) | ToolRequest::Snapshot(_) => Duration::ZERO,
        }
    }
}

/// Whether `[start, end]` touches the calendar month containing `today`.
/// Reversed windows are swapped.
pub fn overlaps_current_month(start: NaiveDate, end: NaiveDate, today: NaiveDate) -> bool {
    let (start, end) = if end < start { (end, start) } else { (start, end) };
    let month_start = today.with_day(1);
    let month_end = month_start
        .and_then(|first| first.checked_add_months(Months::new(1)))
        .and_then(|next| next.pred_opt());
    match (month_start, month_end) {
        (Some(first), Some(last)) => start <= last && end >= first,
        // Unrepresentable calendar edges: assume live data
        _ => true,
    }
}

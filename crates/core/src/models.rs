use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Option right (put or call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionRight {
    #[serde(rename = "P")]
    Put,
    #[serde(rename = "C")]
    Call,
}

impl OptionRight {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionRight::Put => "P",
            OptionRight::Call => "C",
        }
    }

    /// Parse a user-supplied right ("P", "put", "c", ...).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "P" | "PUT" => Some(OptionRight::Put),
            "C" | "CALL" => Some(OptionRight::Call),
            _ => None,
        }
    }
}

/// Describes a contract as sent to the gateway for qualification.
///
/// Symbols, security types, exchanges and currencies are always stored
/// upper-cased so that two specs for the same instrument compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractSpec {
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
    /// Gateway-assigned contract id, when already known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub con_id: Option<i64>,
    /// Expiry (`YYYYMMDD`) or contract month (`YYYYMM`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strike: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<OptionRight>,
}

impl ContractSpec {
    pub fn new(symbol: &str, sec_type: &str, exchange: &str, currency: &str) -> Self {
        Self {
            symbol: symbol.trim().to_ascii_uppercase(),
            sec_type: sec_type.trim().to_ascii_uppercase(),
            exchange: exchange.trim().to_ascii_uppercase(),
            currency: currency.trim().to_ascii_uppercase(),
            con_id: None,
            expiry: None,
            strike: None,
            right: None,
        }
    }

    /// A SMART-routed USD stock.
    pub fn stock(symbol: &str) -> Self {
        Self::new(symbol, "STK", "SMART", "USD")
    }

    /// A SMART-routed option contract.
    pub fn option(symbol: &str, expiry: &str, strike: Decimal, right: OptionRight) -> Self {
        let mut spec = Self::new(symbol, "OPT", "SMART", "USD");
        spec.expiry = Some(expiry.trim().to_string());
        spec.strike = Some(strike.normalize());
        spec.right = Some(right);
        spec
    }

    pub fn with_con_id(mut self, con_id: Option<i64>) -> Self {
        self.con_id = con_id;
        self
    }

    pub fn is_option(&self) -> bool {
        self.sec_type == "OPT" || self.sec_type == "FOP"
    }
}

/// Normalized contract details returned by a lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractDetail {
    pub con_id: Option<i64>,
    pub symbol: Option<String>,
    pub sec_type: Option<String>,
    pub exchange: Option<String>,
    pub primary_exchange: Option<String>,
    pub currency: Option<String>,
    pub multiplier: Option<String>,
    pub min_tick: Option<Decimal>,
    pub trading_class: Option<String>,
    #[serde(default)]
    pub valid_exchanges: Vec<String>,
    pub long_name: Option<String>,
    pub industry: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub trading_hours: Option<String>,
    pub liquid_hours: Option<String>,
    pub last_trade_date: Option<String>,
}

/// Option chain parameters for one exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionChain {
    pub exchange: Option<String>,
    #[serde(default)]
    pub expirations: Vec<String>,
    #[serde(default)]
    pub strikes: Vec<Decimal>,
    pub multiplier: Option<String>,
}

impl OptionChain {
    /// Sort expirations and strikes, dropping duplicates.
    pub fn normalized(mut self) -> Self {
        self.expirations.sort();
        self.expirations.dedup();
        self.strikes.sort();
        self.strikes.dedup();
        self
    }
}

/// All option chains for a qualified underlying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionChainSet {
    pub underlying: String,
    pub con_id: i64,
    pub chains: Vec<OptionChain>,
}

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// A single historical OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Point-in-time quote for one contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    pub mid: Option<Decimal>,
    pub volume: Option<i64>,
    pub open_interest: Option<i64>,
    pub implied_vol: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
}

impl MarketSnapshot {
    /// True when at least one field was populated by the gateway.
    pub fn has_data(&self) -> bool {
        self.bid.is_some()
            || self.ask.is_some()
            || self.last.is_some()
            || self.volume.is_some()
            || self.open_interest.is_some()
            || self.implied_vol.is_some()
            || self.delta.is_some()
            || self.gamma.is_some()
            || self.theta.is_some()
            || self.vega.is_some()
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// An open position as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub account: String,
    pub symbol: String,
    pub sec_type: Option<String>,
    pub currency: Option<String>,
    pub exchange: Option<String>,
    pub con_id: Option<i64>,
    pub position: Decimal,
    pub avg_cost: Option<Decimal>,
}

/// One raw account value (tag/value/currency triple).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountValue {
    pub account: Option<String>,
    pub tag: String,
    pub value: String,
    pub currency: Option<String>,
}

/// Account-level profit and loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountPnl {
    pub account_id: String,
    pub daily_pnl: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
}

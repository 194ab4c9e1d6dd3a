use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::models::{ContractSpec, OptionRight};

// ---------------------------------------------------------------------------
// Tool kinds
// ---------------------------------------------------------------------------

/// The six externally callable tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    MarketData,
    Positions,
    AccountSummary,
    ContractLookup,
    OptionPrices,
    Snapshot,
}

/// Whether a tool reads or mutates account state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// How long results of a tool may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// Long-lived, also eligible for the disk tier.
    Persistent,
    /// Seconds-scale freshness, memory only.
    Volatile,
    /// Never cached.
    Bypass,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::MarketData,
        ToolKind::Positions,
        ToolKind::AccountSummary,
        ToolKind::ContractLookup,
        ToolKind::OptionPrices,
        ToolKind::Snapshot,
    ];

    /// Externally visible tool name.
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::MarketData => "get_ibkr_market_data",
            ToolKind::Positions => "get_ibkr_positions",
            ToolKind::AccountSummary => "get_ibkr_account",
            ToolKind::ContractLookup => "get_ibkr_contract",
            ToolKind::OptionPrices => "get_ibkr_option_prices",
            ToolKind::Snapshot => "get_ibkr_snapshot",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Every tool must declare its access mode here; the read-only policy
    /// relies on this match being exhaustive.
    pub fn access_mode(&self) -> AccessMode {
        match self {
            ToolKind::MarketData
            | ToolKind::Positions
            | ToolKind::AccountSummary
            | ToolKind::ContractLookup
            | ToolKind::OptionPrices
            | ToolKind::Snapshot => AccessMode::Read,
        }
    }

    pub fn cache_class(&self) -> CacheClass {
        match self {
            ToolKind::MarketData | ToolKind::ContractLookup => CacheClass::Persistent,
            ToolKind::Positions | ToolKind::AccountSummary => CacheClass::Volatile,
            ToolKind::OptionPrices | ToolKind::Snapshot => CacheClass::Bypass,
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Normalized parameters
// ---------------------------------------------------------------------------

/// Instrument families with distinct historical data profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentType {
    Stock,
    Futures,
    #[serde(alias = "forex")]
    Fx,
    Bond,
    Option,
}

impl InstrumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentType::Stock => "stock",
            InstrumentType::Futures => "futures",
            InstrumentType::Fx => "fx",
            InstrumentType::Bond => "bond",
            InstrumentType::Option => "option",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketDataParams {
    /// Upper-cased, sorted, de-duplicated.
    pub symbols: Vec<String>,
    pub instrument_type: InstrumentType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Explicit bar size; `None` uses the instrument profile default.
    pub bar_size: Option<String>,
    /// Explicit data source; `None` walks the profile fallback chain.
    pub what_to_show: Option<String>,
    pub con_id: Option<i64>,
    pub exchange: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionsParams {
    pub account_id: Option<String>,
    pub include_pnl: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSummaryParams {
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractInfoType {
    Details,
    OptionChain,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractLookupParams {
    pub contract: ContractSpec,
    pub info_type: ContractInfoType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionPricesParams {
    pub symbol: String,
    pub expiry: String,
    /// Sorted, de-duplicated.
    pub strikes: Vec<Decimal>,
    pub right: OptionRight,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotParams {
    pub contract: ContractSpec,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A validated, normalized tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    MarketData(MarketDataParams),
    Positions(PositionsParams),
    AccountSummary(AccountSummaryParams),
    ContractLookup(ContractLookupParams),
    OptionPrices(OptionPricesParams),
    Snapshot(SnapshotParams),
}

impl ToolRequest {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolRequest::MarketData(_) => ToolKind::MarketData,
            ToolRequest::Positions(_) => ToolKind::Positions,
            ToolRequest::AccountSummary(_) => ToolKind::AccountSummary,
            ToolRequest::ContractLookup(_) => ToolKind::ContractLookup,
            ToolRequest::OptionPrices(_) => ToolKind::OptionPrices,
            ToolRequest::Snapshot(_) => ToolKind::Snapshot,
        }
    }

    /// The account this request is scoped to, if any.
    pub fn account(&self) -> Option<&str> {
        match self {
            ToolRequest::Positions(p) => p.account_id.as_deref(),
            ToolRequest::AccountSummary(p) => p.account_id.as_deref(),
            _ => None,
        }
    }

    /// Whether the gateway exchange needs a concrete account id.
    pub fn requires_account(&self) -> bool {
        match self {
            ToolRequest::AccountSummary(_) => true,
            ToolRequest::Positions(p) => p.include_pnl,
            _ => false,
        }
    }

    /// Fill in the account id chosen by policy.
    pub fn with_account(mut self, account: Option<String>) -> Self {
        match &mut self {
            ToolRequest::Positions(p) => p.account_id = account,
            ToolRequest::AccountSummary(p) => p.account_id = account,
            _ => {}
        }
        self
    }

    /// Canonical parameter encoding; identical for semantically equal requests.
    fn canonical_params(&self) -> Value {
        let value = match self {
            ToolRequest::MarketData(p) => serde_json::to_value(p),
            ToolRequest::Positions(p) => serde_json::to_value(p),
            ToolRequest::AccountSummary(p) => serde_json::to_value(p),
            ToolRequest::ContractLookup(p) => serde_json::to_value(p),
            ToolRequest::OptionPrices(p) => serde_json::to_value(p),
            ToolRequest::Snapshot(p) => serde_json::to_value(p),
        };
        value.map(sort_keys).unwrap_or(Value::Null)
    }

    /// Deterministic cache key over tool kind and normalized parameters.
    pub fn fingerprint(&self) -> Fingerprint {
        let canonical = json!([self.kind(), self.canonical_params()]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        Fingerprint(hex::encode(digest))
    }
}

/// Rebuild objects with sorted keys so field order never leaks into keys.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, sort_keys(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Hex-encoded SHA-256 request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A successful tool result. `fetched_at` is the time the gateway answered,
/// preserved when the result is served from cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: ToolKind,
    pub fetched_at: DateTime<Utc>,
    pub payload: Value,
}

impl ToolResult {
    pub fn new(tool: ToolKind, fetched_at: DateTime<Utc>, payload: Value) -> Self {
        Self {
            tool,
            fetched_at,
            payload,
        }
    }

    /// Flatten into the caller-facing `{"status": "success", ...}` object.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("status".into(), json!("success"));
        out.insert("fetched_at".into(), json!(self.fetched_at.to_rfc3339()));
        if let Value::Object(fields) = &self.payload {
            for (key, value) in fields {
                out.insert(key.clone(), value.clone());
            }
        } else {
            out.insert("result".into(), self.payload.clone());
        }
        Value::Object(out)
    }
}
